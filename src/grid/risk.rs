//! Position limit enforcement.
//!
//! The guard reads a consistent snapshot of the net position at decision
//! time and clips or rejects intents so the post-fill position can never
//! leave `[-max_position, max_position]`. It holds no lock of its own;
//! correctness relies on the single-writer discipline of the
//! reconciliation engine.

use rust_decimal::Decimal;
use tracing::warn;

use crate::exchange::Side;
use crate::trading::errors::{config_error, TradingError};

/// Accept/clip/reject gate evaluated against every order intent.
#[derive(Debug, Clone)]
pub struct RiskGuard {
    max_position: Decimal,
}

impl RiskGuard {
    pub fn new(max_position: Decimal) -> Result<Self, TradingError> {
        if max_position <= Decimal::ZERO {
            return Err(config_error("max position must be positive"));
        }
        Ok(Self { max_position })
    }

    pub fn max_position(&self) -> Decimal {
        self.max_position
    }

    /// Evaluate an intent against the current net position.
    ///
    /// Returns the allowed size: the full requested size when it fits, a
    /// clipped size when only partial headroom remains. Errors are
    /// non-fatal; the intent is simply dropped for this cycle.
    pub fn evaluate(
        &self,
        position: Decimal,
        side: Side,
        size: Decimal,
        price: Decimal,
    ) -> Result<Decimal, TradingError> {
        if size <= Decimal::ZERO {
            return Err(TradingError::InvalidOrderIntent {
                reason: format!("non-positive size {size}"),
            });
        }
        if price <= Decimal::ZERO {
            return Err(TradingError::InvalidOrderIntent {
                reason: format!("non-positive price {price}"),
            });
        }

        // Headroom to the limit in the direction this intent moves us.
        let headroom = match side {
            Side::Bid => self.max_position - position,
            Side::Ask => self.max_position + position,
        };

        if headroom <= Decimal::ZERO {
            return Err(TradingError::PositionLimitExceeded {
                position,
                requested: size,
                max: self.max_position,
            });
        }

        if size > headroom {
            warn!(
                "clipping {} intent from {} to {} (position {}, max {})",
                side, size, headroom, position, self.max_position
            );
            Ok(headroom)
        } else {
            Ok(size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn guard() -> RiskGuard {
        RiskGuard::new(dec!(3)).unwrap()
    }

    #[test]
    fn test_accepts_within_limit() {
        assert_eq!(
            guard().evaluate(dec!(0), Side::Bid, dec!(2), dec!(100)).unwrap(),
            dec!(2)
        );
    }

    #[test]
    fn test_clips_to_headroom() {
        // Position +1, max 3: buying 5 leaves headroom 2.
        assert_eq!(
            guard().evaluate(dec!(1), Side::Bid, dec!(5), dec!(100)).unwrap(),
            dec!(2)
        );
    }

    #[test]
    fn test_rejects_at_limit_boundary() {
        let err = guard()
            .evaluate(dec!(3), Side::Bid, dec!(1), dec!(100))
            .unwrap_err();
        assert!(matches!(err, TradingError::PositionLimitExceeded { .. }));
    }

    #[test]
    fn test_short_side_headroom_is_symmetric() {
        // Position -2, max 3: selling has headroom 1.
        assert_eq!(
            guard().evaluate(dec!(-2), Side::Ask, dec!(4), dec!(100)).unwrap(),
            dec!(1)
        );
        // Buying from -2 has headroom 5.
        assert_eq!(
            guard().evaluate(dec!(-2), Side::Bid, dec!(5), dec!(100)).unwrap(),
            dec!(5)
        );
    }

    #[test]
    fn test_rejects_invalid_intent() {
        assert!(matches!(
            guard().evaluate(dec!(0), Side::Bid, dec!(0), dec!(100)),
            Err(TradingError::InvalidOrderIntent { .. })
        ));
        assert!(matches!(
            guard().evaluate(dec!(0), Side::Bid, dec!(1), dec!(0)),
            Err(TradingError::InvalidOrderIntent { .. })
        ));
    }

    #[test]
    fn test_post_fill_position_never_exceeds_max() {
        let g = guard();
        let positions = [dec!(-3), dec!(-1.5), dec!(0), dec!(1.5), dec!(3)];
        let sizes = [dec!(0.5), dec!(1), dec!(3), dec!(7)];
        for pos in positions {
            for size in sizes {
                for side in [Side::Bid, Side::Ask] {
                    if let Ok(allowed) = g.evaluate(pos, side, size, dec!(100)) {
                        let after = pos + side.sign() * allowed;
                        assert!(after.abs() <= dec!(3), "pos {pos} {side} {size} -> {after}");
                    }
                }
            }
        }
    }
}
