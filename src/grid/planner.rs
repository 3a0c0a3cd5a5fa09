//! Grid level planning.
//!
//! Computes the target ladder of price rungs around a reference price.
//! Prices are quantized away from the reference (bids down, asks up) so the
//! agent never crosses its own reference; sizes are quantized to the venue
//! lot size and levels that round to zero are dropped with a warning.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::exchange::Side;
use crate::trading::errors::{config_error, TradingError};

/// How per-level distance is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMode {
    /// distance is a fraction of the reference price (0.01 = 1%)
    Percentage,
    /// distance is an absolute price offset
    Absolute,
}

/// Which side opens new exposure. Long strategies open with bids and take
/// profit with asks; short strategies mirror that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// The side that increases exposure for this direction.
    pub fn open_side(&self) -> Side {
        match self {
            Direction::Long => Side::Bid,
            Direction::Short => Side::Ask,
        }
    }
}

/// A planned price rung.
///
/// `index` is the signed offset from the reference: -1 is the first bid
/// below, +1 the first ask above. The slot keeps its identity when a fill
/// re-arms the opposite side at the same rung.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridLevel {
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub index: i32,
}

/// Validated planner parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSettings {
    /// Levels per side
    pub level_count: u32,
    /// Per-level distance, interpreted per `distance_mode`
    pub distance: Decimal,
    pub distance_mode: DistanceMode,
    /// Requested size per level, before lot quantization
    pub order_size: Decimal,
    /// Venue price increment
    pub tick_size: Decimal,
    /// Venue size increment
    pub lot_size: Decimal,
    /// Reference drift that triggers a re-plan, same unit as `distance`
    pub recenter_threshold: Decimal,
    pub direction: Direction,
}

/// Computes target grid levels from configuration and a reference price.
#[derive(Debug, Clone)]
pub struct GridPlanner {
    settings: GridSettings,
}

impl GridPlanner {
    /// Validate settings once at startup; invalid parameters are fatal.
    pub fn new(settings: GridSettings) -> Result<Self, TradingError> {
        if settings.level_count < 1 {
            return Err(config_error("grid level count must be at least 1"));
        }
        if settings.distance <= Decimal::ZERO {
            return Err(config_error("grid distance must be positive"));
        }
        if settings.order_size <= Decimal::ZERO {
            return Err(config_error("grid order size must be positive"));
        }
        if settings.tick_size <= Decimal::ZERO || settings.lot_size <= Decimal::ZERO {
            return Err(config_error("tick size and lot size must be positive"));
        }
        if settings.recenter_threshold <= Decimal::ZERO {
            return Err(config_error("re-center threshold must be positive"));
        }
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &GridSettings {
        &self.settings
    }

    /// Produce the target set of levels for both sides around `reference`.
    ///
    /// Output is strictly monotonic per side: a rung whose quantized price
    /// collides with the previous one is dropped, as is any rung whose
    /// quantized size rounds to zero.
    pub fn plan(&self, reference: Decimal) -> Result<Vec<GridLevel>, TradingError> {
        if reference <= Decimal::ZERO {
            return Err(config_error(format!(
                "reference price must be positive, got {reference}"
            )));
        }

        let size = self.quantize_size(self.settings.order_size);
        if size <= Decimal::ZERO {
            // Dropped, not fatal: the next cycle may run with a usable size.
            warn!(
                "order size {} rounds to zero at lot size {}, planning no levels",
                self.settings.order_size, self.settings.lot_size
            );
            return Ok(Vec::new());
        }

        let mut levels = Vec::with_capacity(self.settings.level_count as usize * 2);
        let mut prev_bid: Option<Decimal> = None;
        let mut prev_ask: Option<Decimal> = None;

        for i in 1..=self.settings.level_count as i32 {
            let offset = self.offset(reference, i);

            let bid = self.quantize_down(reference - offset);
            if bid <= Decimal::ZERO {
                warn!("dropping bid level {} at non-positive price {}", i, bid);
            } else if prev_bid == Some(bid) {
                warn!("dropping bid level {} sharing quantized price {}", i, bid);
            } else {
                prev_bid = Some(bid);
                levels.push(GridLevel {
                    side: Side::Bid,
                    price: bid,
                    size,
                    index: -i,
                });
            }

            let ask = self.quantize_up(reference + offset);
            if prev_ask == Some(ask) {
                warn!("dropping ask level {} sharing quantized price {}", i, ask);
            } else {
                prev_ask = Some(ask);
                levels.push(GridLevel {
                    side: Side::Ask,
                    price: ask,
                    size,
                    index: i,
                });
            }
        }

        Ok(levels)
    }

    /// Whether the reference has drifted far enough from the planned center
    /// to warrant a re-plan.
    pub fn should_recenter(&self, planned_center: Decimal, reference: Decimal) -> bool {
        let drift = (reference - planned_center).abs();
        match self.settings.distance_mode {
            DistanceMode::Percentage => {
                planned_center > Decimal::ZERO
                    && drift / planned_center > self.settings.recenter_threshold
            }
            DistanceMode::Absolute => drift > self.settings.recenter_threshold,
        }
    }

    /// Price for a counter-order resting one grid step away from `base` on
    /// `side`, quantized outward so it can never cross an order at `base`.
    pub fn counter_price(&self, base: Decimal, side: Side) -> Decimal {
        let step = match self.settings.distance_mode {
            DistanceMode::Percentage => base * self.settings.distance,
            DistanceMode::Absolute => self.settings.distance,
        };
        match side {
            Side::Ask => self.quantize_up(base + step),
            Side::Bid => self.quantize_down(base - step),
        }
    }

    fn offset(&self, reference: Decimal, i: i32) -> Decimal {
        let step = Decimal::from(i) * self.settings.distance;
        match self.settings.distance_mode {
            DistanceMode::Percentage => reference * step,
            DistanceMode::Absolute => step,
        }
    }

    fn quantize_down(&self, price: Decimal) -> Decimal {
        (price / self.settings.tick_size).floor() * self.settings.tick_size
    }

    fn quantize_up(&self, price: Decimal) -> Decimal {
        (price / self.settings.tick_size).ceil() * self.settings.tick_size
    }

    fn quantize_size(&self, size: Decimal) -> Decimal {
        (size / self.settings.lot_size).floor() * self.settings.lot_size
    }
}
