//! In-memory paper venue.
//!
//! Stands in for a live exchange in simulation mode and in integration
//! tests: orders rest in a book, `tick` crosses them against a trade price,
//! and every transition is reported through the same event stream a live
//! adapter would feed.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{
    AccountSnapshot, AdapterError, ExchangeAdapter, OpenOrder, OrderEvent, OrderIntent,
    OrderStatusReport, Side, VenueOrderState,
};

#[derive(Debug, Clone)]
struct PaperOrder {
    venue_id: String,
    client_id: String,
    side: Side,
    price: Decimal,
    size: Decimal,
    filled: Decimal,
    open: bool,
}

#[derive(Default)]
struct PaperBook {
    orders: HashMap<String, PaperOrder>,
    by_client: HashMap<String, String>,
    position: Decimal,
    next_id: u64,
    sequence: u64,
}

impl PaperBook {
    fn next_venue_id(&mut self) -> String {
        self.next_id += 1;
        format!("P-{}", self.next_id)
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

/// Paper venue implementing the adapter contract against local state.
pub struct PaperExchange {
    book: Mutex<PaperBook>,
    events: mpsc::Sender<OrderEvent>,
}

impl PaperExchange {
    /// Create the venue together with its order event stream.
    pub fn new(event_buffer: usize) -> (Self, mpsc::Receiver<OrderEvent>) {
        let (tx, rx) = mpsc::channel(event_buffer);
        (
            Self {
                book: Mutex::new(PaperBook::default()),
                events: tx,
            },
            rx,
        )
    }

    async fn emit(&self, order: &PaperOrder, state: VenueOrderState, sequence: u64) {
        let event = OrderEvent {
            venue_order_id: order.venue_id.clone(),
            client_id: Some(order.client_id.clone()),
            state,
            cumulative_filled: order.filled,
            fill_price: Some(order.price),
            sequence,
            timestamp: Utc::now(),
        };
        // Receiver dropped means the engine is gone; nothing left to notify.
        let _ = self.events.send(event).await;
    }

    /// Cross resting orders against a trade price: bids fill at or above
    /// the trade, asks at or below. Fills are full and at the order price.
    pub async fn tick(&self, price: Decimal) {
        let filled = {
            let mut book = self.book.lock().await;
            let crossed: Vec<String> = book
                .orders
                .values()
                .filter(|o| {
                    o.open
                        && match o.side {
                            Side::Bid => price <= o.price,
                            Side::Ask => price >= o.price,
                        }
                })
                .map(|o| o.venue_id.clone())
                .collect();

            let mut done = Vec::new();
            for venue_id in crossed {
                let seq = book.next_sequence();
                let Some(order) = book.orders.get_mut(&venue_id) else {
                    continue;
                };
                order.filled = order.size;
                order.open = false;
                let snapshot = order.clone();
                book.position += snapshot.side.sign() * snapshot.size;
                debug!("paper fill: {} {} @ {}", snapshot.side, snapshot.size, snapshot.price);
                done.push((snapshot, seq));
            }
            done
        };

        for (order, seq) in filled {
            self.emit(&order, VenueOrderState::Filled, seq).await;
        }
    }

    /// Scripted partial or full fill of one order, for tests.
    pub async fn fill(&self, venue_order_id: &str, quantity: Decimal) -> Result<(), AdapterError> {
        let (order, seq, state) = {
            let mut book = self.book.lock().await;
            let seq = book.next_sequence();
            let order = book
                .orders
                .get_mut(venue_order_id)
                .ok_or_else(|| AdapterError::NotFound {
                    order_ref: venue_order_id.to_string(),
                })?;
            order.filled = (order.filled + quantity).min(order.size);
            let state = if order.filled >= order.size {
                order.open = false;
                VenueOrderState::Filled
            } else {
                VenueOrderState::PartiallyFilled
            };
            let snapshot = order.clone();
            book.position += snapshot.side.sign() * quantity;
            (snapshot, seq, state)
        };
        self.emit(&order, state, seq).await;
        Ok(())
    }

    /// Replay the last reported state of one order, for duplicate-event tests.
    pub async fn replay_last(&self, venue_order_id: &str) -> Result<(), AdapterError> {
        let (order, seq, state) = {
            let mut book = self.book.lock().await;
            let seq = book.next_sequence();
            let order = book
                .orders
                .get(venue_order_id)
                .cloned()
                .ok_or_else(|| AdapterError::NotFound {
                    order_ref: venue_order_id.to_string(),
                })?;
            let state = if order.filled >= order.size {
                VenueOrderState::Filled
            } else if order.filled > Decimal::ZERO {
                VenueOrderState::PartiallyFilled
            } else {
                VenueOrderState::Open
            };
            (order, seq, state)
        };
        self.emit(&order, state, seq).await;
        Ok(())
    }

    /// Current net position held at the venue.
    pub async fn position(&self) -> Decimal {
        self.book.lock().await.position
    }

    /// Venue order id assigned to a client intent, if any.
    pub async fn venue_id_for(&self, client_id: &str) -> Option<String> {
        self.book.lock().await.by_client.get(client_id).cloned()
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn place_order(&self, intent: &OrderIntent) -> Result<String, AdapterError> {
        if intent.size <= Decimal::ZERO || intent.price <= Decimal::ZERO {
            return Err(AdapterError::Rejected {
                reason: format!(
                    "non-positive price or size: {} @ {}",
                    intent.size, intent.price
                ),
            });
        }

        let (order, seq, state) = {
            let mut book = self.book.lock().await;
            let venue_id = book.next_venue_id();
            let seq = book.next_sequence();
            let mut order = PaperOrder {
                venue_id: venue_id.clone(),
                client_id: intent.client_id.clone(),
                side: intent.side,
                price: intent.price,
                size: intent.size,
                filled: Decimal::ZERO,
                open: true,
            };

            let state = if intent.market {
                // Market orders fill immediately at the supplied price.
                order.filled = order.size;
                order.open = false;
                book.position += order.side.sign() * order.size;
                VenueOrderState::Filled
            } else {
                VenueOrderState::Open
            };

            book.by_client
                .insert(intent.client_id.clone(), venue_id.clone());
            book.orders.insert(venue_id, order.clone());
            (order, seq, state)
        };

        self.emit(&order, state, seq).await;
        Ok(order.venue_id)
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), AdapterError> {
        let (order, seq) = {
            let mut book = self.book.lock().await;
            let seq = book.next_sequence();
            let order = book
                .orders
                .get_mut(venue_order_id)
                .ok_or_else(|| AdapterError::NotFound {
                    order_ref: venue_order_id.to_string(),
                })?;
            if order.filled >= order.size {
                return Err(AdapterError::AlreadyFilled {
                    venue_order_id: venue_order_id.to_string(),
                });
            }
            order.open = false;
            (order.clone(), seq)
        };
        self.emit(&order, VenueOrderState::Cancelled, seq).await;
        Ok(())
    }

    async fn query_order(&self, client_id: &str) -> Result<OrderStatusReport, AdapterError> {
        let book = self.book.lock().await;
        let venue_id = book
            .by_client
            .get(client_id)
            .ok_or_else(|| AdapterError::NotFound {
                order_ref: client_id.to_string(),
            })?;
        let order = book.orders.get(venue_id).ok_or_else(|| AdapterError::NotFound {
            order_ref: client_id.to_string(),
        })?;

        let state = if order.filled >= order.size {
            VenueOrderState::Filled
        } else if !order.open {
            VenueOrderState::Cancelled
        } else if order.filled > Decimal::ZERO {
            VenueOrderState::PartiallyFilled
        } else {
            VenueOrderState::Open
        };

        Ok(OrderStatusReport {
            venue_order_id: Some(order.venue_id.clone()),
            state,
            cumulative_filled: order.filled,
            fill_price: Some(order.price),
        })
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, AdapterError> {
        let book = self.book.lock().await;
        let open_orders = book
            .orders
            .values()
            .filter(|o| o.open)
            .map(|o| OpenOrder {
                venue_order_id: o.venue_id.clone(),
                side: o.side,
                price: o.price,
                size: o.size,
                filled: o.filled,
            })
            .collect();
        Ok(AccountSnapshot {
            position: book.position,
            open_orders,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_limit_order_rests_then_fills_on_cross() {
        let (venue, mut events) = PaperExchange::new(16);
        let intent = OrderIntent::limit(Side::Bid, dec!(99), dec!(1), Some(-1));
        let venue_id = venue.place_order(&intent).await.unwrap();

        let open = events.recv().await.unwrap();
        assert_eq!(open.state, VenueOrderState::Open);
        assert_eq!(open.venue_order_id, venue_id);

        venue.tick(dec!(98.5)).await;
        let fill = events.recv().await.unwrap();
        assert_eq!(fill.state, VenueOrderState::Filled);
        assert_eq!(fill.cumulative_filled, dec!(1));
        assert_eq!(venue.position().await, dec!(1));
    }

    #[tokio::test]
    async fn test_market_order_fills_immediately() {
        let (venue, mut events) = PaperExchange::new(16);
        let intent = OrderIntent::market(Side::Ask, dec!(100), dec!(2));
        venue.place_order(&intent).await.unwrap();

        let fill = events.recv().await.unwrap();
        assert_eq!(fill.state, VenueOrderState::Filled);
        assert_eq!(venue.position().await, dec!(-2));
    }

    #[tokio::test]
    async fn test_cancel_after_fill_reports_already_filled() {
        let (venue, mut events) = PaperExchange::new(16);
        let intent = OrderIntent::limit(Side::Ask, dec!(101), dec!(1), Some(1));
        let venue_id = venue.place_order(&intent).await.unwrap();
        events.recv().await.unwrap();

        venue.tick(dec!(102)).await;
        events.recv().await.unwrap();

        let err = venue.cancel_order(&venue_id).await.unwrap_err();
        assert!(matches!(err, AdapterError::AlreadyFilled { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_reflects_open_orders_and_position() {
        let (venue, _events) = PaperExchange::new(16);
        venue
            .place_order(&OrderIntent::limit(Side::Bid, dec!(99), dec!(1), Some(-1)))
            .await
            .unwrap();
        venue
            .place_order(&OrderIntent::limit(Side::Ask, dec!(101), dec!(1), Some(1)))
            .await
            .unwrap();

        let snap = venue.account_snapshot().await.unwrap();
        assert_eq!(snap.open_orders.len(), 2);
        assert_eq!(snap.position, dec!(0));
    }
}
