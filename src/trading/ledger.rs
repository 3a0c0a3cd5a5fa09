//! Order book ledger and derived position.
//!
//! The authoritative in-process record of every order this agent has
//! placed. All mutations are driven by the reconciliation engine; adapter
//! events only report facts and are applied here under the idempotence
//! rules: a duplicate cumulative fill is a no-op, a decreasing cumulative
//! fill is an anomaly and is never applied.

use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::exchange::{OrderEvent, OrderIntent, OrderStatusReport, Side, VenueOrderState};

/// Local order lifecycle.
///
/// `Submitted` may only move to `Failed` after the acknowledgment deadline
/// expires *and* a status query could not resolve the true state; every
/// other transition is driven by adapter events or explicit intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Intended,
    Submitted,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Failed,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected | OrderState::Failed
        )
    }

    /// Working orders count against the grid diff.
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            OrderState::Submitted | OrderState::Open | OrderState::PartiallyFilled
        )
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderState::Intended => "intended",
            OrderState::Submitted => "submitted",
            OrderState::Open => "open",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Rejected => "rejected",
            OrderState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One order owned by the ledger.
#[derive(Debug, Clone)]
pub struct LedgerOrder {
    pub client_id: String,
    pub venue_order_id: Option<String>,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    /// Cumulative filled size, monotonically non-decreasing while alive
    pub filled: Decimal,
    pub state: OrderState,
    /// Signed grid slot; None for flatten/fix orders
    pub level: Option<i32>,
    /// Market orders flatten risk and get no follow-up of their own
    pub market: bool,
    /// Set once a cancel intent has been issued, to avoid re-cancelling
    pub cancel_requested: bool,
    pub submitted_at: Option<Instant>,
    pub last_sequence: u64,
}

/// Newly applied fill, handed to the engine for follow-up actions.
#[derive(Debug, Clone)]
pub struct FillDelta {
    pub client_id: String,
    pub side: Side,
    pub price: Decimal,
    /// Newly filled size (cumulative delta, always positive)
    pub delta: Decimal,
    pub level: Option<i32>,
    /// The filled order was a flatten market order
    pub market: bool,
    /// The order reached `Filled` with this event
    pub completed: bool,
    /// Profit realized by the closing part of this fill, zero when opening
    pub realized: Decimal,
}

/// Result of applying one adapter event.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    /// State advanced; `fill` is present when new quantity was filled
    Applied { fill: Option<FillDelta> },
    /// Same cumulative fill and no state to advance, no-op
    Duplicate,
    /// Cumulative fill went backwards, ignored and logged as an anomaly
    Stale,
    /// Event references an order this agent never placed
    Unknown,
}

/// Net signed position with running weighted average entry price.
#[derive(Debug, Clone, Default)]
pub struct PositionBook {
    net: Decimal,
    avg_entry: Decimal,
    realized_total: Decimal,
}

impl PositionBook {
    /// Net signed size, positive = long.
    pub fn net(&self) -> Decimal {
        self.net
    }

    pub fn avg_entry(&self) -> Decimal {
        self.avg_entry
    }

    /// Total profit realized by closing fills since startup.
    pub fn realized_total(&self) -> Decimal {
        self.realized_total
    }

    /// Apply a fill, returning the profit it realized (zero when the fill
    /// only opens or extends exposure).
    pub fn apply_fill(&mut self, side: Side, price: Decimal, quantity: Decimal) -> Decimal {
        let signed = side.sign() * quantity;
        let extending = self.net == Decimal::ZERO
            || (self.net > Decimal::ZERO) == (signed > Decimal::ZERO);

        if extending {
            let new_abs = (self.net + signed).abs();
            self.avg_entry =
                (self.avg_entry * self.net.abs() + price * quantity) / new_abs;
            self.net += signed;
            return Decimal::ZERO;
        }

        let closing = quantity.min(self.net.abs());
        let realized = if self.net > Decimal::ZERO {
            (price - self.avg_entry) * closing
        } else {
            (self.avg_entry - price) * closing
        };
        self.realized_total += realized;
        self.net += signed;

        if self.net == Decimal::ZERO {
            self.avg_entry = Decimal::ZERO;
        } else if (self.net > Decimal::ZERO) == (signed > Decimal::ZERO) {
            // Flipped through zero; the remainder opened at the fill price.
            self.avg_entry = price;
        }
        realized
    }

    /// Overwrite the net size with the venue-reported value. Average entry
    /// is kept; the venue does not report it.
    pub fn correct(&mut self, venue_net: Decimal) {
        self.net = venue_net;
        if self.net == Decimal::ZERO {
            self.avg_entry = Decimal::ZERO;
        }
    }
}

/// Terminal orders kept around for late duplicate events before eviction.
const FINISHED_RETENTION: usize = 256;

/// Authoritative record of all orders placed by this agent.
#[derive(Debug, Default)]
pub struct OrderBookLedger {
    orders: HashMap<String, LedgerOrder>,
    by_venue: HashMap<String, String>,
    finished: VecDeque<String>,
    position: PositionBook,
}

impl OrderBookLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> &PositionBook {
        &self.position
    }

    pub fn position_mut(&mut self) -> &mut PositionBook {
        &mut self.position
    }

    pub fn get(&self, client_id: &str) -> Option<&LedgerOrder> {
        self.orders.get(client_id)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Record a new intent in `Intended` state.
    pub fn register_intent(&mut self, intent: &OrderIntent) {
        self.orders.insert(
            intent.client_id.clone(),
            LedgerOrder {
                client_id: intent.client_id.clone(),
                venue_order_id: None,
                side: intent.side,
                price: intent.price,
                size: intent.size,
                filled: Decimal::ZERO,
                state: OrderState::Intended,
                level: intent.level,
                market: intent.market,
                cancel_requested: false,
                submitted_at: None,
                last_sequence: 0,
            },
        );
    }

    pub fn mark_submitted(&mut self, client_id: &str) {
        if let Some(order) = self.orders.get_mut(client_id) {
            if order.state == OrderState::Intended {
                order.state = OrderState::Submitted;
                order.submitted_at = Some(Instant::now());
            }
        }
    }

    /// Record the venue acknowledgment. Idempotent; never moves a fill
    /// state backwards.
    pub fn acknowledge(&mut self, client_id: &str, venue_order_id: &str) {
        if let Some(order) = self.orders.get_mut(client_id) {
            if order.venue_order_id.is_none() {
                order.venue_order_id = Some(venue_order_id.to_string());
                self.by_venue
                    .insert(venue_order_id.to_string(), client_id.to_string());
            }
            if matches!(order.state, OrderState::Intended | OrderState::Submitted) {
                order.state = OrderState::Open;
            }
        }
    }

    pub fn mark_rejected(&mut self, client_id: &str) {
        self.finalize(client_id, OrderState::Rejected);
    }

    pub fn mark_failed(&mut self, client_id: &str) {
        self.finalize(client_id, OrderState::Failed);
    }

    pub fn mark_cancelled(&mut self, client_id: &str) {
        self.finalize(client_id, OrderState::Cancelled);
    }

    pub fn mark_cancel_requested(&mut self, client_id: &str) {
        if let Some(order) = self.orders.get_mut(client_id) {
            order.cancel_requested = true;
        }
    }

    fn finalize(&mut self, client_id: &str, state: OrderState) {
        let finished = match self.orders.get_mut(client_id) {
            Some(order) if !order.state.is_terminal() => {
                order.state = state;
                true
            }
            _ => false,
        };
        if finished {
            self.record_finished(client_id);
        }
    }

    /// Track a terminal order and evict the oldest beyond the retention
    /// window. Events for evicted orders resolve as `Unknown` and are left
    /// to the snapshot cycle.
    fn record_finished(&mut self, client_id: &str) {
        self.finished.push_back(client_id.to_string());
        while self.finished.len() > FINISHED_RETENTION {
            let Some(evicted) = self.finished.pop_front() else {
                break;
            };
            let Some(order) = self.orders.get(&evicted) else {
                continue;
            };
            if !order.state.is_terminal() {
                continue;
            }
            if let Some(venue_id) = &order.venue_order_id {
                self.by_venue.remove(venue_id);
            }
            self.orders.remove(&evicted);
        }
    }

    /// All orders currently counting against the venue.
    pub fn working_orders(&self) -> impl Iterator<Item = &LedgerOrder> {
        self.orders.values().filter(|o| o.state.is_working())
    }

    /// Grid slots that still carry a working order, on either side.
    pub fn occupied_slots(&self) -> HashSet<i32> {
        self.working_orders().filter_map(|o| o.level).collect()
    }

    /// Working order resting at a given grid slot, if any.
    pub fn order_at_slot(&self, slot: i32) -> Option<&LedgerOrder> {
        self.working_orders().find(|o| o.level == Some(slot))
    }

    /// Venue ids of all working orders that have been acknowledged.
    pub fn working_venue_ids(&self) -> HashSet<String> {
        self.working_orders()
            .filter_map(|o| o.venue_order_id.clone())
            .collect()
    }

    /// Client ids stuck in `Submitted` past the acknowledgment deadline.
    /// The engine resolves these with a status query before finalizing.
    pub fn expired_submissions(&self, deadline: Duration) -> Vec<String> {
        self.orders
            .values()
            .filter(|o| {
                o.state == OrderState::Submitted
                    && o.submitted_at
                        .map(|t| t.elapsed() > deadline)
                        .unwrap_or(false)
            })
            .map(|o| o.client_id.clone())
            .collect()
    }

    /// Resolve an event to the client id of an order we own.
    fn resolve(&self, event: &OrderEvent) -> Option<String> {
        if let Some(client_id) = self.by_venue.get(&event.venue_order_id) {
            return Some(client_id.clone());
        }
        event
            .client_id
            .as_ref()
            .filter(|id| self.orders.contains_key(*id))
            .cloned()
    }

    /// Apply one adapter event under the idempotence and ordering rules.
    pub fn apply_event(&mut self, event: &OrderEvent) -> EventOutcome {
        let Some(client_id) = self.resolve(event) else {
            return EventOutcome::Unknown;
        };

        // Learn the venue id as soon as any event carries it.
        self.acknowledge_mapping(&client_id, &event.venue_order_id);

        let Some(order) = self.orders.get_mut(&client_id) else {
            return EventOutcome::Unknown;
        };

        if event.cumulative_filled < order.filled {
            warn!(
                "stale event for {}: cumulative {} < recorded {}, ignoring",
                client_id, event.cumulative_filled, order.filled
            );
            return EventOutcome::Stale;
        }

        if event.sequence > order.last_sequence {
            order.last_sequence = event.sequence;
        }

        if event.cumulative_filled == order.filled {
            return self.apply_state_only(&client_id, event.state);
        }

        // New quantity filled. A fill always wins over a pending or even a
        // confirmed cancel (cancel/fill race).
        let Some(order) = self.orders.get_mut(&client_id) else {
            return EventOutcome::Unknown;
        };
        let delta = event.cumulative_filled - order.filled;
        order.filled = event.cumulative_filled;

        let completed = event.state == VenueOrderState::Filled || order.filled >= order.size;
        order.state = if completed {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };

        let fill_price = event.fill_price.unwrap_or(order.price);
        let side = order.side;
        let level = order.level;
        let market = order.market;
        let realized = self.position.apply_fill(side, fill_price, delta);

        debug!(
            "fill applied: {} {} {} @ {} (delta {}, position {})",
            client_id,
            side,
            event.cumulative_filled,
            fill_price,
            delta,
            self.position.net()
        );

        if completed {
            self.record_finished(&client_id);
        }

        EventOutcome::Applied {
            fill: Some(FillDelta {
                client_id,
                side,
                price: fill_price,
                delta,
                level,
                market,
                completed,
                realized,
            }),
        }
    }

    /// Apply a status report obtained from a reconciling query, reusing the
    /// event path so the same idempotence rules hold.
    pub fn apply_report(&mut self, client_id: &str, report: &OrderStatusReport) -> EventOutcome {
        let venue_order_id = report
            .venue_order_id
            .clone()
            .or_else(|| {
                self.orders
                    .get(client_id)
                    .and_then(|o| o.venue_order_id.clone())
            })
            .unwrap_or_default();
        let event = OrderEvent {
            venue_order_id,
            client_id: Some(client_id.to_string()),
            state: report.state,
            cumulative_filled: report.cumulative_filled,
            fill_price: report.fill_price,
            sequence: 0,
            timestamp: chrono::Utc::now(),
        };
        self.apply_event(&event)
    }

    fn acknowledge_mapping(&mut self, client_id: &str, venue_order_id: &str) {
        if venue_order_id.is_empty() {
            return;
        }
        if let Some(order) = self.orders.get_mut(client_id) {
            if order.venue_order_id.is_none() {
                order.venue_order_id = Some(venue_order_id.to_string());
            }
        }
        self.by_venue
            .entry(venue_order_id.to_string())
            .or_insert_with(|| client_id.to_string());
    }

    /// State transition with no new filled quantity.
    fn apply_state_only(&mut self, client_id: &str, state: VenueOrderState) -> EventOutcome {
        let Some(order) = self.orders.get_mut(client_id) else {
            return EventOutcome::Unknown;
        };
        let outcome = match state {
            VenueOrderState::Open => {
                if matches!(order.state, OrderState::Intended | OrderState::Submitted) {
                    order.state = OrderState::Open;
                    EventOutcome::Applied { fill: None }
                } else {
                    EventOutcome::Duplicate
                }
            }
            VenueOrderState::PartiallyFilled => EventOutcome::Duplicate,
            VenueOrderState::Filled => {
                // Completion confirmation after the quantity already arrived.
                if order.state != OrderState::Filled && order.filled >= order.size {
                    order.state = OrderState::Filled;
                    EventOutcome::Applied { fill: None }
                } else {
                    EventOutcome::Duplicate
                }
            }
            VenueOrderState::Cancelled => {
                if order.state.is_terminal() {
                    EventOutcome::Duplicate
                } else {
                    order.state = OrderState::Cancelled;
                    EventOutcome::Applied { fill: None }
                }
            }
            VenueOrderState::Rejected => {
                if order.state.is_terminal() {
                    EventOutcome::Duplicate
                } else {
                    order.state = OrderState::Rejected;
                    EventOutcome::Applied { fill: None }
                }
            }
        };

        if matches!(outcome, EventOutcome::Applied { .. }) {
            let terminal = self
                .orders
                .get(client_id)
                .map(|o| o.state.is_terminal())
                .unwrap_or(false);
            if terminal {
                self.record_finished(client_id);
            }
        }
        outcome
    }
}
