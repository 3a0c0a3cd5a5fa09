//! Exchange adapter boundary.
//!
//! The core never talks to a venue directly. It consumes the
//! [`ExchangeAdapter`] trait for outbound calls and a unified stream of
//! [`OrderEvent`]s the adapter feeds into the per-account channel.
//! Transport, reconnection and authentication are entirely the adapter's
//! problem; the core only sees normalized facts.

pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use paper::PaperExchange;

/// Order side. Bids rest below the reference price, asks above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }

    /// Sign applied to filled size when accumulating net position.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Bid => Decimal::ONE,
            Side::Ask => -Decimal::ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Bid => write!(f, "bid"),
            Side::Ask => write!(f, "ask"),
        }
    }
}

/// An order the core wants resting on the venue.
#[derive(Debug, Clone)]
pub struct OrderIntent {
    /// Locally generated id, unique for the lifetime of the run
    pub client_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    /// Signed grid slot (negative bids, positive asks); None for
    /// flatten and fix orders
    pub level: Option<i32>,
    /// Market orders are only used to flatten risk
    pub market: bool,
}

impl OrderIntent {
    pub fn limit(side: Side, price: Decimal, size: Decimal, level: Option<i32>) -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            side,
            price,
            size,
            level,
            market: false,
        }
    }

    pub fn market(side: Side, price: Decimal, size: Decimal) -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            side,
            price,
            size,
            level: None,
            market: true,
        }
    }
}

/// Venue-reported lifecycle state carried inside an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueOrderState {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// One entry of the unified order event stream.
///
/// `cumulative_filled` is the venue's total filled size for the order, not
/// a delta; the ledger derives deltas and discards anything that would move
/// state backward.
#[derive(Debug, Clone)]
pub struct OrderEvent {
    pub venue_order_id: String,
    pub client_id: Option<String>,
    pub state: VenueOrderState,
    pub cumulative_filled: Decimal,
    pub fill_price: Option<Decimal>,
    /// Venue-assigned sequence, used to re-sequence multiplexed streams
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time order status, returned by reconciling queries after a
/// client-side timeout.
#[derive(Debug, Clone)]
pub struct OrderStatusReport {
    pub venue_order_id: Option<String>,
    pub state: VenueOrderState,
    pub cumulative_filled: Decimal,
    pub fill_price: Option<Decimal>,
}

/// A resting order as the venue reports it in a snapshot.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub venue_order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub filled: Decimal,
}

/// Authoritative account state, polled as reconciliation ground truth.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    /// Net signed position, positive = long
    pub position: Decimal,
    pub open_orders: Vec<OpenOrder>,
}

/// Venue-reported and transport errors at the adapter boundary
#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    /// Venue-side validation failure
    #[error("Order rejected: {reason}")]
    Rejected { reason: String },

    /// Cancel raced a fill; the fill event wins
    #[error("Order already filled: {venue_order_id}")]
    AlreadyFilled { venue_order_id: String },

    /// The venue does not know the order
    #[error("Order not found: {order_ref}")]
    NotFound { order_ref: String },

    /// Network or unknown transport error
    #[error("Transport failure: {message}")]
    TransportFailure { message: String },

    /// Throttled by the venue
    #[error("Rate limited: {message}")]
    RateLimited { message: String },
}

impl AdapterError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::TransportFailure { .. } | AdapterError::RateLimited { .. }
        )
    }
}

/// Normalized venue operations consumed by the reconciliation engine.
///
/// Implementations own credentials, signing and reconnection; order events
/// arrive through the channel handed to the engine, not through this trait.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Place an order. Returns the venue-assigned order id on acknowledgment.
    async fn place_order(&self, intent: &OrderIntent) -> Result<String, AdapterError>;

    /// Request cancellation of a resting order.
    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), AdapterError>;

    /// Status query by client intent id, used to resolve timed-out calls
    /// before any state is finalized.
    async fn query_order(&self, client_id: &str) -> Result<OrderStatusReport, AdapterError>;

    /// Authoritative position and open-order snapshot.
    async fn account_snapshot(&self) -> Result<AccountSnapshot, AdapterError>;
}
