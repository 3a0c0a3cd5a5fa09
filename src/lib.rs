//! Grid Pilot - grid-trading agent with a reconciliation core
//!
//! Features:
//! - Ladder of resting limit orders re-armed on fills
//! - Idempotent order-and-position reconciliation against venue events
//! - Position limits with clip-or-reject enforcement
//! - Realized-PnL log and account status rows in SQLite

pub mod config;
pub mod exchange;
pub mod grid;
pub mod persist;
pub mod trading;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use exchange::{
    AccountSnapshot, AdapterError, ExchangeAdapter, OrderEvent, OrderIntent, OrderStatusReport,
    PaperExchange, Side, VenueOrderState,
};
pub use grid::{Direction, DistanceMode, GridLevel, GridPlanner, GridSettings, RiskGuard};
pub use persist::{AccountStatus, ProfitStore, RecordCommand, RecorderHandle};
pub use trading::{
    EngineSettings, EventOutcome, FillDelta, OrderBookLedger, OrderState, PositionBook,
    ReconciliationEngine, RunStats, TradingError,
};
pub use utils::{rate_limiter, retry};

/// Agent version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
