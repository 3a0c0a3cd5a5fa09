//! Trading core: ledger, reconciliation engine, error taxonomy and stats.

pub mod errors;
pub mod ledger;
pub mod reconciler;
pub mod stats;

pub use errors::TradingError;
pub use ledger::{EventOutcome, FillDelta, LedgerOrder, OrderBookLedger, OrderState, PositionBook};
pub use reconciler::{EngineSettings, ReconciliationEngine};
pub use stats::RunStats;
