//! Run statistics for the periodic status report.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Counters accumulated over one run of the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub start_time: String,
    pub orders_placed: u64,
    pub orders_filled: u64,
    pub orders_cancelled: u64,
    pub orders_rejected: u64,
    pub orders_failed: u64,
    pub duplicate_events: u64,
    pub stale_events: u64,
    pub divergences: u64,
    pub recenters: u64,
    pub errors: u64,
    pub total_volume: Decimal,
    pub realized_pnl: Decimal,
    pub last_update: String,
}

impl RunStats {
    /// Create new stats with current time
    pub fn new() -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            start_time: now.clone(),
            last_update: now,
            ..Default::default()
        }
    }

    pub fn record_order_placed(&mut self, size: Decimal) {
        self.orders_placed += 1;
        self.total_volume += size;
        self.update_time();
    }

    pub fn record_order_filled(&mut self) {
        self.orders_filled += 1;
        self.update_time();
    }

    pub fn record_order_cancelled(&mut self) {
        self.orders_cancelled += 1;
        self.update_time();
    }

    pub fn record_order_rejected(&mut self) {
        self.orders_rejected += 1;
        self.update_time();
    }

    pub fn record_order_failed(&mut self) {
        self.orders_failed += 1;
        self.update_time();
    }

    pub fn record_duplicate_event(&mut self) {
        self.duplicate_events += 1;
        self.update_time();
    }

    /// Stale events indicate a venue anomaly, counted separately
    pub fn record_stale_event(&mut self) {
        self.stale_events += 1;
        self.update_time();
    }

    pub fn record_divergence(&mut self) {
        self.divergences += 1;
        self.update_time();
    }

    pub fn record_recenter(&mut self) {
        self.recenters += 1;
        self.update_time();
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
        self.update_time();
    }

    pub fn record_realized(&mut self, pnl: Decimal) {
        self.realized_pnl += pnl;
        self.update_time();
    }

    /// One-line summary for the periodic report
    pub fn summary(&self) -> String {
        format!(
            "📊 Stats: placed={}, filled={}, cancelled={}, rejected={}, failed={}, dup={}, stale={}, divergences={}, recenters={}, errors={}, volume={}, realized={}",
            self.orders_placed,
            self.orders_filled,
            self.orders_cancelled,
            self.orders_rejected,
            self.orders_failed,
            self.duplicate_events,
            self.stale_events,
            self.divergences,
            self.recenters,
            self.errors,
            self.total_volume,
            self.realized_pnl
        )
    }

    fn update_time(&mut self) {
        self.last_update = chrono::Utc::now().to_rfc3339();
    }
}
