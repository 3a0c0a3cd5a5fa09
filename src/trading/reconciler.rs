//! Reconciliation engine.
//!
//! Single writer for one account: every ledger mutation (fills, acks,
//! cancels, snapshot corrections) flows through this task in one
//! consistent order. It also drives the diff between the planner's target
//! ladder and the orders currently working at the venue.

use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::exchange::{
    AdapterError, ExchangeAdapter, OrderEvent, OrderIntent, Side, VenueOrderState,
};
use crate::grid::{GridPlanner, RiskGuard};
use crate::persist::{AccountStatus, RecordCommand, RecorderHandle};
use crate::trading::errors::{config_error, TradingError};
use crate::trading::ledger::{EventOutcome, FillDelta, OrderBookLedger};
use crate::trading::stats::RunStats;
use crate::utils::{retry_with_backoff, RateLimiter, RetryConfig};

/// Engine timing and policy knobs
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How long a placement may sit unacknowledged before a status query
    pub ack_deadline: Duration,
    /// Interval between authoritative venue snapshot polls
    pub snapshot_interval: Duration,
    /// Interval between status report lines
    pub report_interval: Duration,
    /// Position divergence tolerated before correction
    pub position_tolerance: Decimal,
    pub fix_order_enabled: bool,
    pub auto_close_enabled: bool,
    /// Working orders allowed per side before the farthest are pruned
    pub max_orders_per_side: usize,
    /// Minimum spacing between outbound venue calls
    pub place_min_interval_ms: u64,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ack_deadline: Duration::from_secs(config.engine.ack_deadline_secs),
            snapshot_interval: Duration::from_secs(config.engine.snapshot_interval_secs),
            report_interval: Duration::from_secs(config.engine.report_interval_secs),
            position_tolerance: config.position_tolerance(),
            fix_order_enabled: config.risk.fix_order_enabled,
            auto_close_enabled: config.risk.auto_close_enabled,
            max_orders_per_side: config.risk.max_orders_per_side,
            place_min_interval_ms: config.engine.place_min_interval_ms,
        }
    }
}

/// Per-account reconciliation context: ledger, planner, risk limits and the
/// adapter handle, owned by exactly one task.
pub struct ReconciliationEngine<A: ExchangeAdapter> {
    adapter: Arc<A>,
    planner: GridPlanner,
    risk: RiskGuard,
    ledger: OrderBookLedger,
    stats: RunStats,
    recorder: Option<RecorderHandle>,
    limiter: RateLimiter,
    settings: EngineSettings,
    planned_center: Option<Decimal>,
    last_reference: Option<Decimal>,
    paused: bool,
}

impl<A: ExchangeAdapter> ReconciliationEngine<A> {
    pub fn new(
        adapter: Arc<A>,
        planner: GridPlanner,
        risk: RiskGuard,
        settings: EngineSettings,
        recorder: Option<RecorderHandle>,
    ) -> Result<Self, TradingError> {
        if settings.fix_order_enabled && settings.auto_close_enabled {
            return Err(config_error(
                "fix-order and auto-close are mutually exclusive",
            ));
        }
        let limiter = RateLimiter::new(settings.place_min_interval_ms);
        Ok(Self {
            adapter,
            planner,
            risk,
            ledger: OrderBookLedger::new(),
            stats: RunStats::new(),
            recorder,
            limiter,
            settings,
            planned_center: None,
            last_reference: None,
            paused: false,
        })
    }

    pub fn ledger(&self) -> &OrderBookLedger {
        &self.ledger
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Main loop. Consumes the per-account event and price channels until
    /// shutdown, interleaving snapshot polls, ack sweeps and reports.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<OrderEvent>,
        mut prices: mpsc::Receiver<Decimal>,
        shutdown: CancellationToken,
    ) -> Result<(), TradingError> {
        self.set_status(AccountStatus::Active);
        // Startup snapshot is the one reconciliation that is allowed to be
        // fatal: without venue truth we must not trade.
        self.reconcile_snapshot().await?;

        let mut snapshot_tick = tokio::time::interval(self.settings.snapshot_interval);
        snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep_tick = tokio::time::interval(Duration::from_secs(1));
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut report_tick = tokio::time::interval(self.settings.report_interval);
        report_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Intervals fire immediately once; consume those ticks.
        snapshot_tick.tick().await;
        sweep_tick.tick().await;
        report_tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                }
                Some(price) = prices.recv() => {
                    self.handle_price(price).await;
                }
                _ = snapshot_tick.tick() => {
                    if let Err(e) = self.reconcile_snapshot().await {
                        warn!("snapshot reconciliation failed: {}", e);
                        self.stats.record_error();
                    }
                }
                _ = sweep_tick.tick() => {
                    self.sweep_acks().await;
                }
                _ = report_tick.tick() => {
                    self.report();
                }
            }
        }

        self.cancel_all_working().await;
        self.set_status(AccountStatus::Stopped);
        Ok(())
    }

    /// Absorb a reference price update, re-centering the grid when it has
    /// drifted past the threshold, then sync the ladder.
    pub async fn handle_price(&mut self, reference: Decimal) {
        let recenter = match self.planned_center {
            None => true,
            Some(center) => self.planner.should_recenter(center, reference),
        };
        if recenter {
            if self.planned_center.is_some() {
                info!("📐 re-centering grid at {}", reference);
                self.stats.record_recenter();
                self.cancel_grid_orders().await;
            }
            self.planned_center = Some(reference);
        }
        self.last_reference = Some(reference);
        if let Err(e) = self.sync_grid().await {
            warn!("grid sync failed: {}", e);
            self.stats.record_error();
        }
    }

    /// Diff the planned ladder against working orders: place missing
    /// levels, prune obsolete or excess orders.
    pub async fn sync_grid(&mut self) -> Result<(), TradingError> {
        let Some(center) = self.planned_center else {
            return Ok(());
        };
        let levels = self.planner.plan(center)?;
        let planned_slots: HashSet<i32> = levels.iter().map(|l| l.index).collect();
        let occupied = self.ledger.occupied_slots();
        let open_side = self.planner.settings().direction.open_side();

        for level in levels {
            if occupied.contains(&level.index) {
                continue;
            }
            // While paused at the position limit the open side halts
            // entirely; close-side orders keep working the position down.
            if self.paused && level.side == open_side {
                continue;
            }
            if self.side_is_capped(level.side) {
                continue;
            }
            let intent = OrderIntent::limit(level.side, level.price, level.size, Some(level.index));
            self.place(intent).await;
        }

        self.prune(&planned_slots).await;
        self.update_pause_state();
        Ok(())
    }

    /// Apply one adapter event and run the fill follow-up rules.
    pub async fn handle_event(&mut self, event: OrderEvent) {
        match self.ledger.apply_event(&event) {
            EventOutcome::Applied { fill: Some(fill) } => {
                self.follow_up(fill).await;
            }
            EventOutcome::Applied { fill: None } => match event.state {
                VenueOrderState::Cancelled => self.stats.record_order_cancelled(),
                VenueOrderState::Rejected => self.stats.record_order_rejected(),
                _ => {}
            },
            EventOutcome::Duplicate => self.stats.record_duplicate_event(),
            EventOutcome::Stale => self.stats.record_stale_event(),
            EventOutcome::Unknown => {
                warn!(
                    "event for unknown order {} ignored, next snapshot will reconcile",
                    event.venue_order_id
                );
            }
        }
    }

    /// Fill follow-up per the grid recycling rules. Exactly one policy
    /// intent per fill: auto-close flattens the delta immediately; otherwise
    /// a completed grid fill re-arms the opposite side at the same slot. In
    /// fix-order mode partial deltas are countered as they arrive instead of
    /// waiting for completion.
    async fn follow_up(&mut self, fill: FillDelta) {
        if fill.completed {
            self.stats.record_order_filled();
        }
        if fill.realized != Decimal::ZERO {
            self.stats.record_realized(fill.realized);
            self.record(RecordCommand::Profit {
                price: fill.price,
                position: self.ledger.position().net(),
                period_profit: fill.realized,
            });
        }
        self.update_pause_state();

        // Flatten fills restore risk; following them up would loop.
        if fill.delta <= Decimal::ZERO || fill.market {
            return;
        }

        if self.settings.auto_close_enabled {
            let flatten = OrderIntent::market(fill.side.opposite(), fill.price, fill.delta);
            debug!("auto-close: flattening {} at {}", fill.delta, fill.price);
            self.place(flatten).await;
            return;
        }

        if let Some(slot) = fill.level {
            if fill.completed {
                // Re-arm the opposite side at the vacated slot at the
                // level's own price, not the fill price. Plain mode re-arms
                // the full level size; fix-order mode already countered the
                // earlier deltas, so only the final delta remains.
                let (size, price) = match self.ledger.get(&fill.client_id) {
                    Some(order) if !self.settings.fix_order_enabled => (order.size, order.price),
                    Some(order) => (fill.delta, order.price),
                    None => (fill.delta, fill.price),
                };
                let intent = OrderIntent::limit(fill.side.opposite(), price, size, Some(slot));
                debug!(
                    "re-arming slot {} with {} {} @ {}",
                    slot, intent.side, size, price
                );
                self.place(intent).await;
            } else if self.settings.fix_order_enabled {
                // The remainder is still resting at its slot. The counter
                // goes out as a non-grid order one step away; an opposite
                // order at the same price would cross our own remainder.
                let base = self
                    .ledger
                    .get(&fill.client_id)
                    .map(|o| o.price)
                    .unwrap_or(fill.price);
                let side = fill.side.opposite();
                let price = self.planner.counter_price(base, side);
                let intent = OrderIntent::limit(side, price, fill.delta, None);
                debug!(
                    "countering partial fill with {} {} @ {}",
                    side, fill.delta, price
                );
                self.place(intent).await;
            }
        }
    }

    /// Resolve placements stuck past the ack deadline with a status query
    /// before finalizing anything.
    pub async fn sweep_acks(&mut self) {
        for client_id in self.ledger.expired_submissions(self.settings.ack_deadline) {
            match self.adapter.query_order(&client_id).await {
                Ok(report) => {
                    if let EventOutcome::Applied { fill: Some(fill) } =
                        self.ledger.apply_report(&client_id, &report)
                    {
                        self.follow_up(fill).await;
                    }
                }
                Err(AdapterError::NotFound { .. }) => {
                    warn!("placement {} never reached the venue, failing it", client_id);
                    self.ledger.mark_failed(&client_id);
                    self.stats.record_order_failed();
                }
                Err(e) => {
                    debug!("ack query for {} failed, retrying next sweep: {}", client_id, e);
                }
            }
        }
    }

    /// Correct the local view against the venue's authoritative snapshot.
    /// Divergence beyond tolerance is reported and corrected, never
    /// silently swallowed.
    pub async fn reconcile_snapshot(&mut self) -> Result<(), TradingError> {
        let adapter = self.adapter.clone();
        let snapshot = retry_with_backoff(
            "account snapshot",
            RetryConfig::new(3, 500),
            |e: &AdapterError| e.is_retryable(),
            || {
                let adapter = adapter.clone();
                async move { adapter.account_snapshot().await }
            },
        )
        .await?;

        let venue_ids: HashSet<String> = snapshot
            .open_orders
            .iter()
            .map(|o| o.venue_order_id.clone())
            .collect();

        // Orders open at the venue that we do not know: not ours to keep.
        let known = self.ledger.working_venue_ids();
        for foreign in venue_ids.difference(&known) {
            warn!("cancelling order {} unknown to the ledger", foreign);
            self.limiter.wait().await;
            if let Err(e) = self.adapter.cancel_order(foreign).await {
                debug!("cancel of unknown order {} failed: {}", foreign, e);
            }
        }

        // Working orders the venue no longer shows: resolve their true state.
        let missing: Vec<String> = self
            .ledger
            .working_orders()
            .filter(|o| {
                o.venue_order_id
                    .as_ref()
                    .map(|id| !venue_ids.contains(id))
                    .unwrap_or(false)
            })
            .map(|o| o.client_id.clone())
            .collect();
        for client_id in missing {
            if let Ok(report) = self.adapter.query_order(&client_id).await {
                if let EventOutcome::Applied { fill: Some(fill) } =
                    self.ledger.apply_report(&client_id, &report)
                {
                    self.follow_up(fill).await;
                }
            }
        }

        // Compare positions only after lost fills have been recovered, so
        // the remaining gap is genuine divergence.
        let local = self.ledger.position().net();
        let diff = (local - snapshot.position).abs();
        if diff > self.settings.position_tolerance {
            self.stats.record_divergence();
            let divergence = TradingError::ReconciliationDivergence {
                local,
                venue: snapshot.position,
            };
            warn!("{}, correcting local view to venue truth", divergence);
            self.ledger.position_mut().correct(snapshot.position);
            self.update_pause_state();
        }
        Ok(())
    }

    /// Log the periodic status line.
    pub fn report(&self) {
        info!(
            "{} | position={} avg_entry={} working={} paused={}",
            self.stats.summary(),
            self.ledger.position().net(),
            self.ledger.position().avg_entry(),
            self.ledger.working_orders().count(),
            self.paused
        );
    }

    /// Risk-check then submit one intent. Placement failures degrade: a
    /// rejection finalizes the order, transport trouble leaves it in
    /// `Submitted` for the ack sweep to resolve.
    async fn place(&mut self, mut intent: OrderIntent) {
        let allowed = match self.risk.evaluate(
            self.ledger.position().net(),
            intent.side,
            intent.size,
            intent.price,
        ) {
            Ok(size) => size,
            Err(e) => {
                debug!("intent dropped: {}", e);
                return;
            }
        };
        intent.size = allowed;

        self.ledger.register_intent(&intent);
        self.limiter.wait().await;
        self.ledger.mark_submitted(&intent.client_id);

        let adapter = self.adapter.clone();
        let call_intent = intent.clone();
        let call = retry_with_backoff(
            "place order",
            RetryConfig::new(2, 250),
            |e: &AdapterError| e.is_retryable(),
            || {
                let adapter = adapter.clone();
                let intent = call_intent.clone();
                async move { adapter.place_order(&intent).await }
            },
        );

        match tokio::time::timeout(self.settings.ack_deadline, call).await {
            Ok(Ok(venue_id)) => {
                self.ledger.acknowledge(&intent.client_id, &venue_id);
                self.stats.record_order_placed(intent.size);
            }
            Ok(Err(AdapterError::Rejected { reason })) => {
                warn!("order {} rejected: {}", intent.client_id, reason);
                self.ledger.mark_rejected(&intent.client_id);
                self.stats.record_order_rejected();
            }
            Ok(Err(e)) => {
                // Retry budget exhausted; the sweep queries before failing.
                warn!("placement {} unresolved: {}", intent.client_id, e);
                self.stats.record_error();
            }
            Err(_) => {
                warn!(
                    "placement {} hit the ack deadline, will query",
                    intent.client_id
                );
            }
        }
    }

    /// Request a cancel. Fire-and-forget: the ledger state only moves when
    /// the venue confirms, and a racing fill wins.
    async fn cancel(&mut self, client_id: &str) {
        let Some(venue_id) = self
            .ledger
            .get(client_id)
            .and_then(|o| o.venue_order_id.clone())
        else {
            return;
        };
        self.ledger.mark_cancel_requested(client_id);
        self.limiter.wait().await;

        let adapter = self.adapter.clone();
        let call_id = venue_id.clone();
        let result = retry_with_backoff(
            "cancel order",
            RetryConfig::new(2, 250),
            |e: &AdapterError| e.is_retryable(),
            || {
                let adapter = adapter.clone();
                let venue_id = call_id.clone();
                async move { adapter.cancel_order(&venue_id).await }
            },
        )
        .await;

        match result {
            Ok(()) => {}
            Err(AdapterError::AlreadyFilled { .. }) | Err(AdapterError::NotFound { .. }) => {
                // Race with a fill; the status query settles it.
                if let Ok(report) = self.adapter.query_order(client_id).await {
                    if let EventOutcome::Applied { fill: Some(fill) } =
                        self.ledger.apply_report(client_id, &report)
                    {
                        self.follow_up(fill).await;
                    }
                }
            }
            Err(e) => {
                warn!("cancel of {} failed: {}", client_id, e);
                self.stats.record_error();
            }
        }
    }

    /// Cancel working orders that no longer belong to the ladder: obsolete
    /// slots, duplicate prices, and per-side overflow farthest from center.
    async fn prune(&mut self, planned_slots: &HashSet<i32>) {
        let center = match self.last_reference.or(self.planned_center) {
            Some(c) => c,
            None => return,
        };

        let mut to_cancel: Vec<String> = Vec::new();
        let mut seen_prices: HashSet<(Side, Decimal)> = HashSet::new();
        let mut per_side: Vec<(Side, Decimal, String)> = Vec::new();

        for order in self.ledger.working_orders() {
            if order.cancel_requested {
                continue;
            }
            if let Some(slot) = order.level {
                if !planned_slots.contains(&slot) {
                    to_cancel.push(order.client_id.clone());
                    continue;
                }
                if !seen_prices.insert((order.side, order.price)) {
                    to_cancel.push(order.client_id.clone());
                    continue;
                }
            }
            per_side.push((order.side, order.price, order.client_id.clone()));
        }

        for side in [Side::Bid, Side::Ask] {
            let mut orders: Vec<&(Side, Decimal, String)> =
                per_side.iter().filter(|(s, _, _)| *s == side).collect();
            if orders.len() > self.settings.max_orders_per_side {
                orders.sort_by(|a, b| (a.1 - center).abs().cmp(&(b.1 - center).abs()));
                for entry in orders.iter().skip(self.settings.max_orders_per_side) {
                    to_cancel.push(entry.2.clone());
                }
            }
        }

        for client_id in to_cancel {
            self.cancel(&client_id).await;
        }
    }

    async fn cancel_grid_orders(&mut self) {
        let grid_orders: Vec<String> = self
            .ledger
            .working_orders()
            .filter(|o| o.level.is_some() && !o.cancel_requested)
            .map(|o| o.client_id.clone())
            .collect();
        for client_id in grid_orders {
            self.cancel(&client_id).await;
        }
    }

    async fn cancel_all_working(&mut self) {
        let working: Vec<String> = self
            .ledger
            .working_orders()
            .map(|o| o.client_id.clone())
            .collect();
        info!("cancelling {} working orders", working.len());
        for client_id in working {
            self.cancel(&client_id).await;
        }
    }

    /// Skip placements on the side that would grow an already capped
    /// position; the risk guard would reject them anyway.
    fn side_is_capped(&self, side: Side) -> bool {
        let net = self.ledger.position().net();
        match side {
            Side::Bid => net >= self.risk.max_position(),
            Side::Ask => net <= -self.risk.max_position(),
        }
    }

    fn update_pause_state(&mut self) {
        let at_limit = self.ledger.position().net().abs() >= self.risk.max_position();
        if at_limit != self.paused {
            self.paused = at_limit;
            if at_limit {
                warn!(
                    "⚠️ position {} at limit {}, pausing grid",
                    self.ledger.position().net(),
                    self.risk.max_position()
                );
                self.set_status(AccountStatus::Paused);
            } else {
                info!("position back inside limits, resuming grid");
                self.set_status(AccountStatus::Active);
            }
        }
    }

    fn set_status(&self, status: AccountStatus) {
        self.record(RecordCommand::Status(status));
    }

    fn record(&self, command: RecordCommand) {
        if let Some(recorder) = &self.recorder {
            recorder.record(command);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{AccountSnapshot, MockExchangeAdapter, PaperExchange};
    use crate::grid::{Direction, DistanceMode, GridSettings};
    use rust_decimal_macros::dec;

    fn settings() -> EngineSettings {
        EngineSettings {
            ack_deadline: Duration::from_secs(10),
            snapshot_interval: Duration::from_secs(30),
            report_interval: Duration::from_secs(60),
            position_tolerance: dec!(0.01),
            fix_order_enabled: false,
            auto_close_enabled: false,
            max_orders_per_side: 10,
            place_min_interval_ms: 0,
        }
    }

    fn grid() -> GridSettings {
        GridSettings {
            level_count: 3,
            distance: dec!(0.01),
            distance_mode: DistanceMode::Percentage,
            order_size: dec!(1),
            tick_size: dec!(0.01),
            lot_size: dec!(0.01),
            recenter_threshold: dec!(0.02),
            direction: Direction::Long,
        }
    }

    fn engine(
        adapter: Arc<PaperExchange>,
        settings: EngineSettings,
    ) -> ReconciliationEngine<PaperExchange> {
        ReconciliationEngine::new(
            adapter,
            GridPlanner::new(grid()).unwrap(),
            RiskGuard::new(dec!(5)).unwrap(),
            settings,
            None,
        )
        .unwrap()
    }

    async fn drain(
        engine: &mut ReconciliationEngine<PaperExchange>,
        events: &mut mpsc::Receiver<OrderEvent>,
    ) {
        while let Ok(event) = events.try_recv() {
            engine.handle_event(event).await;
        }
    }

    #[tokio::test]
    async fn test_bootstrap_places_full_ladder() {
        let (venue, mut events) = PaperExchange::new(64);
        let adapter = Arc::new(venue);
        let mut engine = engine(adapter.clone(), settings());

        engine.handle_price(dec!(100)).await;
        drain(&mut engine, &mut events).await;

        assert_eq!(engine.ledger().working_orders().count(), 6);
        let snap = adapter.account_snapshot().await.unwrap();
        assert_eq!(snap.open_orders.len(), 6);
    }

    #[tokio::test]
    async fn test_fill_rearms_opposite_side_at_same_slot() {
        let (venue, mut events) = PaperExchange::new(64);
        let adapter = Arc::new(venue);
        let mut engine = engine(adapter.clone(), settings());

        engine.handle_price(dec!(100)).await;
        drain(&mut engine, &mut events).await;

        // Trade through the first bid at 99.
        adapter.tick(dec!(98.99)).await;
        drain(&mut engine, &mut events).await;

        assert_eq!(engine.ledger().position().net(), dec!(1));
        let rearmed = engine.ledger().order_at_slot(-1).unwrap();
        assert_eq!(rearmed.side, Side::Ask);
        assert_eq!(rearmed.price, dec!(99));
        assert_eq!(rearmed.size, dec!(1));
    }

    #[tokio::test]
    async fn test_auto_close_flattens_instead_of_rearming() {
        let (venue, mut events) = PaperExchange::new(64);
        let adapter = Arc::new(venue);
        let mut cfg = settings();
        cfg.auto_close_enabled = true;
        let mut engine = engine(adapter.clone(), cfg);

        engine.handle_price(dec!(100)).await;
        drain(&mut engine, &mut events).await;

        adapter.tick(dec!(98.99)).await;
        drain(&mut engine, &mut events).await;

        // The flatten market order brings the venue position back to zero
        // and no ask was re-armed into the filled slot.
        assert_eq!(adapter.position().await, dec!(0));
        assert_eq!(engine.ledger().position().net(), dec!(0));
        assert!(engine.ledger().order_at_slot(-1).is_none());
    }

    #[tokio::test]
    async fn test_fix_order_counters_partials_without_doubling_the_slot() {
        let (venue, mut events) = PaperExchange::new(64);
        let adapter = Arc::new(venue);
        let mut cfg = settings();
        cfg.fix_order_enabled = true;
        let mut engine = engine(adapter.clone(), cfg);

        engine.handle_price(dec!(100)).await;
        drain(&mut engine, &mut events).await;
        assert_eq!(engine.ledger().working_orders().count(), 6);

        // Partial fill of the bid resting at 99 (slot -1).
        let client_id = engine
            .ledger()
            .order_at_slot(-1)
            .unwrap()
            .client_id
            .clone();
        let venue_id = adapter.venue_id_for(&client_id).await.unwrap();
        adapter.fill(&venue_id, dec!(0.4)).await.unwrap();
        drain(&mut engine, &mut events).await;

        // The remainder keeps the slot to itself; exactly one counter went
        // out, off the grid and a full step above the resting bid.
        let at_slot: Vec<_> = engine
            .ledger()
            .working_orders()
            .filter(|o| o.level == Some(-1))
            .collect();
        assert_eq!(at_slot.len(), 1);
        assert_eq!(at_slot[0].side, Side::Bid);
        let counters: Vec<_> = engine
            .ledger()
            .working_orders()
            .filter(|o| o.level.is_none())
            .collect();
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0].side, Side::Ask);
        assert_eq!(counters[0].size, dec!(0.4));
        assert_eq!(counters[0].price, dec!(99.99));
        assert_eq!(engine.ledger().working_orders().count(), 7);

        // Completion re-arms the slot sized to the final delta, so the
        // counters add up to exactly the level size.
        adapter.fill(&venue_id, dec!(0.6)).await.unwrap();
        drain(&mut engine, &mut events).await;
        let rearmed = engine.ledger().order_at_slot(-1).unwrap();
        assert_eq!(rearmed.side, Side::Ask);
        assert_eq!(rearmed.price, dec!(99));
        assert_eq!(rearmed.size, dec!(0.6));
    }

    #[tokio::test]
    async fn test_policies_are_mutually_exclusive() {
        let (venue, _events) = PaperExchange::new(4);
        let mut cfg = settings();
        cfg.auto_close_enabled = true;
        cfg.fix_order_enabled = true;
        let result = ReconciliationEngine::new(
            Arc::new(venue),
            GridPlanner::new(grid()).unwrap(),
            RiskGuard::new(dec!(5)).unwrap(),
            cfg,
            None,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_recenter_cancels_and_replaces_ladder() {
        let (venue, mut events) = PaperExchange::new(128);
        let adapter = Arc::new(venue);
        let mut engine = engine(adapter.clone(), settings());

        engine.handle_price(dec!(100)).await;
        drain(&mut engine, &mut events).await;
        let before = engine.stats().recenters;

        // 5% drift is far beyond the 2% threshold.
        engine.handle_price(dec!(105)).await;
        drain(&mut engine, &mut events).await;
        // Cancels confirmed; freed slots refill on the next price tick.
        engine.handle_price(dec!(105)).await;
        drain(&mut engine, &mut events).await;

        assert_eq!(engine.stats().recenters, before + 1);
        let working: Vec<Decimal> = engine
            .ledger()
            .working_orders()
            .map(|o| o.price)
            .collect();
        assert!(working.iter().all(|p| (*p - dec!(105)).abs() <= dec!(3.2)));
    }

    #[tokio::test]
    async fn test_sweep_fails_placements_the_venue_never_saw() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_place_order().returning(|_| {
            Err(AdapterError::TransportFailure {
                message: "connection reset".to_string(),
            })
        });
        mock.expect_query_order().returning(|client_id| {
            Err(AdapterError::NotFound {
                order_ref: client_id.to_string(),
            })
        });

        // Zero ack deadline: every placement times out into Submitted and
        // is immediately eligible for the sweep.
        let mut cfg = settings();
        cfg.ack_deadline = Duration::ZERO;
        let mut engine = ReconciliationEngine::new(
            Arc::new(mock),
            GridPlanner::new(grid()).unwrap(),
            RiskGuard::new(dec!(5)).unwrap(),
            cfg,
            None,
        )
        .unwrap();

        engine.handle_price(dec!(100)).await;
        assert_eq!(engine.ledger().working_orders().count(), 6);

        engine.sweep_acks().await;
        assert_eq!(engine.ledger().working_orders().count(), 0);
        assert_eq!(engine.stats().orders_failed, 6);
    }

    #[tokio::test]
    async fn test_snapshot_within_tolerance_is_untouched() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_account_snapshot().returning(|| {
            Ok(AccountSnapshot {
                position: Decimal::ZERO,
                open_orders: Vec::new(),
            })
        });
        let mut engine = ReconciliationEngine::new(
            Arc::new(mock),
            GridPlanner::new(grid()).unwrap(),
            RiskGuard::new(dec!(5)).unwrap(),
            settings(),
            None,
        )
        .unwrap();

        engine.reconcile_snapshot().await.unwrap();
        assert_eq!(engine.stats().divergences, 0);
        assert_eq!(engine.ledger().position().net(), dec!(0));
    }

    #[tokio::test]
    async fn test_paused_grid_halts_open_side_only() {
        let (venue, mut events) = PaperExchange::new(128);
        let adapter = Arc::new(venue);
        let mut engine = ReconciliationEngine::new(
            adapter.clone(),
            GridPlanner::new(grid()).unwrap(),
            RiskGuard::new(dec!(1)).unwrap(),
            settings(),
            None,
        )
        .unwrap();

        engine.handle_price(dec!(100)).await;
        drain(&mut engine, &mut events).await;

        // One bid fill reaches the position limit and pauses the grid.
        adapter.tick(dec!(98.99)).await;
        drain(&mut engine, &mut events).await;
        assert!(engine.is_paused());

        // A re-center while paused rebuilds only the close side.
        engine.handle_price(dec!(103)).await;
        drain(&mut engine, &mut events).await;
        engine.handle_price(dec!(103)).await;
        drain(&mut engine, &mut events).await;

        assert!(engine
            .ledger()
            .working_orders()
            .all(|o| o.side == Side::Ask));
        assert!(engine.ledger().working_orders().count() > 0);
    }

    #[tokio::test]
    async fn test_snapshot_divergence_corrected_to_venue() {
        let (venue, mut events) = PaperExchange::new(64);
        let adapter = Arc::new(venue);
        let mut engine = engine(adapter.clone(), settings());

        engine.handle_price(dec!(100)).await;
        drain(&mut engine, &mut events).await;

        // Venue acquires a position the engine never saw.
        adapter
            .place_order(&OrderIntent::market(Side::Bid, dec!(100), dec!(2)))
            .await
            .unwrap();
        // Drop the event on the floor to simulate a stream gap.
        while events.try_recv().is_ok() {}

        engine.reconcile_snapshot().await.unwrap();
        assert_eq!(engine.ledger().position().net(), dec!(2));
        assert_eq!(engine.stats().divergences, 1);
    }
}
