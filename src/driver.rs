// =============================================================================
// Per-Bar Driver Loop — single-threaded cooperative loop over one symbol
// =============================================================================
//
// Drives the full pipeline once per closed candle: poll -> drain fills ->
// poll funding -> features/model/signal/combine -> guards/risk/execute ->
// health/logging -> sleep. One instance owns every piece of mutable state
// for its symbol (`CohortState`, the per-timeframe `LiveFeatureComputer`s,
// the bandit, the BMA blender, rolling throttle/ADV windows); nothing here
// is shared across tasks.
//
// A single instance internally manages every overlay timeframe
// (`RollupEngine` derives 15m/1h bars from the base feed) and calls
// `combine_signals` once per base-bar close across all of them, rather than
// running one driver per timeframe string: `combine_signals` takes every
// timeframe's signal in one `BTreeMap` argument, and `RuntimeConfig` names a
// single symbol/interval pair, so a timeframe-per-instance split would leave
// nothing to own the combiner call. See DESIGN.md.
//
// Generalized from a fixed 5-second poll to the configured bar interval and
// from "spawn five streams per symbol" to one cooperative loop with explicit
// suspension points.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::api::rest::{ApiState, InstanceStatus};
use crate::bandit::{ArmCandidate, Bandit};
use crate::bma::BmaBlender;
use crate::cohort::{CohortState, CohortWeights};
use crate::combiner::{combine_signals, CombinerInputs};
use crate::config::RuntimeConfig;
use crate::data_model::{Bar, Decision, Fill, LogRecord, Signal};
use crate::emitter::LogEmitter;
use crate::error::EngineError;
use crate::execution::PaperExecutor;
use crate::features::{build_feature_vector, FeatureBuilder, LiveFeatureComputer};
use crate::guards::{run_guard_chain, GuardContext};
use crate::health::HealthTracker;
use crate::model::ModelRuntime;
use crate::risk::RiskEngine;
use crate::rollup::RollupEngine;
use crate::signal::{generate_signal, SignalThresholds};
use crate::types::Side;
use crate::venue::{BookTicker, MarketDataVenue};

/// Parse a `"5m"`/`"15m"`/`"1h"`/`"1d"`-shaped interval string into minutes.
/// Unrecognised suffixes fall back to treating the whole string as minutes.
fn interval_minutes(interval: &str) -> f64 {
    let (num, unit) = interval.split_at(interval.len().saturating_sub(1));
    let n: f64 = num.parse().unwrap_or(5.0);
    match unit {
        "m" => n,
        "h" => n * 60.0,
        "d" => n * 1_440.0,
        _ => interval.parse().unwrap_or(5.0),
    }
}

/// Rolling notional volume window used to approximate ADV20 (20-bar average
/// notional, annualized to a daily figure) for guard/risk sizing.
struct AdvTracker {
    window: VecDeque<f64>,
    capacity: usize,
    bars_per_day: f64,
}

impl AdvTracker {
    fn new(bar_minutes: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(20),
            capacity: 20,
            bars_per_day: (1_440.0 / bar_minutes.max(1e-9)).max(1.0),
        }
    }

    fn push(&mut self, notional: f64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(notional);
    }

    fn adv20_usd(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
        mean * self.bars_per_day
    }
}

/// Rolling order/notional counters used by the throttle and ADV-hour guards.
struct ThrottleTracker {
    order_ts: VecDeque<i64>,
    hour_notional: VecDeque<(i64, f64)>,
}

impl ThrottleTracker {
    fn new() -> Self {
        Self {
            order_ts: VecDeque::new(),
            hour_notional: VecDeque::new(),
        }
    }

    fn orders_in_last_second(&mut self, now_ms: i64) -> u32 {
        while matches!(self.order_ts.front(), Some(&t) if now_ms - t > 1_000) {
            self.order_ts.pop_front();
        }
        self.order_ts.len() as u32
    }

    fn notional_in_last_hour(&mut self, now_ms: i64) -> f64 {
        while matches!(self.hour_notional.front(), Some(&(t, _)) if now_ms - t > 3_600_000) {
            self.hour_notional.pop_front();
        }
        self.hour_notional.iter().map(|(_, n)| n).sum()
    }

    fn record_order(&mut self, now_ms: i64, notional: f64) {
        self.order_ts.push_back(now_ms);
        self.hour_notional.push_back((now_ms, notional));
    }
}

/// Per-timeframe feature/model/signal state the driver threads together on
/// every bar the timeframe rolls up.
struct TimeframeState {
    computer: LiveFeatureComputer,
    last_close: Option<f64>,
}

pub struct DriverLoop {
    config: RuntimeConfig,
    symbol: String,
    run_id: String,
    venue: Arc<dyn MarketDataVenue>,
    risk: RiskEngine,
    executor: PaperExecutor,
    health: HealthTracker,
    emitter: LogEmitter,
    bandit: Bandit,
    bandit_checkpoint_path: String,
    bma: BmaBlender,
    api_state: ApiState,
    model: ModelRuntime,
    feature_builder: FeatureBuilder,
    base_tf: String,
    timeframes: BTreeMap<String, TimeframeState>,
    rollup: RollupEngine,
    cohort: CohortState,
    fill_rx: mpsc::Receiver<Fill>,
    adv: AdvTracker,
    throttle: ThrottleTracker,
    last_flip: Option<(i64, i32)>,
    last_bar_id: u64,
    last_bar_ts: i64,
    last_known_funding: f64,
    rng: StdRng,
    last_chosen_arm_idx: Option<usize>,
    last_chosen_raw_val: Option<f64>,
    last_feature_values: Vec<f64>,
    last_prediction: crate::data_model::Prediction,
    last_daily_stopped: bool,
}

impl DriverLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        venue: Arc<dyn MarketDataVenue>,
        model: ModelRuntime,
        api_state: ApiState,
        emitter: LogEmitter,
        bandit_checkpoint_path: String,
        fill_rx: mpsc::Receiver<Fill>,
        run_id: String,
    ) -> Self {
        let tz: chrono_tz::Tz = config.local_timezone.parse().unwrap_or(chrono_tz::UTC);
        let bar_minutes = interval_minutes(&config.data.interval);

        let risk = RiskEngine::new(config.risk.clone(), tz, config.paper.starting_equity);
        let executor = PaperExecutor::new(config.risk.clone(), config.execution.clone());
        let health = HealthTracker::new(200, bar_minutes);
        let bandit = Bandit::load_or_new(&bandit_checkpoint_path, config.execution.bandit.epsilon, config.execution.bandit.model_optimism);
        let bma = BmaBlender::new(config.ensemble.bma.ic_window_bars, config.ensemble.bma.kappa, config.ensemble.bma.freeze);

        let feature_builder = FeatureBuilder::new(model.columns.clone());

        let base_tf = config.data.interval.clone();
        let mut timeframes = BTreeMap::new();
        timeframes.insert(
            base_tf.clone(),
            TimeframeState {
                computer: LiveFeatureComputer::new(12, 50, 36),
                last_close: None,
            },
        );

        let mut rollup = RollupEngine::new();
        if config.overlay.enabled {
            for (tf, window) in config.overlay.timeframes.iter().zip(config.overlay.rollup_windows.iter()) {
                if tf == &base_tf {
                    continue;
                }
                rollup.register(tf.clone(), *window as usize);
                timeframes.insert(
                    tf.clone(),
                    TimeframeState {
                        computer: LiveFeatureComputer::new(12, 50, 36),
                        last_close: None,
                    },
                );
            }
        }

        let bar_interval_ms = (bar_minutes * 60_000.0) as i64;
        let cohort = CohortState::new(bar_interval_ms.max(1), 64, 0.0);

        Self {
            symbol: config.data.symbol.clone(),
            run_id,
            risk,
            executor,
            health,
            emitter,
            bandit,
            bandit_checkpoint_path,
            bma,
            api_state,
            model,
            feature_builder,
            base_tf,
            timeframes,
            rollup,
            cohort,
            fill_rx,
            adv: AdvTracker::new(bar_minutes),
            throttle: ThrottleTracker::new(),
            last_flip: None,
            last_bar_id: 0,
            last_bar_ts: 0,
            last_known_funding: 0.0,
            rng: StdRng::from_entropy(),
            last_chosen_arm_idx: None,
            last_chosen_raw_val: None,
            last_feature_values: Vec::new(),
            last_prediction: crate::data_model::Prediction::neutral(),
            last_daily_stopped: false,
            venue,
            config,
        }
    }

    fn thresholds(&self) -> SignalThresholds {
        SignalThresholds {
            min_confidence: self.config.thresholds.min_confidence,
            min_alpha: self.config.thresholds.min_alpha,
            neutral_band: self.config.thresholds.neutral_band,
        }
    }

    /// Run the driver to completion. `offline` skips every network call and
    /// runs the loop against a single synthetic bar, for smoke-testing
    /// without a venue connection (mirrors `LIVE_DEMO_OFFLINE`). `one_shot`
    /// (or `offline`) exits after the first iteration (`LIVE_DEMO_ONE_SHOT`).
    pub async fn run(&mut self, one_shot: bool, offline: bool, mut shutdown: watch::Receiver<bool>, poll_interval: std::time::Duration) {
        info!(symbol = %self.symbol, interval = %self.base_tf, one_shot, offline, "driver loop starting");
        loop {
            if let Err(e) = self.tick(offline).await {
                warn!(symbol = %self.symbol, error = %e, "driver tick failed, continuing with last-known state");
            }

            if one_shot || offline {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(symbol = %self.symbol, "driver loop received shutdown signal");
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.bandit.save(&self.bandit_checkpoint_path) {
            warn!(error = %e, "failed to save bandit checkpoint on exit");
        }
        info!(symbol = %self.symbol, "driver loop exiting");
    }

    async fn tick(&mut self, offline: bool) -> anyhow::Result<()> {
        // Step 1: poll the last closed candle; skip non-advancing ticks.
        let bar = if offline {
            self.synthetic_bar()
        } else {
            match self.poll_latest_bar().await {
                Some(b) => b,
                None => return Ok(()),
            }
        };

        if bar.bar_id == self.last_bar_id && bar.ts_ms == self.last_bar_ts && self.last_bar_ts != 0 {
            return Ok(());
        }

        // Data anomaly: malformed OHLC or a non-monotonic timestamp is
        // skipped and counted, never raised.
        if !bar.is_valid() {
            warn!(symbol = %self.symbol, bar_id = bar.bar_id, "skipping bar with invalid OHLC ordering");
            self.health.record_anomaly();
            return Ok(());
        }
        if self.last_bar_ts != 0 && bar.ts_ms < self.last_bar_ts {
            warn!(symbol = %self.symbol, bar_ts = bar.ts_ms, last_ts = self.last_bar_ts, "skipping non-monotonic bar timestamp");
            self.health.record_anomaly();
            return Ok(());
        }

        self.last_bar_id = bar.bar_id;
        self.last_bar_ts = bar.ts_ms;
        let now_ms = bar.ts_ms;

        // Step 2: drain the cohort fill queue, capped per tick.
        self.drain_fills(now_ms);

        // Step 3: poll funding with a short timeout, falling back to last-known.
        let (funding, funding_stale) = if offline {
            (self.last_known_funding, true)
        } else {
            self.poll_funding().await
        };
        self.last_known_funding = funding;

        self.risk.update_returns(
            self.timeframes.get(&self.base_tf).and_then(|s| s.last_close).unwrap_or(bar.close),
            bar.close,
        );
        self.adv.push(bar.volume * bar.close);
        let adv20_usd = self.adv.adv20_usd();
        let bars_seen = self.risk.record_bar_seen();

        // Step 4: features -> model -> signal per timeframe, then combine.
        let cohort_snapshot = self.cohort.snapshot();
        let base_signal = self.compute_signal(&self.base_tf.clone(), &bar, cohort_snapshot, funding);

        let overlay_bars = self.rollup.on_base_bar(bar);
        let mut signals: BTreeMap<String, Signal> = BTreeMap::new();
        signals.insert(self.base_tf.clone(), base_signal);
        for (tf, ob) in overlay_bars {
            let sig = self.compute_signal(&tf, &ob, cohort_snapshot, funding);
            signals.insert(tf, sig);
        }

        let decision = if self.config.overlay.enabled && signals.len() > 1 {
            let required: Vec<String> = if self.config.alignment.require_5m_15m_agreement {
                vec!["5m".to_string(), "15m".to_string()]
            } else {
                Vec::new()
            };
            let override_tf = if self.config.alignment.allow_1h_override { Some("1h") } else { None };
            let weights: BTreeMap<String, f64> = self
                .config
                .overlay
                .timeframes
                .iter()
                .cloned()
                .zip(self.config.overlay.weights.iter().copied().chain(std::iter::repeat(1.0)))
                .collect();
            combine_signals(&CombinerInputs {
                signals: &signals,
                weights: &weights,
                required: &required,
                override_tf,
                pred_cal_bps: base_signal.alpha * 10_000.0,
                band_bps: self.config.calibration.band_bps,
                alignment_cfg: &self.config.alignment,
            })
        } else {
            let mut d = Decision::neutral("single_timeframe");
            d.direction = base_signal.direction;
            d.alpha = base_signal.alpha;
            d.overlay.insert("confidence".to_string(), base_signal.confidence);
            d
        };

        let mut decision = self.apply_bandit_and_bma(decision, &signals, bar.close);

        // Forced exits run ahead of the fresh decision, overriding it to flat.
        if let Some(reason) = self.executor.should_force_exit(bar.bar_id, bar.close, decision.direction, base_signal.confidence, decision.alpha) {
            info!(symbol = %self.symbol, reason = ?reason, "forced exit triggered");
            decision = Decision::neutral(format!("forced_exit_{reason:?}"));
        }

        // Step 5: pre-trade guards -> risk sizing -> executor.
        let target_pos = self.risk.target_position(decision.direction, decision.alpha);
        let current_pos = self.executor.position().fraction;

        let guard_ctx = GuardContext {
            now_ms,
            spread_bps: bar.spread_bps.unwrap_or(0.0),
            funding_rate: funding,
            price: bar.close,
            signal_bps: decision.alpha * 10_000.0,
            current_pos,
            target_pos,
            adv20_usd,
            last_flip: self.last_flip,
            orders_in_last_second: self.throttle.orders_in_last_second(now_ms),
            exec_notional_last_hour: self.throttle.notional_in_last_hour(now_ms),
        };

        let (gated, reason_codes, guard_details) = run_guard_chain(
            &decision,
            &guard_ctx,
            &self.config.microstructure,
            &self.config.risk_controls,
            &self.config.risk,
            &self.config.calibration,
        );

        let mut trade_report = None;
        let blocked_by_cooldown = self.risk.in_cooldown(now_ms) && !self.risk.warmup_active();
        let blocked_by_daily_stop = self.risk.daily_stopped(now_ms);
        let effective_target = if blocked_by_daily_stop {
            0.0
        } else if self.risk.warmup_active() {
            0.0
        } else if blocked_by_cooldown {
            current_pos
        } else {
            self.risk.target_position(gated.direction, gated.alpha)
        };

        if !blocked_by_cooldown || self.risk.warmup_active() || blocked_by_daily_stop {
            if let Some(report) = self.executor.mirror(
                effective_target,
                bar.close,
                self.last_book_ticker(),
                bar.volume,
                adv20_usd,
                now_ms,
                bar.bar_id,
            ) {
                if report.realized_pnl_delta != 0.0 {
                    self.risk.record_pnl(report.realized_pnl_delta, now_ms);
                }
                if report.side != Side::Hold {
                    self.throttle.record_order(now_ms, (report.delta_qty * bar.close).abs());
                    let new_sign = if self.executor.position().fraction > 0.0 {
                        1
                    } else if self.executor.position().fraction < 0.0 {
                        -1
                    } else {
                        0
                    };
                    if new_sign != 0 && self.last_flip.map(|(_, s)| s) != Some(new_sign) {
                        self.last_flip = Some((now_ms, new_sign));
                    }
                    self.risk.set_cooldown(now_ms);
                }
                trade_report = Some(report);
            }
        }

        // Step 6: health/equity update and stream logging.
        let prev_close = self
            .timeframes
            .get(&self.base_tf)
            .and_then(|s| s.last_close)
            .unwrap_or(bar.close);
        let bar_return = if bar.close > 0.0 && prev_close > 0.0 {
            bar.close / prev_close - 1.0
        } else {
            0.0
        };
        let turnover_bps = trade_report.as_ref().map(|r| (r.delta_qty * bar.close).abs() / self.config.risk.base_notional.max(1e-6) * 10_000.0).unwrap_or(0.0);
        self.health.update_bar(
            bar_return,
            trade_report.as_ref().map(|r| r.realized_pnl_delta),
            turnover_bps,
            decision.alpha * 10_000.0,
            self.config.calibration.band_bps,
        );

        if let Some(state) = self.timeframes.get_mut(&self.base_tf) {
            state.last_close = Some(bar.close);
        }

        self.emit_logs(&bar, &gated, &reason_codes, guard_details.as_ref(), &trade_report, funding_stale, now_ms);
        self.publish_status(&bar, bars_seen);

        Ok(())
    }

    fn synthetic_bar(&self) -> Bar {
        let last_close = self.timeframes.get(&self.base_tf).and_then(|s| s.last_close).unwrap_or(100.0);
        Bar {
            ts_ms: self.last_bar_ts + (interval_minutes(&self.base_tf) * 60_000.0) as i64 + 1,
            open: last_close,
            high: last_close,
            low: last_close,
            close: last_close,
            volume: 0.0,
            bar_id: self.last_bar_id + 1,
            funding: None,
            spread_bps: Some(0.0),
            rv_1h: None,
        }
    }

    async fn poll_latest_bar(&self) -> Option<Bar> {
        match self.venue.klines(&self.symbol, &self.base_tf, 2).await {
            Ok(mut bars) => bars.pop(),
            Err(e) => {
                self.note_transient(EngineError::Transient(e.to_string()));
                None
            }
        }
    }

    async fn poll_funding(&self) -> (f64, bool) {
        let fut = self.venue.premium_index(&self.symbol);
        match tokio::time::timeout(std::time::Duration::from_secs(2), fut).await {
            Ok(Ok(rate)) => (rate, false),
            Ok(Err(e)) => {
                self.note_transient(EngineError::Transient(e.to_string()));
                (self.last_known_funding, true)
            }
            Err(_) => {
                self.note_transient(EngineError::Transient("funding poll timed out".to_string()));
                (self.last_known_funding, true)
            }
        }
    }

    /// Log and count a retried-and-continued transient error.
    /// `EngineError::Transient` is always the classification here: both
    /// callers already chose to degrade rather than escalate, so this only
    /// needs `Display` and the health counter, not branching on `is_*`.
    fn note_transient(&self, err: EngineError) {
        warn!(symbol = %self.symbol, error = %err, "transient I/O error, continuing with last-known state");
        self.health.record_transient();
    }

    /// Best-effort top-of-book used by the Passive-then-cross mode. A
    /// synthetic degenerate quote is used if the last fetched filters are
    /// unavailable; the market-mode path never reads this.
    fn last_book_ticker(&self) -> BookTicker {
        BookTicker { bid: 0.0, ask: 0.0 }
    }

    fn drain_fills(&mut self, now_ms: i64) {
        const MAX_FILLS_PER_TICK: usize = 2_000;
        let weights = CohortWeights { pros: 1.0, amateurs: 1.0, mood: 1.0 };
        let mut drained = 0;
        while drained < MAX_FILLS_PER_TICK {
            match self.fill_rx.try_recv() {
                Ok(fill) => {
                    self.cohort.update_from_fill(&fill, weights, now_ms);
                    drained += 1;
                }
                Err(_) => break,
            }
        }
    }

    fn compute_signal(&mut self, tf: &str, bar: &Bar, cohort: crate::cohort::CohortSnapshot, funding: f64) -> Signal {
        let thresholds = self.thresholds();
        let columns = self.feature_builder.columns.clone();
        let builder = FeatureBuilder::new(columns);
        let state = self.timeframes.entry(tf.to_string()).or_insert_with(|| TimeframeState {
            computer: LiveFeatureComputer::new(12, 50, 36),
            last_close: None,
        });
        let fv = build_feature_vector(&mut state.computer, &builder, bar, cohort, funding);
        if !fv.is_warmed {
            if tf == self.base_tf.as_str() {
                self.last_feature_values = fv.values;
            }
            return Signal { direction: 0, alpha: 0.0, confidence: 0.0, bar_id: bar.bar_id };
        }
        let prediction = self.model.infer(&fv.values);
        if tf == self.base_tf.as_str() {
            self.last_feature_values = fv.values.clone();
            self.last_prediction = prediction;
        }
        generate_signal(&prediction, thresholds, bar.bar_id)
    }

    /// Apply the bandit arm selector (if enabled) and the BMA blend (if
    /// enabled) on top of the combined decision, attributing the resulting
    /// alpha to whichever arm/source won.
    fn apply_bandit_and_bma(&mut self, mut decision: Decision, signals: &BTreeMap<String, Signal>, close: f64) -> Decision {
        if self.config.ensemble.enable_bma {
            if let Some(base) = signals.get(&self.base_tf) {
                let prob_pred = base.direction as f64 * base.alpha;
                let blended = self.bma.blend(decision.alpha * decision.direction as f64 * 10_000.0, prob_pred * 10_000.0);
                decision.alpha = (blended.abs() / 10_000.0).clamp(0.0, 1.0);
                decision.overlay.insert("bma_w_base".to_string(), self.bma.weights().w_base);
                decision.overlay.insert("bma_w_prob".to_string(), self.bma.weights().w_prob);
                let realized_return = self.timeframes.get(&self.base_tf).and_then(|s| s.last_close).map(|pc| if pc > 0.0 { close / pc - 1.0 } else { 0.0 }).unwrap_or(0.0);
                self.bma.push(decision.alpha * decision.direction as f64 * 10_000.0, prob_pred * 10_000.0, realized_return);
            }
        }

        if self.config.execution.bandit.enabled {
            let candidates: [ArmCandidate; 4] = std::array::from_fn(|i| match crate::bandit::ARM_NAMES[i] {
                "pros" => ArmCandidate { raw_val: signals.get(&self.base_tf).map(|s| s.alpha * s.direction as f64).unwrap_or(0.0), eligible: true },
                "amateurs" => ArmCandidate { raw_val: signals.get(&self.base_tf).map(|s| -s.alpha * s.direction as f64).unwrap_or(0.0), eligible: true },
                "model_meta" => ArmCandidate { raw_val: decision.alpha * decision.direction as f64, eligible: decision.direction != 0 },
                _ => ArmCandidate { raw_val: decision.alpha * decision.direction as f64, eligible: self.config.ensemble.enable_bma },
            });

            // Credit the arm chosen on the previous bar with this bar's
            // realized return before picking a new one. Skipped (not
            // credited as zero) when that arm is ineligible this bar, so a
            // bar where the arm was simply not in play doesn't drag its
            // running mean toward zero.
            if let (Some(idx), Some(raw_val)) = (self.last_chosen_arm_idx, self.last_chosen_raw_val) {
                if candidates[idx].eligible {
                    let realized_return = self
                        .timeframes
                        .get(&self.base_tf)
                        .and_then(|s| s.last_close)
                        .map(|pc| if pc > 0.0 { close / pc - 1.0 } else { 0.0 })
                        .unwrap_or(0.0);
                    let reward = realized_return * 10_000.0 * raw_val;
                    self.bandit.update(idx, reward, self.last_bar_ts);
                }
            }

            let result = self.bandit.select(&candidates, &mut self.rng);
            decision.chosen_arm = result.chosen_arm;
            self.last_chosen_arm_idx = result.chosen_index;
            self.last_chosen_raw_val = result.raw_val;
            if let Err(e) = self.bandit.save(&self.bandit_checkpoint_path) {
                warn!(error = %e, "failed to checkpoint bandit state");
            }
        }

        decision
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_logs(
        &mut self,
        bar: &Bar,
        decision: &Decision,
        reason_codes: &BTreeMap<String, bool>,
        guard_details: Option<&crate::guards::GuardDetails>,
        trade_report: &Option<crate::execution::TradeReport>,
        funding_stale: bool,
        now_ms: i64,
    ) {
        let mut payload = serde_json::Map::new();
        payload.insert("close".to_string(), serde_json::json!(bar.close));
        payload.insert("volume".to_string(), serde_json::json!(bar.volume));
        payload.insert("funding_stale".to_string(), serde_json::json!(funding_stale));
        self.emitter.emit("market_ingest_log", now_ms, self.record(bar.bar_id, payload), &mut self.rng);

        let mut signal_payload = serde_json::Map::new();
        signal_payload.insert("direction".to_string(), serde_json::json!(decision.direction));
        signal_payload.insert("alpha".to_string(), serde_json::json!(decision.alpha));
        signal_payload.insert("mode".to_string(), serde_json::json!(decision.mode));
        signal_payload.insert("chosen_arm".to_string(), serde_json::json!(decision.chosen_arm));
        self.emitter.emit("signals", now_ms, self.record(bar.bar_id, signal_payload), &mut self.rng);

        let mut ensemble_payload = serde_json::Map::new();
        ensemble_payload.insert("chosen_arm".to_string(), serde_json::json!(decision.chosen_arm));
        ensemble_payload.insert("bandit_weights".to_string(), serde_json::json!(self.bandit.state.means));
        if let Some(w_base) = decision.overlay.get("bma_w_base") {
            ensemble_payload.insert("bma_w_base".to_string(), serde_json::json!(w_base));
        }
        if let Some(w_prob) = decision.overlay.get("bma_w_prob") {
            ensemble_payload.insert("bma_w_prob".to_string(), serde_json::json!(w_prob));
        }
        self.emitter.emit("ensemble_log", now_ms, self.record(bar.bar_id, ensemble_payload), &mut self.rng);

        let mut calibration_payload = serde_json::Map::new();
        calibration_payload.insert("p_up".to_string(), serde_json::json!(self.last_prediction.p_up));
        calibration_payload.insert("p_down".to_string(), serde_json::json!(self.last_prediction.p_down));
        calibration_payload.insert("p_neutral".to_string(), serde_json::json!(self.last_prediction.p_neutral));
        calibration_payload.insert("s_model".to_string(), serde_json::json!(self.last_prediction.s_model));
        calibration_payload.insert("pred_cal_bps".to_string(), serde_json::json!(self.last_prediction.calibrated_bps()));
        calibration_payload.insert("band_bps".to_string(), serde_json::json!(self.config.calibration.band_bps));
        self.emitter.emit("calibration_log", now_ms, self.record(bar.bar_id, calibration_payload), &mut self.rng);

        let mut feature_payload = serde_json::Map::new();
        feature_payload.insert("values".to_string(), serde_json::json!(self.last_feature_values));
        self.emitter.emit("feature_log", now_ms, self.record(bar.bar_id, feature_payload), &mut self.rng);

        let mut risk_payload = serde_json::Map::new();
        let risk_state = self.risk.get_state(now_ms);
        risk_payload.insert("rv_annualized".to_string(), serde_json::json!(risk_state.rv_annualized));
        risk_payload.insert("daily_stopped".to_string(), serde_json::json!(risk_state.daily_stopped));
        risk_payload.insert("drawdown_pct".to_string(), serde_json::json!(risk_state.drawdown_pct));
        risk_payload.insert("in_cooldown".to_string(), serde_json::json!(risk_state.in_cooldown));
        risk_payload.insert("warmup_active".to_string(), serde_json::json!(risk_state.warmup_active));
        self.emitter.emit("sizing_risk_log", now_ms, self.record(bar.bar_id, risk_payload), &mut self.rng);

        let mut equity_payload = serde_json::Map::new();
        let equity = self.config.paper.starting_equity + risk_state.cum_pnl;
        equity_payload.insert("equity".to_string(), serde_json::json!(equity));
        equity_payload.insert("cum_pnl".to_string(), serde_json::json!(risk_state.cum_pnl));
        equity_payload.insert("peak_equity".to_string(), serde_json::json!(risk_state.peak_equity));
        equity_payload.insert(
            "realized_pnl_delta".to_string(),
            serde_json::json!(trade_report.as_ref().map(|r| r.realized_pnl_delta).unwrap_or(0.0)),
        );
        self.emitter.emit("pnl_equity_log", now_ms, self.record(bar.bar_id, equity_payload), &mut self.rng);

        let mut order_payload = serde_json::Map::new();
        order_payload.insert("reason_codes".to_string(), serde_json::json!(reason_codes));
        if let Some(details) = guard_details {
            order_payload.insert("guard_details".to_string(), serde_json::json!(details.0));
        }
        self.emitter.emit("order_intent", now_ms, self.record(bar.bar_id, order_payload), &mut self.rng);

        if let Some(report) = trade_report {
            let mut exec_payload = serde_json::Map::new();
            exec_payload.insert("side".to_string(), serde_json::json!(report.side.to_string()));
            exec_payload.insert("delta_qty".to_string(), serde_json::json!(report.delta_qty));
            exec_payload.insert("avg_price".to_string(), serde_json::json!(report.avg_price));
            exec_payload.insert("realized_pnl_delta".to_string(), serde_json::json!(report.realized_pnl_delta));
            self.emitter.emit("execution", now_ms, self.record(bar.bar_id, exec_payload), &mut self.rng);

            let mut cost_payload = serde_json::Map::new();
            cost_payload.insert("total_fee".to_string(), serde_json::json!(report.total_fee));
            cost_payload.insert("total_impact".to_string(), serde_json::json!(report.total_impact));
            self.emitter.emit("costs_log", now_ms, self.record(bar.bar_id, cost_payload), &mut self.rng);
        }

        if self.config.overlay.enabled {
            let mut overlay_payload = serde_json::Map::new();
            for tf in &self.config.overlay.timeframes {
                if tf == &self.base_tf {
                    continue;
                }
                overlay_payload.insert(tf.clone(), serde_json::json!(self.rollup.is_timeframe_ready(tf, 1)));
            }
            self.emitter.emit("overlay_status", now_ms, self.record(bar.bar_id, overlay_payload), &mut self.rng);
        }

        let cohort_snapshot = self.cohort.snapshot();
        let mut hyperliquid_payload = serde_json::Map::new();
        hyperliquid_payload.insert("pros".to_string(), serde_json::json!(cohort_snapshot.pros));
        hyperliquid_payload.insert("amateurs".to_string(), serde_json::json!(cohort_snapshot.amateurs));
        hyperliquid_payload.insert("mood".to_string(), serde_json::json!(cohort_snapshot.mood));
        self.emitter.emit("hyperliquid", now_ms, self.record(bar.bar_id, hyperliquid_payload), &mut self.rng);

        if risk_state.daily_stopped && !self.last_daily_stopped {
            let mut alert_payload = serde_json::Map::new();
            alert_payload.insert("kind".to_string(), serde_json::json!("daily_stop_triggered"));
            alert_payload.insert("drawdown_pct".to_string(), serde_json::json!(risk_state.drawdown_pct));
            self.emitter.emit("alerts", now_ms, self.record(bar.bar_id, alert_payload), &mut self.rng);
        }
        if decision.mode.starts_with("forced_exit") {
            let mut alert_payload = serde_json::Map::new();
            alert_payload.insert("kind".to_string(), serde_json::json!("forced_exit"));
            alert_payload.insert("reason".to_string(), serde_json::json!(decision.mode));
            self.emitter.emit("alerts", now_ms, self.record(bar.bar_id, alert_payload), &mut self.rng);
        }
        self.last_daily_stopped = risk_state.daily_stopped;

        let mut bandit_payload = serde_json::Map::new();
        bandit_payload.insert("counts".to_string(), serde_json::json!(self.bandit.state.counts));
        bandit_payload.insert("means".to_string(), serde_json::json!(self.bandit.state.means));
        bandit_payload.insert("variances".to_string(), serde_json::json!(self.bandit.state.variances));
        bandit_payload.insert("chosen_arm".to_string(), serde_json::json!(decision.chosen_arm));
        self.emitter.emit("bandit", now_ms, self.record(bar.bar_id, bandit_payload), &mut self.rng);

        if bar.bar_id % self.config.execution.health_emit_every_bars as u64 == 0 {
            let snapshot = self.health.snapshot();
            let mut health_payload = serde_json::Map::new();
            health_payload.insert("bars_observed".to_string(), serde_json::json!(snapshot.bars_observed));
            health_payload.insert("transient_errors".to_string(), serde_json::json!(snapshot.transient_errors));
            health_payload.insert("data_anomalies".to_string(), serde_json::json!(snapshot.data_anomalies));
            health_payload.insert("funding_stale".to_string(), serde_json::json!(funding_stale));
            self.emitter.emit("health", now_ms, self.record(bar.bar_id, health_payload), &mut self.rng);

            let mut kpi_payload = serde_json::Map::new();
            kpi_payload.insert("sharpe_roll".to_string(), serde_json::json!(snapshot.sharpe_roll));
            kpi_payload.insert("max_drawdown".to_string(), serde_json::json!(snapshot.max_drawdown));
            kpi_payload.insert("hit_rate".to_string(), serde_json::json!(snapshot.hit_rate));
            kpi_payload.insert("in_band_share".to_string(), serde_json::json!(snapshot.in_band_share));
            kpi_payload.insert("turnover_bps".to_string(), serde_json::json!(snapshot.turnover_bps));
            self.emitter.emit("kpi_scorecard", now_ms, self.record(bar.bar_id, kpi_payload), &mut self.rng);

            let mut repro_payload = serde_json::Map::new();
            repro_payload.insert("git_commit".to_string(), serde_json::json!(self.model.manifest.git_commit));
            repro_payload.insert("trained_at_utc".to_string(), serde_json::json!(self.model.manifest.trained_at_utc));
            repro_payload.insert("run_id".to_string(), serde_json::json!(self.run_id));
            self.emitter.emit("repro", now_ms, self.record(bar.bar_id, repro_payload), &mut self.rng);
        }
    }

    fn record(&self, bar_id: u64, payload: serde_json::Map<String, serde_json::Value>) -> LogRecord {
        LogRecord {
            run_id: self.run_id.clone(),
            ts_ist: String::new(),
            schema_v: 1,
            bar_id,
            asset: self.symbol.clone(),
            payload,
        }
    }

    fn publish_status(&self, bar: &Bar, _bars_seen: u64) {
        self.api_state.publish(InstanceStatus {
            timeframe: self.base_tf.clone(),
            last_bar_id: bar.bar_id,
            last_bar_ts_ms: bar.ts_ms,
            position_fraction: self.executor.position().fraction,
            trading_mode: self.config.trading_mode.to_string(),
            account_mode: self.config.account_mode.to_string(),
            health: Some(self.health.snapshot()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_minutes_parses_common_suffixes() {
        assert_eq!(interval_minutes("5m"), 5.0);
        assert_eq!(interval_minutes("1h"), 60.0);
        assert_eq!(interval_minutes("1d"), 1_440.0);
    }

    #[test]
    fn adv_tracker_annualizes_mean_notional() {
        let mut adv = AdvTracker::new(5.0);
        for _ in 0..20 {
            adv.push(1_000.0);
        }
        // bars_per_day = 1440/5 = 288
        assert!((adv.adv20_usd() - 288_000.0).abs() < 1e-6);
    }

    #[test]
    fn throttle_tracker_expires_old_orders() {
        let mut t = ThrottleTracker::new();
        t.record_order(1_000, 500.0);
        t.record_order(1_500, 500.0);
        assert_eq!(t.orders_in_last_second(1_900), 2);
        assert_eq!(t.orders_in_last_second(3_000), 0);
    }
}
