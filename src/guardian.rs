//! Guardian: hard risk limits that override agent dispatch.
//!
//! Each cycle captures a [`GuardianSnapshot`] from the account, runs the
//! ordered checks below and applies one corrective action per breach:
//!
//! | check        | breach when                 | action            |
//! |--------------|-----------------------------|-------------------|
//! | drawdown     | drawdown > max_drawdown     | reduce exposure   |
//! | open trades  | open > max_open_trades      | cap open trades   |
//! | margin       | margin < min_margin_level   | emergency stop    |
//! | grid size    | cluster > max_grid_size     | close riskiest    |
//! | trend risk   | predictor flags runaway     | close riskiest    |
//!
//! An emergency stop suspends the controller through the [`SuspendGate`].
//! A later cycle with no emergency breach clears a suspension the guardian
//! raised itself; a manual stop needs a manual clear.

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::GuardianConfig;
use crate::error::{HiveError, Result};
use crate::journal::{JournalEntry, PersistenceSink};
use crate::logging::{self, Domain, Level};

/// Account state as reported by the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub equity: f64,
    pub peak_equity: f64,
    pub margin_level: f64,
    pub open_position_count: usize,
    /// Largest same-side position cluster held by one agent.
    pub largest_cluster: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianSnapshot {
    pub seq: u64,
    pub time: DateTime<Utc>,
    pub equity: f64,
    pub drawdown: f64,
    pub margin_level: f64,
    pub open_position_count: usize,
    pub largest_cluster: usize,
}

impl GuardianSnapshot {
    pub fn from_state(seq: u64, state: &RiskState) -> Self {
        let drawdown = if state.peak_equity > 0.0 {
            ((state.peak_equity - state.equity) / state.peak_equity).max(0.0)
        } else {
            0.0
        };
        Self {
            seq,
            time: Utc::now(),
            equity: state.equity,
            drawdown,
            margin_level: state.margin_level,
            open_position_count: state.open_position_count,
            largest_cluster: state.largest_cluster,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Drawdown,
    OpenTrades,
    Margin,
    GridSize,
    TrendRisk,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Drawdown => "drawdown",
            CheckKind::OpenTrades => "open_trades",
            CheckKind::Margin => "margin",
            CheckKind::GridSize => "grid_size",
            CheckKind::TrendRisk => "trend_risk",
        }
    }
}

/// Corrective actions, also accepted as manual overrides.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Intervention {
    ReduceExposure { fraction: f64 },
    CapOpenTrades { max: usize },
    CloseRiskiest { keep: usize },
    EmergencyStop,
    /// Manual only: lift any suspension.
    Clear,
}

impl Intervention {
    pub fn label(&self) -> &'static str {
        match self {
            Intervention::ReduceExposure { .. } => "reduce_exposure",
            Intervention::CapOpenTrades { .. } => "cap_open_trades",
            Intervention::CloseRiskiest { .. } => "close_riskiest",
            Intervention::EmergencyStop => "emergency_stop",
            Intervention::Clear => "clear",
        }
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self, Intervention::EmergencyStop)
    }
}

/// A failed check. A value, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breach {
    pub check: CheckKind,
    pub value: f64,
    pub limit: f64,
    pub action: Intervention,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneEvent {
    pub check: CheckKind,
    pub old: f64,
    pub new: f64,
    pub floor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub seq: u64,
    pub time: DateTime<Utc>,
    pub breaches: Vec<Breach>,
    pub near_breaches: Vec<CheckKind>,
    pub tuned: Vec<TuneEvent>,
    pub suspended: bool,
}

/// Current thresholds. Start at the configured limits and only tighten.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub max_drawdown: f64,
    pub max_open_trades: usize,
    pub max_grid_size: usize,
    pub min_margin_level: f64,
}

impl Limits {
    pub fn from_config(cfg: &GuardianConfig) -> Self {
        Self {
            max_drawdown: cfg.max_drawdown,
            max_open_trades: cfg.max_open_trades,
            max_grid_size: cfg.max_grid_size,
            min_margin_level: cfg.min_margin_level,
        }
    }
}

// =============================================================================
// Collaborators
// =============================================================================

/// Account the guardian watches and corrects. Each corrective call returns
/// the number of positions it closed.
#[async_trait]
pub trait AccountGateway: Send + Sync {
    async fn risk_state(&self) -> AnyResult<RiskState>;
    async fn reduce_exposure(&self, fraction: f64) -> AnyResult<usize>;
    async fn limit_open_trades(&self, max: usize) -> AnyResult<usize>;
    async fn close_riskiest_positions(&self, keep: usize) -> AnyResult<usize>;
    async fn emergency_stop(&self) -> AnyResult<usize>;
}

pub trait TrendRiskPredictor: Send + Sync {
    fn runaway_risk(&self, snapshot: &GuardianSnapshot) -> bool;
}

// =============================================================================
// Suspend gate
// =============================================================================

#[derive(Debug)]
struct GateInner {
    suspended: AtomicBool,
    manual: AtomicBool,
    tx: watch::Sender<bool>,
}

/// Shared flag checked by the controller at the start of every cycle.
#[derive(Debug, Clone)]
pub struct SuspendGate {
    inner: Arc<GateInner>,
}

impl Default for SuspendGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspendGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(GateInner {
                suspended: AtomicBool::new(false),
                manual: AtomicBool::new(false),
                tx,
            }),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }

    pub fn is_manual(&self) -> bool {
        self.inner.manual.load(Ordering::SeqCst)
    }

    pub fn suspend(&self, manual: bool) {
        if manual {
            self.inner.manual.store(true, Ordering::SeqCst);
        }
        self.inner.suspended.store(true, Ordering::SeqCst);
        self.inner.tx.send_replace(true);
    }

    /// Clears a guardian-raised suspension. No effect on a manual stop.
    pub fn clear_automatic(&self) -> bool {
        if self.is_manual() || !self.is_suspended() {
            return false;
        }
        self.inner.suspended.store(false, Ordering::SeqCst);
        self.inner.tx.send_replace(false);
        true
    }

    pub fn clear_manual(&self) {
        self.inner.manual.store(false, Ordering::SeqCst);
        self.inner.suspended.store(false, Ordering::SeqCst);
        self.inner.tx.send_replace(false);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }
}

// =============================================================================
// Guardian
// =============================================================================

pub struct Guardian {
    cfg: GuardianConfig,
    limits: Limits,
    gate: SuspendGate,
    predictor: Option<Arc<dyn TrendRiskPredictor>>,
    sink: Option<Arc<dyn PersistenceSink>>,
    next_seq: u64,
    last_evaluated: Option<u64>,
    near_streaks: HashMap<CheckKind, usize>,
    reflections: VecDeque<Reflection>,
    interventions: u64,
}

impl Guardian {
    pub fn new(cfg: &GuardianConfig, gate: SuspendGate) -> Self {
        Self {
            cfg: cfg.clone(),
            limits: Limits::from_config(cfg),
            gate,
            predictor: None,
            sink: None,
            next_seq: 0,
            last_evaluated: None,
            near_streaks: HashMap::new(),
            reflections: VecDeque::new(),
            interventions: 0,
        }
    }

    pub fn with_predictor(mut self, predictor: Arc<dyn TrendRiskPredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn gate(&self) -> SuspendGate {
        self.gate.clone()
    }

    pub fn reflections(&self) -> impl Iterator<Item = &Reflection> {
        self.reflections.iter()
    }

    pub fn interventions(&self) -> u64 {
        self.interventions
    }

    pub async fn capture(&mut self, gateway: &dyn AccountGateway) -> Result<GuardianSnapshot> {
        let state = gateway
            .risk_state()
            .await
            .map_err(|e| HiveError::TransientInput(format!("risk state: {}", e)))?;
        self.next_seq += 1;
        Ok(GuardianSnapshot::from_state(self.next_seq, &state))
    }

    pub fn check_drawdown(&self, s: &GuardianSnapshot) -> Option<Breach> {
        (s.drawdown > self.limits.max_drawdown).then(|| Breach {
            check: CheckKind::Drawdown,
            value: s.drawdown,
            limit: self.limits.max_drawdown,
            action: Intervention::ReduceExposure { fraction: 0.5 },
        })
    }

    pub fn check_open_trades(&self, s: &GuardianSnapshot) -> Option<Breach> {
        (s.open_position_count > self.limits.max_open_trades).then(|| Breach {
            check: CheckKind::OpenTrades,
            value: s.open_position_count as f64,
            limit: self.limits.max_open_trades as f64,
            action: Intervention::CapOpenTrades {
                max: self.limits.max_open_trades,
            },
        })
    }

    pub fn check_margin(&self, s: &GuardianSnapshot) -> Option<Breach> {
        (s.margin_level < self.limits.min_margin_level).then(|| Breach {
            check: CheckKind::Margin,
            value: s.margin_level,
            limit: self.limits.min_margin_level,
            action: Intervention::EmergencyStop,
        })
    }

    pub fn check_grid_size(&self, s: &GuardianSnapshot) -> Option<Breach> {
        (s.largest_cluster > self.limits.max_grid_size).then(|| Breach {
            check: CheckKind::GridSize,
            value: s.largest_cluster as f64,
            limit: self.limits.max_grid_size as f64,
            action: Intervention::CloseRiskiest {
                keep: self.limits.max_grid_size,
            },
        })
    }

    pub fn check_trend_risk(&self, s: &GuardianSnapshot) -> Option<Breach> {
        let predictor = self.predictor.as_ref()?;
        predictor.runaway_risk(s).then(|| Breach {
            check: CheckKind::TrendRisk,
            value: 1.0,
            limit: 0.0,
            action: Intervention::CloseRiskiest {
                keep: (self.limits.max_grid_size / 2).max(1),
            },
        })
    }

    /// Ordered checks. A snapshot is evaluated at most once; a repeat
    /// returns no breaches.
    pub fn evaluate(&mut self, snapshot: &GuardianSnapshot) -> Vec<Breach> {
        if self.last_evaluated == Some(snapshot.seq) {
            return Vec::new();
        }
        self.last_evaluated = Some(snapshot.seq);
        [
            self.check_drawdown(snapshot),
            self.check_open_trades(snapshot),
            self.check_margin(snapshot),
            self.check_grid_size(snapshot),
            self.check_trend_risk(snapshot),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn near_breaches(&self, s: &GuardianSnapshot) -> Vec<CheckKind> {
        let r = self.cfg.near_breach_ratio;
        let mut out = Vec::new();
        if s.drawdown > r * self.limits.max_drawdown {
            out.push(CheckKind::Drawdown);
        }
        if s.open_position_count as f64 > r * self.limits.max_open_trades as f64 {
            out.push(CheckKind::OpenTrades);
        }
        if r > 0.0 && s.margin_level < self.limits.min_margin_level / r {
            out.push(CheckKind::Margin);
        }
        if s.largest_cluster as f64 > r * self.limits.max_grid_size as f64 {
            out.push(CheckKind::GridSize);
        }
        out
    }

    /// Tighten one threshold, never past its floor.
    fn tighten(&mut self, check: CheckKind) -> Option<TuneEvent> {
        let f = self.cfg.tighten_factor;
        let event = match check {
            CheckKind::Drawdown => {
                let old = self.limits.max_drawdown;
                let new = (old * f).max(self.cfg.drawdown_floor);
                self.limits.max_drawdown = new;
                TuneEvent { check, old, new, floor: self.cfg.drawdown_floor }
            }
            CheckKind::OpenTrades => {
                let old = self.limits.max_open_trades;
                let scaled = ((old as f64) * f).floor() as usize;
                let new = scaled.min(old.saturating_sub(1)).max(self.cfg.open_trades_floor);
                self.limits.max_open_trades = new;
                TuneEvent { check, old: old as f64, new: new as f64, floor: self.cfg.open_trades_floor as f64 }
            }
            CheckKind::GridSize => {
                let old = self.limits.max_grid_size;
                let new = old.saturating_sub(1).max(self.cfg.grid_size_floor);
                self.limits.max_grid_size = new;
                TuneEvent { check, old: old as f64, new: new as f64, floor: self.cfg.grid_size_floor as f64 }
            }
            CheckKind::Margin => {
                let old = self.limits.min_margin_level;
                let new = (old / f).min(self.cfg.margin_ceiling);
                self.limits.min_margin_level = new;
                TuneEvent { check, old, new, floor: self.cfg.margin_ceiling }
            }
            CheckKind::TrendRisk => return None,
        };
        if (event.new - event.old).abs() < f64::EPSILON {
            return None;
        }
        logging::log_tune(check.as_str(), event.old, event.new, event.floor);
        Some(event)
    }

    fn auto_tune(&mut self, near: &[CheckKind]) -> Vec<TuneEvent> {
        for kind in [CheckKind::Drawdown, CheckKind::OpenTrades, CheckKind::Margin, CheckKind::GridSize] {
            if !near.contains(&kind) {
                self.near_streaks.insert(kind, 0);
            }
        }
        if !self.cfg.auto_tune {
            return Vec::new();
        }
        let mut tuned = Vec::new();
        for kind in near {
            let streak = self.near_streaks.entry(*kind).or_insert(0);
            *streak += 1;
            if *streak >= self.cfg.tune_after.max(1) {
                self.near_streaks.insert(*kind, 0);
                if let Some(event) = self.tighten(*kind) {
                    tuned.push(event);
                }
            }
        }
        tuned
    }

    pub async fn apply(&mut self, action: Intervention, gateway: &dyn AccountGateway, manual: bool) -> Result<usize> {
        let result = match action {
            Intervention::ReduceExposure { fraction } => gateway.reduce_exposure(fraction).await,
            Intervention::CapOpenTrades { max } => gateway.limit_open_trades(max).await,
            Intervention::CloseRiskiest { keep } => gateway.close_riskiest_positions(keep).await,
            Intervention::EmergencyStop => {
                self.gate.suspend(manual);
                gateway.emergency_stop().await
            }
            Intervention::Clear => {
                self.gate.clear_manual();
                Ok(0)
            }
        };
        self.interventions += 1;
        let closed = result.map_err(|e| HiveError::TransientInput(format!("{}: {}", action.label(), e)))?;
        logging::log(
            Level::Info,
            Domain::Guardian,
            "intervention",
            logging::obj(&[
                ("action", logging::v_str(action.label())),
                ("closed", serde_json::json!(closed)),
                ("manual", serde_json::Value::Bool(manual)),
            ]),
        );
        Ok(closed)
    }

    /// One full guardian cycle: capture, check, act, reflect, tune, persist.
    pub async fn run_cycle(&mut self, gateway: &dyn AccountGateway) -> Result<Reflection> {
        let _profile = logging::ProfileScope::new("guardian_cycle");
        let snapshot = self.capture(gateway).await?;
        self.persist(JournalEntry::GuardianSnapshot {
            ts: snapshot.time,
            snapshot: snapshot.clone(),
        });
        if let Some(path) = &self.cfg.snapshot_path {
            if let Err(err) = save_snapshot(path, &snapshot) {
                logging::log_transient(Domain::Guardian, "save_snapshot", &err.to_string());
            }
        }

        let breaches = self.evaluate(&snapshot);
        let mut emergency = false;
        for breach in &breaches {
            logging::log_breach(breach.check.as_str(), breach.value, breach.limit, breach.action.label());
            emergency |= breach.action.is_emergency();
            if let Err(err) = self.apply(breach.action, gateway, false).await {
                logging::log_transient(Domain::Guardian, breach.action.label(), &err.to_string());
            }
        }
        if !emergency && self.gate.clear_automatic() {
            logging::log(
                Level::Info,
                Domain::Guardian,
                "suspension_cleared",
                logging::obj(&[("seq", serde_json::json!(snapshot.seq))]),
            );
        }

        let near = self.near_breaches(&snapshot);
        let tuned = self.auto_tune(&near);
        let reflection = Reflection {
            seq: snapshot.seq,
            time: snapshot.time,
            breaches,
            near_breaches: near,
            tuned,
            suspended: self.gate.is_suspended(),
        };
        self.reflect(reflection.clone());
        Ok(reflection)
    }

    fn reflect(&mut self, reflection: Reflection) {
        if self.reflections.len() >= self.cfg.reflection_capacity.max(1) {
            self.reflections.pop_front();
        }
        self.persist(JournalEntry::Reflection {
            ts: reflection.time,
            reflection: reflection.clone(),
        });
        self.reflections.push_back(reflection);
    }

    fn persist(&self, entry: JournalEntry) {
        if let Some(sink) = &self.sink {
            if let Err(err) = sink.append(&entry) {
                logging::log_transient(Domain::Guardian, "persist", &err.to_string());
            }
        }
    }

    /// Manual override from operational tooling.
    pub async fn force_action(&mut self, action: Intervention, gateway: &dyn AccountGateway) -> Result<usize> {
        logging::log(
            Level::Warn,
            Domain::Guardian,
            "manual_override",
            logging::obj(&[("action", logging::v_str(action.label()))]),
        );
        self.apply(action, gateway, true).await
    }
}

/// Latest snapshot as a standalone JSON file.
pub fn save_snapshot(path: &str, snapshot: &GuardianSnapshot) -> Result<()> {
    let body = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, body)?;
    Ok(())
}

/// Periodic guardian task. Stops when `shutdown` flips to true.
pub fn spawn(
    guardian: Arc<tokio::sync::Mutex<Guardian>>,
    gateway: Arc<dyn AccountGateway>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut g = guardian.lock().await;
                    if let Err(err) = g.run_cycle(gateway.as_ref()).await {
                        logging::log_transient(Domain::Guardian, "guardian_cycle", &err.to_string());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
