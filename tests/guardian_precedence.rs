//! Guardian precedence: while the gate is suspended the controller dispatches
//! nothing, and dispatch resumes once the guardian (or an operator) clears it.
//! Also covers agent failures never escaping the control loop.

use std::sync::Arc;

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use hivefx::agent::{Action, Decider, DecisionView, DeciderRegistry, ManifestEntry, Outcome, Parameters};
use hivefx::config::HiveConfig;
use hivefx::controller::{ActionResolver, CycleReport};
use hivefx::feed::SyntheticFeed;
use hivefx::fingerprint::Context;
use hivefx::guardian::{AccountGateway, Intervention, RiskState};
use hivefx::signals::{GeneratorRegistry, Observation};
use hivefx::{Collaborators, Hive};

struct Account {
    state: Mutex<RiskState>,
}

impl Account {
    fn healthy() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RiskState {
                equity: 10_000.0,
                peak_equity: 10_000.0,
                margin_level: 5.0,
                open_position_count: 0,
                largest_cluster: 0,
            }),
        })
    }

    fn set_margin(&self, margin_level: f64) {
        self.state.lock().margin_level = margin_level;
    }
}

#[async_trait]
impl AccountGateway for Account {
    async fn risk_state(&self) -> AnyResult<RiskState> {
        Ok(*self.state.lock())
    }
    async fn reduce_exposure(&self, _fraction: f64) -> AnyResult<usize> {
        Ok(0)
    }
    async fn limit_open_trades(&self, _max: usize) -> AnyResult<usize> {
        Ok(0)
    }
    async fn close_riskiest_positions(&self, _keep: usize) -> AnyResult<usize> {
        Ok(0)
    }
    async fn emergency_stop(&self) -> AnyResult<usize> {
        Ok(0)
    }
}

struct FixedReward;

#[async_trait]
impl ActionResolver for FixedReward {
    async fn resolve(&self, agent_id: &str, context: &Context, action: Action) -> AnyResult<Outcome> {
        Ok(Outcome {
            agent_id: agent_id.to_string(),
            context: context.clone(),
            action: Some(action),
            reward: 1.0,
            timestamp: Utc::now(),
        })
    }
}

fn config() -> HiveConfig {
    let mut cfg = HiveConfig::default();
    cfg.runtime.seed = Some(11);
    cfg.runtime.cycle_ms = 1;
    cfg.guardian.cycle_ms = 1;
    cfg
}

fn collaborators(account: Arc<Account>) -> Collaborators {
    Collaborators {
        feed: Box::new(SyntheticFeed::new(11, 100.0)),
        resolver: Arc::new(FixedReward),
        gateway: account,
        predictor: None,
        peers: Vec::new(),
        sink: None,
    }
}

fn observation(v: f64) -> Option<Observation> {
    let mut obs = Observation::new();
    for key in ["noise", "pressure", "volume", "spread"] {
        obs.insert(key.to_string(), v);
    }
    Some(obs)
}

#[tokio::test]
async fn test_manual_stop_blocks_dispatch_until_cleared() {
    let account = Account::healthy();
    let mut hive = Hive::new(config(), collaborators(account.clone()), None).unwrap();

    hive.force_guardian_action(Intervention::EmergencyStop).await.unwrap();
    assert!(hive.gate().is_suspended());
    for i in 0..5 {
        assert_eq!(hive.step_with(observation(i as f64)).await, CycleReport::Suspended);
    }
    assert_eq!(hive.stats().dispatches, 0);
    assert_eq!(hive.stats().suspended_cycles, 5);

    // A healthy guardian cycle does not lift an operator stop.
    hive.guardian_cycle().await.unwrap();
    assert!(hive.gate().is_suspended());
    assert_eq!(hive.step_with(observation(1.0)).await, CycleReport::Suspended);

    hive.force_guardian_action(Intervention::Clear).await.unwrap();
    assert!(!hive.gate().is_suspended());
    assert!(matches!(
        hive.step_with(observation(1.0)).await,
        CycleReport::Dispatched { .. }
    ));
    assert_eq!(hive.stats().dispatches, 1);
}

#[tokio::test]
async fn test_margin_emergency_suspends_and_guardian_clears() {
    let account = Account::healthy();
    let mut hive = Hive::new(config(), collaborators(account.clone()), None).unwrap();

    account.set_margin(0.1);
    let reflection = hive.guardian_cycle().await.unwrap();
    assert!(reflection.suspended);
    assert!(reflection.breaches.iter().any(|b| b.action == Intervention::EmergencyStop));
    for i in 0..3 {
        assert_eq!(hive.step_with(observation(i as f64)).await, CycleReport::Suspended);
    }
    assert_eq!(hive.stats().dispatches, 0);

    account.set_margin(5.0);
    let reflection = hive.guardian_cycle().await.unwrap();
    assert!(!reflection.suspended);
    assert!(matches!(
        hive.step_with(observation(2.0)).await,
        CycleReport::Dispatched { .. }
    ));
}

#[tokio::test]
async fn test_concurrent_guardian_holds_suspension_through_run() {
    let account = Account::healthy();
    let mut hive = Hive::new(config(), collaborators(account.clone()), None).unwrap();

    account.set_margin(0.1);
    hive.guardian_cycle().await.unwrap();
    let summary = hive.run(Some(20)).await.unwrap();

    assert_eq!(summary.cycles, 20);
    assert_eq!(summary.stats.dispatches, 0);
    assert_eq!(summary.stats.suspended_cycles, 20);
    assert!(hive.gate().is_suspended());
}

struct Broken;

impl Decider for Broken {
    fn kind(&self) -> &'static str {
        "broken"
    }
    fn decide(&self, _view: &DecisionView) -> AnyResult<Action> {
        Err(anyhow!("model unavailable"))
    }
    fn default_parameters(&self) -> Parameters {
        Parameters::new()
    }
}

struct Panicky;

impl Decider for Panicky {
    fn kind(&self) -> &'static str {
        "panicky"
    }
    fn decide(&self, _view: &DecisionView) -> AnyResult<Action> {
        panic!("decider bug")
    }
    fn default_parameters(&self) -> Parameters {
        Parameters::new()
    }
}

struct Slow;

impl Decider for Slow {
    fn kind(&self) -> &'static str {
        "slow"
    }
    fn decide(&self, _view: &DecisionView) -> AnyResult<Action> {
        std::thread::sleep(std::time::Duration::from_millis(200));
        Ok(Action::Hold)
    }
    fn default_parameters(&self) -> Parameters {
        Parameters::new()
    }
}

fn only(kind: &str, count: usize) -> Option<Vec<ManifestEntry>> {
    Some(vec![ManifestEntry {
        kind: kind.to_string(),
        count,
        parameters: Parameters::new(),
    }])
}

async fn failing_hive(kind: &str) -> Hive {
    let mut registry = DeciderRegistry::empty();
    registry.register(Arc::new(Broken));
    registry.register(Arc::new(Panicky));
    registry.register(Arc::new(Slow));
    let mut cfg = config();
    cfg.runtime.decide_timeout_ms = 20;
    Hive::with_registries(
        cfg,
        collaborators(Account::healthy()),
        only(kind, 5),
        &registry,
        &GeneratorRegistry::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_failing_deciders_become_failed_outcomes() {
    for kind in ["broken", "panicky", "slow"] {
        let mut hive = failing_hive(kind).await;
        for i in 0..3 {
            match hive.step_with(observation(i as f64)).await {
                CycleReport::Dispatched { outcome, .. } => {
                    assert!(outcome.action.is_none(), "{kind} produced an action");
                    assert_eq!(outcome.reward, 0.0);
                }
                other => panic!("{kind}: unexpected report {other:?}"),
            }
        }
        assert_eq!(hive.stats().agent_failures, 3, "{kind}");
        let failures: u64 = hive.inspect_population().iter().map(|a| a.stats.failures).sum();
        assert_eq!(failures, 3, "{kind}");
    }
}
