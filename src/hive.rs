//! Public facade: wires generators, ledger, population, evolver, controller
//! and guardian, and exposes run / inspect / manual override.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::agent::{default_manifest, load_manifest, AgentSummary, DeciderRegistry, ManifestEntry};
use crate::broker::{BrokerConfig, PaperBroker};
use crate::config::HiveConfig;
use crate::controller::{ActionResolver, Controller, ControllerStats, CycleReport};
use crate::error::{HiveError, Result};
use crate::evolver::Evolver;
use crate::feed::ObservationSource;
use crate::fingerprint::Context;
use crate::guardian::{self, AccountGateway, Guardian, Intervention, Reflection, SuspendGate, TrendRiskPredictor};
use crate::journal::PersistenceSink;
use crate::ledger::{Candidate, Ledger, LedgerSnapshot, SharedLedger};
use crate::logging::{self, Domain, Level};
use crate::peer::PeerChannel;
use crate::population::{Population, SharedPopulation};
use crate::signals::{GeneratorBank, GeneratorRegistry};

/// External collaborators the core runs against.
pub struct Collaborators {
    pub feed: Box<dyn ObservationSource>,
    pub resolver: Arc<dyn ActionResolver>,
    pub gateway: Arc<dyn AccountGateway>,
    pub predictor: Option<Arc<dyn TrendRiskPredictor>>,
    pub peers: Vec<Arc<dyn PeerChannel>>,
    pub sink: Option<Arc<dyn PersistenceSink>>,
}

impl Collaborators {
    /// Paper broker as resolver, gateway and trend predictor.
    pub fn paper(feed: Box<dyn ObservationSource>, cfg: &HiveConfig) -> (Self, Arc<PaperBroker>) {
        let broker = Arc::new(PaperBroker::new(BrokerConfig {
            initial_capital: cfg.runtime.initial_capital,
            ..BrokerConfig::default()
        }));
        let collaborators = Self {
            feed,
            resolver: broker.clone(),
            gateway: broker.clone(),
            predictor: Some(broker.clone()),
            peers: Vec::new(),
            sink: None,
        };
        (collaborators, broker)
    }
}

/// Clonable handle that stops a running hive after its in-flight cycle.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub cycles: u64,
    pub stats: ControllerStats,
    pub population: usize,
    pub guardian_interventions: u64,
}

pub struct Hive {
    cfg: HiveConfig,
    controller: Controller,
    guardian: Arc<tokio::sync::Mutex<Guardian>>,
    gateway: Arc<dyn AccountGateway>,
    feed: Box<dyn ObservationSource>,
    gate: SuspendGate,
    ledger: SharedLedger,
    population: SharedPopulation,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Hive {
    /// Build from config. Fails with `Configuration` on invalid bounds,
    /// unknown kinds or a manifest that does not fit the population bounds.
    pub fn new(cfg: HiveConfig, collaborators: Collaborators, manifest: Option<Vec<ManifestEntry>>) -> Result<Self> {
        Self::with_registries(
            cfg,
            collaborators,
            manifest,
            &DeciderRegistry::default(),
            &GeneratorRegistry::default(),
        )
    }

    pub fn with_registries(
        cfg: HiveConfig,
        collaborators: Collaborators,
        manifest: Option<Vec<ManifestEntry>>,
        deciders: &DeciderRegistry,
        generators: &GeneratorRegistry,
    ) -> Result<Self> {
        cfg.validate()?;

        let manifest = match manifest {
            Some(m) => m,
            None => match &cfg.runtime.manifest_path {
                Some(path) => load_manifest(Path::new(path), deciders)?,
                None => default_manifest(deciders, cfg.population.initial_size),
            },
        };
        let total: usize = manifest.iter().map(|e| e.count).sum();
        if total < cfg.population.min_size || total > cfg.population.max_size {
            return Err(HiveError::config(format!(
                "manifest seeds {} agents, outside [{}, {}]",
                total, cfg.population.min_size, cfg.population.max_size
            )));
        }

        let mut rng = match cfg.runtime.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut evolver = Evolver::new(&cfg.evolver);
        let mut population = Population::new(&cfg.population);
        for entry in &manifest {
            let decider = deciders.get(&entry.kind)?;
            for _ in 0..entry.count {
                population.add(evolver.spawn(decider.clone(), &entry.parameters))?;
            }
        }

        let bank = GeneratorBank::from_config(generators, &cfg.generator)?;
        let ledger = Ledger::new(&cfg.ledger).shared();
        let population = population.shared();
        let gate = SuspendGate::new();

        let mut guardian = Guardian::new(&cfg.guardian, gate.clone());
        if let Some(predictor) = collaborators.predictor {
            guardian = guardian.with_predictor(predictor);
        }
        if let Some(sink) = &collaborators.sink {
            guardian = guardian.with_sink(sink.clone());
        }

        let controller_rng = StdRng::seed_from_u64(rand::Rng::gen(&mut rng));
        let controller = Controller::new(
            cfg.clone(),
            bank,
            ledger.clone(),
            population.clone(),
            evolver,
            gate.clone(),
            collaborators.resolver,
            controller_rng,
        )
        .with_peers(collaborators.peers)
        .with_sink(collaborators.sink);

        let (tx, rx) = watch::channel(false);
        logging::log(
            Level::Info,
            Domain::System,
            "hive_built",
            logging::obj(&[
                ("population", serde_json::json!(total)),
                ("generators", serde_json::json!(controller.bank().names())),
                ("seed", serde_json::json!(cfg.runtime.seed)),
            ]),
        );

        Ok(Self {
            cfg,
            controller,
            guardian: Arc::new(tokio::sync::Mutex::new(guardian)),
            gateway: collaborators.gateway,
            feed: collaborators.feed,
            gate,
            ledger,
            population,
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn gate(&self) -> SuspendGate {
        self.gate.clone()
    }

    pub fn ledger(&self) -> SharedLedger {
        self.ledger.clone()
    }

    pub fn stats(&self) -> ControllerStats {
        self.controller.stats()
    }

    /// Run until `cycle_budget` cycles complete, the feed is exhausted or
    /// shutdown is requested. The guardian runs alongside as its own task.
    pub async fn run(&mut self, cycle_budget: Option<u64>) -> Result<RunSummary> {
        let guardian_task = guardian::spawn(
            self.guardian.clone(),
            self.gateway.clone(),
            Duration::from_millis(self.cfg.guardian.cycle_ms.max(1)),
            self.shutdown_rx.clone(),
        );

        let mut ticker = tokio::time::interval(Duration::from_millis(self.cfg.runtime.cycle_ms.max(1)));
        let mut shutdown = self.shutdown_rx.clone();
        let mut ran = 0u64;
        loop {
            if *shutdown.borrow() || cycle_budget.is_some_and(|b| ran >= b) {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => continue,
            }
            let observation = self.feed.next_observation().await;
            if observation.is_none() && self.feed.is_exhausted() {
                logging::log(Level::Info, Domain::System, "feed_exhausted", logging::obj(&[]));
                break;
            }
            self.step_with(observation).await;
            ran += 1;
        }

        self.shutdown_tx.send_replace(true);
        if let Err(err) = guardian_task.await {
            logging::log(
                Level::Error,
                Domain::Guardian,
                "guardian_task_failed",
                logging::obj(&[("msg", logging::v_str(&err.to_string()))]),
            );
        }
        // Re-arm so the hive can run again.
        self.shutdown_tx.send_replace(false);

        let summary = RunSummary {
            cycles: ran,
            stats: self.controller.stats(),
            population: self.population.lock().len(),
            guardian_interventions: self.guardian.lock().await.interventions(),
        };
        logging::log(
            Level::Info,
            Domain::System,
            "run_complete",
            logging::obj(&[
                ("cycles", serde_json::json!(summary.cycles)),
                ("dispatches", serde_json::json!(summary.stats.dispatches)),
                ("population", serde_json::json!(summary.population)),
            ]),
        );
        Ok(summary)
    }

    /// One controller cycle with an explicit observation, no guardian task.
    pub async fn step_with(&mut self, observation: Option<crate::signals::Observation>) -> CycleReport {
        self.controller.run_cycle(observation).await
    }

    /// One guardian cycle, run inline.
    pub async fn guardian_cycle(&self) -> Result<Reflection> {
        self.guardian.lock().await.run_cycle(self.gateway.as_ref()).await
    }

    pub fn inspect_population(&self) -> Vec<AgentSummary> {
        self.population.lock().summaries()
    }

    pub fn inspect_ledger(&self, context: &Context) -> Vec<Candidate> {
        self.ledger.read().ranked(context)
    }

    pub fn ledger_snapshot(&self) -> LedgerSnapshot {
        self.ledger.read().snapshot()
    }

    /// Replace the ledger with a recovered snapshot. Rows of agents that are
    /// not in the live population are dropped. Returns the kept row count.
    pub fn restore_ledger(&self, mut snapshot: LedgerSnapshot) -> usize {
        let pop = self.population.lock();
        let recovered = snapshot.rows.len();
        snapshot.rows.retain(|row| pop.contains(&row.agent_id));
        let kept = snapshot.rows.len();
        *self.ledger.write() = Ledger::restore(&self.cfg.ledger, snapshot);
        logging::log(
            Level::Info,
            Domain::Ledger,
            "ledger_restored",
            logging::obj(&[
                ("recovered", serde_json::json!(recovered)),
                ("kept", serde_json::json!(kept)),
            ]),
        );
        kept
    }

    pub async fn force_guardian_action(&self, action: Intervention) -> Result<usize> {
        self.guardian.lock().await.force_action(action, self.gateway.as_ref()).await
    }

    pub async fn reflections(&self) -> Vec<Reflection> {
        self.guardian.lock().await.reflections().cloned().collect()
    }
}
