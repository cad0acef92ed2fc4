use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use hivefx::config::HiveConfig;
use hivefx::feed::{JsonlFeed, ObservationSource, SyntheticFeed};
use hivefx::journal::{FanoutSink, Journal, PersistenceSink};
use hivefx::ledger::Ledger;
use hivefx::logging::{self, obj, v_num, v_str, Domain, Level};
use hivefx::storage::HiveStore;
use hivefx::{Collaborators, Hive};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = HiveConfig::from_env();
    cfg.validate()?;

    let feed: Box<dyn ObservationSource> = match &cfg.runtime.feed_path {
        Some(path) => {
            logging::log(Level::Info, Domain::System, "feed", obj(&[("type", v_str("jsonl")), ("path", v_str(path))]));
            Box::new(JsonlFeed::open(path)?)
        }
        None => {
            let seed = cfg.runtime.seed.unwrap_or(7);
            logging::log(Level::Info, Domain::System, "feed", obj(&[("type", v_str("synthetic")), ("seed", v_num(seed as f64))]));
            Box::new(SyntheticFeed::new(seed, 100.0))
        }
    };

    let mut sinks: Vec<Arc<dyn PersistenceSink>> = Vec::new();
    let mut recovered = None;
    if let Some(path) = &cfg.runtime.journal_path {
        // Pick up what a previous run left behind before appending to it.
        if Path::new(path).exists() {
            let recovery = Journal::recover(path)?;
            if let Some((cycle, hash, snapshot)) = &recovery.last_checkpoint {
                let restored = Ledger::restore(&cfg.ledger, snapshot.clone());
                logging::log(
                    Level::Info,
                    Domain::Audit,
                    "journal_recovery",
                    obj(&[
                        ("cycle", v_num(*cycle as f64)),
                        ("hash", v_str(hash)),
                        ("hash_ok", serde_json::json!(restored.state_hash() == *hash)),
                        ("archived", v_num(recovery.archived.len() as f64)),
                        ("skipped_lines", v_num(recovery.skipped_lines as f64)),
                    ]),
                );
                recovered = Some(snapshot.clone());
            }
        }
        sinks.push(Arc::new(Journal::open(path)?));
    }
    if let Some(path) = &cfg.runtime.sqlite_path {
        let store = HiveStore::new(path)?;
        store.init()?;
        sinks.push(Arc::new(store));
    }
    let sink: Option<Arc<dyn PersistenceSink>> = match sinks.len() {
        0 => None,
        1 => sinks.pop(),
        _ => Some(Arc::new(FanoutSink::new(sinks))),
    };

    let (mut collaborators, broker) = Collaborators::paper(feed, &cfg);
    collaborators.sink = sink;
    let budget = cfg.runtime.cycle_budget;
    let mut hive = Hive::new(cfg, collaborators, None)?;
    if let Some(snapshot) = recovered {
        hive.restore_ledger(snapshot);
    }

    let shutdown = hive.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logging::log(Level::Warn, Domain::System, "shutdown_requested", obj(&[]));
            shutdown.shutdown();
        }
    });

    let summary = hive.run(budget).await?;

    for agent in hive.inspect_population() {
        logging::log(
            Level::Info,
            Domain::Population,
            "final_agent",
            obj(&[
                ("id", v_str(&agent.id)),
                ("kind", v_str(&agent.kind)),
                ("win_rate", v_num(agent.stats.win_rate())),
                ("trials", v_num(agent.stats.trials as f64)),
            ]),
        );
    }
    logging::log(
        Level::Info,
        Domain::System,
        "final",
        obj(&[
            ("cycles", v_num(summary.cycles as f64)),
            ("dispatches", v_num(summary.stats.dispatches as f64)),
            ("population", v_num(summary.population as f64)),
            ("interventions", v_num(summary.guardian_interventions as f64)),
            ("equity", v_num(broker.equity())),
            ("ledger_hash", v_str(&hive.ledger().read().state_hash())),
        ]),
    );
    Ok(())
}
