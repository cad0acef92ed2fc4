//! Rebuild the shared ledger from a journal and print what it knows.
//!
//! Usage: hivefx-replay [journal-path]   (defaults to $JOURNAL_PATH)

use std::collections::BTreeSet;

use anyhow::{bail, Result};
use serde_json::json;

use hivefx::config::HiveConfig;
use hivefx::fingerprint::Context;
use hivefx::journal::Journal;
use hivefx::ledger::Ledger;

fn main() -> Result<()> {
    let cfg = HiveConfig::from_env();
    let path = match std::env::args().nth(1).or_else(|| cfg.runtime.journal_path.clone()) {
        Some(p) => p,
        None => bail!("no journal path given and JOURNAL_PATH unset"),
    };

    let recovery = Journal::recover(&path)?;
    if recovery.skipped_lines > 0 {
        eprintln!("skipped {} unreadable lines", recovery.skipped_lines);
    }

    let Some((cycle, expected_hash, snapshot)) = recovery.last_checkpoint else {
        println!("{}", json!({ "journal": path, "checkpoint": null }));
        return Ok(());
    };

    let contexts: BTreeSet<Context> = snapshot.rows.iter().map(|r| r.context.clone()).collect();
    let ledger = Ledger::restore(&cfg.ledger, snapshot);
    let hash = ledger.state_hash();
    println!(
        "{}",
        json!({
            "journal": path,
            "cycle": cycle,
            "entries": ledger.len(),
            "merges": ledger.merge_count(),
            "state_hash": hash,
            "hash_ok": hash == expected_hash,
        })
    );

    for context in &contexts {
        let ranked = ledger.ranked(context);
        let top: Vec<_> = ranked
            .iter()
            .take(3)
            .map(|c| json!({ "agent": c.agent_id, "rate": c.rate, "trials": c.trials }))
            .collect();
        println!("{}", json!({ "context": context.to_string(), "top": top }));
    }

    for archived in &recovery.archived {
        println!(
            "{}",
            json!({
                "archived": archived.summary.id,
                "kind": archived.summary.kind,
                "reason": archived.reason,
                "win_rate": archived.summary.stats.win_rate(),
            })
        );
    }

    if let Some(last) = recovery.snapshots.last() {
        println!("{}", json!({ "guardian": last, "reflections": recovery.reflections.len() }));
    }

    if hash != expected_hash {
        bail!("state hash mismatch: journal {} rebuilt {}", expected_hash, hash);
    }
    Ok(())
}
