//! Structured logging for the hive runtime.
//!
//! Every record is one JSON line: timestamp, run id, sequence number, level,
//! domain, event name and a free-form `data` object. Lines are appended to
//! the run directory (`LOG_DIR/RUN_ID`) and echoed to stdout.
//!
//! Filtering:
//! - `LOG_LEVEL`   trace | debug | info | warn | error | fatal (default info)
//! - `LOG_DOMAINS` comma separated domain list, or `all` (default)

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Signal,     // Generator readings, anomalies, replication
    Ledger,     // Record, merge, checkpoints
    Population, // Clone, archive, ranking
    Evolver,    // Variant generation
    Guardian,   // Snapshots, breaches, overrides, tuning
    Dispatch,   // Per-cycle agent dispatch and outcomes
    System,     // Startup, shutdown, summaries
    Audit,      // State hashes for replay
    Profile,    // Timing
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Signal => "signal",
            Domain::Ledger => "ledger",
            Domain::Population => "population",
            Domain::Evolver => "evolver",
            Domain::Guardian => "guardian",
            Domain::Dispatch => "dispatch",
            Domain::System => "system",
            Domain::Audit => "audit",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(file) => Some(Mutex::new(BufWriter::new(file))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, mut fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let msg = fields.remove("msg").unwrap_or(Value::String(String::new()));

    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for key in ["agent_id", "generator", "cycle"] {
        if let Some(value) = fields.remove(key) {
            entry.insert(key.to_string(), value);
        }
    }
    entry.insert("data".to_string(), Value::Object(fields));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    println!("{}", line);
}

// =============================================================================
// Domain-specific helpers
// =============================================================================

pub fn log_reading(generator: &str, value: f64, anomaly: bool, drift_hunger: f64, threshold: f64) {
    log(
        Level::Trace,
        Domain::Signal,
        "reading",
        obj(&[
            ("generator", v_str(generator)),
            ("value", v_num(value)),
            ("anomaly", Value::Bool(anomaly)),
            ("drift_hunger", v_num(drift_hunger)),
            ("threshold", v_num(threshold)),
        ]),
    );
}

pub fn log_transient(domain: Domain, what: &str, reason: &str) {
    log(
        Level::Debug,
        domain,
        "transient_input",
        obj(&[("what", v_str(what)), ("reason", v_str(reason))]),
    );
}

pub fn log_dispatch(cycle: u64, agent_id: &str, context: &str, action: &str, reward: f64, source: &str) {
    log(
        Level::Debug,
        Domain::Dispatch,
        "dispatch",
        obj(&[
            ("cycle", json!(cycle)),
            ("agent_id", v_str(agent_id)),
            ("context", v_str(context)),
            ("action", v_str(action)),
            ("reward", v_num(reward)),
            ("selected_by", v_str(source)),
        ]),
    );
}

pub fn log_agent_failure(cycle: u64, agent_id: &str, reason: &str) {
    log(
        Level::Warn,
        Domain::Dispatch,
        "agent_failure",
        obj(&[
            ("cycle", json!(cycle)),
            ("agent_id", v_str(agent_id)),
            ("msg", v_str(reason)),
        ]),
    );
}

pub fn log_lifecycle(event: &str, agent_id: &str, fields: &[(&str, Value)]) {
    let mut data = obj(fields);
    data.insert("agent_id".to_string(), v_str(agent_id));
    log(Level::Info, Domain::Population, event, data);
}

pub fn log_breach(check: &str, value: f64, limit: f64, action: &str) {
    log(
        Level::Warn,
        Domain::Guardian,
        "breach",
        obj(&[
            ("check", v_str(check)),
            ("value", v_num(value)),
            ("limit", v_num(limit)),
            ("action", v_str(action)),
        ]),
    );
}

pub fn log_tune(parameter: &str, old: f64, new: f64, floor: f64) {
    log(
        Level::Warn,
        Domain::Guardian,
        "auto_tune",
        obj(&[
            ("parameter", v_str(parameter)),
            ("old", v_num(old)),
            ("new", v_num(new)),
            ("floor", v_num(floor)),
        ]),
    );
}

/// Log a ledger checkpoint for replay verification
pub fn log_checkpoint(state_hash: &str, entries: usize, merges: usize) {
    log(
        Level::Info,
        Domain::Audit,
        "ledger_checkpoint",
        obj(&[
            ("state_hash", v_str(state_hash)),
            ("entries", json!(entries)),
            ("merges", json!(merges)),
        ]),
    );
}

pub fn log_periodic_summary(cycle: u64, population: usize, dispatches: u64, suspended: u64, failures: u64) {
    log(
        Level::Info,
        Domain::System,
        "periodic_summary",
        obj(&[
            ("cycle", json!(cycle)),
            ("population", json!(population)),
            ("dispatches", json!(dispatches)),
            ("suspended_cycles", json!(suspended)),
            ("agent_failures", json!(failures)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Profiling scope that emits structured timing on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            context: None,
            started: Instant::now(),
            enabled: Self::should_sample(),
        }
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = Self::should_sample();
        Self {
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    fn should_sample() -> bool {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| {
                if p >= 1.0 {
                    true
                } else if p <= 0.0 {
                    false
                } else {
                    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
                    let bucket = (seq % 10_000) as f64 / 10_000.0;
                    bucket < p
                }
            })
            .unwrap_or(true)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }

    #[test]
    fn test_domain_names_are_distinct() {
        let all = [
            Domain::Signal,
            Domain::Ledger,
            Domain::Population,
            Domain::Evolver,
            Domain::Guardian,
            Domain::Dispatch,
            Domain::System,
            Domain::Audit,
            Domain::Profile,
        ];
        let names: std::collections::HashSet<_> = all.iter().map(|d| d.as_str()).collect();
        assert_eq!(names.len(), all.len());
    }
}
