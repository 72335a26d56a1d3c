//! Structured logging for the panel core.
//!
//! Every record is one JSON line carrying a run id, a monotonically
//! increasing sequence number, level, domain and event name. Records are
//! appended to `<LOG_DIR>/<run_id>/events.jsonl` (trace/debug go to
//! `trace.jsonl`) and mirrored to stderr.

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

use crate::ensemble::EnsembleWeights;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    const ALL: [Level; 5] = [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str().eq_ignore_ascii_case(name.trim()))
    }

    /// `LOG_LEVEL`, read once; unknown values mean info.
    pub fn threshold() -> Self {
        static THRESHOLD: OnceLock<Level> = OnceLock::new();
        *THRESHOLD.get_or_init(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .and_then(|v| Level::parse(&v))
                .unwrap_or(Level::Info)
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Schema,     // refreshes and selector re-renders
    Training,   // payload normalization
    Ensemble,   // blend weights
    Analysis,   // exploratory fan-out
    Transport,  // remote calls
    Validation, // rejected input
    System,
    Profile,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Schema => "schema",
            Domain::Training => "training",
            Domain::Ensemble => "ensemble",
            Domain::Analysis => "analysis",
            Domain::Transport => "transport",
            Domain::Validation => "validation",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    /// `LOG_DOMAINS` is a comma-separated allow list; unset or `all` enables everything.
    pub fn is_enabled(&self) -> bool {
        static ALLOWED: OnceLock<Option<Vec<String>>> = OnceLock::new();
        let allowed = ALLOWED.get_or_init(|| match std::env::var("LOG_DOMAINS") {
            Ok(list) if list.trim() != "all" => {
                Some(list.split(',').map(|d| d.trim().to_lowercase()).collect())
            }
            _ => None,
        });
        allowed
            .as_ref()
            .map_or(true, |list| list.iter().any(|d| d == self.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Run sink
// ---------------------------------------------------------------------------

const REDACTED_KEYS: [&str; 5] = ["authorization", "Authorization", "api_key", "token", "password"];
/// Fields promoted from `data` to the top level of a record.
const LIFTED_KEYS: [&str; 4] = ["filename", "generation", "section", "msg"];

static SEQ: AtomicU64 = AtomicU64::new(0);
static SINK: OnceLock<RunSink> = OnceLock::new();

fn next_seq() -> u64 {
    SEQ.fetch_add(1, Ordering::SeqCst)
}

type LogFile = Option<Mutex<BufWriter<File>>>;

/// Files of one process run under `<LOG_DIR>/<run_id>/`.
#[derive(Debug)]
struct RunSink {
    run_id: String,
    events: LogFile,
    trace: LogFile,
}

impl RunSink {
    fn open() -> Self {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("panel-{}-{}", ts_epoch_ms(), process::id()));
        let dir = PathBuf::from(std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string()))
            .join(&run_id);
        if let Err(err) = create_dir_all(&dir) {
            eprintln!("[log] cannot create {}: {}", dir.display(), err);
        }
        let manifest = json!({
            "run_id": run_id,
            "started": ts_now(),
            "pid": process::id(),
            "dir": dir.display().to_string(),
        });
        if let Err(err) = std::fs::write(dir.join("manifest.json"), manifest.to_string()) {
            eprintln!("[log] cannot write manifest: {}", err);
        }
        Self {
            events: Self::file(dir.join("events.jsonl")),
            trace: Self::file(dir.join("trace.jsonl")),
            run_id,
        }
    }

    fn file(path: PathBuf) -> LogFile {
        File::create(&path)
            .map(|f| Mutex::new(BufWriter::new(f)))
            .map_err(|err| eprintln!("[log] cannot create {}: {}", path.display(), err))
            .ok()
    }

    fn append(target: &LogFile, line: &str) {
        let Some(Ok(mut w)) = target.as_ref().map(|m| m.lock()) else {
            return;
        };
        let _ = writeln!(w, "{}", line).and_then(|_| w.flush());
    }
}

fn redact(fields: &mut Map<String, Value>) {
    for key in REDACTED_KEYS {
        if let Some(v) = fields.get_mut(key) {
            *v = Value::String("[REDACTED]".to_string());
        }
    }
}

/// Split `fields` into lifted keys and the remaining `data` payload.
fn lift(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let lifted = LIFTED_KEYS
        .iter()
        .filter_map(|k| fields.remove(*k).map(|v| (k.to_string(), v)))
        .collect();
    (lifted, fields)
}

#[derive(Serialize)]
struct Record<'a> {
    ts: String,
    run_id: &'a str,
    seq: u64,
    lvl: String,
    component: &'a str,
    event: &'a str,
    #[serde(flatten)]
    lifted: Map<String, Value>,
    data: Map<String, Value>,
}

/// RFC3339 with milliseconds, UTC.
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Write one JSON record to the run files and stderr.
pub fn log(level: Level, domain: Domain, event: &str, mut fields: Map<String, Value>) {
    if level < Level::threshold() || !domain.is_enabled() {
        return;
    }
    let sink = SINK.get_or_init(RunSink::open);
    redact(&mut fields);
    let (mut lifted, data) = lift(fields);
    lifted.entry("msg").or_insert_with(|| Value::String(String::new()));
    let record = Record {
        ts: ts_now(),
        run_id: &sink.run_id,
        seq: next_seq(),
        lvl: level.as_str().to_uppercase(),
        component: domain.as_str(),
        event,
        lifted,
        data,
    };
    let Ok(line) = serde_json::to_string(&record) else {
        return;
    };
    let target = if level <= Level::Debug { &sink.trace } else { &sink.events };
    RunSink::append(target, &line);
    eprintln!("{}", line);
}

// ---------------------------------------------------------------------------
// Panel events
// ---------------------------------------------------------------------------

pub fn log_refresh(event: &str, filename: &str, generation: u64, extra: &[(&str, Value)]) {
    let mut fields = obj(extra);
    fields.insert("filename".to_string(), v_str(filename));
    fields.insert("generation".to_string(), json!(generation));
    let level = match event {
        "refresh_failed" | "refresh_abandoned" | "refresh_rejected" => Level::Warn,
        "refresh_stale" => Level::Debug,
        _ => Level::Info,
    };
    log(level, Domain::Schema, event, fields);
}

pub fn log_consistency_warning(filename: &str, column: &str, available: usize) {
    log(
        Level::Warn,
        Domain::Schema,
        "column_synthesized",
        obj(&[
            ("filename", v_str(filename)),
            ("column", v_str(column)),
            ("available_columns", json!(available)),
            ("msg", v_str("transform reported a column the schema fetch did not return")),
        ]),
    );
}

pub fn log_section(section: &str, outcome: &str, detail: Option<&str>) {
    let level = if outcome == "failed" { Level::Warn } else { Level::Debug };
    log(
        level,
        Domain::Analysis,
        "section",
        obj(&[
            ("section", v_str(section)),
            ("outcome", v_str(outcome)),
            ("detail", detail.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_shape_diagnostic(reason: &str, keys: &[String]) {
    log(
        Level::Warn,
        Domain::Training,
        "shape_diagnostic",
        obj(&[
            ("reason", v_str(reason)),
            ("keys", Value::Array(keys.iter().map(|k| v_str(k)).collect())),
        ]),
    );
}

pub fn log_ensemble_weights(weights: &EnsembleWeights) {
    let entries: Vec<Value> = weights
        .entries()
        .iter()
        .map(|e| {
            json!({
                "constituent": e.constituent.key(),
                "weight": e.weight,
                "status": e.status,
                "rmse": e.rmse,
            })
        })
        .collect();
    log(
        Level::Info,
        Domain::Ensemble,
        "weights_resolved",
        obj(&[("constituents", Value::Array(entries)), ("sum", v_num(weights.sum()))]),
    );
}

pub fn log_validation_failure(operation: &str, reason: &str) {
    log(
        Level::Warn,
        Domain::Validation,
        "rejected",
        obj(&[("operation", v_str(operation)), ("msg", v_str(reason))]),
    );
}

pub fn log_transport_error(operation: &str, error: &str) {
    log(
        Level::Warn,
        Domain::Transport,
        "call_failed",
        obj(&[("operation", v_str(operation)), ("msg", v_str(error))]),
    );
}

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

/// Emits elapsed time on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Map<String, Value>,
    started: Instant,
}

impl ProfileScope {
    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self {
            label,
            context: obj(fields),
            started: Instant::now(),
        }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = std::mem::take(&mut self.context);
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse_and_order() {
        assert_eq!(Level::parse("WARN"), Some(Level::Warn));
        assert_eq!(Level::parse(" debug "), Some(Level::Debug));
        assert_eq!(Level::parse("fatal"), None);
        assert!(Level::Debug < Level::Info && Level::Warn < Level::Error);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_redacts_credentials() {
        let mut m = obj(&[("api_key", v_str("secret")), ("column", v_str("sales"))]);
        redact(&mut m);
        assert_eq!(m.get("api_key").unwrap(), "[REDACTED]");
        assert_eq!(m.get("column").unwrap(), "sales");
    }

    #[test]
    fn test_lift_correlation_keys() {
        let (top, data) = lift(obj(&[
            ("filename", v_str("a.csv")),
            ("generation", json!(3)),
            ("column", v_str("x")),
        ]));
        assert!(top.contains_key("filename"));
        assert!(top.contains_key("generation"));
        assert!(data.contains_key("column"));
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
