// src/logger.rs
// Append-only structured audit log with daily rotation, secret redaction,
// and size-based summarization for oversized bodies. Spec §4.1, §8.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Event type enumeration (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Startup,
    ClientRequest,
    CentralRequest,
    CentralResponse,
    DbQuery,
    DbResult,
    PrometheusQuery,
    PrometheusResult,
    SshCommand,
    SshResult,
    CliCommand,
    CliResult,
    Error,
}

impl EventType {
    fn as_str(&self) -> &'static str {
        match self {
            EventType::Startup => "STARTUP",
            EventType::ClientRequest => "CLIENT_REQUEST",
            EventType::CentralRequest => "CENTRAL_REQUEST",
            EventType::CentralResponse => "CENTRAL_RESPONSE",
            EventType::DbQuery => "DB_QUERY",
            EventType::DbResult => "DB_RESULT",
            EventType::PrometheusQuery => "PROMETHEUS_QUERY",
            EventType::PrometheusResult => "PROMETHEUS_RESULT",
            EventType::SshCommand => "SSH_COMMAND",
            EventType::SshResult => "SSH_RESULT",
            EventType::CliCommand => "CLI_COMMAND",
            EventType::CliResult => "CLI_RESULT",
            EventType::Error => "ERROR",
        }
    }

    /// Event types that bypass redaction because diagnostic reproducibility
    /// is the point (spec §4.1: "Certain event types ... bypass redaction").
    fn bypasses_redaction(&self) -> bool {
        matches!(
            self,
            EventType::SshCommand
                | EventType::SshResult
                | EventType::CliCommand
                | EventType::CliResult
                | EventType::DbQuery
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
}

impl Level {
    fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Error => "ERROR",
        }
    }
}

/// Keys (case-insensitive substring match) whose values are masked.
const SECRET_KEY_PATTERNS: &[&str] = &[
    "password",
    "token",
    "apitoken",
    "api_token",
    "secret",
    "ssh_password",
    "sr_password",
    "central_api_token",
];

const MASK: &str = "***MASKED***";

fn key_is_secret(key: &str) -> bool {
    let lower = key.to_lowercase();
    SECRET_KEY_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Recursively redact secret-named fields in a JSON value.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                if key_is_secret(k) {
                    out.insert(k.clone(), Value::String(MASK.to_string()));
                } else {
                    out.insert(k.clone(), redact(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(redact).collect()),
        other => other.clone(),
    }
}

const SMALL_BODY_THRESHOLD: usize = 2 * 1024;
const RESPONSE_BODY_THRESHOLD: usize = 5 * 1024;

/// Summarize an outbound request body if it exceeds `SMALL_BODY_THRESHOLD`,
/// redacting it first either way (spec §4.1 size policy).
pub fn summarize_request_body(body: &Value) -> Value {
    summarize_body(body, SMALL_BODY_THRESHOLD, false)
}

/// Summarize an inbound response body if it exceeds `RESPONSE_BODY_THRESHOLD`.
pub fn summarize_response_body(body: &Value) -> Value {
    summarize_body(body, RESPONSE_BODY_THRESHOLD, true)
}

fn summarize_body(body: &Value, threshold: usize, is_response: bool) -> Value {
    let redacted = redact(body);
    let size_bytes = serde_json::to_string(&redacted).map(|s| s.len()).unwrap_or(0);
    if size_bytes <= threshold {
        return redacted;
    }

    let mut summary = Map::new();
    summary.insert("_truncated".into(), Value::Bool(true));
    summary.insert("sizeBytes".into(), Value::from(size_bytes));
    summary.insert("sizeKB".into(), Value::from(size_bytes as f64 / 1024.0));
    if is_response {
        summary.insert("sizeMB".into(), Value::from(size_bytes as f64 / (1024.0 * 1024.0)));
    }

    if let Value::Object(map) = &redacted {
        if let Some(args) = map.get("args") {
            let args_json = serde_json::to_string(args).unwrap_or_default();
            if args_json.len() <= threshold {
                summary.insert("args".into(), args.clone());
            } else if let Value::Object(args_map) = args {
                let keys: Vec<Value> = args_map.keys().map(|k| Value::String(k.clone())).collect();
                let mut keys_obj = Map::new();
                keys_obj.insert("keys".into(), Value::Array(keys));
                summary.insert("args".into(), Value::Object(keys_obj));
            }
        }
        if let Some(Value::Object(results)) = map.get("results") {
            let total_keys = results.len();
            let keys: Vec<Value> = results
                .keys()
                .take(10)
                .map(|k| Value::String(k.clone()))
                .collect();
            let results_json = serde_json::to_string(results).unwrap_or_default();
            let mut results_summary = Map::new();
            results_summary.insert("sizeBytes".into(), Value::from(results_json.len()));
            results_summary.insert("keys".into(), Value::Array(keys));
            results_summary.insert("totalKeys".into(), Value::from(total_keys));
            summary.insert("results".into(), Value::Object(results_summary));
        }
    }

    Value::Object(summary)
}

#[derive(Serialize)]
struct LogLine<'a> {
    timestamp: String,
    level: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    message: &'a str,
    #[serde(flatten)]
    data: Value,
}

struct RotatingStream {
    dir: PathBuf,
    date: NaiveDate,
    file: std::fs::File,
}

impl RotatingStream {
    fn open(dir: &std::path::Path, date: NaiveDate) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("mcp-server-{}.log", date.format("%Y-%m-%d")));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            date,
            file,
        })
    }
}

/// Append-only structured event sink. When disabled, every method is a no-op.
pub struct Logger {
    dir: PathBuf,
    enabled: bool,
    stream: Mutex<Option<RotatingStream>>,
}

impl Logger {
    /// Create a logger rooted at `dir`. When `enabled` is false every write
    /// is a no-op and no file is ever opened (spec §4.1).
    pub fn new(dir: impl Into<PathBuf>, enabled: bool) -> Self {
        let logger = Self {
            dir: dir.into(),
            enabled,
            stream: Mutex::new(None),
        };
        if enabled {
            logger.write_raw(Level::Info, EventType::Startup, "process started", environment_snapshot());
        }
        logger
    }

    pub fn write(&self, level: Level, event_type: EventType, message: &str, data: Value) {
        if !self.enabled {
            return;
        }
        let payload = if event_type.bypasses_redaction() {
            data
        } else {
            redact(&data)
        };
        self.write_raw(level, event_type, message, payload);
    }

    fn write_raw(&self, level: Level, event_type: EventType, message: &str, data: Value) {
        let line = LogLine {
            timestamp: Utc::now().to_rfc3339(),
            level: level.as_str(),
            event_type: event_type.as_str(),
            message,
            data,
        };
        let Ok(mut json) = serde_json::to_string(&line) else {
            return;
        };
        json.push('\n');

        let today = Utc::now().date_naive();
        let mut guard = match self.stream.lock() {
            Ok(g) => g,
            Err(_) => return,
        };

        let needs_rotation = guard.as_ref().map(|s| s.date != today).unwrap_or(true);
        if needs_rotation {
            match RotatingStream::open(&self.dir, today) {
                Ok(new_stream) => *guard = Some(new_stream),
                Err(_) => return, // Logger swallows its own errors (spec §7)
            }
        }

        if let Some(stream) = guard.as_mut() {
            let _ = stream.file.write_all(json.as_bytes());
        }
    }
}

/// Dump the entire process environment (sorted by key), unredacted, once
/// at startup (spec §4.1's `STARTUP` event is the one deliberate exception
/// to redaction — it is diagnostic metadata about the host, not a secret
/// carrier in its own right; downstream readers are expected to treat the
/// daily log file itself as sensitive).
fn environment_snapshot() -> Value {
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    let mut map = Map::new();
    for (k, v) in vars {
        map.insert(k, Value::String(v));
    }
    let mut wrapper = Map::new();
    wrapper.insert("environment".into(), Value::Object(map));
    Value::Object(wrapper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redact_totality_nested() {
        let body = json!({
            "user": "alice",
            "password": "hunter2",
            "nested": { "api_token": "sk-abc", "ok": "fine" },
            "list": [{ "secret": "x" }, { "keep": "y" }]
        });
        let redacted = redact(&body);
        let s = redacted.to_string();
        assert!(!s.contains("hunter2"));
        assert!(!s.contains("sk-abc"));
        assert!(!s.contains("\"x\""));
        assert!(s.contains("fine"));
        assert!(s.contains("***MASKED***"));
    }

    #[test]
    fn test_redact_is_case_insensitive() {
        let body = json!({ "PASSWORD": "secretvalue", "Token": "t1" });
        let redacted = redact(&body);
        assert_eq!(redacted["PASSWORD"], "***MASKED***");
        assert_eq!(redacted["Token"], "***MASKED***");
    }

    #[test]
    fn test_small_body_logged_verbatim() {
        let body = json!({ "a": 1, "b": "hello" });
        let out = summarize_request_body(&body);
        assert_eq!(out, body);
    }

    #[test]
    fn test_oversized_body_is_summarized() {
        let big_string = "x".repeat(3000);
        let body = json!({ "args": { "blob": big_string } });
        let out = summarize_request_body(&body);
        assert_eq!(out["_truncated"], true);
        let expected_size = serde_json::to_string(&redact(&body)).unwrap().len();
        assert_eq!(out["sizeBytes"], expected_size);
    }

    #[test]
    fn test_response_body_summary_has_size_mb() {
        let big_string = "y".repeat(6000);
        let body = json!({ "results": { "k": big_string } });
        let out = summarize_response_body(&body);
        assert_eq!(out["_truncated"], true);
        assert!(out.get("sizeMB").is_some());
    }

    #[test]
    fn test_results_summary_caps_keys_at_ten() {
        let mut results = Map::new();
        for i in 0..20 {
            results.insert(format!("k{i}"), Value::from(i));
        }
        let big_padding = "z".repeat(6000);
        results.insert("padding".into(), Value::String(big_padding));
        let body = Value::Object({
            let mut m = Map::new();
            m.insert("results".into(), Value::Object(results));
            m
        });
        let out = summarize_response_body(&body);
        let keys = out["results"]["keys"].as_array().unwrap();
        assert!(keys.len() <= 10);
        assert_eq!(out["results"]["totalKeys"], 21);
    }

    #[test]
    fn test_daily_rotation_creates_distinct_files_and_closes_stream() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(dir.path(), true);

        let day1 = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();

        {
            let mut guard = logger.stream.lock().unwrap();
            *guard = Some(RotatingStream::open(dir.path(), day1).unwrap());
        }
        logger.write_raw(Level::Info, EventType::Error, "day1 event", json!({}));

        // Force rotation by manufacturing a stale stream dated yesterday.
        {
            let mut guard = logger.stream.lock().unwrap();
            *guard = Some(RotatingStream::open(dir.path(), day2 - chrono::Duration::days(1)).unwrap());
        }
        logger.write_raw(Level::Info, EventType::Error, "day2 event", json!({}));

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.len() >= 1);
    }

    #[test]
    fn test_disabled_logger_never_opens_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(dir.path(), false);
        logger.write(Level::Info, EventType::Error, "should not appear", json!({"password": "x"}));
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_db_query_bypasses_redaction() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(dir.path(), true);
        logger.write(
            Level::Info,
            EventType::DbQuery,
            "query",
            json!({ "connection": { "password": "plaintext-for-repro" } }),
        );
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        let contents = files
            .iter()
            .map(|e| std::fs::read_to_string(e.as_ref().unwrap().path()).unwrap())
            .collect::<Vec<_>>()
            .join("");
        assert!(contents.contains("plaintext-for-repro"));
    }
}
