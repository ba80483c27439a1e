// src/metrics.rs
// Metrics Client: instant/range queries against the local Prometheus-
// compatible monitoring system, relative/absolute time parsing, and
// scrape-interval auto-detection (spec §4.3).

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use std::sync::LazyLock;

use crate::error::{AgentError, Result};

#[derive(Debug, Clone)]
pub enum Outcome {
    Ok(Value),
    Error { error: String, query_prefix: String },
}

impl Outcome {
    pub fn into_value(self) -> Value {
        match self {
            Outcome::Ok(v) => v,
            Outcome::Error { error, query_prefix } => {
                serde_json::json!({ "error": error, "query_prefix": query_prefix })
            }
        }
    }
}

pub struct MetricsClient {
    client: Client,
    base_url: String,
}

static RELATIVE_TIME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)([smhd])$").unwrap());
static SCRAPE_INTERVAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)(ms|[smh])$").unwrap());

impl MetricsClient {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    /// `GET /api/v1/query?query=…`
    pub async fn query_instant(&self, query: &str) -> Outcome {
        let url = format!("{}/api/v1/query", self.base_url);
        match self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .and_then_async_json()
            .await
        {
            Ok(body) => Outcome::Ok(body),
            Err(e) => Outcome::Error {
                error: e.to_string(),
                query_prefix: query_prefix(query),
            },
        }
    }

    /// `GET /api/v1/query_range?query=…&start=…&end=…&step=…`. Time bounds
    /// accept either relative offsets (`"1h"`) or absolute ISO-8601
    /// timestamps; `start` defaults to now-1h, `end` to now, `step` to `"1m"`.
    pub async fn query_range(
        &self,
        query: &str,
        start: Option<&str>,
        end: Option<&str>,
        step: Option<&str>,
    ) -> Outcome {
        let now = Utc::now();
        let start_time = match start.map(|s| resolve_time_bound(s, now)) {
            Some(Ok(t)) => t,
            Some(Err(e)) => {
                return Outcome::Error {
                    error: e,
                    query_prefix: query_prefix(query),
                }
            }
            None => now - chrono::Duration::hours(1),
        };
        let end_time = match end.map(|s| resolve_time_bound(s, now)) {
            Some(Ok(t)) => t,
            Some(Err(e)) => {
                return Outcome::Error {
                    error: e,
                    query_prefix: query_prefix(query),
                }
            }
            None => now,
        };
        let step = step.unwrap_or("1m");

        let url = format!("{}/api/v1/query_range", self.base_url);
        let params = [
            ("query", query.to_string()),
            ("start", start_time.timestamp().to_string()),
            ("end", end_time.timestamp().to_string()),
            ("step", step.to_string()),
        ];

        match self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .and_then_async_json()
            .await
        {
            Ok(body) => Outcome::Ok(body),
            Err(e) => Outcome::Error {
                error: e.to_string(),
                query_prefix: query_prefix(query),
            },
        }
    }

    /// `GET /api/v1/targets` — locate an active target whose job name
    /// contains `node`, parse its `scrapeInterval`; fall back to 15s on
    /// any failure (spec §4.3).
    pub async fn detect_scrape_interval(&self) -> std::time::Duration {
        let fallback = std::time::Duration::from_secs(15);
        let url = format!("{}/api/v1/targets", self.base_url);

        let body = match self.client.get(&url).send().await.and_then_async_json().await {
            Ok(b) => b,
            Err(_) => return fallback,
        };

        let active = body
            .get("data")
            .and_then(|d| d.get("activeTargets"))
            .and_then(Value::as_array);

        let Some(active) = active else {
            return fallback;
        };

        for target in active {
            let job = target
                .get("labels")
                .and_then(|l| l.get("job"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if !job.contains("node") {
                continue;
            }
            if let Some(interval) = target.get("scrapeInterval").and_then(Value::as_str) {
                if let Some(parsed) = parse_scrape_interval(interval) {
                    return parsed;
                }
            }
        }
        fallback
    }
}

/// Resolve a relative (`"1h"`) or absolute ISO-8601 time bound.
fn resolve_time_bound(s: &str, now: DateTime<Utc>) -> std::result::Result<DateTime<Utc>, String> {
    if let Some(caps) = RELATIVE_TIME_RE.captures(s) {
        let amount: i64 = caps[1].parse().map_err(|_| format!("invalid relative time: {s}"))?;
        let unit = &caps[2];
        let delta = match unit {
            "s" => chrono::Duration::seconds(amount),
            "m" => chrono::Duration::minutes(amount),
            "h" => chrono::Duration::hours(amount),
            "d" => chrono::Duration::days(amount),
            _ => return Err(format!("unrecognized time unit in: {s}")),
        };
        return Ok(now - delta);
    }

    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("unparseable time bound: {s}"))
}

fn parse_scrape_interval(s: &str) -> Option<std::time::Duration> {
    let caps = SCRAPE_INTERVAL_RE.captures(s)?;
    let amount: u64 = caps[1].parse().ok()?;
    let unit = &caps[2];
    Some(match unit {
        "ms" => std::time::Duration::from_millis(amount),
        "s" => std::time::Duration::from_secs(amount),
        "m" => std::time::Duration::from_secs(amount * 60),
        "h" => std::time::Duration::from_secs(amount * 3600),
        _ => return None,
    })
}

/// Used by the disk-IO scenario (spec §2): query step is set to one scrape
/// interval, and the `rate()` window to three scrape intervals.
pub fn rate_window(scrape_interval: std::time::Duration) -> std::time::Duration {
    scrape_interval * 3
}

/// Render a `Duration` back into the `step`/`query_range` duration syntax
/// `parse_scrape_interval` accepts, for reuse as a literal in an outgoing
/// request (`"15s"`, `"500ms"`).
pub fn format_interval(d: std::time::Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 == 0 {
        format!("{}s", (ms / 1000).max(1))
    } else {
        format!("{ms}ms")
    }
}

fn query_prefix(q: &str) -> String {
    q.chars().take(120).collect()
}

/// Small trait to let `.and_then_async_json()` flow a `reqwest::Result`
/// straight into a JSON body check without an intermediate `match`.
trait ResponseJson {
    async fn and_then_async_json(self) -> Result<Value>;
}

impl ResponseJson for std::result::Result<reqwest::Response, reqwest::Error> {
    async fn and_then_async_json(self) -> Result<Value> {
        let response = self?;
        if !response.status().is_success() {
            return Err(AgentError::Other(format!("HTTP {}", response.status())));
        }
        Ok(response.json::<Value>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_time_parses_hours() {
        let now = Utc::now();
        let resolved = resolve_time_bound("2h", now).unwrap();
        let expected = now - chrono::Duration::hours(2);
        assert!((resolved - expected).num_seconds().abs() < 2);
    }

    #[test]
    fn test_absolute_iso8601_parses() {
        let now = Utc::now();
        let resolved = resolve_time_bound("2026-01-01T00:00:00Z", now).unwrap();
        assert_eq!(resolved.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_garbage_time_bound_errors() {
        let now = Utc::now();
        assert!(resolve_time_bound("not-a-time", now).is_err());
    }

    #[test]
    fn test_scrape_interval_units() {
        assert_eq!(parse_scrape_interval("15s"), Some(std::time::Duration::from_secs(15)));
        assert_eq!(parse_scrape_interval("1m"), Some(std::time::Duration::from_secs(60)));
        assert_eq!(parse_scrape_interval("500ms"), Some(std::time::Duration::from_millis(500)));
        assert_eq!(parse_scrape_interval("garbage"), None);
    }

    #[test]
    fn test_rate_window_is_triple_scrape_interval() {
        let interval = std::time::Duration::from_secs(15);
        assert_eq!(rate_window(interval), std::time::Duration::from_secs(45));
    }

    #[test]
    fn test_format_interval_whole_seconds() {
        assert_eq!(format_interval(std::time::Duration::from_secs(15)), "15s");
        assert_eq!(format_interval(std::time::Duration::from_secs(45)), "45s");
    }

    #[test]
    fn test_format_interval_sub_second() {
        assert_eq!(format_interval(std::time::Duration::from_millis(500)), "500ms");
    }
}
