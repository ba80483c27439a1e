// src/profile.rs
// Profile enrichment ("meta query") pipeline: system-query filtering,
// time-window filtering, min-duration filtering, profile fetch, and
// optional table-schema fetch (spec §4.10).

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};

use crate::sql::{Outcome, SqlExecutor};

const DEFAULT_TIME_WINDOW_SECS: i64 = 3600;
const DEFAULT_MIN_DURATION_MS: u64 = 100;

static SYSTEM_QUERY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)^\s*SHOW\b").unwrap(),
        Regex::new(r"(?i)^\s*SET\b").unwrap(),
        Regex::new(r"(?i)^\s*USE\b").unwrap(),
        Regex::new(r"(?i)^\s*SELECT\s+last_query_id\s*\(").unwrap(),
        Regex::new(r"(?i)^\s*SELECT\s+get_query_profile\s*\(").unwrap(),
        Regex::new(r"(?i)^\s*SELECT\s+@@").unwrap(),
        Regex::new(r"(?i)information_schema\.").unwrap(),
    ]
});

static SELECT_WITHOUT_FROM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\s*SELECT\b").unwrap());
static HAS_FROM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bFROM\b").unwrap());

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)?)(ms|s|m)$").unwrap());

static TABLE_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*-\s*Table:\s*([A-Za-z0-9_]+\.[A-Za-z0-9_]+)").unwrap());
static FROM_JOIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:FROM|JOIN)\s+([A-Za-z0-9_]+\.[A-Za-z0-9_]+)").unwrap());

/// Is this row (raw `Statement` text) a system query that should be
/// excluded from profile enrichment (spec §4.10)?
pub fn is_system_query(statement: &str) -> bool {
    if SYSTEM_QUERY_PATTERNS.iter().any(|re| re.is_match(statement)) {
        return true;
    }
    if SELECT_WITHOUT_FROM_RE.is_match(statement) && !HAS_FROM_RE.is_match(statement) {
        return true;
    }
    false
}

/// Parse a duration string like `"1.2s"`, `"340ms"`, `"2m"` into milliseconds.
pub fn parse_duration_ms(s: &str) -> Option<u64> {
    let caps = DURATION_RE.captures(s.trim())?;
    let amount: f64 = caps[1].parse().ok()?;
    let ms = match &caps[2] {
        "ms" => amount,
        "s" => amount * 1000.0,
        "m" => amount * 60_000.0,
        _ => return None,
    };
    Some(ms.round() as u64)
}

fn row_field<'a>(row: &'a Value, key: &str) -> Option<&'a str> {
    row.get(key).and_then(Value::as_str)
}

/// Filter `profile_list` rows down to those eligible for profile enrichment.
pub fn filter_profile_candidates(
    profile_list: &[Value],
    time_window_secs: Option<i64>,
    min_duration_ms: Option<u64>,
) -> Vec<Value> {
    let window = time_window_secs.unwrap_or(DEFAULT_TIME_WINDOW_SECS);
    let min_duration = min_duration_ms.unwrap_or(DEFAULT_MIN_DURATION_MS);
    let now = Utc::now();

    profile_list
        .iter()
        .filter(|row| {
            let statement = row_field(row, "Statement").unwrap_or("");
            if is_system_query(statement) {
                return false;
            }
            if let Some(start_time) = row_field(row, "StartTime") {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(start_time) {
                    let age = now.signed_duration_since(parsed.with_timezone(&Utc));
                    if age.num_seconds() > window {
                        return false;
                    }
                }
            }
            if let Some(time_str) = row_field(row, "Time") {
                match parse_duration_ms(time_str) {
                    Some(ms) if ms < min_duration => return false,
                    _ => {}
                }
            }
            true
        })
        .cloned()
        .collect()
}

/// Run `SELECT get_query_profile('<id>')` for each candidate and build
/// `results.query_profiles`.
pub async fn fetch_profiles(sql: &SqlExecutor, candidates: &[Value]) -> Map<String, Value> {
    let mut query_profiles = Map::new();

    for row in candidates {
        let Some(query_id) = row_field(row, "QueryId") else {
            continue;
        };
        let statement = format!("SELECT get_query_profile('{}')", escape_sql_literal(query_id));
        let outcome = sql.execute_one(&statement).await;

        let profile_text = match &outcome {
            Outcome::Rows(rows) => rows
                .first()
                .and_then(|r| r.as_object())
                .and_then(|m| m.values().next())
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default(),
            Outcome::Error { .. } => String::new(),
        };

        query_profiles.insert(
            query_id.to_string(),
            serde_json::json!({
                "profile": profile_text,
                "startTime": row_field(row, "StartTime"),
                "duration": row_field(row, "Time"),
                "state": row_field(row, "State"),
                "statement": row_field(row, "Statement"),
            }),
        );
    }

    query_profiles
}

fn escape_sql_literal(s: &str) -> String {
    s.replace('\'', "''")
}

/// Extract `db.table` names referenced by a set of fetched profiles: both
/// the profile text's `- Table: db.table` comment lines, and `FROM`/`JOIN`
/// clauses in the embedded SQL statement (spec §4.10).
pub fn extract_table_names(query_profiles: &Map<String, Value>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tables = Vec::new();

    let mut consider = |name: &str| {
        if name.split('.').count() == 2 && seen.insert(name.to_string()) {
            tables.push(name.to_string());
        }
    };

    for entry in query_profiles.values() {
        if let Some(profile) = entry.get("profile").and_then(Value::as_str) {
            for caps in TABLE_COMMENT_RE.captures_iter(profile) {
                consider(&caps[1]);
            }
        }
        if let Some(statement) = entry.get("statement").and_then(Value::as_str) {
            for caps in FROM_JOIN_RE.captures_iter(statement) {
                consider(&caps[1]);
            }
        }
    }

    tables
}

/// Run `SHOW CREATE TABLE <name>` for each extracted table name and detect
/// `data_cache.enable` plus VIEW-vs-TABLE shape from the response.
pub async fn fetch_table_schemas(sql: &SqlExecutor, table_names: &[String]) -> Map<String, Value> {
    let mut schemas = Map::new();

    for table in table_names {
        let statement = format!("SHOW CREATE TABLE {table}");
        let outcome = sql.execute_one(&statement).await;

        let entry = match outcome {
            Outcome::Rows(rows) => rows
                .first()
                .map(|row| describe_schema_row(row))
                .unwrap_or_else(|| serde_json::json!({ "error": "no rows returned" })),
            Outcome::Error { error, .. } => serde_json::json!({ "error": error }),
        };

        schemas.insert(table.clone(), entry);
    }

    schemas
}

fn describe_schema_row(row: &Value) -> Value {
    let obj = row.as_object();
    let is_view = obj
        .map(|m| m.keys().any(|k| k.eq_ignore_ascii_case("View")))
        .unwrap_or(false);

    let ddl = obj
        .and_then(|m| {
            m.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("Create Table") || k.eq_ignore_ascii_case("Create View"))
        })
        .and_then(|(_, v)| v.as_str())
        .unwrap_or("");

    let data_cache_enabled = if ddl.contains("\"data_cache.enable\" = \"true\"") {
        Some(true)
    } else if ddl.contains("\"data_cache.enable\" = \"false\"") {
        Some(false)
    } else {
        None
    };

    serde_json::json!({
        "ddl": ddl,
        "kind": if is_view { "VIEW" } else { "TABLE" },
        "data_cache_enabled": data_cache_enabled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_system_query_patterns_excluded() {
        assert!(is_system_query("SHOW TABLES"));
        assert!(is_system_query("SET enable_profile = true"));
        assert!(is_system_query("USE mydb"));
        assert!(is_system_query("SELECT last_query_id()"));
        assert!(is_system_query("SELECT get_query_profile('abc')"));
        assert!(is_system_query("SELECT @@version_comment"));
        assert!(is_system_query("SELECT * FROM information_schema.tables"));
        assert!(is_system_query("SELECT 1"));
    }

    #[test]
    fn test_non_system_select_with_from_is_retained() {
        assert!(!is_system_query("SELECT a, b FROM orders WHERE x = 1"));
    }

    #[test]
    fn test_parse_duration_variants() {
        assert_eq!(parse_duration_ms("340ms"), Some(340));
        assert_eq!(parse_duration_ms("1.2s"), Some(1200));
        assert_eq!(parse_duration_ms("2m"), Some(120_000));
    }

    #[test]
    fn test_filter_excludes_short_duration() {
        let rows = vec![
            json!({ "QueryId": "a", "Statement": "SELECT x FROM t", "Time": "50ms" }),
            json!({ "QueryId": "b", "Statement": "SELECT x FROM t", "Time": "500ms" }),
        ];
        let filtered = filter_profile_candidates(&rows, Some(3600), Some(100));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["QueryId"], "b");
    }

    #[test]
    fn test_extract_table_names_whitelists_compound_form() {
        let mut profiles = Map::new();
        profiles.insert(
            "q1".into(),
            json!({
                "profile": "- Table: db1.orders\nsome other line",
                "statement": "SELECT * FROM db2.customers JOIN db1.orders ON x = y",
            }),
        );
        let tables = extract_table_names(&profiles);
        assert!(tables.contains(&"db1.orders".to_string()));
        assert!(tables.contains(&"db2.customers".to_string()));
        assert_eq!(tables.len(), 2);
    }

    #[test]
    fn test_describe_schema_row_detects_data_cache() {
        let row = json!({ "Table": "t", "Create Table": "CREATE TABLE t (...) PROPERTIES(\"data_cache.enable\" = \"true\")" });
        let described = describe_schema_row(&row);
        assert_eq!(described["data_cache_enabled"], true);
        assert_eq!(described["kind"], "TABLE");
    }

    #[test]
    fn test_describe_schema_row_detects_view() {
        let row = json!({ "View": "v", "Create View": "CREATE VIEW v AS SELECT 1" });
        let described = describe_schema_row(&row);
        assert_eq!(described["kind"], "VIEW");
    }
}
