// src/sql.rs
// SQL Executor (spec §4.2): one fresh connection per `execute()` call,
// profile recording disabled first, statements run sequentially, each
// statement's outcome folded into the results map independently.

use std::sync::Arc;

use serde_json::{Map, Value};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, Connection, Row, TypeInfo};
use tracing::warn;

use crate::config::SqlConfig;
use crate::logger::{EventType, Level, Logger};

/// Outcome of one labelled statement: either its rows, or an error record
/// (spec §7: "Recorded as `results[id] = {error, sql-prefix}`; loop continues").
#[derive(Debug, Clone)]
pub enum Outcome {
    Rows(Vec<Value>),
    Error { error: String, sql_prefix: String },
}

impl Outcome {
    pub fn into_value(self) -> Value {
        match self {
            Outcome::Rows(rows) => Value::Array(rows),
            Outcome::Error { error, sql_prefix } => {
                serde_json::json!({ "error": error, "sql_prefix": sql_prefix })
            }
        }
    }
}

pub struct SqlExecutor {
    config: SqlConfig,
    logger: Arc<Logger>,
}

impl SqlExecutor {
    pub fn new(config: SqlConfig, logger: Arc<Logger>) -> Self {
        Self { config, logger }
    }

    /// Run a batch of labelled `(id, sql)` statements. Opens one connection,
    /// disables profile recording, runs each statement, and always closes
    /// the connection — including on error paths.
    pub async fn execute(&self, statements: &[(String, String)]) -> Vec<(String, Outcome)> {
        let mut results = Vec::with_capacity(statements.len());

        let options = MySqlConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.user)
            .password(&self.config.password);

        let conn = match MySqlConnection::connect_with(&options).await {
            Ok(c) => c,
            Err(e) => {
                for (id, sql) in statements {
                    self.log_error(id, sql, &e.to_string());
                    results.push((
                        id.clone(),
                        Outcome::Error {
                            error: format!("connection failed: {e}"),
                            sql_prefix: sql_prefix(sql),
                        },
                    ));
                }
                return results;
            }
        };

        let mut conn = conn;
        if let Err(e) = disable_profile_recording(&mut conn).await {
            warn!(error = %e, "failed to disable profile recording on session; continuing anyway");
        }

        for (id, sql) in statements {
            self.logger.write(
                Level::Info,
                EventType::DbQuery,
                "executing statement",
                serde_json::json!({ "id": id, "sql": sql, "connection": { "host": self.config.host, "port": self.config.port, "user": self.config.user, "password": self.config.password } }),
            );

            let outcome = match sqlx::query(sql).fetch_all(&mut conn).await {
                Ok(rows) => {
                    let values: Vec<Value> = rows.iter().map(row_to_json).collect();
                    self.logger.write(
                        Level::Info,
                        EventType::DbResult,
                        "statement succeeded",
                        serde_json::json!({ "id": id, "row_count": values.len() }),
                    );
                    Outcome::Rows(values)
                }
                Err(e) => {
                    self.log_error(id, sql, &e.to_string());
                    Outcome::Error {
                        error: e.to_string(),
                        sql_prefix: sql_prefix(sql),
                    }
                }
            };
            results.push((id.clone(), outcome));
        }

        let _ = conn.close().await;

        results
    }

    /// Single-statement variant used by the orchestration loop's
    /// `requires_sql_execution` dispatch (spec §4.9.6 step 4).
    pub async fn execute_one(&self, sql: &str) -> Outcome {
        let results = self.execute(&[("_single".to_string(), sql.to_string())]).await;
        results.into_iter().next().map(|(_, o)| o).unwrap_or(Outcome::Error {
            error: "no result produced".into(),
            sql_prefix: sql_prefix(sql),
        })
    }

    fn log_error(&self, id: &str, sql: &str, error: &str) {
        self.logger.write(
            Level::Error,
            EventType::DbResult,
            "statement failed",
            serde_json::json!({ "id": id, "sql_prefix": sql_prefix(sql), "error": error }),
        );
    }
}

async fn disable_profile_recording(conn: &mut MySqlConnection) -> Result<(), sqlx::Error> {
    sqlx::query("SET enable_profile = false")
        .execute(conn)
        .await
        .map(|_| ())
}

fn sql_prefix(sql: &str) -> String {
    sql.chars().take(120).collect()
}

/// Convert one row into a JSON object, attempting string/int/float/bool
/// decode in that order per column — StarRocks exposes most scalar types
/// through one of these MySQL wire representations.
fn row_to_json(row: &MySqlRow) -> Value {
    let mut map = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let value = decode_column(row, i, column.type_info().name());
        map.insert(name, value);
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_prefix_truncates_to_120_chars() {
        let long = "a".repeat(500);
        assert_eq!(sql_prefix(&long).chars().count(), 120);
    }

    #[test]
    fn sql_prefix_passes_short_statements_through() {
        assert_eq!(sql_prefix("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn outcome_rows_into_value_is_json_array() {
        let outcome = Outcome::Rows(vec![serde_json::json!({"a": 1})]);
        assert_eq!(outcome.into_value(), serde_json::json!([{"a": 1}]));
    }

    #[test]
    fn outcome_error_into_value_carries_error_and_prefix() {
        let outcome = Outcome::Error {
            error: "syntax error".to_string(),
            sql_prefix: "SELECT * FROM".to_string(),
        };
        let value = outcome.into_value();
        assert_eq!(value["error"], "syntax error");
        assert_eq!(value["sql_prefix"], "SELECT * FROM");
    }
}

fn decode_column(row: &MySqlRow, index: usize, type_name: &str) -> Value {
    if let Ok(None) = row.try_get::<Option<String>, _>(index) {
        return Value::Null;
    }

    let upper = type_name.to_uppercase();
    if upper.contains("INT") || upper.contains("BIGINT") {
        if let Ok(v) = row.try_get::<i64, _>(index) {
            return Value::from(v);
        }
    }
    if upper.contains("DOUBLE") || upper.contains("FLOAT") || upper.contains("DECIMAL") {
        if let Ok(v) = row.try_get::<f64, _>(index) {
            return Value::from(v);
        }
    }
    if upper.contains("BOOL") || upper.contains("TINYINT(1)") {
        if let Ok(v) = row.try_get::<bool, _>(index) {
            return Value::Bool(v);
        }
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Value::String(v);
    }
    Value::Null
}
