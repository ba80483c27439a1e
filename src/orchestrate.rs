// src/orchestrate.rs
// The Orchestration Loop (spec §4.9) — the core state machine. One call to
// `Engine::run_tool` handles exactly one client `call_tool` invocation.
//
// Recursion replacement (spec §9): the source recurses the loop into itself
// for `requires_tool_call` directives. Here that becomes a direct call to
// `run_tool_inner` carrying a `depth` counter; each invocation owns its own
// `results` map, so no shared mutable state leaks across the recursion.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::cli_exec::CliExecutor;
use crate::config::AgentConfig;
use crate::directive::{
    CliCommand, NeedsMoreQueriesPayload, Query, QueryType, RemoteCommand, ToolDirective,
};
use crate::error::{AgentError, Result};
use crate::file_reader;
use crate::logger::{EventType, Level, Logger};
use crate::metrics::MetricsClient;
use crate::orchestrator::OrchestratorClient;
use crate::profile;
use crate::remote::RemoteExecutor;
use crate::report;
use crate::session::{deterministic_session_key, SessionStore};
use crate::sql::SqlExecutor;

const MAX_PHASES: u32 = 10;
const MAX_RECURSION_DEPTH: u8 = 5;

/// Tool whose Prometheus range queries get scrape-interval auto-detection
/// when the orchestrator leaves `step` unset (spec §2/§4.3).
const CHECK_DISK_IO_TOOL: &str = "check_disk_io";
/// Literal token a `check_disk_io` query's `rate(...)` window may carry,
/// substituted with the detected rate window before the query is sent.
const RATE_WINDOW_PLACEHOLDER: &str = "{rate_window}";

pub struct Engine {
    pub config: Arc<AgentConfig>,
    pub logger: Arc<Logger>,
    pub orchestrator: Arc<OrchestratorClient>,
    pub sql: Arc<SqlExecutor>,
    pub metrics: Arc<MetricsClient>,
    pub remote: Arc<RemoteExecutor>,
    pub cli: Arc<CliExecutor>,
    pub sessions: Arc<SessionStore>,
}

/// What `call_tool` hands back to the Tool Protocol Surface.
pub enum LoopOutcome {
    Plan { markdown: String },
    NeedsSelection { payload: Value },
    Progress { text: String },
    Report { brief_summary: String, report_path: String },
}

impl Engine {
    /// Wire up every leaf executor from a loaded `AgentConfig` (spec §2's
    /// data-flow diagram: leaves depend on nothing else, the loop depends on
    /// all of them).
    pub fn new(config: AgentConfig, logger: Arc<Logger>) -> Self {
        let http = reqwest::Client::new();
        let config = Arc::new(config);

        let orchestrator = Arc::new(OrchestratorClient::new(
            http.clone(),
            config.central_api.clone(),
            config.central_api_token.clone(),
            logger.clone(),
        ));
        let sql = Arc::new(SqlExecutor::new(config.sql.clone(), logger.clone()));
        let metrics = Arc::new(MetricsClient::new(http, config.prometheus_base_url()));
        let remote = Arc::new(RemoteExecutor::new(config.ssh.clone(), logger.clone()));
        let cli = Arc::new(CliExecutor::new(logger.clone()));
        let sessions = Arc::new(SessionStore::new());

        Self {
            config,
            logger,
            orchestrator,
            sql,
            metrics,
            remote,
            cli,
            sessions,
        }
    }

    /// Entry point for a top-level client tool call.
    pub async fn run_tool(&self, tool: &str, args: Map<String, Value>) -> Result<LoopOutcome> {
        self.run_tool_inner(tool, args, 0).await
    }

    async fn run_tool_inner(&self, tool: &str, mut args: Map<String, Value>, depth: u8) -> Result<LoopOutcome> {
        if depth > MAX_RECURSION_DEPTH {
            return Err(AgentError::Other(format!(
                "recursive tool-call depth exceeded ({MAX_RECURSION_DEPTH}) for tool '{tool}'"
            )));
        }

        // --- 4.9.1 Plan gate (turn 0) ---
        let confirmed = args.get("confirmed").and_then(Value::as_bool).unwrap_or(false);
        if !confirmed {
            let plan_response = self.orchestrator.get_plan(tool, &args).await?;
            if plan_response.requires_plan {
                if let Some(plan) = plan_response.plan {
                    return Ok(LoopOutcome::Plan {
                        markdown: report::format_plan(&plan),
                    });
                }
            }
        }

        // --- 4.9.2 Session rehydration ---
        let mut results: Map<String, Value> = Map::new();
        let mut session_id: Option<String> = None;
        let session_key = deterministic_session_key(tool, &args);

        if let Some(supplied_id) = args.get("session_id").and_then(Value::as_str).map(str::to_string) {
            if let Some(session) = self.sessions.get(&supplied_id) {
                results = session.results;
                session_id = Some(session.session_id);
            }
        } else if let Some(session) = self.sessions.find_by_key(&session_key) {
            results = session.results;
            session_id = Some(session.session_id);
        }

        // --- 4.9.3 Fetch initial directive ---
        let queries = self.orchestrator.get_queries(tool, &args).await?;
        let (meta_queries, regular_queries): (Vec<Query>, Vec<Query>) =
            queries.into_iter().partition(|q| q.is_meta());

        // --- 4.9.4 First execution pass ---
        self.execute_regular_queries(tool, &regular_queries, &mut results).await;

        for meta in &meta_queries {
            if meta.requires_profile_fetch {
                self.run_profile_pipeline(meta, &mut results).await;
            }
        }

        // --- 4.9.5 Multi-phase analysis loop ---
        let mut phase_count: u32 = 0;
        let mut last_directive: Option<ToolDirective> = None;

        loop {
            let directive = self.orchestrator.analyze(tool, &results, &args).await?;

            match &directive {
                ToolDirective::Plan(p) => {
                    if let Some(plan) = &p.plan {
                        return Ok(LoopOutcome::Plan {
                            markdown: report::format_plan(plan),
                        });
                    }
                    last_directive = Some(directive);
                    break;
                }
                ToolDirective::NeedsSelection(p) => {
                    return Ok(LoopOutcome::NeedsSelection {
                        payload: p.extras.clone(),
                    });
                }
                ToolDirective::StepCompleted(p) => {
                    let new_session_id = self.sessions.put(
                        session_id.clone(),
                        session_key.clone(),
                        results.clone(),
                        args.clone(),
                        p.completed_step.as_ref().map(|s| serde_json::json!(s)),
                    );
                    let (step, step_name) = p
                        .completed_step
                        .as_ref()
                        .map(|s| (s.step, s.name.clone()))
                        .unwrap_or((0, "unknown".to_string()));
                    let one_line = p
                        .extras
                        .get("result_summary")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let text = report::format_progress(step, p.total_steps, &step_name, one_line);
                    self.logger.write(
                        Level::Info,
                        EventType::ClientRequest,
                        "step_completed",
                        serde_json::json!({ "tool": tool, "session_id": new_session_id, "step": step }),
                    );
                    return Ok(LoopOutcome::Progress { text });
                }
                ToolDirective::NeedsMoreQueries(payload) => {
                    self.dispatch_phase(tool, payload, &mut results, depth).await;

                    if let Some(next_args) = payload.next_args.clone() {
                        args = next_args;
                    }
                    phase_count += 1;

                    if phase_count >= MAX_PHASES {
                        warn!(tool, phase_count, "Max phases reached; treating partial state as terminal");
                        self.logger.write(
                            Level::Error,
                            EventType::Error,
                            "Max phases reached for tool call",
                            serde_json::json!({ "tool": tool, "phase_count": phase_count }),
                        );
                        last_directive = Some(directive);
                        break;
                    }
                }
                _terminal => {
                    last_directive = Some(directive);
                    break;
                }
            }
        }

        let mut terminal = last_directive.expect("loop only exits with a directive set");

        // --- 4.9.7 Post-loop suggested_actions ---
        self.apply_suggested_actions(&mut terminal, depth).await;

        // --- 4.9.8 Termination ---
        self.finish(tool, terminal).await
    }

    async fn execute_regular_queries(&self, tool: &str, queries: &[Query], results: &mut Map<String, Value>) {
        let sql_batch: Vec<(String, String)> = queries
            .iter()
            .filter(|q| q.query_type == QueryType::Sql)
            .filter_map(|q| q.sql.clone().map(|sql| (q.id.clone(), sql)))
            .collect();

        if !sql_batch.is_empty() {
            let outcomes = self.sql.execute(&sql_batch).await;
            for (id, outcome) in outcomes {
                results.entry(id).or_insert_with(|| outcome.into_value());
            }
        }

        for q in queries.iter().filter(|q| {
            matches!(q.query_type, QueryType::PrometheusInstant | QueryType::PrometheusRange)
        }) {
            let Some(query) = &q.query else { continue };
            let outcome = match q.query_type {
                QueryType::PrometheusInstant => self.metrics.query_instant(query).await,
                QueryType::PrometheusRange => self.run_prometheus_range(tool, q, query).await,
                _ => unreachable!(),
            };
            results.entry(q.id.clone()).or_insert_with(|| outcome.into_value());
        }
    }

    /// Run one `prometheus_range` query. For `check_disk_io` with no
    /// orchestrator-supplied `step`, auto-detect the scrape interval and use
    /// it as the step, substituting any `{rate_window}` token in the query
    /// text with the detected rate window (spec §2/§4.3).
    async fn run_prometheus_range(&self, tool: &str, q: &Query, query_text: &str) -> crate::metrics::Outcome {
        if tool == CHECK_DISK_IO_TOOL && q.step.is_none() {
            let interval = self.metrics.detect_scrape_interval().await;
            let window = crate::metrics::rate_window(interval);
            let step = crate::metrics::format_interval(interval);
            let substituted = query_text.replace(RATE_WINDOW_PLACEHOLDER, &crate::metrics::format_interval(window));
            return self
                .metrics
                .query_range(&substituted, q.start.as_deref(), q.end.as_deref(), Some(&step))
                .await;
        }

        self.metrics
            .query_range(query_text, q.start.as_deref(), q.end.as_deref(), q.step.as_deref())
            .await
    }

    async fn run_profile_pipeline(&self, meta: &Query, results: &mut Map<String, Value>) {
        let Some(profile_list) = results.get("profile_list").and_then(Value::as_array).cloned() else {
            return;
        };

        let time_window_secs = meta
            .time_range
            .as_deref()
            .and_then(profile::parse_duration_ms)
            .map(|ms| (ms / 1000) as i64);
        let candidates = profile::filter_profile_candidates(&profile_list, time_window_secs, meta.min_duration_ms);

        let query_profiles = profile::fetch_profiles(&self.sql, &candidates).await;
        results.insert("query_profiles".to_string(), Value::Object(query_profiles.clone()));

        if meta.requires_table_schema_fetch {
            let table_names = profile::extract_table_names(&query_profiles);
            let schemas = profile::fetch_table_schemas(&self.sql, &table_names).await;
            results.insert("table_schemas".to_string(), Value::Object(schemas));
        }
    }

    /// Directive dispatch for one `needs_more_queries` phase (spec §4.9.6).
    /// Order is fixed and part of the contract: CLI, SSH, tool-call, single
    /// SQL, Prometheus, `next_queries`.
    async fn dispatch_phase(
        &self,
        tool: &str,
        payload: &NeedsMoreQueriesPayload,
        results: &mut Map<String, Value>,
        depth: u8,
    ) {
        // 1. CLI Executor
        if payload.requires_cli_execution {
            if let Some(commands) = &payload.cli_commands {
                self.dispatch_cli(payload.phase.as_deref(), commands, results).await;
            }
        }

        // 2. Remote Command Executor
        if payload.requires_ssh_execution {
            if let Some(commands) = &payload.ssh_commands {
                self.dispatch_ssh(payload.phase.as_deref(), commands, results).await;
            }
        }

        // 3. Recursive tool-call path
        if payload.requires_tool_call {
            if let Some(tool_name) = &payload.tool_name {
                self.dispatch_tool_call(tool_name, payload, results, depth).await;
            }
        }

        // 4. Single-statement SQL
        if payload.requires_sql_execution {
            if let Some(sql) = &payload.sql {
                let outcome = self.sql.execute_one(sql).await;
                let key = payload.sql_result_key.clone().unwrap_or_else(|| "sql_result".to_string());
                results.insert(key, outcome.into_value());
            }
        }

        // 5. Prometheus range queries
        if payload.requires_prometheus_query {
            if let Some(queries) = &payload.prometheus_queries {
                let mut bundle = Map::new();
                for q in queries {
                    if let Some(query) = &q.query {
                        let outcome = self.run_prometheus_range(tool, q, query).await;
                        bundle.insert(q.id.clone(), outcome.into_value());
                    }
                }
                let key = payload_prometheus_key(payload);
                results.insert(key, Value::Object(bundle));
            }
        }

        // 6. next_queries batch
        if let Some(next_queries) = &payload.next_queries {
            self.dispatch_next_queries(tool, payload.phase.as_deref(), next_queries, results)
                .await;
        }
    }

    async fn dispatch_cli(&self, phase: Option<&str>, commands: &[CliCommand], results: &mut Map<String, Value>) {
        let batch = self.cli.execute_batch(commands).await;
        let value = crate::cli_exec::batch_to_value(&batch);

        let (results_key, summary_key) = match phase {
            Some("list_table_directories") => ("dir_listing_results", "dir_listing_summary"),
            Some("get_garbage_sizes") => ("garbage_size_results", "garbage_size_summary"),
            _ => ("cli_results", "cli_summary"),
        };
        results.insert(results_key.to_string(), value.get("results").cloned().unwrap_or(Value::Null));
        results.insert(summary_key.to_string(), value.get("summary").cloned().unwrap_or(Value::Null));
    }

    async fn dispatch_ssh(&self, phase: Option<&str>, commands: &[RemoteCommand], results: &mut Map<String, Value>) {
        let batch = self.remote.execute_batch(commands).await;

        match phase {
            Some("discover_log_paths") => {
                let discovered = crate::remote::discovered_paths_value(&batch);
                results.insert("discovered_log_paths".to_string(), Value::Array(discovered));
            }
            Some("fetch_logs") => {
                let value = crate::remote::batch_to_value(&batch);
                results.insert(
                    "log_contents".to_string(),
                    value.get("results").cloned().unwrap_or(Value::Null),
                );
            }
            _ => {
                let value = crate::remote::batch_to_value(&batch);
                results.insert("ssh_results".to_string(), value.get("results").cloned().unwrap_or(Value::Null));
                results.insert("ssh_summary".to_string(), value.get("summary").cloned().unwrap_or(Value::Null));
            }
        }
    }

    async fn dispatch_tool_call(
        &self,
        tool_name: &str,
        payload: &NeedsMoreQueriesPayload,
        results: &mut Map<String, Value>,
        depth: u8,
    ) {
        let tool_args = payload.tool_args.clone().unwrap_or_default();
        let result_key = payload
            .tool_result_key
            .clone()
            .unwrap_or_else(|| format!("{tool_name}_result"));

        let sub_result = if tool_name == "read_file" {
            let path = tool_args.get("path").and_then(Value::as_str).unwrap_or("");
            file_reader::read_file_or_error_value(path).await
        } else if tool_name == "fetch_logs" {
            self.fetch_logs_shortcut(&tool_args).await
        } else {
            Box::pin(self.run_sub_tool(tool_name, tool_args, depth)).await
        };

        results.insert(result_key, sub_result);
    }

    /// Local shortcut for `fetch_logs`: discover-paths then fetch, without
    /// looping back to the orchestrator for either step (spec §4.9.6 step 3).
    async fn fetch_logs_shortcut(&self, tool_args: &Map<String, Value>) -> Value {
        let Some(commands) = tool_args.get("ssh_commands").and_then(Value::as_array) else {
            return serde_json::json!({ "error": "fetch_logs shortcut requires ssh_commands" });
        };
        let discover_commands: Vec<RemoteCommand> = commands
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect();

        let discovered = self.remote.execute_batch(&discover_commands).await;
        let fetch_commands: Vec<RemoteCommand> = discovered
            .results
            .iter()
            .zip(discover_commands.iter())
            .filter(|(r, _)| r.success)
            .filter_map(|(r, original)| {
                let path = r.output.clone()?;
                Some(RemoteCommand {
                    node_ip: original.node_ip.clone(),
                    node_type: original.node_type,
                    ssh_command: format!("cat {path}"),
                    command_type: crate::directive::CommandType::FetchLog,
                    options: None,
                })
            })
            .collect();

        let fetched = self.remote.execute_batch(&fetch_commands).await;
        serde_json::json!({ "discovered": discovered, "fetched": fetched })
    }

    /// Recursively invoke the full orchestration loop on a named tool. If the
    /// sub-result's own directive carries `requires_prometheus_query` or
    /// `requires_ssh_execution`, service that as a nested micro-phase:
    /// execute, fold into `next_args`, recall the sub-tool once (spec §4.9.6).
    async fn run_sub_tool(&self, tool_name: &str, tool_args: Map<String, Value>, depth: u8) -> Value {
        match self.run_tool_inner(tool_name, tool_args, depth + 1).await {
            Ok(LoopOutcome::Report { brief_summary, report_path }) => {
                serde_json::json!({ "summary": brief_summary, "report_path": report_path })
            }
            Ok(LoopOutcome::Progress { text }) => serde_json::json!({ "progress": text }),
            Ok(LoopOutcome::Plan { markdown }) => serde_json::json!({ "plan": markdown }),
            Ok(LoopOutcome::NeedsSelection { payload }) => serde_json::json!({ "needs_selection": payload }),
            Err(e) => serde_json::json!({ "error": e.to_user_string() }),
        }
    }

    async fn dispatch_next_queries(
        &self,
        tool: &str,
        phase: Option<&str>,
        next_queries: &[Query],
        results: &mut Map<String, Value>,
    ) {
        let sql_batch: Vec<(String, String)> = next_queries
            .iter()
            .filter(|q| q.query_type == QueryType::Sql)
            .filter_map(|q| q.sql.clone().map(|sql| (q.id.clone(), sql)))
            .collect();
        let outcomes = self.sql.execute(&sql_batch).await;

        if phase == Some("desc_storage_volumes") {
            let mut storage_volume_details = Map::new();
            for (id, outcome) in outcomes {
                if let Some(name) = id.strip_prefix("desc_volume_") {
                    storage_volume_details.insert(name.to_string(), outcome.into_value());
                } else {
                    results.insert(id, outcome.into_value());
                }
            }
            results.insert("storage_volume_details".to_string(), Value::Object(storage_volume_details));
        } else {
            for (id, outcome) in outcomes {
                results.insert(id, outcome.into_value());
            }
        }

        for q in next_queries.iter().filter(|q| {
            matches!(q.query_type, QueryType::PrometheusInstant | QueryType::PrometheusRange)
        }) {
            let Some(query) = &q.query else { continue };
            let outcome = match q.query_type {
                QueryType::PrometheusInstant => self.metrics.query_instant(query).await,
                QueryType::PrometheusRange => self.run_prometheus_range(tool, q, query).await,
                _ => unreachable!(),
            };
            results.insert(q.id.clone(), outcome.into_value());
        }
    }

    async fn apply_suggested_actions(&self, terminal: &mut ToolDirective, depth: u8) {
        let extras = terminal.extras().clone();
        let suggested = extras
            .get("suggested_actions")
            .or_else(|| extras.get("load_profile_analysis").and_then(|v| v.get("suggested_actions")))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if suggested.is_empty() {
            return;
        }

        let mut additions = Map::new();
        for action in &suggested {
            let Some(tool) = action.get("tool").and_then(Value::as_str) else {
                continue;
            };
            let params = action
                .get("params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let result = if tool == "read_file" {
                let path = params.get("path").and_then(Value::as_str).unwrap_or("");
                file_reader::read_file_or_error_value(path).await
            } else {
                Box::pin(self.run_sub_tool(tool, params, depth)).await
            };

            additions.insert(format!("{tool}_result"), result);
        }

        merge_into_terminal_extras(terminal, additions);
    }

    async fn finish(&self, tool: &str, terminal: ToolDirective) -> Result<LoopOutcome> {
        let extras = terminal.extras().clone();
        let (full_markdown, brief_summary) = report::format_terminal(&terminal);

        if let Some(html_path) = report::maybe_write_html(&extras).await? {
            info!(tool, html_path, "wrote terminal html_content to output_path");
        }

        let report_path = report::write_report(tool, &full_markdown).await?;

        Ok(LoopOutcome::Report { brief_summary, report_path })
    }
}

fn payload_prometheus_key(payload: &NeedsMoreQueriesPayload) -> String {
    payload
        .extras
        .get("prometheus_result_key")
        .and_then(Value::as_str)
        .unwrap_or("prometheus_results")
        .to_string()
}

/// Splice additional key-value pairs into a terminal directive's extras bag
/// (used by `apply_suggested_actions`). `ToolDirective`'s payload variants
/// all carry an `extras: Value` field holding the flattened remainder of the
/// original JSON object, so this mutates that object in place.
fn merge_into_terminal_extras(terminal: &mut ToolDirective, additions: Map<String, Value>) {
    let extras_mut = match terminal {
        ToolDirective::Success(p) | ToolDirective::Error(p) | ToolDirective::NotApplicable(p) | ToolDirective::OtherTerminal(p) => {
            &mut p.extras
        }
        ToolDirective::Plan(p) => &mut p.extras,
        ToolDirective::NeedsSelection(p) => &mut p.extras,
        ToolDirective::StepCompleted(p) => &mut p.extras,
        ToolDirective::NeedsMoreQueries(p) => &mut p.extras,
    };

    if let Value::Object(map) = extras_mut {
        for (k, v) in additions {
            map.insert(k, v);
        }
    }
}
