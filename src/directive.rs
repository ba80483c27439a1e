// src/directive.rs
// Tagged-union replacement for the orchestrator's heterogeneous directive
// envelope (spec §3, §9 "Dynamic typing of directives").

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One instruction returned by `/api/analyze/<tool>`.
///
/// The orchestrator's wire format is a single flat JSON object carrying only
/// the fields legal for its `status`. Rather than modeling that as one
/// monster struct, each status gets its own variant; unrecognized fields land
/// in `extras` so a new orchestrator field never breaks deserialization.
///
/// `status` is not a serde-derivable internal tag here: an unrecognized
/// status must still deserialize (as terminal, per §4.9.5), which plain
/// internal tagging can't express alongside a catch-all variant. Dispatch
/// is done by hand in `TryFrom<Value>` instead.
#[derive(Debug, Clone)]
pub enum ToolDirective {
    Success(TerminalPayload),
    Error(TerminalPayload),
    NotApplicable(TerminalPayload),
    Plan(PlanPayload),
    NeedsSelection(SelectionPayload),
    StepCompleted(StepCompletedPayload),
    NeedsMoreQueries(NeedsMoreQueriesPayload),
    /// Any status not enumerated above is, per spec §4.9.5, terminal.
    OtherTerminal(TerminalPayload),
}

impl TryFrom<Value> for ToolDirective {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        match status.as_str() {
            "success" => Ok(ToolDirective::Success(serde_json::from_value(value)?)),
            "error" => Ok(ToolDirective::Error(serde_json::from_value(value)?)),
            "not_applicable" => Ok(ToolDirective::NotApplicable(serde_json::from_value(value)?)),
            "plan" => Ok(ToolDirective::Plan(serde_json::from_value(value)?)),
            "needs_selection" => Ok(ToolDirective::NeedsSelection(serde_json::from_value(value)?)),
            "step_completed" => Ok(ToolDirective::StepCompleted(serde_json::from_value(value)?)),
            "needs_more_queries" => Ok(ToolDirective::NeedsMoreQueries(serde_json::from_value(value)?)),
            _ => Ok(ToolDirective::OtherTerminal(serde_json::from_value(value)?)),
        }
    }
}

impl ToolDirective {
    /// Terminal statuses exit the loop (§4.9.5): `success`, `error`,
    /// `not_applicable`, and anything unrecognized.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ToolDirective::Success(_)
                | ToolDirective::Error(_)
                | ToolDirective::NotApplicable(_)
                | ToolDirective::OtherTerminal(_)
        )
    }

    pub fn next_args(&self) -> Option<&Map<String, Value>> {
        match self {
            ToolDirective::NeedsMoreQueries(p) => p.next_args.as_ref(),
            _ => None,
        }
    }

    /// The raw JSON object this directive was parsed from, retained so the
    /// terminal formatter can inspect shapes beyond what we've modeled
    /// (health envelopes, storage-amplification envelopes, etc — §4.11).
    pub fn extras(&self) -> &Value {
        match self {
            ToolDirective::Success(p)
            | ToolDirective::Error(p)
            | ToolDirective::NotApplicable(p)
            | ToolDirective::OtherTerminal(p) => &p.extras,
            ToolDirective::Plan(p) => &p.extras,
            ToolDirective::NeedsSelection(p) => &p.extras,
            ToolDirective::StepCompleted(p) => &p.extras,
            ToolDirective::NeedsMoreQueries(p) => &p.extras,
        }
    }
}

/// A terminal directive: `success` / `error` / `not_applicable` / unrecognized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalPayload {
    #[serde(flatten)]
    pub extras: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPayload {
    pub plan: Option<Plan>,
    #[serde(flatten)]
    pub extras: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub description: Option<String>,
    pub steps: Vec<PlanStep>,
    pub estimated_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionPayload {
    #[serde(flatten)]
    pub extras: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompletedPayload {
    pub completed_step: Option<CompletedStep>,
    pub step: Option<u32>,
    pub total_steps: Option<u32>,
    #[serde(flatten)]
    pub extras: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedStep {
    pub step: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeedsMoreQueriesPayload {
    pub phase: Option<String>,
    pub phase_name: Option<String>,

    #[serde(default)]
    pub requires_sql_execution: bool,
    #[serde(default)]
    pub requires_ssh_execution: bool,
    #[serde(default)]
    pub requires_prometheus_query: bool,
    #[serde(default)]
    pub requires_cli_execution: bool,
    #[serde(default)]
    pub requires_tool_call: bool,

    pub cli_commands: Option<Vec<CliCommand>>,
    pub ssh_commands: Option<Vec<RemoteCommand>>,
    pub prometheus_queries: Option<Vec<Query>>,

    pub tool_name: Option<String>,
    pub tool_args: Option<Map<String, Value>>,
    pub tool_result_key: Option<String>,

    pub sql: Option<String>,
    pub sql_result_key: Option<String>,

    pub next_queries: Option<Vec<Query>>,
    pub next_args: Option<Map<String, Value>>,
    pub suggested_actions: Option<Vec<SuggestedAction>>,

    #[serde(flatten)]
    pub extras: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub tool: String,
    pub params: Option<Map<String, Value>>,
    pub reason: Option<String>,
}

/// One statement to run (§3). Untagged on `type` because the shapes genuinely
/// overlap (`sql` carries `sql`; `prometheus_*` carry `query`/`start`/`end`/`step`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    #[serde(rename = "type")]
    pub query_type: QueryType,
    pub sql: Option<String>,
    pub query: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub step: Option<String>,

    // `meta` query fields (§4.2, §4.10)
    #[serde(default)]
    pub requires_profile_fetch: bool,
    #[serde(default)]
    pub requires_table_schema_fetch: bool,
    pub time_range: Option<String>,
    pub min_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Sql,
    PrometheusInstant,
    PrometheusRange,
    Meta,
}

impl Query {
    pub fn is_meta(&self) -> bool {
        self.query_type == QueryType::Meta
    }
}

/// One SSH invocation (§3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub node_ip: String,
    pub node_type: NodeType,
    pub ssh_command: String,
    pub command_type: CommandType,
    pub options: Option<RemoteCommandOptions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Fe,
    Be,
    Cn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    DiscoverLogPath,
    FetchLog,
    FetchLogScp,
    #[serde(other)]
    Generic,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteCommandOptions {
    #[serde(default)]
    pub compress: bool,
}

/// One local cloud-storage command (§3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliCommand {
    pub command: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub storage_type: String,
    pub partition_key: Option<String>,
    pub table_key: Option<String>,
    pub path: Option<String>,
}
