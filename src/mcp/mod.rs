// src/mcp/mod.rs
// Tool Protocol Surface: the outer JSON-RPC bindings exposing `list_tools`
// and `call_tool` over standard input/output (spec §4.9.8 is where results
// land; this module is the boundary, spec §6).

use std::sync::Arc;

use rmcp::handler::server::{router::tool::ToolRouter, tool::ToolCallContext, wrapper::Parameters};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, ListToolsResult, PaginatedRequestParam,
    ProgressNotificationParam, ProgressToken, ServerCapabilities, ServerInfo,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{schemars, tool, tool_router, ErrorData, ServerHandler};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{error, warn};

use crate::orchestrate::{Engine, LoopOutcome};
use crate::report;

/// Tool names declared locally (spec §6). `list_tools` merges these with
/// the orchestrator's dynamic catalogue, with local definitions winning on
/// name collision.
const LOCAL_TOOL_NAMES: &[&str] = &["get_query_profile", "analyze_load_profile", "check_disk_io"];

#[derive(Clone)]
pub struct DiagAgentServer {
    engine: Arc<Engine>,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct GetQueryProfileRequest {
    #[schemars(description = "StarRocks query id to fetch the profile for")]
    pub query_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct AnalyzeLoadProfileRequest {
    #[schemars(description = "Path to a load profile file on the local filesystem")]
    pub file_path: Option<String>,
    #[schemars(description = "Inline load profile content, when not reading from a file")]
    pub profile_content: Option<String>,
    #[schemars(description = "Set true to proceed past an orchestrator confirmation plan")]
    pub confirmed: Option<bool>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CheckDiskIoRequest {
    #[schemars(description = "Start of the analysis window (relative like \"1h\" or ISO-8601)")]
    pub start_time: String,
    #[schemars(description = "End of the analysis window (relative like \"1h\" or ISO-8601)")]
    pub end_time: String,
    #[schemars(description = "Specific BE node addresses to inspect; all nodes if omitted")]
    pub be_addresses: Option<Vec<String>>,
    #[schemars(description = "Set true to proceed past an orchestrator confirmation plan")]
    pub confirmed: Option<bool>,
}

#[tool_router]
impl DiagAgentServer {
    #[tool(description = "Fetch and summarize the execution profile for a StarRocks query id.")]
    async fn get_query_profile(
        &self,
        Parameters(req): Parameters<GetQueryProfileRequest>,
    ) -> Result<String, String> {
        let mut args = Map::new();
        args.insert("query_id".into(), Value::String(req.query_id));
        self.run_and_render("get_query_profile", args).await
    }

    #[tool(description = "Two-stage analysis of a StarRocks load profile, from a file or inline content.")]
    async fn analyze_load_profile(
        &self,
        Parameters(req): Parameters<AnalyzeLoadProfileRequest>,
    ) -> Result<String, String> {
        let mut args = Map::new();
        if let Some(path) = req.file_path {
            args.insert("file_path".into(), Value::String(path));
        }
        if let Some(content) = req.profile_content {
            args.insert("profile_content".into(), Value::String(content));
        }
        if let Some(confirmed) = req.confirmed {
            args.insert("confirmed".into(), Value::Bool(confirmed));
        }
        self.run_and_render("analyze_load_profile", args).await
    }

    #[tool(description = "Report disk I/O utilization across cluster BE nodes over a time window.")]
    async fn check_disk_io(
        &self,
        Parameters(req): Parameters<CheckDiskIoRequest>,
    ) -> Result<String, String> {
        let mut args = Map::new();
        args.insert("start_time".into(), Value::String(req.start_time));
        args.insert("end_time".into(), Value::String(req.end_time));
        if let Some(addresses) = req.be_addresses {
            args.insert(
                "be_addresses".into(),
                Value::Array(addresses.into_iter().map(Value::String).collect()),
            );
        }
        if let Some(confirmed) = req.confirmed {
            args.insert("confirmed".into(), Value::Bool(confirmed));
        }
        self.run_and_render("check_disk_io", args).await
    }
}

impl DiagAgentServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }

    async fn run_and_render(&self, tool: &str, args: Map<String, Value>) -> Result<String, String> {
        match self.engine.run_tool(tool, args).await {
            Ok(outcome) => Ok(render_outcome(outcome)),
            Err(e) => Err(e.to_user_string()),
        }
    }

    /// Dispatch a tool call that is not one of the three locally-declared
    /// names — i.e. a tool drawn from the orchestrator's dynamic catalogue.
    /// Execution still routes through the same `Engine::run_tool`.
    async fn run_dynamic(&self, tool: &str, arguments: Option<Map<String, Value>>) -> CallToolResult {
        let args = arguments.unwrap_or_default();
        match self.engine.run_tool(tool, args).await {
            Ok(outcome) => CallToolResult::success(vec![Content::text(render_outcome(outcome))]),
            Err(e) => {
                let hints = failure_hints(&self.engine, &e.to_user_string());
                CallToolResult::error(vec![Content::text(hints)])
            }
        }
    }
}

fn render_outcome(outcome: LoopOutcome) -> String {
    match outcome {
        LoopOutcome::Plan { markdown } => markdown,
        LoopOutcome::NeedsSelection { payload } => {
            serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "needs_selection".to_string())
        }
        LoopOutcome::Progress { text } => text,
        LoopOutcome::Report { brief_summary, report_path } => {
            format!("{brief_summary}\n\n完整报告: {report_path}")
        }
    }
}

fn failure_hints(engine: &Engine, message: &str) -> String {
    report::failure_text(
        message,
        &engine.config.central_api,
        &format!("{}:{}", engine.config.sql.host, engine.config.sql.port),
        engine.config.central_api_token.is_some(),
    )
}

/// Extract the progress token the client expects echoed back (spec §6,
/// §9 Open Questions: three possible locations with different keys; this
/// precedence follows the source and should be reconfirmed against the
/// client spec before being trusted blindly).
fn extract_progress_token(request: &CallToolRequestParam) -> Option<ProgressToken> {
    let meta = request.meta()?;
    if let Some(token) = meta.get("progressToken") {
        return serde_json::from_value(token.clone()).ok();
    }
    if let Some(token) = meta.get("toolUseId") {
        return serde_json::from_value(token.clone()).ok();
    }
    meta.get("requestId").and_then(|v| serde_json::from_value(v.clone()).ok())
}

impl ServerHandler for DiagAgentServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: rmcp::model::Implementation {
                name: "sr-diag-agent".into(),
                title: Some("StarRocks Diagnostic Execution Arm".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Execution arm for the StarRocks diagnostic service. Diagnostic analysis is driven by a \
                 remote orchestrator; this process executes SQL, Prometheus queries, SSH log collection, \
                 and cloud-storage CLI invocations on its behalf."
                    .into(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, ErrorData>> + Send + '_ {
        async move {
            let mut tools = self.tool_router.list_all();
            let local_names: std::collections::HashSet<&str> = LOCAL_TOOL_NAMES.iter().copied().collect();

            match self.engine.orchestrator.list_tools().await {
                Ok(remote_tools) => {
                    for remote in remote_tools {
                        if local_names.contains(remote.name.as_str()) {
                            continue;
                        }
                        if let Ok(tool) = serde_json::from_value(remote.raw) {
                            tools.push(tool);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to fetch orchestrator tool catalogue; serving local tools only"),
            }

            Ok(ListToolsResult {
                tools,
                next_cursor: None,
                meta: None,
            })
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, ErrorData>> + Send + '_ {
        async move {
            let tool_name = request.name.to_string();
            let progress_token = extract_progress_token(&request);
            let peer = context.peer.clone();

            if let Some(token) = progress_token.clone() {
                let _ = notify_started(&peer, token).await;
            }

            let is_local = LOCAL_TOOL_NAMES.contains(&tool_name.as_str());

            let result = if is_local {
                let ctx = ToolCallContext::new(self, request, context);
                self.tool_router.call(ctx).await
            } else {
                Ok(self.run_dynamic(&tool_name, request.arguments).await)
            };

            if let Some(token) = progress_token {
                let _ = notify_finished(&peer, token).await;
            }

            if let Err(e) = &result {
                error!(tool = tool_name, error = %e.message, "tool call failed");
            }

            result
        }
    }
}

async fn notify_started(peer: &rmcp::service::Peer<RoleServer>, token: ProgressToken) -> Result<(), ErrorData> {
    peer.notify_progress(ProgressNotificationParam {
        progress_token: token,
        progress: 0.0,
        total: None,
        message: Some("executing".to_string()),
    })
    .await
    .map_err(|_| ErrorData::internal_error("progress notification failed", None))
}

async fn notify_finished(peer: &rmcp::service::Peer<RoleServer>, token: ProgressToken) -> Result<(), ErrorData> {
    peer.notify_progress(ProgressNotificationParam {
        progress_token: token,
        progress: 1.0,
        total: Some(1.0),
        message: Some("done".to_string()),
    })
    .await
    .map_err(|_| ErrorData::internal_error("progress notification failed", None))
}
