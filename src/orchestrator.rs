// src/orchestrator.rs
// Orchestrator Client: typed calls to the Central Orchestrator's HTTP
// surface (spec §4.6, §6). Deliberately does not retry — a non-2xx or
// transport error aborts the tool call (spec §7); this is why it does not
// reuse the teacher's `LlmHttpClient` retry-with-backoff pattern.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::directive::ToolDirective;
use crate::error::{AgentError, Result};
use crate::logger::{EventType, Level, Logger};

const TOOLS_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    #[allow(dead_code)]
    pub raw: Value,
}

struct ToolsCache {
    tools: Vec<ToolDef>,
    fetched_at: Instant,
}

/// Typed client for `/api/tools`, `/api/plan/<tool>`, `/api/queries/<tool>`,
/// `/api/analyze/<tool>`.
pub struct OrchestratorClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    logger: Arc<Logger>,
    tools_cache: RwLock<Option<ToolsCache>>,
}

impl OrchestratorClient {
    pub fn new(client: Client, base_url: String, api_key: Option<String>, logger: Arc<Logger>) -> Self {
        Self {
            client,
            base_url,
            api_key,
            logger,
            tools_cache: RwLock::new(None),
        }
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-API-Key", key),
            None => builder,
        }
    }

    /// `GET /api/tools` — cached for 1h; stale cache survives a transport
    /// error (spec §4.6).
    pub async fn list_tools(&self) -> Result<Vec<ToolDef>> {
        if let Some(cache) = self.tools_cache.read().await.as_ref() {
            if cache.fetched_at.elapsed() < TOOLS_CACHE_TTL {
                return Ok(cache.tools.clone());
            }
        }

        let url = format!("{}/api/tools", self.base_url);
        let response = self.with_auth(self.client.get(&url)).send().await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let body: Value = resp.json().await?;
                let tools = parse_tool_defs(&body);
                *self.tools_cache.write().await = Some(ToolsCache {
                    tools: tools.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(tools)
            }
            _ => {
                warn!("GET /api/tools failed; falling back to stale cache if present");
                match self.tools_cache.read().await.as_ref() {
                    Some(cache) => Ok(cache.tools.clone()),
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    /// `GET /api/plan/<tool>?<args>` — `None` plan means the tool runs
    /// without confirmation.
    pub async fn get_plan(&self, tool: &str, args: &Map<String, Value>) -> Result<PlanResponse> {
        let url = format!("{}/api/plan/{}", self.base_url, tool);
        let query: Vec<(String, String)> = args
            .iter()
            .map(|(k, v)| (k.clone(), value_to_query_string(v)))
            .collect();

        self.logger.write(
            Level::Info,
            EventType::CentralRequest,
            "GET /api/plan",
            serde_json::json!({ "tool": tool, "args": args }),
        );

        let response = self
            .with_auth(self.client.get(&url))
            .query(&query)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(AgentError::Orchestrator {
                stage: "plan".into(),
                message: format!("HTTP {status}"),
            });
        }

        let body: Value = response.json().await?;
        self.logger.write(
            Level::Info,
            EventType::CentralResponse,
            "plan response",
            crate::logger::summarize_response_body(&body),
        );

        Ok(serde_json::from_value(body)?)
    }

    /// `POST /api/queries/<tool>` body `{args}`.
    pub async fn get_queries(&self, tool: &str, args: &Map<String, Value>) -> Result<Vec<crate::directive::Query>> {
        let url = format!("{}/api/queries/{}", self.base_url, tool);
        let body = serde_json::json!({ "args": args });

        self.logger.write(
            Level::Info,
            EventType::CentralRequest,
            "POST /api/queries",
            crate::logger::summarize_request_body(&body),
        );

        let response = self.with_auth(self.client.post(&url)).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(AgentError::Orchestrator {
                stage: "queries".into(),
                message: format!("HTTP {status}"),
            });
        }

        let response_body: Value = response.json().await?;
        self.logger.write(
            Level::Info,
            EventType::CentralResponse,
            "queries response",
            crate::logger::summarize_response_body(&response_body),
        );

        let queries = response_body
            .get("queries")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(queries)?)
    }

    /// `POST /api/analyze/<tool>` body `{results, args}` → `ToolDirective`.
    pub async fn analyze(
        &self,
        tool: &str,
        results: &Map<String, Value>,
        args: &Map<String, Value>,
    ) -> Result<ToolDirective> {
        let url = format!("{}/api/analyze/{}", self.base_url, tool);
        let body = serde_json::json!({ "results": results, "args": args });

        self.logger.write(
            Level::Info,
            EventType::CentralRequest,
            "POST /api/analyze",
            crate::logger::summarize_request_body(&body),
        );

        let response = self.with_auth(self.client.post(&url)).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(AgentError::Orchestrator {
                stage: "analyze".into(),
                message: format!("HTTP {status}"),
            });
        }

        let response_body: Value = response.json().await?;
        self.logger.write(
            Level::Info,
            EventType::CentralResponse,
            "analyze response",
            crate::logger::summarize_response_body(&response_body),
        );

        debug!(tool, "parsed analyze directive");
        Ok(ToolDirective::try_from(response_body)?)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PlanResponse {
    #[serde(default)]
    pub requires_plan: bool,
    pub plan: Option<crate::directive::Plan>,
}

fn parse_tool_defs(body: &Value) -> Vec<ToolDef> {
    body.get("tools")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    let name = t.get("name")?.as_str()?.to_string();
                    Some(ToolDef {
                        name,
                        raw: t.clone(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Render a JSON scalar/array as it would appear as one query-string value.
/// Non-scalars are serialized to JSON text (spec §4.6: request args bigger
/// than a JSON URL can accept are always sent as POST bodies — this covers
/// only the plan endpoint's simple scalar args).
fn value_to_query_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
