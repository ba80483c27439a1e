//! End-to-end exercises of `Engine::run_tool` against a `wiremock`-stood-in
//! Central Orchestrator (spec.md §8, scenarios 1/2/4/5). The SSH and
//! cloud-storage CLI scenario (§8 scenario 3) is exercised in `remote.rs`'s
//! and `cli_exec.rs`'s own unit tests instead — those executors shell out to
//! real binaries with no injected transport seam, so there's nothing useful
//! to stand in for at this layer.

use std::sync::Arc;

use serde_json::{json, Map};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sr_diag_agent::config::{AgentConfig, SqlConfig, SshConfig};
use sr_diag_agent::logger::Logger;
use sr_diag_agent::orchestrate::{Engine, LoopOutcome};
use sr_diag_agent::session::deterministic_session_key;

const TOOL: &str = "check_disk_io";

fn test_config(central_api: String) -> AgentConfig {
    AgentConfig {
        central_api,
        central_api_token: Some("test-token".to_string()),
        sql: SqlConfig {
            host: "127.0.0.1".into(),
            port: 9030,
            user: "root".into(),
            password: String::new(),
        },
        prometheus_protocol: "http".into(),
        prometheus_host: "127.0.0.1".into(),
        prometheus_port: 9090,
        ssh: SshConfig {
            user: None,
            key_path: None,
        },
        logging_enabled: false,
    }
}

fn test_engine(central_api: String) -> Engine {
    let logger = Arc::new(Logger::new(tempfile::tempdir().unwrap().into_path(), false));
    Engine::new(test_config(central_api), logger)
}

async fn mock_empty_queries(server: &MockServer, tool: &str) {
    Mock::given(method("POST"))
        .and(path(format!("/api/queries/{tool}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "queries": [] })))
        .mount(server)
        .await;
}

async fn mock_plan(server: &MockServer, tool: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/api/plan/{tool}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

// --- Scenario 1: a simple terminal tool call, no phases needed ---

#[tokio::test]
async fn simple_tool_call_returns_terminal_report() {
    let server = MockServer::start().await;
    mock_plan(&server, TOOL, json!({ "requires_plan": false, "plan": null })).await;
    mock_empty_queries(&server, TOOL).await;

    Mock::given(method("POST"))
        .and(path(format!("/api/analyze/{TOOL}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "message": "disk io nominal across all be nodes",
        })))
        .mount(&server)
        .await;

    let engine = test_engine(server.uri());
    let mut args = Map::new();
    args.insert("confirmed".into(), json!(true));
    args.insert("start_time".into(), json!("1h"));
    args.insert("end_time".into(), json!("now"));

    let outcome = engine.run_tool(TOOL, args).await.expect("tool call should succeed");
    match outcome {
        LoopOutcome::Report { brief_summary, report_path } => {
            assert!(brief_summary.contains("disk io nominal"));
            assert!(!report_path.is_empty());
        }
        other => panic!("expected Report, got a different outcome variant: {}", debug_name(&other)),
    }
}

// --- Scenario 2: the plan gate stops execution before confirmation ---

#[tokio::test]
async fn unconfirmed_call_returns_plan_without_hitting_queries_or_analyze() {
    let server = MockServer::start().await;
    mock_plan(
        &server,
        TOOL,
        json!({
            "requires_plan": true,
            "plan": {
                "description": "This will inspect disk I/O across BE nodes.",
                "steps": [
                    { "step": 1, "name": "collect node_exporter disk metrics" },
                    { "step": 2, "name": "summarize by node" },
                ],
                "estimated_time": "30s",
            },
        }),
    )
    .await;

    // No /api/queries or /api/analyze mocks are registered — if the engine
    // called past the plan gate it would hit an unmatched 404 and this test
    // would fail at the `.expect(...)` below instead of returning a Plan.
    let engine = test_engine(server.uri());
    let mut args = Map::new();
    args.insert("start_time".into(), json!("1h"));
    args.insert("end_time".into(), json!("now"));

    let outcome = engine.run_tool(TOOL, args).await.expect("plan should be returned, not an error");
    match outcome {
        LoopOutcome::Plan { markdown } => {
            assert!(markdown.contains("| 步骤 | 名称 |"));
            assert!(markdown.contains("collect node_exporter disk metrics"));
            assert!(markdown.contains("confirmed: true"));
        }
        other => panic!("expected Plan, got a different outcome variant: {}", debug_name(&other)),
    }
}

// --- Scenario 4: the phase cap is reached and the loop terminates anyway ---

#[tokio::test]
async fn phase_cap_reached_terminates_with_partial_state() {
    let server = MockServer::start().await;
    mock_plan(&server, TOOL, json!({ "requires_plan": false, "plan": null })).await;
    mock_empty_queries(&server, TOOL).await;

    // Every analyze call asks for another phase that requires nothing —
    // this never reaches a terminal status on its own, so the loop must
    // stop itself at MAX_PHASES. `.expect(10)` pins the call count so an
    // off-by-one in the cap check fails this test instead of passing silently.
    Mock::given(method("POST"))
        .and(path(format!("/api/analyze/{TOOL}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "needs_more_queries",
            "phase": "keep_going",
        })))
        .expect(10)
        .mount(&server)
        .await;

    let engine = test_engine(server.uri());
    let mut args = Map::new();
    args.insert("confirmed".into(), json!(true));

    let outcome = engine.run_tool(TOOL, args).await.expect("phase cap should still terminate cleanly");
    match outcome {
        LoopOutcome::Report { report_path, .. } => assert!(!report_path.is_empty()),
        other => panic!("expected Report after phase cap, got: {}", debug_name(&other)),
    }
}

// --- Scenario 5: a step_completed directive persists a resumable session ---

#[tokio::test]
async fn step_completed_directive_persists_a_session() {
    let server = MockServer::start().await;
    mock_plan(&server, TOOL, json!({ "requires_plan": false, "plan": null })).await;
    mock_empty_queries(&server, TOOL).await;

    Mock::given(method("POST"))
        .and(path(format!("/api/analyze/{TOOL}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "step_completed",
            "completed_step": { "step": 1, "name": "collect node_exporter disk metrics" },
            "total_steps": 3,
            "result_summary": "collected metrics from 4 be nodes",
        })))
        .mount(&server)
        .await;

    let engine = test_engine(server.uri());
    let mut args = Map::new();
    args.insert("confirmed".into(), json!(true));
    args.insert("start_time".into(), json!("1h"));
    args.insert("end_time".into(), json!("now"));

    let outcome = engine
        .run_tool(TOOL, args.clone())
        .await
        .expect("step_completed should surface as progress, not an error");

    match outcome {
        LoopOutcome::Progress { text } => {
            assert!(text.contains("1/3"));
            assert!(text.contains("collect node_exporter disk metrics"));
        }
        other => panic!("expected Progress, got: {}", debug_name(&other)),
    }

    let session_key = deterministic_session_key(TOOL, &args);
    let session = engine
        .sessions
        .find_by_key(&session_key)
        .expect("a session should have been stored for this call's deterministic key");
    assert_eq!(
        session
            .last_completed_step
            .as_ref()
            .and_then(|s| s.get("step"))
            .and_then(|v| v.as_u64()),
        Some(1)
    );
}

fn debug_name(outcome: &LoopOutcome) -> &'static str {
    match outcome {
        LoopOutcome::Plan { .. } => "Plan",
        LoopOutcome::NeedsSelection { .. } => "NeedsSelection",
        LoopOutcome::Progress { .. } => "Progress",
        LoopOutcome::Report { .. } => "Report",
    }
}
