// src/report.rs
// Report Formatter + Report Sink (spec §4.11, §4.9.1, §4.9.8).
//
// The formatter is pure: it takes a terminal JSON envelope and renders
// prose. The sink writes the full report to a temp file and hands back a
// short summary so the outer transport payload stays small.

use chrono::Utc;
use serde_json::Value;

use crate::directive::{Plan, ToolDirective};
use crate::error::Result;

/// Render a plan as the markdown table the client is expected to re-call
/// the tool against (spec §4.9.1, §8 scenario 2 — note the header is
/// literally `| 步骤 | 名称 |`, following the source's Chinese-language UI).
pub fn format_plan(plan: &Plan) -> String {
    let mut out = String::new();
    if let Some(desc) = &plan.description {
        out.push_str(desc);
        out.push_str("\n\n");
    }
    out.push_str("| 步骤 | 名称 |\n|---|---|\n");
    for step in &plan.steps {
        out.push_str(&format!("| {} | {} |\n", step.step, step.name));
    }
    if let Some(estimate) = &plan.estimated_time {
        out.push_str(&format!("\n预计耗时: {estimate}\n"));
    }
    out.push_str("\n请使用 `confirmed: true` 重新调用该工具以继续执行。\n");
    out
}

/// One-line progress summary for `step_completed` (spec §4.9.5, §8 scenario 5).
pub fn format_progress(step: u32, total: Option<u32>, step_name: &str, one_line_result: &str) -> String {
    match total {
        Some(total) => format!("⏳ 进度 {step}/{total}: {step_name} | {one_line_result}"),
        None => format!("⏳ 进度 {step}: {step_name} | {one_line_result}"),
    }
}

/// Render a terminal directive's JSON payload into a full markdown report
/// plus a brief (~10 line) summary for the outer transport.
pub fn format_terminal(directive: &ToolDirective) -> (String, String) {
    let extras = directive.extras();
    let is_error = matches!(directive, ToolDirective::Error(_));

    if let Some(health) = first_present(extras, &["storage_health", "compaction_health", "import_health"]) {
        return format_health_envelope(health, is_error);
    }
    if let Some(amp) = extras.get("storage_amplification") {
        return format_storage_amplification(amp);
    }
    if let Some(diagnosis) = extras.get("diagnosis_results") {
        return format_diagnosis(diagnosis, is_error);
    }
    if extras.get("html_content").is_some() || extras.get("output_path").is_some() {
        return format_html_envelope(extras);
    }

    format_generic(extras, is_error)
}

fn first_present<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| value.get(k))
}

fn health_emoji(level: &str) -> &'static str {
    match level.to_uppercase().as_str() {
        "EXCELLENT" | "GOOD" => "🟢",
        "FAIR" => "🟡",
        "POOR" => "🔴",
        _ => "⚪",
    }
}

fn format_health_envelope(health: &Value, is_error: bool) -> (String, String) {
    let level = health.get("level").and_then(Value::as_str).unwrap_or("UNKNOWN");
    let score = health.get("score");
    let status = health.get("status").and_then(Value::as_str).unwrap_or("");
    let emoji = health_emoji(level);

    let mut full = String::new();
    full.push_str(&format!("# {emoji} 健康状况: {level}\n\n"));
    if let Some(score) = score {
        full.push_str(&format!("评分: {score}\n\n"));
    }
    full.push_str(status);
    full.push('\n');

    let brief = format!(
        "{} {} {}\n{}",
        if is_error { "❌" } else { emoji },
        level,
        score.map(|s| s.to_string()).unwrap_or_default(),
        truncate_lines(status, 8)
    );
    (full, brief)
}

fn format_storage_amplification(amp: &Value) -> (String, String) {
    let mut full = String::from("# 存储放大分析\n\n");
    let mut brief_lines = vec!["# 存储放大分析".to_string()];

    if let Some(ratio) = amp.get("ratio").and_then(Value::as_f64) {
        let marker = if ratio > 2.0 { "🔴" } else if ratio > 1.5 { "🟡" } else { "🟢" };
        let line = format!("{marker} 放大比例: {ratio:.2}");
        full.push_str(&line);
        full.push_str("\n\n");
        brief_lines.push(line);
    }
    if let Some(total) = amp.get("total_bytes") {
        full.push_str(&format!("总字节数: {total}\n\n"));
    }

    if let Some(tables) = amp.get("top_tables").and_then(Value::as_array) {
        full.push_str("## Top 5 表\n\n| 表 | 放大比例 |\n|---|---|\n");
        for entry in tables.iter().take(5) {
            let name = entry.get("table").and_then(Value::as_str).unwrap_or("?");
            let ratio = entry.get("ratio").and_then(Value::as_f64).unwrap_or(0.0);
            full.push_str(&format!("| {name} | {ratio:.2} |\n"));
        }
    }

    let brief = brief_lines.join("\n");
    (full, brief)
}

fn format_diagnosis(diagnosis: &Value, is_error: bool) -> (String, String) {
    let summary = diagnosis.get("summary").and_then(Value::as_str).unwrap_or("");
    let total_issues = diagnosis.get("total_issues").and_then(Value::as_u64);

    let mut full = String::from("# 诊断结果\n\n");
    full.push_str(summary);
    full.push_str("\n\n");

    for (label, key) in [("严重问题", "critical"), ("警告", "warnings"), ("问题", "issues")] {
        if let Some(items) = diagnosis.get(key).and_then(Value::as_array) {
            if items.is_empty() {
                continue;
            }
            full.push_str(&format!("## {label}\n\n"));
            for item in items {
                full.push_str(&format!("- {}\n", item_text(item)));
            }
            full.push('\n');
        }
    }

    if let Some(recs) = diagnosis.get("recommendations").and_then(Value::as_array) {
        if !recs.is_empty() {
            full.push_str("## 建议\n\n");
            for rec in recs.iter().take(3) {
                full.push_str(&format!("- {}\n", item_text(rec)));
            }
        }
    }

    let emoji = if is_error {
        "❌"
    } else if total_issues.unwrap_or(0) == 0 {
        "✅"
    } else {
        "⚠️"
    };
    let brief = format!("{emoji} {}", truncate_lines(summary, 8));
    (full, brief)
}

fn item_text(item: &Value) -> String {
    item.as_str()
        .map(str::to_string)
        .or_else(|| item.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| item.to_string())
}

fn format_html_envelope(extras: &Value) -> (String, String) {
    let path = extras.get("output_path").and_then(Value::as_str).unwrap_or("(unknown)");
    let full = format!("# HTML 报告\n\nHTML 内容已写入: `{path}`\n");
    let brief = format!("✅ HTML report written to {path}");
    (full, brief)
}

fn format_generic(extras: &Value, is_error: bool) -> (String, String) {
    let pretty = serde_json::to_string_pretty(extras).unwrap_or_default();
    let full = format!("# 结果\n\n```json\n{pretty}\n```\n");
    let emoji = if is_error { "❌" } else { "✅" };
    let summary = extras
        .get("message")
        .or_else(|| extras.get("summary"))
        .and_then(Value::as_str)
        .unwrap_or("done");
    let brief = format!("{emoji} {summary}");
    (full, brief)
}

fn truncate_lines(s: &str, max_lines: usize) -> String {
    s.lines().take(max_lines).collect::<Vec<_>>().join("\n")
}

/// Failure text for the outer transport (spec §7): a single text node plus
/// troubleshooting hints naming the orchestrator URL, DB address, and
/// whether a token is configured.
pub fn failure_text(message: &str, central_api: &str, db_address: &str, has_token: bool) -> String {
    format!(
        "❌ 工具执行失败: {message}\n\n排查信息:\n- Orchestrator: {central_api}\n- Database: {db_address}\n- API Token configured: {has_token}"
    )
}

/// Write the full report to `/tmp/<tool>_<iso-timestamp>.md` (spec §4.9.8,
/// §6 on-disk artifacts).
pub async fn write_report(tool: &str, markdown: &str) -> Result<String> {
    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string();
    let path = std::env::temp_dir().join(format!("{tool}_{timestamp}.md"));
    tokio::fs::write(&path, markdown).await?;
    Ok(path.to_string_lossy().to_string())
}

/// If the terminal payload carries `html_content` + `output_path`, write
/// that HTML out separately and strip it from the envelope that gets
/// logged/returned (spec §4.9.8).
pub async fn maybe_write_html(extras: &Value) -> Result<Option<String>> {
    let (Some(html), Some(path)) = (
        extras.get("html_content").and_then(Value::as_str),
        extras.get("output_path").and_then(Value::as_str),
    ) else {
        return Ok(None);
    };
    tokio::fs::write(path, html).await?;
    Ok(Some(path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::{PlanStep};
    use serde_json::json;

    #[test]
    fn test_format_plan_table_header_and_row() {
        let plan = Plan {
            description: Some("D".into()),
            steps: vec![PlanStep { step: 1, name: "A".into() }],
            estimated_time: Some("5s".into()),
        };
        let md = format_plan(&plan);
        assert!(md.contains("| 步骤 | 名称 |"));
        assert!(md.contains("| 1 | A |"));
    }

    #[test]
    fn test_format_progress_line() {
        let line = format_progress(1, Some(3), "A", "ok");
        assert_eq!(line, "⏳ 进度 1/3: A | ok");
    }

    #[tokio::test]
    async fn test_write_report_creates_file_with_tool_prefix() {
        let path = write_report("my_tool", "# hello").await.unwrap();
        assert!(path.contains("my_tool_"));
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "# hello");
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[test]
    fn test_format_diagnosis_caps_recommendations_at_three() {
        let diagnosis = json!({
            "summary": "ok",
            "total_issues": 0,
            "recommendations": ["a", "b", "c", "d", "e"],
        });
        let (full, _) = format_diagnosis(&diagnosis, false);
        assert_eq!(full.matches("- ").count(), 3);
    }

    #[test]
    fn test_storage_amplification_ratio_markers() {
        let amp = json!({ "ratio": 2.5 });
        let (full, _) = format_storage_amplification(&amp);
        assert!(full.contains('🔴'));
    }
}
