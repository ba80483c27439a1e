// src/file_reader.rs
// File Reader: trivial local-file-contents primitive exposed to the
// orchestrator (spec §4.8).

use serde_json::{json, Value};

use crate::error::Result;

/// Threshold spec §4.9.6/§9 uses to describe the source's deferred-load
/// optimization. Not load-bearing here (see `read_file`'s doc comment) —
/// kept as a pure size check for callers that want to branch on it.
pub const LARGE_FILE_THRESHOLD_BYTES: u64 = 50 * 1024;

/// `read_file(path)` → `{content, file_path, size_bytes}` (spec §4.8).
/// On failure: "return error structure, loop continues" (spec §7). This
/// crate doesn't build the `large_file_path` deferred-load pass described in
/// spec §4.9.6/§9 — per §9's own "Two-pass file loading" note, streaming
/// content straight into the analyze request body is observationally
/// equivalent to deferring it, so every `read_file` call site in
/// `orchestrate.rs` goes through the same non-aborting
/// `read_file_or_error_value` below, size notwithstanding.
pub async fn read_file(path: &str) -> Result<Value> {
    let content = tokio::fs::read_to_string(path).await?;
    let size_bytes = content.len() as u64;
    Ok(json!({
        "content": content,
        "file_path": path,
        "size_bytes": size_bytes,
    }))
}

/// Same as `read_file`, but returns an error-shaped JSON value instead of an
/// `Err` — used by the orchestration loop's `requires_tool_call` dispatch to
/// `read_file`, where a failed read is folded into `results` as data rather
/// than aborting the tool call (spec §7).
pub async fn read_file_or_error_value(path: &str) -> Value {
    match read_file(path).await {
        Ok(v) => v,
        Err(e) => json!({ "error": e.to_user_string(), "file_path": path }),
    }
}

pub fn is_large(size_bytes: u64) -> bool {
    size_bytes >= LARGE_FILE_THRESHOLD_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.txt");
        tokio::fs::write(&path, "hello world").await.unwrap();

        let value = read_file(path.to_str().unwrap()).await.unwrap();
        assert_eq!(value["content"], "hello world");
        assert_eq!(value["size_bytes"], 11);
    }

    #[tokio::test]
    async fn test_read_file_missing_returns_error_value() {
        let value = read_file_or_error_value("/nonexistent/path/for/sure").await;
        assert!(value.get("error").is_some());
    }

    #[test]
    fn test_large_file_threshold() {
        assert!(!is_large(1024));
        assert!(is_large(51 * 1024));
    }
}
