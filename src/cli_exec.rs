// src/cli_exec.rs
// CLI Executor: fans out local cloud-storage CLI invocations (S3, OSS,
// s3cmd, COS, HDFS, GCS, Azure) with bounded concurrency, then parses each
// vendor's output into a byte count (spec §4.5, §9 "Vendor CLI parsers").

use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use regex::Regex;
use serde_json::Value;
use tokio::process::Command;

use crate::directive::CliCommand;
use crate::logger::{EventType, Level, Logger};

const MAX_CONCURRENT: usize = 10;
const TIMEOUT: Duration = Duration::from_secs(30);
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct CliResult {
    pub command_type: String,
    pub storage_type: String,
    pub success: bool,
    pub size_bytes: Option<u64>,
    pub error: Option<String>,
    pub raw_output: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub execution_time_ms: u128,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchOutcome {
    pub results: Vec<CliResult>,
    pub summary: BatchSummary,
}

pub struct CliExecutor {
    logger: Arc<Logger>,
}

impl CliExecutor {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }

    pub async fn execute_batch(&self, commands: &[CliCommand]) -> BatchOutcome {
        let started = Instant::now();

        let results: Vec<CliResult> = stream::iter(commands.iter())
            .map(|cmd| self.execute_one(cmd))
            .buffer_unordered(MAX_CONCURRENT)
            .collect()
            .await;

        let successful = results.iter().filter(|r| r.success).count();
        let summary = BatchSummary {
            total: results.len(),
            successful,
            failed: results.len() - successful,
            execution_time_ms: started.elapsed().as_millis(),
        };

        BatchOutcome { results, summary }
    }

    async fn execute_one(&self, cmd: &CliCommand) -> CliResult {
        self.logger.write(
            Level::Info,
            EventType::CliCommand,
            "dispatching cli command",
            serde_json::json!({ "command": cmd.command, "storage_type": cmd.storage_type }),
        );

        // The vendor CLI's full invocation line arrives pre-built from the
        // orchestrator (spec §3: `CliCommand.command` is a string), so it is
        // spawned through a shell rather than split into argv ourselves —
        // there is no local interpolation of untrusted data into this string.
        let mut command = Command::new("sh");
        command.arg("-c").arg(&cmd.command);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = match tokio::time::timeout(TIMEOUT, command.output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                return self.failure(cmd, e.to_string());
            }
            Err(_) => {
                return self.failure(cmd, format!("timed out after {:?}", TIMEOUT));
            }
        };

        let stdout = String::from_utf8_lossy(
            &output.stdout[..output.stdout.len().min(MAX_OUTPUT_BYTES)],
        )
        .to_string();

        let result = match parse_vendor_output(&cmd.storage_type, &stdout) {
            Some(size_bytes) => CliResult {
                command_type: cmd.command_type.clone(),
                storage_type: cmd.storage_type.clone(),
                success: true,
                size_bytes: Some(size_bytes),
                error: None,
                raw_output: Some(stdout),
            },
            None => CliResult {
                command_type: cmd.command_type.clone(),
                storage_type: cmd.storage_type.clone(),
                success: false,
                size_bytes: None,
                error: Some("unparseable output for this storage type".into()),
                raw_output: Some(stdout),
            },
        };

        self.logger.write(
            Level::Info,
            EventType::CliResult,
            "cli command finished",
            serde_json::json!({ "storage_type": cmd.storage_type, "success": result.success }),
        );

        result
    }

    fn failure(&self, cmd: &CliCommand, error: String) -> CliResult {
        CliResult {
            command_type: cmd.command_type.clone(),
            storage_type: cmd.storage_type.clone(),
            success: false,
            size_bytes: None,
            error: Some(error),
            raw_output: None,
        }
    }
}

/// `(storage_type, extractor)` table — a table of regex rows rather than a
/// switch, per spec §9. Unknown storage types fall through to `None`.
static PARSERS: LazyLock<Vec<(&'static str, fn(&str) -> Option<u64>)>> = LazyLock::new(|| {
    vec![
        ("s3", parse_s3),
        ("s3a", parse_s3),
        ("s3n", parse_s3),
        ("oss", parse_oss),
        ("s3cmd", parse_s3cmd),
        ("cos", parse_cos),
        ("cosn", parse_cos),
        ("hdfs", parse_leading_digits),
        ("gs", parse_leading_digits),
        ("azblob", parse_azblob),
    ]
});

fn parse_vendor_output(storage_type: &str, output: &str) -> Option<u64> {
    let lower = storage_type.to_lowercase();
    PARSERS
        .iter()
        .find(|(name, _)| *name == lower)
        .and_then(|(_, parser)| parser(output))
}

static S3_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Total Size:\s*([\d,]+)\s*Bytes").unwrap());
static S3_ZERO_OBJECTS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Total Objects:\s*0\b").unwrap());
static OSS_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"total object sum size:\s*(\d+)").unwrap());
static S3CMD_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+)\s+\d+\s+objects?").unwrap());
static COS_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\((\d+)\s*Bytes\)").unwrap());
static LEADING_DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(\d+)").unwrap());

fn parse_s3(output: &str) -> Option<u64> {
    if let Some(caps) = S3_SIZE_RE.captures(output) {
        return caps[1].replace(',', "").parse().ok();
    }
    if S3_ZERO_OBJECTS_RE.is_match(output) {
        return Some(0);
    }
    None
}

fn parse_oss(output: &str) -> Option<u64> {
    OSS_SIZE_RE.captures(output).and_then(|c| c[1].parse().ok())
}

fn parse_s3cmd(output: &str) -> Option<u64> {
    S3CMD_SIZE_RE.captures(output).and_then(|c| c[1].parse().ok())
}

fn parse_cos(output: &str) -> Option<u64> {
    COS_SIZE_RE.captures(output).and_then(|c| c[1].parse().ok())
}

fn parse_leading_digits(output: &str) -> Option<u64> {
    LEADING_DIGITS_RE.captures(output).and_then(|c| c[1].parse().ok())
}

fn parse_azblob(output: &str) -> Option<u64> {
    output.trim().parse().ok()
}

pub fn batch_to_value(batch: &BatchOutcome) -> Value {
    serde_json::to_value(batch).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_total_size() {
        assert_eq!(parse_s3("Total Size: 1,234,567 Bytes"), Some(1_234_567));
    }

    #[test]
    fn test_parse_s3_zero_objects() {
        assert_eq!(parse_s3("Total Objects: 0"), Some(0));
    }

    #[test]
    fn test_parse_s3_unparseable() {
        assert_eq!(parse_s3("garbage output"), None);
    }

    #[test]
    fn test_parse_oss() {
        assert_eq!(parse_oss("total object sum size: 4096"), Some(4096));
    }

    #[test]
    fn test_parse_s3cmd_with_leading_whitespace() {
        assert_eq!(parse_s3cmd("   8192 3 objects"), Some(8192));
        assert_eq!(parse_s3cmd("8192 3 object"), Some(8192));
    }

    #[test]
    fn test_parse_cos() {
        assert_eq!(parse_cos("done (2048 Bytes)"), Some(2048));
    }

    #[test]
    fn test_parse_hdfs_gs_leading_digits() {
        assert_eq!(parse_leading_digits("65536   /warehouse/table"), Some(65536));
    }

    #[test]
    fn test_parse_azblob_entire_output() {
        assert_eq!(parse_azblob("  131072 \n"), Some(131072));
        assert_eq!(parse_azblob("not a number"), None);
    }

    #[test]
    fn test_unknown_storage_type_returns_none() {
        assert_eq!(parse_vendor_output("made_up_vendor", "123"), None);
    }

    #[test]
    fn test_parser_dispatch_is_case_insensitive() {
        assert_eq!(parse_vendor_output("S3", "Total Size: 10 Bytes"), Some(10));
    }
}
