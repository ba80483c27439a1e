// src/remote.rs
// Remote Command Executor: SSH fan-out with bounded concurrency, three
// command modes, and multi-file archive parsing (spec §4.4).
//
// Escaping: argv is passed straight to `tokio::process::Command` — no shell
// string concatenation locally. Only the remote-side command string is
// escaped, because it still has to survive a shell invoked over the SSH
// session (spec §9 "Shell escaping").

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use flate2::read::GzDecoder;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::io::Read;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::SshConfig;
use crate::directive::{CommandType, NodeType, RemoteCommand};
use crate::logger::{EventType, Level, Logger};

const MAX_CONCURRENT: usize = 5;
const GENERIC_TIMEOUT: Duration = Duration::from_secs(60);
const STREAMED_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const MAX_STDOUT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandResult {
    pub node_ip: String,
    pub node_type: String,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub stderr: Option<String>,
    pub stdout: Option<String>,
    pub warning: Option<String>,
    pub files: Option<Vec<ArchiveFile>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ArchiveFile {
    pub filename: String,
    pub node_ip: String,
    pub node_type: String,
    pub content: String,
    pub line_count: usize,
    pub size_bytes: usize,
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
    pub results: Vec<CommandResult>,
    pub summary: BatchSummary,
}

pub struct RemoteExecutor {
    ssh: SshConfig,
    logger: Arc<Logger>,
}

impl RemoteExecutor {
    pub fn new(ssh: SshConfig, logger: Arc<Logger>) -> Self {
        Self { ssh, logger }
    }

    pub async fn execute_batch(&self, commands: &[RemoteCommand]) -> BatchOutcome {
        let started = Instant::now();

        let results: Vec<CommandResult> = stream::iter(commands.iter())
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

    async fn execute_one(&self, cmd: &RemoteCommand) -> CommandResult {
        self.logger.write(
            Level::Info,
            EventType::SshCommand,
            "dispatching ssh command",
            serde_json::json!({
                "node_ip": cmd.node_ip,
                "command_type": format!("{:?}", cmd.command_type),
                "ssh_command": cmd.ssh_command,
            }),
        );

        let result = match cmd.command_type {
            CommandType::FetchLogScp => self.run_streamed(cmd).await,
            _ => self.run_captured(cmd).await,
        };

        self.logger.write(
            Level::Info,
            EventType::SshResult,
            "ssh command finished",
            serde_json::json!({ "node_ip": cmd.node_ip, "success": result.success }),
        );

        result
    }

    /// Generic / `discover_log_path` / `fetch_log`: capture stdout in-process.
    async fn run_captured(&self, cmd: &RemoteCommand) -> CommandResult {
        let user = self.ssh.resolve_user(None);
        let remote = format!("{}@{}", user, cmd.node_ip);
        let escaped = escape_for_remote_shell(&cmd.ssh_command);

        let mut command = Command::new("ssh");
        apply_ssh_identity(&mut command, &self.ssh);
        command.arg(&remote).arg(escaped);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = match tokio::time::timeout(GENERIC_TIMEOUT, command.output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return self.io_failure(cmd, e.to_string()),
            Err(_) => return self.timeout_failure(cmd, GENERIC_TIMEOUT),
        };

        let mut stdout = String::from_utf8_lossy(
            &output.stdout[..output.stdout.len().min(MAX_STDOUT_BYTES)],
        )
        .to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_ok = output.status.success();

        if !exit_ok {
            let trimmed = stdout.trim();
            if cmd.command_type == CommandType::DiscoverLogPath && trimmed.starts_with('/') {
                return CommandResult {
                    node_ip: cmd.node_ip.clone(),
                    node_type: node_type_str(cmd.node_type),
                    success: true,
                    output: Some(trimmed.to_string()),
                    error: None,
                    stderr: Some(stderr),
                    stdout: Some(stdout),
                    warning: Some("non-zero exit but stdout looked like a valid path".into()),
                    files: None,
                };
            }
            return CommandResult {
                node_ip: cmd.node_ip.clone(),
                node_type: node_type_str(cmd.node_type),
                success: false,
                output: None,
                error: Some(format!("ssh exited with status {:?}", output.status.code())),
                stderr: Some(stderr),
                stdout: Some(stdout),
                warning: None,
                files: None,
            };
        }

        let mut files = None;
        if cmd.command_type == CommandType::FetchLog {
            let wants_compress = cmd.options.as_ref().map(|o| o.compress).unwrap_or(false);
            if wants_compress {
                stdout = decode_and_decompress(&stdout, &self.logger);
            }
            files = Some(parse_multi_file_archive(&stdout, &cmd.node_ip, node_type_str(cmd.node_type)));
        }

        CommandResult {
            node_ip: cmd.node_ip.clone(),
            node_type: node_type_str(cmd.node_type),
            success: true,
            output: Some(stdout.trim().to_string()),
            error: None,
            stderr: Some(stderr),
            stdout: Some(stdout),
            warning: None,
            files,
        }
    }

    /// `fetch_log_scp`: stream ssh stdout straight to a temp file, then
    /// read+gunzip+delete, avoiding holding the full payload in memory
    /// while the transfer is in flight.
    async fn run_streamed(&self, cmd: &RemoteCommand) -> CommandResult {
        let user = self.ssh.resolve_user(None);
        let remote = format!("{}@{}", user, cmd.node_ip);
        let escaped = escape_for_remote_shell(&cmd.ssh_command);

        let mangled_ip = cmd.node_ip.replace('.', "_").replace(':', "_");
        let epoch_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let tmp_path = std::env::temp_dir().join(format!("sr_log_{mangled_ip}_{epoch_ms}_{}.gz", Uuid::new_v4()));

        let mut command = Command::new("ssh");
        apply_ssh_identity(&mut command, &self.ssh);
        command.arg(&remote).arg(escaped);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => return self.io_failure(cmd, e.to_string()),
        };

        let mut stdout = match child.stdout.take() {
            Some(s) => s,
            None => return self.io_failure(cmd, "failed to capture ssh stdout".into()),
        };

        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            tokio::io::copy(&mut stdout, &mut file).await?;
            file.flush().await?;
            Ok::<(), std::io::Error>(())
        };

        let outcome = tokio::time::timeout(STREAMED_TIMEOUT, async {
            let write_res = write_result.await;
            let status = child.wait().await;
            (write_res, status)
        })
        .await;

        let (write_res, status) = match outcome {
            Ok(pair) => pair,
            Err(_) => {
                let _ = child.start_kill();
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return self.timeout_failure(cmd, STREAMED_TIMEOUT);
            }
        };

        if let Err(e) = write_res {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return self.io_failure(cmd, e.to_string());
        }
        let status = match status {
            Ok(s) => s,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return self.io_failure(cmd, e.to_string());
            }
        };
        if !status.success() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return CommandResult {
                node_ip: cmd.node_ip.clone(),
                node_type: node_type_str(cmd.node_type),
                success: false,
                output: None,
                error: Some(format!("ssh exited with status {:?}", status.code())),
                stderr: None,
                stdout: None,
                warning: None,
                files: None,
            };
        }

        let raw = match tokio::fs::read(&tmp_path).await {
            Ok(bytes) => bytes,
            Err(e) => return self.io_failure(cmd, e.to_string()),
        };
        let _ = tokio::fs::remove_file(&tmp_path).await;

        let (content, warning) = match gunzip(&raw) {
            Ok(text) => (text, None),
            Err(e) => {
                warn!(error = %e, "decompression failed on streamed ssh payload; falling back to raw utf8");
                (
                    String::from_utf8_lossy(&raw).to_string(),
                    Some("gunzip failed; fell back to raw bytes as utf8".to_string()),
                )
            }
        };

        let files = parse_multi_file_archive(&content, &cmd.node_ip, node_type_str(cmd.node_type));

        CommandResult {
            node_ip: cmd.node_ip.clone(),
            node_type: node_type_str(cmd.node_type),
            success: true,
            output: None,
            error: None,
            stderr: None,
            stdout: None,
            warning,
            files: Some(files),
        }
    }

    fn io_failure(&self, cmd: &RemoteCommand, error: String) -> CommandResult {
        error!(node_ip = %cmd.node_ip, %error, "ssh invocation failed");
        CommandResult {
            node_ip: cmd.node_ip.clone(),
            node_type: node_type_str(cmd.node_type),
            success: false,
            output: None,
            error: Some(error),
            stderr: None,
            stdout: None,
            warning: None,
            files: None,
        }
    }

    fn timeout_failure(&self, cmd: &RemoteCommand, timeout: Duration) -> CommandResult {
        CommandResult {
            node_ip: cmd.node_ip.clone(),
            node_type: node_type_str(cmd.node_type),
            success: false,
            output: None,
            error: Some(format!("timed out after {:?}", timeout)),
            stderr: None,
            stdout: None,
            warning: None,
            files: None,
        }
    }
}

fn apply_ssh_identity(command: &mut Command, ssh: &SshConfig) {
    if let Some(key_path) = &ssh.key_path {
        command.arg("-i").arg(key_path);
    }
    command.arg("-o").arg("StrictHostKeyChecking=no");
    command.arg("-o").arg("BatchMode=yes");
}

fn node_type_str(t: NodeType) -> String {
    match t {
        NodeType::Fe => "fe".into(),
        NodeType::Be => "be".into(),
        NodeType::Cn => "cn".into(),
    }
}

/// Escape a command string so it survives the remote shell invoked by ssh
/// (spec §4.4): double backslashes, escape double quotes/dollar/backtick,
/// then the caller wraps the result in double quotes.
fn escape_for_remote_shell(command: &str) -> String {
    let escaped = command
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('`', "\\`");
    format!("\"{escaped}\"")
}

fn decode_and_decompress(stdout: &str, logger: &Logger) -> String {
    let trimmed = stdout.trim();
    let decoded = match base64::engine::general_purpose::STANDARD.decode(trimmed) {
        Ok(bytes) => bytes,
        Err(e) => {
            logger.write(
                Level::Error,
                EventType::Error,
                "base64 decode failed on fetch_log payload",
                serde_json::json!({ "error": e.to_string() }),
            );
            return stdout.to_string();
        }
    };
    match gunzip(&decoded) {
        Ok(text) => text,
        Err(_) => String::from_utf8_lossy(&decoded).to_string(),
    }
}

fn gunzip(bytes: &[u8]) -> std::io::Result<String> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}

const FILE_MARKER_PREFIX: &str = "=== FILE: ";
const FILE_MARKER_SUFFIX: &str = " ===";

/// Parse the delimited multi-file archive format (spec §4.4): sections
/// introduced by `=== FILE: <name> ===`. With no markers, the whole content
/// becomes a single pseudo-file `combined.log`.
pub fn parse_multi_file_archive(content: &str, node_ip: &str, node_type: String) -> Vec<ArchiveFile> {
    if !content.contains(FILE_MARKER_PREFIX) {
        return vec![ArchiveFile {
            filename: "combined.log".to_string(),
            node_ip: node_ip.to_string(),
            node_type,
            line_count: content.lines().count(),
            size_bytes: content.len(),
            content: content.to_string(),
        }];
    }

    let mut files = Vec::new();
    let mut current_name: Option<String> = None;
    let mut current_body = String::new();

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix(FILE_MARKER_PREFIX) {
            if let Some(name) = rest.strip_suffix(FILE_MARKER_SUFFIX) {
                if let Some(prev_name) = current_name.take() {
                    files.push(build_archive_file(prev_name, &current_body, node_ip, node_type.clone()));
                }
                current_name = Some(name.to_string());
                current_body.clear();
                continue;
            }
        }
        current_body.push_str(line);
        current_body.push('\n');
    }

    if let Some(name) = current_name {
        files.push(build_archive_file(name, &current_body, node_ip, node_type));
    }

    files
}

fn build_archive_file(filename: String, body: &str, node_ip: &str, node_type: String) -> ArchiveFile {
    let content = body.strip_suffix('\n').unwrap_or(body).to_string();
    ArchiveFile {
        line_count: content.lines().count(),
        size_bytes: content.len(),
        filename,
        node_ip: node_ip.to_string(),
        node_type,
        content,
    }
}

/// Render a `CommandResult`/`BatchOutcome` pair into a `serde_json::Value`
/// map suitable for folding into the loop's results (used by `orchestrate.rs`).
pub fn batch_to_value(batch: &BatchOutcome) -> Value {
    serde_json::to_value(batch).unwrap_or(Value::Null)
}

/// Used by discover-paths phases to extract a flat list of discovered
/// `{node_ip, node_type, output/error, warning}` entries.
pub fn discovered_paths_value(batch: &BatchOutcome) -> Vec<Value> {
    batch
        .results
        .iter()
        .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_handles_quotes_dollars_backticks() {
        let escaped = escape_for_remote_shell(r#"echo "$HOME" && `whoami`"#);
        assert!(escaped.starts_with('"') && escaped.ends_with('"'));
        assert!(escaped.contains("\\$HOME"));
        assert!(escaped.contains("\\`whoami\\`"));
        assert!(escaped.contains("\\\""));
    }

    #[test]
    fn test_escape_doubles_backslashes_first() {
        let escaped = escape_for_remote_shell(r"C:\path\to\file");
        assert!(escaped.contains(r"C:\\path\\to\\file"));
    }

    #[test]
    fn test_multi_file_archive_roundtrip() {
        let content = format!(
            "{p}a.log{s}\nline1\nline2\n{p}b.log{s}\nsingle line\n",
            p = FILE_MARKER_PREFIX,
            s = FILE_MARKER_SUFFIX
        );
        let files = parse_multi_file_archive(&content, "10.0.0.1", "fe".into());
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].filename, "a.log");
        assert_eq!(files[0].content, "line1\nline2");
        assert_eq!(files[1].filename, "b.log");
        assert_eq!(files[1].content, "single line");
    }

    #[test]
    fn test_no_markers_produces_combined_pseudo_file() {
        let content = "just some plain log output\nwith two lines";
        let files = parse_multi_file_archive(content, "10.0.0.2", "be".into());
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "combined.log");
        assert_eq!(files[0].line_count, 2);
    }

    #[test]
    fn test_gunzip_roundtrip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello diagnostic log").unwrap();
        let compressed = encoder.finish().unwrap();

        let decompressed = gunzip(&compressed).unwrap();
        assert_eq!(decompressed, "hello diagnostic log");
    }
}
