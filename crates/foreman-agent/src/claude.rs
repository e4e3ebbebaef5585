//! Runs Claude Code as a supervised subprocess.
//!
//! Output is streamed chunk-by-chunk into the runner's channel as it
//! arrives; interactive sessions hold stdin open and write user frames into
//! it; cancellation escalates SIGTERM → SIGKILL after a grace window.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use foreman_core::agent::{
    AgentBackend, AgentExit, AgentIo, AgentMode, AgentSpawn, OutputChunk, OutputStream, StdinFrame,
};

/// Tools withheld from interactive sessions: the agent may read and discuss,
/// never mutate.
const INTERACTIVE_DISALLOWED_TOOLS: &str = "Edit,Write,Bash,NotebookEdit,MultiEdit";

/// Inline MCP config handed to interactive sessions.
const INTERACTIVE_MCP_CONFIG: &str = r#"{"mcpServers":{}}"#;

pub struct ClaudeBackend {
    pub claude_bin: String,
    pub model: String,
    /// Wait this long after SIGTERM before SIGKILL.
    pub kill_grace: Duration,
}

impl ClaudeBackend {
    pub fn new(claude_bin: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            claude_bin: claude_bin.into(),
            model: model.into(),
            kill_grace: Duration::from_secs(5),
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Flag set per mode (§6.3): stream-json for implementation runs, plain
    /// text for spec phases, stdin frames + restricted tools for interactive.
    pub fn build_args(&self, spawn: &AgentSpawn) -> Vec<String> {
        let mut args = vec![
            "--model".to_string(),
            self.model.clone(),
            "--print".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        match spawn.mode {
            AgentMode::PrintJson => {
                args.push("--output-format".into());
                args.push("stream-json".into());
                args.push("--verbose".into());
            }
            AgentMode::Interactive => {
                args.push("--output-format".into());
                args.push("stream-json".into());
                args.push("--verbose".into());
                args.push("--input-format".into());
                args.push("stream-json".into());
                args.push("--disallowedTools".into());
                args.push(INTERACTIVE_DISALLOWED_TOOLS.into());
                args.push("--mcp-config".into());
                args.push(INTERACTIVE_MCP_CONFIG.into());
            }
            AgentMode::Text => {
                args.push("--output-format".into());
                args.push("text".into());
            }
        }
        args.push(spawn.prompt.clone());
        args
    }
}

/// Serialize one user frame for `--input-format stream-json`.
pub fn user_frame(text: &str) -> String {
    let frame = serde_json::json!({
        "type": "user",
        "message": { "role": "user", "content": text },
    });
    format!("{frame}\n")
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn send_sigkill(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    async fn run(&self, spawn: AgentSpawn, io: AgentIo) -> Result<AgentExit> {
        let args = self.build_args(&spawn);
        let interactive = spawn.mode == AgentMode::Interactive;

        let mut child = Command::new(&self.claude_bin)
            .args(&args)
            .current_dir(&spawn.workdir)
            .kill_on_drop(true)
            .stdin(if interactive { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn agent: {}", self.claude_bin))?;

        let pid = child.id();
        if let (Some(pid_tx), Some(pid)) = (io.pid_tx, pid) {
            let _ = pid_tx.send(pid);
        }
        info!(?pid, mode = ?spawn.mode, "agent subprocess spawned");

        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;
        let mut stdout_reader = Some(BufReader::new(stdout).lines());
        let mut stderr_reader = Some(BufReader::new(stderr).lines());

        let mut stdin_rx = io.stdin_rx;
        let mut cancel_rx = io.cancel_rx;
        let output_tx = io.output_tx;

        let mut raw_stdout = String::new();
        let mut cancelled = false;

        while stdout_reader.is_some() || stderr_reader.is_some() {
            tokio::select! {
                line = async {
                    match stdout_reader.as_mut() {
                        Some(reader) => reader.next_line().await,
                        None => Ok(None),
                    }
                }, if stdout_reader.is_some() => {
                    match line {
                        Ok(Some(text)) => {
                            raw_stdout.push_str(&text);
                            raw_stdout.push('\n');
                            let _ = output_tx.send(OutputChunk {
                                stream: OutputStream::Stdout,
                                text,
                            });
                        }
                        Ok(None) | Err(_) => stdout_reader = None,
                    }
                }

                line = async {
                    match stderr_reader.as_mut() {
                        Some(reader) => reader.next_line().await,
                        None => Ok(None),
                    }
                }, if stderr_reader.is_some() => {
                    match line {
                        Ok(Some(text)) => {
                            if !text.is_empty() {
                                let _ = output_tx.send(OutputChunk {
                                    stream: OutputStream::Stderr,
                                    text,
                                });
                            }
                        }
                        Ok(None) | Err(_) => stderr_reader = None,
                    }
                }

                frame = async {
                    match stdin_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => None,
                    }
                }, if stdin_rx.is_some() => {
                    match frame {
                        Some(StdinFrame::User(text)) => {
                            if let Some(pipe) = stdin.as_mut() {
                                let frame = user_frame(&text);
                                if let Err(e) = pipe.write_all(frame.as_bytes()).await {
                                    warn!("stdin write failed: {e}");
                                } else if let Err(e) = pipe.flush().await {
                                    warn!("stdin flush failed: {e}");
                                }
                            }
                        }
                        Some(StdinFrame::Close) | None => {
                            // Dropping the pipe closes the agent's stdin; it
                            // finishes the current turn and exits.
                            stdin = None;
                            stdin_rx = None;
                        }
                    }
                }

                result = cancel_rx.changed(), if !cancelled => {
                    let requested = result.is_ok() && *cancel_rx.borrow();
                    if requested {
                        cancelled = true;
                        stdin = None;
                        if let Some(pid) = pid {
                            let grace = self.kill_grace;
                            tokio::spawn(async move {
                                send_sigterm(pid);
                                tokio::time::sleep(grace).await;
                                send_sigkill(pid);
                            });
                        } else {
                            let _ = child.start_kill();
                        }
                    }
                }
            }
        }

        drop(stdin);
        let status = child.wait().await.context("failed to wait for agent")?;
        let exit_code = status.code().unwrap_or(-1);
        info!(exit_code, cancelled, "agent subprocess finished");

        // stream-json modes: hand runners the extracted text, not raw NDJSON.
        let stdout_text = match spawn.mode {
            AgentMode::Text => raw_stdout,
            AgentMode::PrintJson | AgentMode::Interactive => {
                let parsed = crate::event::parse_stream(&raw_stdout);
                let text = parsed.full_text();
                if text.is_empty() {
                    raw_stdout
                } else {
                    text
                }
            }
        };

        Ok(AgentExit {
            exit_code,
            stdout: stdout_text,
            cancelled,
        })
    }

    async fn health_check(&self) -> Result<String> {
        let output = Command::new(&self.claude_bin)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("failed to run {} --version", self.claude_bin))?;
        if !output.status.success() {
            anyhow::bail!(
                "{} --version exited with {:?}",
                self.claude_bin,
                output.status.code()
            );
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(format!("{version} ({})", login_type()))
    }
}

/// How the CLI is authenticated: API key env, local OAuth files, or unknown.
pub fn login_type() -> &'static str {
    if std::env::var("ANTHROPIC_API_KEY").map(|v| !v.is_empty()).unwrap_or(false) {
        return "api_key";
    }
    if let Ok(home) = std::env::var("HOME") {
        for file in ["settings.json", "auth.json"] {
            if std::path::Path::new(&home).join(".claude").join(file).exists() {
                return "oauth";
            }
        }
    }
    "unknown"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_for(mode: AgentMode) -> AgentSpawn {
        AgentSpawn {
            prompt: "do the thing".into(),
            mode,
            workdir: ".".into(),
        }
    }

    #[test]
    fn test_print_json_args() {
        let backend = ClaudeBackend::new("claude", "claude-sonnet-4-6");
        let args = backend.build_args(&spawn_for(AgentMode::PrintJson));
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--verbose".to_string()));
        assert_eq!(args.last().unwrap(), "do the thing");
        assert!(!args.contains(&"--input-format".to_string()));
    }

    #[test]
    fn test_interactive_args_restrict_tools() {
        let backend = ClaudeBackend::new("claude", "claude-sonnet-4-6");
        let args = backend.build_args(&spawn_for(AgentMode::Interactive));
        assert!(args.contains(&"--input-format".to_string()));
        assert!(args.contains(&INTERACTIVE_DISALLOWED_TOOLS.to_string()));
        assert!(args.contains(&"--mcp-config".to_string()));
    }

    #[test]
    fn test_text_args_for_spec_phases() {
        let backend = ClaudeBackend::new("claude", "claude-sonnet-4-6");
        let args = backend.build_args(&spawn_for(AgentMode::Text));
        assert!(args.contains(&"text".to_string()));
        assert!(!args.contains(&"stream-json".to_string()));
        assert!(!args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn test_user_frame_shape() {
        let frame = user_frame("hello");
        assert!(frame.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(frame.trim()).unwrap();
        assert_eq!(parsed["type"], "user");
        assert_eq!(parsed["message"]["role"], "user");
        assert_eq!(parsed["message"]["content"], "hello");
    }
}
