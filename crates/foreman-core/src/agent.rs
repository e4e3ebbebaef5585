use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

/// Which flag set the subprocess is launched with (§6.3 of the design).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// `--print --dangerously-skip-permissions --output-format stream-json --verbose`
    PrintJson,
    /// PrintJson plus `--input-format stream-json`, a restricted toolset and
    /// an inline MCP config; stdin stays open for user frames.
    Interactive,
    /// `--print --dangerously-skip-permissions --output-format text`, used by
    /// spec phases so JSON can be extracted from plain output.
    Text,
}

#[derive(Debug, Clone)]
pub struct AgentSpawn {
    pub prompt: String,
    pub mode: AgentMode,
    /// Working directory for the subprocess (the job's worktree).
    pub workdir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One chunk of subprocess output, in arrival order.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

/// Frames written to the agent's stdin in interactive mode.
#[derive(Debug)]
pub enum StdinFrame {
    /// Serialized as `{"type":"user","message":{"role":"user","content":...}}`.
    User(String),
    /// Drop stdin; the agent finishes its turn and exits.
    Close,
}

/// Channels wired between a runner and the subprocess it supervises.
pub struct AgentIo {
    /// Every stdout/stderr chunk is sent here as it arrives.
    pub output_tx: mpsc::UnboundedSender<OutputChunk>,
    /// Present only in interactive mode.
    pub stdin_rx: Option<mpsc::UnboundedReceiver<StdinFrame>>,
    /// Flipping to true requests termination: SIGTERM, then SIGKILL after
    /// the configured grace window.
    pub cancel_rx: watch::Receiver<bool>,
    /// Reports the spawned pid once, for the job row.
    pub pid_tx: Option<oneshot::Sender<u32>>,
}

#[derive(Debug, Clone)]
pub struct AgentExit {
    pub exit_code: i32,
    /// Full collected stdout (runners scan it for sentinels / JSON payloads).
    pub stdout: String,
    /// True when the exit was forced by the cancel signal.
    pub cancelled: bool,
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Spawn the agent, stream its output until exit, and return the outcome.
    async fn run(&self, spawn: AgentSpawn, io: AgentIo) -> Result<AgentExit>;

    /// `claude --version` style health probe; Ok means authenticated.
    async fn health_check(&self) -> Result<String>;
}
