//! Job runners and the dispatcher that routes a job row to one of them.

pub mod interactive;
pub mod ralph;
pub mod ralph_prd;
pub mod single_shot;
pub mod spec_phase;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::warn;

use crate::agent::{AgentBackend, AgentExit, AgentIo, AgentSpawn, OutputChunk, OutputStream, StdinFrame};
use crate::config::Config;
use crate::db::Db;
use crate::git::WorktreeManager;
use crate::memory::MemoryStore;
use crate::screenshots;
use crate::stream::JobStreamManager;
use crate::types::{
    is_cosmetic, AgentJob, JobStatus, JobType, MessageType, PullRequestInfo, Repository,
};

/// Everything a runner needs. One instance per process, shared by all worker
/// tasks.
pub struct RunnerContext {
    pub db: Arc<Db>,
    pub config: Arc<Config>,
    pub worktrees: Arc<WorktreeManager>,
    pub backend: Arc<dyn AgentBackend>,
    pub streams: Arc<JobStreamManager>,
    pub memory: Arc<MemoryStore>,
    /// Wakes the queue controller's admission pass.
    pub nudge_tx: mpsc::UnboundedSender<()>,
}

impl RunnerContext {
    /// Insert a job row and nudge the queue so it is picked up promptly.
    pub fn enqueue_job(&self, job: &AgentJob) -> Result<i64> {
        let id = self.db.insert_job(job)?;
        let _ = self.nudge_tx.send(());
        Ok(id)
    }
}

/// Route a job to its runner (§4.2). `stdin_rx` is Some only for interactive
/// jobs; the queue controller registered the matching sender before spawn.
pub async fn dispatch(
    ctx: Arc<RunnerContext>,
    job: AgentJob,
    cancel_rx: watch::Receiver<bool>,
    stdin_rx: Option<mpsc::UnboundedReceiver<StdinFrame>>,
) -> Result<()> {
    match (job.job_type, job.prd_mode) {
        (JobType::Code, _) => single_shot::run(ctx, job, cancel_rx).await,
        (JobType::Task, _) => interactive::run(ctx, job, cancel_rx, stdin_rx).await,
        (JobType::Ralph, false) => ralph::run(ctx, job, cancel_rx).await,
        (JobType::Ralph, true) => ralph_prd::run(ctx, job, cancel_rx).await,
        (JobType::Spec, _) => spec_phase::run(ctx, job, cancel_rx).await,
        (JobType::PrdGeneration, _) => {
            // Accepted by the queue but produced elsewhere; fail with a
            // descriptive error instead of dropping the row silently.
            ctx.db.finish_job(
                job.id,
                JobStatus::Failed,
                None,
                Some("prd_generation jobs are not executed by this worker"),
            )?;
            Ok(())
        }
    }
}

// ── Shared helpers ───────────────────────────────────────────────────────

/// Resolve the repository for a job: explicit repository_id first, then the
/// client's first repository.
pub fn resolve_repo(ctx: &RunnerContext, job: &AgentJob) -> Result<Repository> {
    if let Some(repo_id) = job.repository_id {
        return ctx
            .db
            .get_repository(repo_id)?
            .ok_or_else(|| anyhow!("repository {repo_id} not found for job {}", job.id));
    }
    ctx.db
        .get_repository_for_client(job.client_id)?
        .ok_or_else(|| anyhow!("no repository configured for client {}", job.client_id))
}

/// Mirror + fetch + worktree for the job's branch; records the path on the
/// job row.
pub fn prepare_worktree(ctx: &RunnerContext, job: &AgentJob, repo: &Repository) -> Result<String> {
    ctx.worktrees
        .ensure_bare_repo(repo)
        .with_context(|| format!("ensure mirror for {}", repo.full_name()))?;
    ctx.worktrees
        .fetch_origin(repo)
        .with_context(|| format!("fetch {}", repo.full_name()))?;
    let worktree = ctx
        .worktrees
        .create_worktree(repo, job.id, &job.branch_name)
        .with_context(|| format!("create worktree for branch {}", job.branch_name))?;
    ctx.db.set_job_worktree(job.id, &worktree)?;
    Ok(worktree)
}

/// Append a system message and mirror it onto the live stream.
pub async fn system_message(ctx: &RunnerContext, job_id: i64, text: &str) {
    if let Err(e) = ctx.db.insert_message(job_id, MessageType::System, text) {
        warn!(job_id, "insert system message: {e}");
    }
    ctx.streams.push_line(job_id, text.to_string()).await;
}

/// Spawn the agent and persist every output chunk as it arrives. The writer
/// task drains the output channel into `agent_job_messages` and the live
/// stream; the pid is recorded on the job row for the lifetime of the child.
pub async fn run_agent_streaming(
    ctx: &Arc<RunnerContext>,
    job_id: i64,
    spawn: AgentSpawn,
    cancel_rx: watch::Receiver<bool>,
    stdin_rx: Option<mpsc::UnboundedReceiver<StdinFrame>>,
) -> Result<AgentExit> {
    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<OutputChunk>();
    let (pid_tx, pid_rx) = oneshot::channel::<u32>();

    let writer_ctx = Arc::clone(ctx);
    let writer = tokio::spawn(async move {
        while let Some(chunk) = output_rx.recv().await {
            let kind = match chunk.stream {
                OutputStream::Stdout => MessageType::Stdout,
                OutputStream::Stderr => MessageType::Stderr,
            };
            if let Err(e) = writer_ctx.db.insert_message(job_id, kind, &chunk.text) {
                warn!(job_id, "insert message: {e}");
            }
            writer_ctx.streams.push_line(job_id, chunk.text).await;
        }
    });

    let pid_ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        if let Ok(pid) = pid_rx.await {
            if let Err(e) = pid_ctx.db.set_job_pid(job_id, Some(pid as i64)) {
                warn!(job_id, "record pid: {e}");
            }
        }
    });

    let io = AgentIo {
        output_tx,
        stdin_rx,
        cancel_rx,
        pid_tx: Some(pid_tx),
    };
    let exit = ctx.backend.run(spawn, io).await;

    // The backend dropped its sender; wait for the tail of the stream to be
    // persisted before the caller inspects the store.
    let _ = writer.await;
    if let Err(e) = ctx.db.set_job_pid(job_id, None) {
        warn!(job_id, "clear pid: {e}");
    }

    exit
}

/// Commit message derived from the job title.
pub fn commit_message(job: &AgentJob) -> String {
    if job.title.trim().is_empty() {
        "feat: automated changes".to_string()
    } else {
        format!("feat: {}", job.title.trim())
    }
}

/// Commit, push, and open a PR for whatever the agent produced. Returns None
/// when the worktree holds no commits at all (nothing to PR). Also records
/// branch/PR rows and, for cosmetic features, collects screenshots.
pub async fn commit_and_open_pr(
    ctx: &RunnerContext,
    job: &AgentJob,
    repo: &Repository,
    worktree: &str,
) -> Result<Option<PullRequestInfo>> {
    ctx.worktrees
        .commit_and_push(worktree, &job.branch_name, &commit_message(job))?;

    if !ctx.worktrees.has_commits(repo, worktree) {
        return Ok(None);
    }

    let title = if job.title.trim().is_empty() {
        job.branch_name.clone()
    } else {
        job.title.clone()
    };
    let body = format!("Automated implementation for job #{}.", job.id);
    let pr = ctx
        .worktrees
        .create_pull_request(repo, worktree, &job.branch_name, &title, &body)?;

    ctx.db.upsert_branch(repo.id, &job.branch_name, job.id)?;
    ctx.db.upsert_pull_request(repo.id, &pr, job.id)?;
    ctx.db.set_job_pr(job.id, &pr)?;

    collect_feature_screenshots(ctx, job, worktree).await;

    Ok(Some(pr))
}

/// For cosmetic-typed features, record any UI screenshots the test run left
/// behind. Best-effort: failures are logged, never fatal.
async fn collect_feature_screenshots(ctx: &RunnerContext, job: &AgentJob, worktree: &str) {
    let Some(feature_id) = job.feature_id else {
        return;
    };
    let feature = match ctx.db.get_feature(feature_id) {
        Ok(Some(f)) => f,
        Ok(None) => return,
        Err(e) => {
            warn!(job_id = job.id, "load feature for screenshots: {e}");
            return;
        }
    };
    if !is_cosmetic(feature.feature_type.as_deref()) {
        return;
    }
    let shots = screenshots::collect_screenshots(worktree);
    if shots.is_empty() {
        return;
    }
    system_message(ctx, job.id, &format!("Collected {} screenshots", shots.len())).await;
    for shot in shots {
        if let Err(e) = ctx.db.insert_attachment(
            Some(job.id),
            Some(feature_id),
            "screenshot",
            &shot.to_string_lossy(),
        ) {
            warn!(job_id = job.id, "record screenshot: {e}");
        }
    }
}
