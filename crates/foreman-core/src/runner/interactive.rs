//! Interactive runner for `task` jobs.
//!
//! Same subprocess as the single-shot runner, but stdin stays open and user
//! frames are injected until the caller closes the session. The toolset is
//! restricted to read-only tools, and the job completes without any git
//! mutation.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};

use crate::agent::{AgentMode, AgentSpawn, StdinFrame};
use crate::types::JobStatus;

use super::{prepare_worktree, resolve_repo, run_agent_streaming, system_message, RunnerContext};

pub async fn run(
    ctx: Arc<RunnerContext>,
    job: crate::types::AgentJob,
    cancel_rx: watch::Receiver<bool>,
    stdin_rx: Option<mpsc::UnboundedReceiver<StdinFrame>>,
) -> Result<()> {
    let repo = match resolve_repo(&ctx, &job) {
        Ok(repo) => repo,
        Err(e) => {
            ctx.db
                .finish_job(job.id, JobStatus::Failed, None, Some(&e.to_string()))?;
            return Ok(());
        }
    };

    // Interactive sessions still get a worktree so the agent can inspect the
    // codebase, even though nothing is committed.
    let worktree = match prepare_worktree(&ctx, &job, &repo) {
        Ok(path) => path,
        Err(e) => {
            ctx.db
                .finish_job(job.id, JobStatus::Failed, None, Some(&e.to_string()))?;
            return Ok(());
        }
    };

    system_message(&ctx, job.id, "Interactive session started").await;

    let spawn = AgentSpawn {
        prompt: job.prompt.clone(),
        mode: AgentMode::Interactive,
        workdir: worktree,
    };
    let exit = run_agent_streaming(&ctx, job.id, spawn, cancel_rx, stdin_rx).await?;

    if exit.cancelled {
        ctx.db.finish_job(job.id, JobStatus::Cancelled, None, None)?;
        return Ok(());
    }
    if exit.exit_code != 0 {
        ctx.db.finish_job(
            job.id,
            JobStatus::Failed,
            Some(exit.exit_code as i64),
            Some(&format!("agent exited with code {}", exit.exit_code)),
        )?;
        return Ok(());
    }

    system_message(&ctx, job.id, "Interactive session ended").await;
    ctx.db.finish_job(job.id, JobStatus::Completed, Some(0), None)?;
    Ok(())
}
