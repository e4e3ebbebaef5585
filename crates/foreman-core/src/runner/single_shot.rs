//! Single-shot runner for `code` jobs: prepare the worktree, run the agent
//! once, commit whatever it produced, and open a PR.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

use crate::agent::{AgentMode, AgentSpawn};
use crate::types::JobStatus;

use super::{
    commit_and_open_pr, prepare_worktree, resolve_repo, run_agent_streaming, system_message,
    RunnerContext,
};

pub async fn run(
    ctx: Arc<RunnerContext>,
    job: crate::types::AgentJob,
    cancel_rx: watch::Receiver<bool>,
) -> Result<()> {
    let repo = match resolve_repo(&ctx, &job) {
        Ok(repo) => repo,
        Err(e) => {
            ctx.db
                .finish_job(job.id, JobStatus::Failed, None, Some(&e.to_string()))?;
            return Ok(());
        }
    };

    let worktree = match prepare_worktree(&ctx, &job, &repo) {
        Ok(path) => path,
        Err(e) => {
            ctx.db
                .finish_job(job.id, JobStatus::Failed, None, Some(&e.to_string()))?;
            return Ok(());
        }
    };

    system_message(&ctx, job.id, &format!("Starting agent on {}", job.branch_name)).await;

    let spawn = AgentSpawn {
        prompt: job.prompt.clone(),
        mode: AgentMode::PrintJson,
        workdir: worktree.clone(),
    };
    let exit = run_agent_streaming(&ctx, job.id, spawn, cancel_rx, None).await?;

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

    match commit_and_open_pr(&ctx, &job, &repo, &worktree).await {
        Ok(Some(pr)) => {
            info!(job_id = job.id, pr = pr.number, "single-shot job opened PR");
            system_message(&ctx, job.id, &format!("Opened PR #{}: {}", pr.number, pr.url)).await;
            ctx.db.finish_job(job.id, JobStatus::Completed, Some(0), None)?;
        }
        Ok(None) => {
            // Clean exit with a clean tree: completed, flagged for visibility.
            ctx.db.finish_job(
                job.id,
                JobStatus::Completed,
                Some(0),
                Some("No changes were made"),
            )?;
        }
        Err(e) => {
            ctx.db
                .finish_job(job.id, JobStatus::Failed, Some(0), Some(&e.to_string()))?;
        }
    }

    Ok(())
}
