//! Per-story ralph runner.
//!
//! Extends the plain ralph loop with a structured plan (`prd.json`) the agent
//! edits in the worktree: one story per iteration, a commit per story, and
//! per-story completion tracking mirrored into `prd_progress` and the
//! feature's todo list.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent::{AgentMode, AgentSpawn};
use crate::types::{
    stage, AgentJob, CompletionReason, JobStatus, Prd, PrdProgress, PrdStory, StoryCommit,
};

use super::ralph::{init_progress_file, PROGRESS_FILE};
use super::{
    commit_and_open_pr, prepare_worktree, resolve_repo, run_agent_streaming, system_message,
    RunnerContext,
};

pub const PRD_FILE: &str = "prd.json";
pub const PRD_PROMISE: &str = "<promise>COMPLETE</promise>";

pub async fn run(
    ctx: Arc<RunnerContext>,
    job: AgentJob,
    cancel_rx: watch::Receiver<bool>,
) -> Result<()> {
    let Some(job_prd) = job.prd.clone() else {
        ctx.db.finish_job(
            job.id,
            JobStatus::Failed,
            None,
            Some("prd_mode job has no PRD"),
        )?;
        return Ok(());
    };
    if let Err(e) = job_prd.validate() {
        ctx.db
            .finish_job(job.id, JobStatus::Failed, None, Some(&format!("invalid PRD: {e}")))?;
        return Ok(());
    }

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

    // Seed prd.json, reconciling against a pre-existing file from an earlier
    // run on the same branch.
    let prd = seed_prd_file(&worktree, &job_prd)?;
    let mut progress = job.prd_progress.clone().unwrap_or_default();
    reconcile_progress(&mut progress, &prd);
    ctx.db.update_job_prd_progress(job.id, &progress)?;

    init_progress_file(&worktree, &job)?;
    append_story_checklist(&worktree, &prd)?;

    let max_iterations = job.max_iterations.unwrap_or(prd.stories.len() as i64 * 2).clamp(1, 100);
    let mut reason = CompletionReason::MaxIterations;
    let mut total_iterations: i64 = 0;
    let mut last_error: Option<String> = None;

    for iteration in 1..=max_iterations {
        match ctx.db.get_job(job.id)? {
            Some(fresh) if fresh.status == JobStatus::Cancelled => {
                reason = CompletionReason::ManualStop;
                break;
            }
            Some(_) => {}
            None => break,
        }

        let prd = match read_prd_file(&worktree) {
            Ok(prd) => prd,
            Err(e) => {
                warn!(job_id = job.id, iteration, "prd.json unreadable: {e}");
                last_error = Some(format!("prd.json unreadable: {e}"));
                reason = CompletionReason::IterationError;
                break;
            }
        };
        let incomplete: Vec<PrdStory> =
            prd.incomplete_stories().into_iter().cloned().collect();
        let Some(story) = incomplete.first() else {
            reason = CompletionReason::AllStoriesComplete;
            break;
        };

        let iteration_row = ctx.db.insert_iteration(job.id, iteration)?;
        ctx.db.set_job_current_iteration(job.id, iteration)?;
        progress.current_story_id = Some(story.id);
        ctx.db.update_job_prd_progress(job.id, &progress)?;
        system_message(
            &ctx,
            job.id,
            &format!(
                "Iteration {iteration}/{max_iterations}: story {}: {} ({} remaining)",
                story.id,
                story.title,
                incomplete.len()
            ),
        )
        .await;

        let prompt = build_story_prompt(&prd, story, iteration, max_iterations);
        let spawn = AgentSpawn {
            prompt: prompt.clone(),
            mode: AgentMode::PrintJson,
            workdir: worktree.clone(),
        };
        let mut exit =
            run_agent_streaming(&ctx, job.id, spawn.clone(), cancel_rx.clone(), None).await?;
        let mut promise_seen = exit.stdout.contains(PRD_PROMISE);

        if exit.exit_code != 0 && !promise_seen && !exit.cancelled {
            system_message(&ctx, job.id, "Agent exited abnormally, retrying once").await;
            exit = run_agent_streaming(&ctx, job.id, spawn, cancel_rx.clone(), None).await?;
            promise_seen = exit.stdout.contains(PRD_PROMISE);
        }

        total_iterations = iteration;

        if exit.cancelled {
            reason = CompletionReason::ManualStop;
            ctx.db.complete_iteration(
                iteration_row,
                Some(exit.exit_code as i64),
                &prompt,
                promise_seen,
                None,
                &[],
                Some(story.id),
                None,
                None,
            )?;
            break;
        }
        if exit.exit_code != 0 && !promise_seen {
            let error = format!(
                "agent failed twice in iteration {iteration} (exit {})",
                exit.exit_code
            );
            ctx.db.complete_iteration(
                iteration_row,
                Some(exit.exit_code as i64),
                &prompt,
                promise_seen,
                None,
                &[],
                Some(story.id),
                None,
                Some(&error),
            )?;
            last_error = Some(error);
            reason = CompletionReason::IterationError;
            break;
        }

        // Read back what the agent did and track newly completed stories.
        let after = read_prd_file(&worktree).unwrap_or_else(|e| {
            warn!(job_id = job.id, iteration, "prd.json unreadable after agent: {e}");
            prd.clone()
        });
        let story_sha =
            track_completed_stories(&ctx, &job, &worktree, &after, &mut progress).await?;
        ctx.db.update_job_prd_progress(job.id, &progress)?;

        // Push now so partial progress is durable; a failed push is a
        // warning, not a job failure.
        if let Err(e) = ctx.worktrees.push_branch(&worktree, &job.branch_name) {
            warn!(job_id = job.id, iteration, "intermediate push failed: {e}");
            system_message(&ctx, job.id, &format!("Warning: push failed: {e}")).await;
        }

        ctx.db.complete_iteration(
            iteration_row,
            Some(exit.exit_code as i64),
            &prompt,
            promise_seen,
            None,
            &[],
            Some(story.id),
            story_sha.as_deref(),
            None,
        )?;

        let all_pass = after.stories.iter().all(|s| s.passes);
        if all_pass {
            reason = CompletionReason::AllStoriesComplete;
            break;
        }
        if promise_seen {
            // The agent claimed completion while stories remain unchecked;
            // trust the sentinel to stop, keep the discrepancy visible.
            warn!(job_id = job.id, "sentinel emitted with incomplete stories");
            reason = CompletionReason::PromiseDetected;
            break;
        }
    }

    ctx.db.set_job_totals(job.id, total_iterations, reason)?;
    info!(
        job_id = job.id,
        total_iterations,
        reason = reason.as_str(),
        "ralph-prd loop finished"
    );

    if reason == CompletionReason::ManualStop {
        return Ok(());
    }

    // Final accounting from the on-disk PRD: recompute completion, sync the
    // feature's todos in bulk, then PR.
    if let Ok(final_prd) = read_prd_file(&worktree) {
        progress.completed_story_ids = final_prd
            .stories
            .iter()
            .filter(|s| s.passes)
            .map(|s| s.id)
            .collect();
        progress.current_story_id = None;
        ctx.db.update_job_prd_progress(job.id, &progress)?;

        if let Some(feature_id) = job.feature_id {
            for story in &final_prd.stories {
                let status = if story.passes { "done" } else { "pending" };
                if let Err(e) = ctx.db.set_todo_status(feature_id, story.id - 1, status) {
                    warn!(job_id = job.id, story = story.id, "todo sync: {e}");
                }
            }
        }
    }

    if reason == CompletionReason::IterationError {
        let _ = commit_and_open_pr(&ctx, &job, &repo, &worktree).await;
        let error = last_error.unwrap_or_else(|| "iteration error".to_string());
        ctx.db
            .finish_job(job.id, JobStatus::Failed, None, Some(&error))?;
        return Ok(());
    }

    match commit_and_open_pr(&ctx, &job, &repo, &worktree).await {
        Ok(Some(pr)) => {
            system_message(&ctx, job.id, &format!("Opened PR #{}: {}", pr.number, pr.url)).await;
            if let Some(feature_id) = job.feature_id {
                if let Err(e) = ctx.db.set_feature_stage(feature_id, stage::READY_FOR_REVIEW) {
                    warn!(job_id = job.id, "set feature stage: {e}");
                }
            }
            ctx.db.finish_job(job.id, JobStatus::Completed, Some(0), None)?;
        }
        Ok(None) => {
            ctx.db.finish_job(
                job.id,
                JobStatus::Completed,
                Some(0),
                Some("No changes were made"),
            )?;
        }
        Err(e) => {
            ctx.db
                .finish_job(job.id, JobStatus::Failed, None, Some(&e.to_string()))?;
        }
    }

    Ok(())
}

// ── prd.json handling ────────────────────────────────────────────────────

pub fn read_prd_file(worktree: &str) -> Result<Prd> {
    let path = Path::new(worktree).join(PRD_FILE);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&content).map_err(|e| anyhow!("parse {PRD_FILE}: {e}"))
}

fn write_prd_file(worktree: &str, prd: &Prd) -> Result<()> {
    let path = Path::new(worktree).join(PRD_FILE);
    let content = serde_json::to_string_pretty(prd)?;
    std::fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Write the job's PRD into the worktree. An existing file with a matching
/// title is kept (the agent's `passes` flags are the source of truth for
/// resumed branches); anything stale is overwritten.
pub fn seed_prd_file(worktree: &str, job_prd: &Prd) -> Result<Prd> {
    let path = Path::new(worktree).join(PRD_FILE);
    if path.exists() {
        if let Ok(existing) = read_prd_file(worktree) {
            if existing.title == job_prd.title {
                return Ok(existing);
            }
        }
    }
    write_prd_file(worktree, job_prd)?;
    Ok(job_prd.clone())
}

/// Fold `passes: true` entries into the progress record.
pub fn reconcile_progress(progress: &mut PrdProgress, prd: &Prd) {
    for story in prd.stories.iter().filter(|s| s.passes) {
        if !progress.completed_story_ids.contains(&story.id) {
            progress.completed_story_ids.push(story.id);
        }
    }
}

fn append_story_checklist(worktree: &str, prd: &Prd) -> Result<()> {
    use std::io::Write;
    let path = Path::new(worktree).join(PROGRESS_FILE);
    let content = std::fs::read_to_string(&path).unwrap_or_default();
    if content.contains("## Stories") {
        return Ok(());
    }
    let mut entry = String::from("\n## Stories\n\n");
    for story in &prd.stories {
        let mark = if story.passes { "x" } else { " " };
        entry.push_str(&format!("- [{mark}] story {}: {}\n", story.id, story.title));
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
    file.write_all(entry.as_bytes())?;
    Ok(())
}

// ── Story tracking ───────────────────────────────────────────────────────

/// Record every story newly flipped to `passes: true`: find its commit, add
/// it to `prd_progress`, and mark the matching todo done. Returns the sha
/// found for the first newly completed story (for the iteration row).
async fn track_completed_stories(
    ctx: &RunnerContext,
    job: &AgentJob,
    worktree: &str,
    after: &Prd,
    progress: &mut PrdProgress,
) -> Result<Option<String>> {
    let newly: Vec<&PrdStory> = after
        .stories
        .iter()
        .filter(|s| s.passes && !progress.completed_story_ids.contains(&s.id))
        .collect();

    let mut first_sha = None;
    for story in newly {
        let found = ctx
            .worktrees
            .find_commit_by_grep(worktree, &format!("story-{}", story.id))
            .or_else(|| {
                // Fallback: the newest commit, provided it is not one we
                // already attributed to an earlier story.
                let head = ctx.worktrees.head_commit(worktree)?;
                let known = progress.commits.iter().any(|c| c.sha == head.0);
                if known { None } else { Some(head) }
            });

        match found {
            Some((sha, message)) => {
                if first_sha.is_none() {
                    first_sha = Some(sha.clone());
                }
                progress.commits.push(StoryCommit {
                    story_id: story.id,
                    sha,
                    message,
                    timestamp: Utc::now(),
                });
            }
            None => {
                // Counted anyway; the PRD flag is authoritative.
                warn!(job_id = job.id, story = story.id, "no commit found for completed story");
                system_message(
                    ctx,
                    job.id,
                    &format!("Story {} marked complete without a matching commit", story.id),
                )
                .await;
            }
        }

        progress.completed_story_ids.push(story.id);

        if let Some(feature_id) = job.feature_id {
            if let Err(e) = ctx.db.set_todo_status(feature_id, story.id - 1, "done") {
                warn!(job_id = job.id, story = story.id, "todo update: {e}");
            }
        }
    }

    Ok(first_sha)
}

// ── Prompt ───────────────────────────────────────────────────────────────

pub fn build_story_prompt(prd: &Prd, story: &PrdStory, iteration: i64, max: i64) -> String {
    let mut prompt = format!(
        "# PRD: {}\n\nIteration {iteration} of {max}. Work on EXACTLY ONE user story this \
         iteration:\n\n## Story {}: {}\n",
        prd.title, story.id, story.title
    );
    if !story.description.trim().is_empty() {
        prompt.push_str(&format!("\n{}\n", story.description));
    }
    if !story.acceptance_criteria.is_empty() {
        prompt.push_str("\nAcceptance criteria:\n");
        for (i, criterion) in story.acceptance_criteria.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, criterion));
        }
    }
    prompt.push_str(&format!(
        "\nThe full PRD is in `{PRD_FILE}` in this directory.\n\n\
         Rules:\n\
         1. Implement story {} and nothing else.\n\
         2. Commit your work with the message `feat(story-{}): {}`.\n\
         3. In `{PRD_FILE}`, set \"passes\": true for exactly this story.\n\
         4. Output `{PRD_PROMISE}` only when EVERY story in `{PRD_FILE}` has \"passes\": true.\n",
        story.id, story.id, story.title
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prd(stories: &[(i64, bool)]) -> Prd {
        Prd {
            title: "Checkout".into(),
            description: String::new(),
            stories: stories
                .iter()
                .map(|(id, passes)| PrdStory {
                    id: *id,
                    title: format!("story {id}"),
                    description: String::new(),
                    acceptance_criteria: vec![],
                    passes: *passes,
                })
                .collect(),
        }
    }

    #[test]
    fn test_seed_writes_fresh_prd() {
        let tmp = tempfile::tempdir().unwrap();
        let worktree = tmp.path().to_str().unwrap();
        let seeded = seed_prd_file(worktree, &prd(&[(1, false), (2, false)])).unwrap();
        assert_eq!(seeded.stories.len(), 2);
        let on_disk = read_prd_file(worktree).unwrap();
        assert_eq!(on_disk.title, "Checkout");
    }

    #[test]
    fn test_seed_keeps_matching_existing_prd() {
        let tmp = tempfile::tempdir().unwrap();
        let worktree = tmp.path().to_str().unwrap();
        // An earlier run already completed story 1.
        write_prd_file(worktree, &prd(&[(1, true), (2, false)])).unwrap();

        let seeded = seed_prd_file(worktree, &prd(&[(1, false), (2, false)])).unwrap();
        assert!(seeded.stories[0].passes, "existing passes flags are kept");
    }

    #[test]
    fn test_seed_overwrites_stale_prd() {
        let tmp = tempfile::tempdir().unwrap();
        let worktree = tmp.path().to_str().unwrap();
        let mut other = prd(&[(1, true)]);
        other.title = "Old feature".into();
        write_prd_file(worktree, &other).unwrap();

        let seeded = seed_prd_file(worktree, &prd(&[(1, false), (2, false)])).unwrap();
        assert_eq!(seeded.stories.len(), 2);
        assert!(!seeded.stories[0].passes);
    }

    #[test]
    fn test_reconcile_collects_passing_ids_once() {
        let mut progress = PrdProgress {
            current_story_id: None,
            completed_story_ids: vec![1],
            commits: vec![],
        };
        reconcile_progress(&mut progress, &prd(&[(1, true), (2, true), (3, false)]));
        assert_eq!(progress.completed_story_ids, vec![1, 2]);
    }

    #[test]
    fn test_story_prompt_is_strict() {
        let prd = prd(&[(1, false), (2, false)]);
        let prompt = build_story_prompt(&prd, &prd.stories[0], 1, 4);
        assert!(prompt.contains("EXACTLY ONE"));
        assert!(prompt.contains("feat(story-1): story 1"));
        assert!(prompt.contains(PRD_PROMISE));
        assert!(prompt.contains("\"passes\": true"));
    }
}
