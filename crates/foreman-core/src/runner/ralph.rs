//! Bounded-iteration ("ralph") runner.
//!
//! Drives the agent through up to `max_iterations` passes against one
//! worktree. Cross-iteration memory lives in `.ralph-progress.md` inside the
//! worktree: the agent owns its content, the runner owns its existence and
//! appends iteration summaries and feedback results.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent::{AgentExit, AgentMode, AgentSpawn};
use crate::types::{AgentJob, CompletionReason, FeedbackResult, JobStatus};

use super::{
    commit_and_open_pr, prepare_worktree, resolve_repo, run_agent_streaming, system_message,
    RunnerContext,
};

pub const PROGRESS_FILE: &str = ".ralph-progress.md";
const SUMMARY_CAP_BYTES: usize = 2048;
const FEEDBACK_STREAM_CAP_BYTES: usize = 5 * 1024;
const FALLBACK_SUMMARY_LINES: usize = 10;

pub async fn run(
    ctx: Arc<RunnerContext>,
    job: AgentJob,
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

    init_progress_file(&worktree, &job)?;

    let max_iterations = job.max_iterations.unwrap_or(10).clamp(1, 100);
    let promise = job.promise().to_string();
    let mut reason = CompletionReason::MaxIterations;
    let mut total_iterations: i64 = 0;
    let mut last_error: Option<String> = None;

    for iteration in 1..=max_iterations {
        // Cooperative stop: a cancelled row observed at the top of the
        // iteration ends the loop without touching the current worktree.
        match ctx.db.get_job(job.id)? {
            Some(fresh) if fresh.status == JobStatus::Cancelled => {
                reason = CompletionReason::ManualStop;
                break;
            }
            Some(_) => {}
            None => break,
        }

        let iteration_row = ctx.db.insert_iteration(job.id, iteration)?;
        ctx.db.set_job_current_iteration(job.id, iteration)?;
        system_message(&ctx, job.id, &format!("Iteration {iteration}/{max_iterations}")).await;

        let progress = std::fs::read_to_string(Path::new(&worktree).join(PROGRESS_FILE))
            .unwrap_or_default();
        let prompt = build_iteration_prompt(&job, iteration, max_iterations, &promise, &progress);

        let spawn = AgentSpawn {
            prompt: prompt.clone(),
            mode: AgentMode::PrintJson,
            workdir: worktree.clone(),
        };
        let mut exit =
            run_agent_streaming(&ctx, job.id, spawn.clone(), cancel_rx.clone(), None).await?;
        let mut promise_seen = exit.stdout.contains(&promise);

        // One retry per iteration on a crash without a sentinel.
        if exit.exit_code != 0 && !promise_seen && !exit.cancelled {
            warn!(job_id = job.id, iteration, code = exit.exit_code, "agent crashed, retrying");
            system_message(&ctx, job.id, "Agent exited abnormally, retrying once").await;
            exit = run_agent_streaming(&ctx, job.id, spawn, cancel_rx.clone(), None).await?;
            promise_seen = exit.stdout.contains(&promise);
        }

        total_iterations = iteration;

        if exit.cancelled {
            reason = CompletionReason::ManualStop;
            finish_iteration(&ctx, iteration_row, &exit, &prompt, promise_seen, &[], None)?;
            break;
        }

        if exit.exit_code != 0 && !promise_seen {
            reason = CompletionReason::IterationError;
            let error = format!("agent failed twice in iteration {iteration} (exit {})", exit.exit_code);
            finish_iteration(
                &ctx,
                iteration_row,
                &exit,
                &prompt,
                promise_seen,
                &[],
                Some(&error),
            )?;
            last_error = Some(error);
            break;
        }

        let feedback = if job.feedback_commands.is_empty() {
            Vec::new()
        } else {
            let results = run_feedback_commands(
                &job.feedback_commands,
                &worktree,
                Duration::from_secs(ctx.config.feedback_timeout_s),
            )
            .await;
            append_feedback_results(&worktree, iteration, &results)?;
            results
        };

        let summary = extract_summary(&exit.stdout);
        append_iteration_summary(&worktree, iteration, &summary)?;

        finish_iteration_full(
            &ctx,
            iteration_row,
            &exit,
            &prompt,
            promise_seen,
            Some(&summary),
            &feedback,
            None,
        )?;

        if promise_seen {
            reason = CompletionReason::PromiseDetected;
            break;
        }
    }

    ctx.db.set_job_totals(job.id, total_iterations, reason)?;
    info!(
        job_id = job.id,
        total_iterations,
        reason = reason.as_str(),
        "ralph loop finished"
    );

    if reason == CompletionReason::ManualStop {
        // The row is already cancelled; leave the worktree as-is.
        return Ok(());
    }

    // Whatever was produced gets committed and, when commits exist, a PR,
    // including partial progress from an errored run.
    let pr_outcome = commit_and_open_pr(&ctx, &job, &repo, &worktree).await;

    if reason == CompletionReason::IterationError {
        let error = last_error.unwrap_or_else(|| "iteration error".to_string());
        ctx.db
            .finish_job(job.id, JobStatus::Failed, None, Some(&error))?;
        return Ok(());
    }

    match pr_outcome {
        Ok(Some(pr)) => {
            system_message(&ctx, job.id, &format!("Opened PR #{}: {}", pr.number, pr.url)).await;
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

fn finish_iteration(
    ctx: &RunnerContext,
    iteration_row: i64,
    exit: &AgentExit,
    prompt: &str,
    promise_seen: bool,
    feedback: &[FeedbackResult],
    error: Option<&str>,
) -> Result<()> {
    finish_iteration_full(ctx, iteration_row, exit, prompt, promise_seen, None, feedback, error)
}

#[allow(clippy::too_many_arguments)]
fn finish_iteration_full(
    ctx: &RunnerContext,
    iteration_row: i64,
    exit: &AgentExit,
    prompt: &str,
    promise_seen: bool,
    summary: Option<&str>,
    feedback: &[FeedbackResult],
    error: Option<&str>,
) -> Result<()> {
    ctx.db.complete_iteration(
        iteration_row,
        Some(exit.exit_code as i64),
        prompt,
        promise_seen,
        summary,
        feedback,
        None,
        None,
        error,
    )
}

// ── Progress file ────────────────────────────────────────────────────────

pub fn init_progress_file(worktree: &str, job: &AgentJob) -> Result<()> {
    let path = Path::new(worktree).join(PROGRESS_FILE);
    if path.exists() {
        return Ok(());
    }
    let header = format!(
        "# Ralph Progress\n\n\
         - Job: #{}\n\
         - Branch: {}\n\
         - Started: {}\n\n\
         ## Codebase Patterns\n\n\
         (conventions discovered while working; keep this list current)\n",
        job.id,
        job.branch_name,
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
    );
    std::fs::write(&path, header)?;
    Ok(())
}

fn append_to_progress(worktree: &str, entry: &str) -> Result<()> {
    use std::io::Write;
    let path = Path::new(worktree).join(PROGRESS_FILE);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    file.write_all(entry.as_bytes())?;
    Ok(())
}

fn append_iteration_summary(worktree: &str, iteration: i64, summary: &str) -> Result<()> {
    append_to_progress(worktree, &format!("\n## Iteration {iteration}\n\n{summary}\n"))
}

fn append_feedback_results(
    worktree: &str,
    iteration: i64,
    results: &[FeedbackResult],
) -> Result<()> {
    let mut entry = format!("\n### Feedback Results (Iteration {iteration})\n\n");
    for result in results {
        let status = if result.passed { "PASS" } else { "FAIL" };
        entry.push_str(&format!("- `{}`: {} (exit {})\n", result.command, status, result.exit_code));
        if !result.passed && !result.stderr.trim().is_empty() {
            let tail: String = result.stderr.lines().rev().take(3).collect::<Vec<_>>()
                .into_iter().rev().collect::<Vec<_>>().join("\n  ");
            entry.push_str(&format!("  {tail}\n"));
        }
    }
    append_to_progress(worktree, &entry)
}

// ── Prompt ───────────────────────────────────────────────────────────────

pub fn build_iteration_prompt(
    job: &AgentJob,
    iteration: i64,
    max_iterations: i64,
    promise: &str,
    progress: &str,
) -> String {
    let mut prompt = String::new();
    if !job.prompt.trim().is_empty() {
        prompt.push_str(&job.prompt);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!(
        "## Iteration {iteration} of {max_iterations}\n\n\
         You are one pass of a bounded loop working toward the task above. \
         Progress from earlier iterations is recorded below; continue from it \
         instead of starting over.\n\n"
    ));
    prompt.push_str(&format!("## Progress file ({PROGRESS_FILE})\n\n{progress}\n\n"));
    prompt.push_str(&format!(
        "## Instructions\n\
         1. Pick up the next unfinished piece of work and complete it.\n\
         2. Commit your changes with git.\n\
         3. Record anything worth remembering under \"Codebase Patterns\" in {PROGRESS_FILE}.\n\
         4. End your response with a `## Summary` section describing what you did.\n\
         5. Only if the entire task is fully complete, output `{promise}` on its own line.\n"
    ));
    prompt
}

// ── Summary extraction ───────────────────────────────────────────────────

/// The block under a `## Summary` heading (case-insensitive) up to the next
/// `##` heading or `---` rule; falls back to the last ~10 non-blank lines.
/// Capped at 2 KB either way.
pub fn extract_summary(output: &str) -> String {
    let mut lines = output.lines();
    let mut collected: Vec<&str> = Vec::new();
    let mut in_summary = false;

    for line in lines.by_ref() {
        let trimmed = line.trim();
        if !in_summary {
            if trimmed.to_lowercase().starts_with("## summary") {
                in_summary = true;
            }
            continue;
        }
        if trimmed.starts_with("##") || trimmed.starts_with("---") {
            break;
        }
        collected.push(line);
    }

    let summary = if in_summary {
        collected.join("\n").trim().to_string()
    } else {
        output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .rev()
            .take(FALLBACK_SUMMARY_LINES)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n")
    };

    cap_bytes(&summary, SUMMARY_CAP_BYTES)
}

fn cap_bytes(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

// ── Feedback commands ────────────────────────────────────────────────────

/// Run each feedback command through `sh -c` in the worktree with a timeout.
/// Failures are recorded, never fatal to the job.
pub async fn run_feedback_commands(
    commands: &[String],
    worktree: &str,
    timeout: Duration,
) -> Vec<FeedbackResult> {
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        let run = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(worktree)
            .kill_on_drop(true)
            .output();
        let result = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(1);
                FeedbackResult {
                    command: command.clone(),
                    exit_code,
                    passed: exit_code == 0,
                    stdout: cap_bytes(
                        &String::from_utf8_lossy(&output.stdout),
                        FEEDBACK_STREAM_CAP_BYTES,
                    ),
                    stderr: cap_bytes(
                        &String::from_utf8_lossy(&output.stderr),
                        FEEDBACK_STREAM_CAP_BYTES,
                    ),
                }
            }
            Ok(Err(e)) => FeedbackResult {
                command: command.clone(),
                exit_code: 1,
                passed: false,
                stdout: String::new(),
                stderr: format!("failed to run: {e}"),
            },
            Err(_) => FeedbackResult {
                command: command.clone(),
                exit_code: 124,
                passed: false,
                stdout: String::new(),
                stderr: format!("timed out after {}s", timeout.as_secs()),
            },
        };
        results.push(result);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{new_job, JobType};

    #[test]
    fn test_extract_summary_block() {
        let output = "I did some work.\n\n## Summary\nAdded the login page.\nWired the router.\n\n## Next steps\nmore";
        let summary = extract_summary(output);
        assert_eq!(summary, "Added the login page.\nWired the router.");
    }

    #[test]
    fn test_extract_summary_is_case_insensitive_and_stops_at_rule() {
        let output = "## SUMMARY\nline one\n---\nignored";
        assert_eq!(extract_summary(output), "line one");
    }

    #[test]
    fn test_extract_summary_fallback_last_lines() {
        let output = (1..=15).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n\n");
        let summary = extract_summary(&output);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], "line 6");
        assert_eq!(lines[9], "line 15");
    }

    #[test]
    fn test_extract_summary_is_capped() {
        let output = format!("## Summary\n{}", "x".repeat(5000));
        assert!(extract_summary(&output).len() <= SUMMARY_CAP_BYTES);
    }

    #[test]
    fn test_iteration_prompt_carries_context() {
        let mut job = new_job(1, JobType::Ralph, "m");
        job.prompt = "Build the widget".into();
        let prompt = build_iteration_prompt(&job, 2, 5, "RALPH_COMPLETE", "## Iteration 1\ndid things");
        assert!(prompt.contains("Build the widget"));
        assert!(prompt.contains("Iteration 2 of 5"));
        assert!(prompt.contains("did things"));
        assert!(prompt.contains("RALPH_COMPLETE"));
        assert!(prompt.contains("## Summary"));
    }

    #[tokio::test]
    async fn test_feedback_commands_capture_exit_and_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let worktree = tmp.path().to_str().unwrap().to_string();
        let commands = vec![
            "true".to_string(),
            "echo oops >&2; exit 3".to_string(),
            "sleep 5".to_string(),
        ];
        let results =
            run_feedback_commands(&commands, &worktree, Duration::from_millis(300)).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert_eq!(results[1].exit_code, 3);
        assert!(results[1].stderr.contains("oops"));
        assert!(!results[2].passed);
        assert_eq!(results[2].exit_code, 124);
    }

    #[test]
    fn test_progress_file_init_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let worktree = tmp.path().to_str().unwrap();
        let mut job = new_job(1, JobType::Ralph, "m");
        job.branch_name = "ralph/widget".into();

        init_progress_file(worktree, &job).unwrap();
        let first = std::fs::read_to_string(tmp.path().join(PROGRESS_FILE)).unwrap();
        assert!(first.contains("Codebase Patterns"));
        assert!(first.contains("ralph/widget"));

        append_iteration_summary(worktree, 1, "made progress").unwrap();
        init_progress_file(worktree, &job).unwrap();
        let second = std::fs::read_to_string(tmp.path().join(PROGRESS_FILE)).unwrap();
        assert!(second.contains("made progress"));
    }
}
