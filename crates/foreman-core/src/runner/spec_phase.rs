//! Spec phase runner: executes one phase of the spec pipeline and, gates
//! permitting, enqueues the successor phase through the same queue.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent::{AgentMode, AgentSpawn};
use crate::spec::{
    build_phase_prompt, build_recovery_prompt, judge, merge_phase_slice, parse,
};
use crate::types::{
    new_job, stage, AgentJob, Client, Feature, JobStatus, JobType, SpecOutput, SpecPhase,
};

use super::{prepare_worktree, resolve_repo, run_agent_streaming, system_message, RunnerContext};

const RECOVERY_TAIL_BYTES: usize = 15 * 1024;
const FAILURE_TAIL_BYTES: usize = 2 * 1024;
const JUDGE_MAX_ROUNDS: usize = 3;

pub async fn run(
    ctx: Arc<RunnerContext>,
    job: AgentJob,
    cancel_rx: watch::Receiver<bool>,
) -> Result<()> {
    let phase = job.spec_phase.unwrap_or(SpecPhase::Constitution);

    let Some(client) = ctx.db.get_client(job.client_id)? else {
        ctx.db
            .finish_job(job.id, JobStatus::Failed, None, Some("client not found"))?;
        return Ok(());
    };

    // Constitution regeneration is client-scoped: a missing feature is legal
    // for that phase only.
    let feature = match job.feature_id {
        Some(feature_id) => match ctx.db.get_feature(feature_id)? {
            Some(feature) => Some(feature),
            None => {
                ctx.db.finish_job(
                    job.id,
                    JobStatus::Failed,
                    None,
                    Some(&format!("feature {feature_id} not found")),
                )?;
                return Ok(());
            }
        },
        None if phase == SpecPhase::Constitution => None,
        None => {
            ctx.db.finish_job(
                job.id,
                JobStatus::Failed,
                None,
                Some(&format!("spec job for phase {} has no feature", phase.as_str())),
            )?;
            return Ok(());
        }
    };

    let repo = match resolve_repo(&ctx, &job) {
        Ok(repo) => repo,
        Err(e) => {
            ctx.db
                .finish_job(job.id, JobStatus::Failed, None, Some(&e.to_string()))?;
            return Ok(());
        }
    };
    // A worktree even for read-only phases: the agent inspects the codebase.
    let worktree = match prepare_worktree(&ctx, &job, &repo) {
        Ok(path) => path,
        Err(e) => {
            ctx.db
                .finish_job(job.id, JobStatus::Failed, None, Some(&e.to_string()))?;
            return Ok(());
        }
    };

    if let Some(feature) = &feature {
        if let Err(e) = ctx.db.set_feature_stage(feature.id, &stage::running(phase)) {
            warn!(job_id = job.id, "set running stage: {e}");
        }
    }

    // Best-effort memory recall; failures never block the phase.
    let recall_query = feature.as_ref().map(|f| f.title.as_str()).unwrap_or("");
    let memory_notes = ctx.memory.recall(job.client_id, recall_query, 5);

    let mut output = feature
        .as_ref()
        .and_then(|f| f.spec_output.clone())
        .or_else(|| job.spec_output.clone())
        .unwrap_or_default();

    let force_regenerate = job
        .spec_output
        .as_ref()
        .and_then(|o| o.force_regenerate)
        .unwrap_or(false);

    let reused_constitution = phase == SpecPhase::Constitution
        && !force_regenerate
        && client.constitution.as_deref().map(|c| !c.trim().is_empty()).unwrap_or(false);

    if reused_constitution {
        // The client already has a constitution; skip the agent entirely.
        output.constitution = client.constitution.clone();
        output.phase = Some(SpecPhase::Constitution);
        system_message(&ctx, job.id, "Reusing stored client constitution").await;
    } else {
        let feature_title = feature.as_ref().map(|f| f.title.as_str()).unwrap_or("client constitution");
        let feature_notes = feature.as_ref().map(|f| f.notes.as_str()).unwrap_or("");
        let prompt = build_phase_prompt(
            phase,
            feature_title,
            feature_notes,
            client.constitution.as_deref(),
            &output,
            &memory_notes,
        );

        let spawn = AgentSpawn {
            prompt,
            mode: AgentMode::Text,
            workdir: worktree.clone(),
        };
        let exit = run_agent_streaming(&ctx, job.id, spawn, cancel_rx.clone(), None).await?;
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

        // Parse, with one recovery round on failure.
        match parse_and_merge(&mut output, phase, &exit.stdout) {
            Ok(()) => {}
            Err(first_err) => {
                system_message(
                    &ctx,
                    job.id,
                    &format!("Output parse failed ({first_err}); attempting recovery"),
                )
                .await;
                let recovery = AgentSpawn {
                    prompt: build_recovery_prompt(
                        phase,
                        parse::output_tail(&exit.stdout, RECOVERY_TAIL_BYTES),
                    ),
                    mode: AgentMode::Text,
                    workdir: worktree.clone(),
                };
                let retry = run_agent_streaming(&ctx, job.id, recovery, cancel_rx.clone(), None)
                    .await?;
                if retry.cancelled {
                    ctx.db.finish_job(job.id, JobStatus::Cancelled, None, None)?;
                    return Ok(());
                }
                if let Err(second_err) = parse_and_merge(&mut output, phase, &retry.stdout) {
                    let truncated = if parse::truncation_likely(&exit.stdout) {
                        " (output looks truncated)"
                    } else {
                        ""
                    };
                    let error = format!(
                        "unparseable {} output after recovery: {second_err}{truncated}; tail: {}",
                        phase.as_str(),
                        parse::output_tail(&retry.stdout, FAILURE_TAIL_BYTES)
                    );
                    ctx.db
                        .finish_job(job.id, JobStatus::Failed, Some(0), Some(&error))?;
                    return Ok(());
                }
            }
        }
    }

    persist_output(&ctx, &job, &client, feature.as_ref(), phase, &output)?;
    let subject = feature
        .as_ref()
        .map(|f| f.title.clone())
        .unwrap_or_else(|| client.name.clone());
    ctx.memory
        .record(job.client_id, format!("{} phase completed for {subject}", phase.as_str()));

    // Gate handling and successor enqueue.
    match phase {
        SpecPhase::Clarify if output.unanswered_clarifications() > 0 => {
            if let Some(feature) = &feature {
                ctx.db.set_feature_stage(feature.id, stage::CLARIFY_WAITING)?;
            }
            system_message(
                &ctx,
                job.id,
                &format!(
                    "{} clarifications awaiting answers; pipeline paused",
                    output.unanswered_clarifications()
                ),
            )
            .await;
        }
        SpecPhase::Analyze => {
            let passed = run_analyze_gate(&ctx, &job, &client, feature.as_ref(), &mut output).await?;
            if passed {
                if let Some(feature) = &feature {
                    ctx.db.set_feature_stage(feature.id, &stage::complete(phase))?;
                }
                enqueue_next_phase(&ctx, &job, SpecPhase::Tasks)?;
            } else if let Some(feature) = &feature {
                ctx.db.set_feature_stage(feature.id, stage::ANALYZE_FAILED)?;
            }
        }
        SpecPhase::Tasks => {
            if let Some(feature) = &feature {
                ctx.db.set_feature_stage(feature.id, &stage::complete(phase))?;
                ctx.db.set_feature_stage(feature.id, stage::SPEC_COMPLETE)?;
            }
            system_message(&ctx, job.id, "Spec pipeline complete").await;
        }
        _ => {
            if let Some(feature) = &feature {
                ctx.db.set_feature_stage(feature.id, &stage::complete(phase))?;
                if let Some(next) = phase.next() {
                    enqueue_next_phase(&ctx, &job, next)?;
                }
            }
            // Client-scoped constitution runs end here: output persisted to
            // the client, no successor.
        }
    }

    ctx.db.finish_job(job.id, JobStatus::Completed, Some(0), None)?;
    Ok(())
}

fn parse_and_merge(output: &mut SpecOutput, phase: SpecPhase, raw: &str) -> Result<()> {
    let candidate = parse::extract_json_payload(raw)
        .ok_or_else(|| anyhow!("no JSON payload in agent output"))?;
    let value = parse::parse_json_lenient(&candidate)?;
    merge_phase_slice(output, phase, &value)
}

fn persist_output(
    ctx: &RunnerContext,
    job: &AgentJob,
    client: &Client,
    feature: Option<&Feature>,
    phase: SpecPhase,
    output: &SpecOutput,
) -> Result<()> {
    if let Some(feature) = feature {
        ctx.db.update_feature_spec_output(feature.id, output)?;
    }
    ctx.db.update_job_spec_output(job.id, output)?;
    if phase == SpecPhase::Constitution {
        if let Some(constitution) = &output.constitution {
            ctx.db.update_client_constitution(client.id, constitution)?;
        }
    }
    Ok(())
}

/// Judge + auto-improve loop for the analyze gate (§4.6). The improved plan
/// replaces the stored one; the final verdict lands in `analysis`.
async fn run_analyze_gate(
    ctx: &RunnerContext,
    job: &AgentJob,
    client: &Client,
    feature: Option<&Feature>,
    output: &mut SpecOutput,
) -> Result<bool> {
    let constitution = output.constitution.clone();
    let spec_doc = output.spec.clone();
    let mut plan = output.plan.clone().unwrap_or_default();

    let mut verdict = judge::judge(constitution.as_deref(), spec_doc.as_ref(), &plan);
    let mut rounds = 0;
    while !verdict.passed && rounds < JUDGE_MAX_ROUNDS {
        rounds += 1;
        system_message(
            ctx,
            job.id,
            &format!("Plan judge failed (round {rounds}); auto-improving"),
        )
        .await;
        plan = judge::improve(&plan, spec_doc.as_ref(), &verdict);
        verdict = judge::judge(constitution.as_deref(), spec_doc.as_ref(), &plan);
        if verdict.passed {
            system_message(ctx, job.id, "Auto-improve succeeded").await;
        }
    }

    // Fold the verdict into the analysis slice, keeping whatever patterns the
    // agent surfaced.
    let mut analysis = output.analysis.clone().unwrap_or_default();
    analysis.passed = verdict.passed;
    for criterion in verdict.criteria.iter().filter(|c| !c.passed) {
        analysis.issues.push(format!("{}: {}", criterion.name, criterion.note));
    }
    for improvement in &verdict.improvements {
        if !analysis.suggestions.contains(improvement) {
            analysis.suggestions.push(improvement.clone());
        }
    }
    output.analysis = Some(analysis);
    output.plan = Some(plan);
    persist_output(ctx, job, client, feature, SpecPhase::Analyze, output)?;

    info!(
        job_id = job.id,
        passed = verdict.passed,
        rounds,
        "analyze gate finished"
    );
    Ok(verdict.passed)
}

/// Create the successor spec job (same client, feature, repo, branch) and
/// nudge the queue.
pub fn enqueue_next_phase(ctx: &RunnerContext, job: &AgentJob, next: SpecPhase) -> Result<i64> {
    let mut successor = new_job(job.client_id, JobType::Spec, &job.target_machine);
    successor.feature_id = job.feature_id;
    successor.repository_id = job.repository_id;
    successor.branch_name = job.branch_name.clone();
    let base = job.title.split(" - ").next().unwrap_or("spec").trim();
    successor.title = format!("{base} - {} phase", next.as_str());
    successor.spec_phase = Some(next);
    let id = ctx.enqueue_job(&successor)?;
    info!(job_id = job.id, successor = id, phase = next.as_str(), "enqueued next spec phase");
    Ok(id)
}

// ── Clarification submission (out-of-band) ───────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClarifyOutcome {
    /// Response stored; this many questions remain unanswered.
    Answered { remaining: usize },
    /// Last answer landed: stage moved to clarify_complete and a plan job
    /// was enqueued.
    Complete { plan_job_id: i64 },
}

/// Store the response to one clarification. When the final unanswered
/// question is resolved, the feature advances and a `plan` phase job is
/// enqueued automatically.
pub fn submit_clarification(
    ctx: &RunnerContext,
    feature_id: i64,
    clarification_id: &str,
    response: &str,
) -> Result<Option<ClarifyOutcome>> {
    let Some(feature) = ctx.db.get_feature(feature_id)? else {
        return Ok(None);
    };
    let Some(mut output) = feature.spec_output.clone() else {
        return Ok(None);
    };
    let Some(clarifications) = output.clarifications.as_mut() else {
        return Ok(None);
    };
    let Some(entry) = clarifications.iter_mut().find(|c| c.id == clarification_id) else {
        return Ok(None);
    };

    entry.response = Some(response.to_string());
    entry.responded_at = Some(Utc::now());
    ctx.db.update_feature_spec_output(feature_id, &output)?;

    let remaining = output.unanswered_clarifications();
    if remaining > 0 {
        return Ok(Some(ClarifyOutcome::Answered { remaining }));
    }

    ctx.db.set_feature_stage(feature_id, &stage::complete(SpecPhase::Clarify))?;

    let repo = ctx.db.get_repository_for_client(feature.client_id)?;
    let mut plan_job = new_job(feature.client_id, JobType::Spec, &ctx.config.machine_id);
    plan_job.feature_id = Some(feature_id);
    plan_job.repository_id = repo.map(|r| r.id);
    plan_job.branch_name = format!("spec/feature-{feature_id}");
    plan_job.title = format!("{} - plan phase", feature.title);
    plan_job.spec_phase = Some(SpecPhase::Plan);
    let plan_job_id = ctx.enqueue_job(&plan_job)?;

    Ok(Some(ClarifyOutcome::Complete { plan_job_id }))
}
