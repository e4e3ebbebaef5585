//! Spec pipeline: phase metadata, prompt assembly, and SpecOutput merging.
//!
//! Phases form a linear DAG (constitution → specify → clarify → plan →
//! analyze → tasks). Each phase job parses one JSON slice out of the agent's
//! output and merges it into the feature's SpecOutput, preserving the slices
//! earlier phases wrote.

pub mod judge;
pub mod parse;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::types::{
    AnalysisDoc, Clarification, PlanDoc, SpecDoc, SpecOutput, SpecPhase, SpecTask,
};

// ── Phase metadata ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseMeta {
    pub phase: SpecPhase,
    pub label: &'static str,
    pub description: &'static str,
    pub requires_human_input: bool,
}

pub fn phase_metadata() -> Vec<PhaseMeta> {
    SpecPhase::ALL
        .into_iter()
        .map(|phase| PhaseMeta {
            phase,
            label: match phase {
                SpecPhase::Constitution => "Constitution",
                SpecPhase::Specify => "Specify",
                SpecPhase::Clarify => "Clarify",
                SpecPhase::Plan => "Plan",
                SpecPhase::Analyze => "Analyze",
                SpecPhase::Tasks => "Tasks",
            },
            description: match phase {
                SpecPhase::Constitution => {
                    "Establish the client's engineering principles and constraints"
                }
                SpecPhase::Specify => "Write the feature specification from title and notes",
                SpecPhase::Clarify => "Surface open questions that need a human answer",
                SpecPhase::Plan => "Produce the technical plan for the specification",
                SpecPhase::Analyze => "Judge the plan against the spec and auto-improve it",
                SpecPhase::Tasks => "Break the plan into ordered implementation tasks",
            },
            requires_human_input: phase.requires_human_input(),
        })
        .collect()
}

// ── Expected payload shapes ──────────────────────────────────────────────

/// Textual schema for a phase's JSON payload; inlined into phase prompts and
/// into the one-shot recovery prompt.
pub fn phase_schema(phase: SpecPhase) -> &'static str {
    match phase {
        SpecPhase::Constitution => {
            r#"{"constitution": "<markdown document>"}"#
        }
        SpecPhase::Specify => {
            r#"{"spec": {"overview": "...", "requirements": ["..."], "acceptanceCriteria": ["..."], "outOfScope": ["..."]}}"#
        }
        SpecPhase::Clarify => {
            r#"{"clarifications": [{"id": "CLR-001", "question": "...", "context": "..."}]}"#
        }
        SpecPhase::Plan => {
            r#"{"plan": {"architecture": "...", "techDecisions": ["..."], "fileStructure": ["..."], "dependencies": ["..."]}}"#
        }
        SpecPhase::Analyze => {
            r#"{"analysis": {"passed": true, "issues": ["..."], "suggestions": ["..."], "existingPatterns": ["..."]}}"#
        }
        SpecPhase::Tasks => {
            r#"{"tasks": [{"id": "T-001", "title": "...", "description": "...", "files": ["..."], "dependencies": []}]}"#
        }
    }
}

// ── Prompt assembly ──────────────────────────────────────────────────────

/// Build the full prompt for one phase, inlining the relevant slices of the
/// existing SpecOutput plus any recalled memory notes.
pub fn build_phase_prompt(
    phase: SpecPhase,
    feature_title: &str,
    feature_notes: &str,
    client_constitution: Option<&str>,
    existing: &SpecOutput,
    memory_notes: &[String],
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "# Spec pipeline: {} phase\n\nFeature: {feature_title}\n",
        phase.as_str()
    ));
    if !feature_notes.trim().is_empty() {
        prompt.push_str(&format!("\nNotes:\n{feature_notes}\n"));
    }

    if let Some(constitution) = client_constitution.filter(|c| !c.trim().is_empty()) {
        if phase != SpecPhase::Constitution {
            prompt.push_str("\n## Client constitution\n");
            prompt.push_str(constitution);
            prompt.push('\n');
        }
    }

    match phase {
        SpecPhase::Constitution => {
            prompt.push_str(
                "\nWrite an engineering constitution for this client: principles, coding \
                 standards, review expectations, and constraints that apply to every feature. \
                 Inspect the repository you are running in for conventions worth codifying.\n",
            );
        }
        SpecPhase::Specify => {
            prompt.push_str(
                "\nWrite the feature specification: an overview, concrete requirements, \
                 acceptance criteria, and an explicit out-of-scope list. Ground it in the \
                 codebase you are running in.\n",
            );
        }
        SpecPhase::Clarify => {
            if let Some(spec) = &existing.spec {
                prompt.push_str("\n## Current specification\n");
                push_json(&mut prompt, spec);
            }
            prompt.push_str(
                "\nList the questions that must be answered by a human before planning can \
                 start. Only ask what genuinely blocks the plan; an empty list is a valid \
                 answer. Give each question a stable id like CLR-001.\n",
            );
        }
        SpecPhase::Plan => {
            if let Some(spec) = &existing.spec {
                prompt.push_str("\n## Specification\n");
                push_json(&mut prompt, spec);
            }
            if let Some(clarifications) = &existing.clarifications {
                prompt.push_str("\n## Clarifications\n");
                push_json(&mut prompt, clarifications);
            }
            prompt.push_str(
                "\nProduce the technical plan: architecture, technology decisions, the file \
                 structure to be created or modified, and dependencies.\n",
            );
        }
        SpecPhase::Analyze => {
            if let Some(plan) = &existing.plan {
                prompt.push_str("\n## Plan under review\n");
                push_json(&mut prompt, plan);
            }
            prompt.push_str(
                "\nAnalyze the plan against the specification and the codebase: issues, \
                 suggestions, and existing patterns the implementation should reuse.\n",
            );
        }
        SpecPhase::Tasks => {
            if let Some(plan) = &existing.plan {
                prompt.push_str("\n## Plan\n");
                push_json(&mut prompt, plan);
            }
            prompt.push_str(
                "\nBreak the plan into ordered implementation tasks. Each task should be \
                 completable in one sitting and name the files it touches.\n",
            );
        }
    }

    if !memory_notes.is_empty() {
        prompt.push_str("\n## Relevant notes from past work\n");
        for note in memory_notes {
            prompt.push_str(&format!("- {note}\n"));
        }
    }

    prompt.push_str(&format!(
        "\nRespond with a single ```json block matching exactly this shape:\n{}\n",
        phase_schema(phase)
    ));
    prompt
}

/// One-shot recovery prompt: the expected schema plus the tail of the failed
/// output, asking for the payload again.
pub fn build_recovery_prompt(phase: SpecPhase, previous_tail: &str) -> String {
    format!(
        "Your previous response could not be parsed as JSON. Respond again with ONLY a \
         ```json block matching exactly this shape:\n{}\n\nYour previous output ended \
         with:\n---\n{previous_tail}\n---\n",
        phase_schema(phase)
    )
}

fn push_json<T: Serialize>(prompt: &mut String, value: &T) {
    if let Ok(rendered) = serde_json::to_string_pretty(value) {
        prompt.push_str("```json\n");
        prompt.push_str(&rendered);
        prompt.push_str("\n```\n");
    }
}

// ── Slice merging ────────────────────────────────────────────────────────

/// Merge a parsed payload into the SpecOutput, overwriting only the phase's
/// slice plus `phase`. Accepts both the wrapped form (`{"plan": {...}}`) and
/// a bare slice.
pub fn merge_phase_slice(
    existing: &mut SpecOutput,
    phase: SpecPhase,
    payload: &Value,
) -> Result<()> {
    fn slice<'a>(payload: &'a Value, key: &str) -> &'a Value {
        payload.get(key).unwrap_or(payload)
    }

    match phase {
        SpecPhase::Constitution => {
            let text = match slice(payload, "constitution") {
                Value::String(s) => s.clone(),
                other => other
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("constitution payload is not a string"))?,
            };
            if text.trim().is_empty() {
                return Err(anyhow!("constitution payload is empty"));
            }
            existing.constitution = Some(text);
        }
        SpecPhase::Specify => {
            let doc: SpecDoc = serde_json::from_value(slice(payload, "spec").clone())
                .context("spec slice does not match the expected shape")?;
            existing.spec = Some(doc);
        }
        SpecPhase::Clarify => {
            let items: Vec<Clarification> =
                serde_json::from_value(slice(payload, "clarifications").clone())
                    .context("clarifications slice does not match the expected shape")?;
            existing.clarifications = Some(items);
        }
        SpecPhase::Plan => {
            let doc: PlanDoc = serde_json::from_value(slice(payload, "plan").clone())
                .context("plan slice does not match the expected shape")?;
            existing.plan = Some(doc);
        }
        SpecPhase::Analyze => {
            let doc: AnalysisDoc = serde_json::from_value(slice(payload, "analysis").clone())
                .context("analysis slice does not match the expected shape")?;
            existing.analysis = Some(doc);
        }
        SpecPhase::Tasks => {
            let tasks: Vec<SpecTask> = serde_json::from_value(slice(payload, "tasks").clone())
                .context("tasks slice does not match the expected shape")?;
            if tasks.is_empty() {
                return Err(anyhow!("tasks payload is empty"));
            }
            existing.tasks = Some(tasks);
        }
    }

    existing.phase = Some(phase);
    Ok(())
}

/// Is the slice for `phase` present on the output? Used by tests and the
/// phase-ordering invariant.
pub fn phase_slice_present(output: &SpecOutput, phase: SpecPhase) -> bool {
    match phase {
        SpecPhase::Constitution => output.constitution.is_some(),
        SpecPhase::Specify => output.spec.is_some(),
        SpecPhase::Clarify => output.clarifications.is_some(),
        SpecPhase::Plan => output.plan.is_some(),
        SpecPhase::Analyze => output.analysis.is_some(),
        SpecPhase::Tasks => output.tasks.is_some(),
    }
}
