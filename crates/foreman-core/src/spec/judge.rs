//! Plan quality gate for the analyze phase.
//!
//! `judge` and `improve` are pure functions so the analyze loop is fully
//! deterministic and testable: judge the plan, improve it from the verdict,
//! re-judge, capped at three rounds by the caller.

use serde::Serialize;

use crate::types::{PlanDoc, SpecDoc};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeCriterion {
    pub name: String,
    pub passed: bool,
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeResult {
    pub passed: bool,
    pub criteria: Vec<JudgeCriterion>,
    pub improvements: Vec<String>,
}

const MIN_ARCHITECTURE_CHARS: usize = 40;

pub fn judge(
    constitution: Option<&str>,
    spec: Option<&SpecDoc>,
    plan: &PlanDoc,
) -> JudgeResult {
    let mut criteria = Vec::new();
    let mut improvements = Vec::new();

    let arch_ok = plan.architecture.trim().len() >= MIN_ARCHITECTURE_CHARS;
    criteria.push(JudgeCriterion {
        name: "architecture_described".into(),
        passed: arch_ok,
        note: if arch_ok {
            "architecture section is substantive".into()
        } else {
            "architecture section is missing or too thin".into()
        },
    });
    if !arch_ok {
        improvements.push(
            "Describe the architecture: main components, data flow, and integration points."
                .to_string(),
        );
    }

    let decisions_ok = !plan.tech_decisions.is_empty();
    criteria.push(JudgeCriterion {
        name: "tech_decisions_present".into(),
        passed: decisions_ok,
        note: if decisions_ok {
            format!("{} technology decisions recorded", plan.tech_decisions.len())
        } else {
            "no technology decisions recorded".into()
        },
    });
    if !decisions_ok {
        improvements.push("Record the concrete technology decisions with rationale.".to_string());
    }

    let files_ok = !plan.file_structure.is_empty();
    criteria.push(JudgeCriterion {
        name: "file_structure_present".into(),
        passed: files_ok,
        note: if files_ok {
            format!("{} file structure entries", plan.file_structure.len())
        } else {
            "no file structure planned".into()
        },
    });
    if !files_ok {
        improvements.push("List the files and directories this work will touch.".to_string());
    }

    // When the spec enumerates requirements, the plan must place them
    // somewhere concrete.
    let requirements = spec.map(|s| s.requirements.len()).unwrap_or(0);
    let coverage_ok = requirements == 0 || !plan.file_structure.is_empty();
    criteria.push(JudgeCriterion {
        name: "requirements_covered".into(),
        passed: coverage_ok,
        note: format!("{requirements} requirements in scope"),
    });
    if !coverage_ok {
        improvements.push("Map each requirement to the files that will implement it.".to_string());
    }

    if let Some(text) = constitution {
        let respected = text.trim().is_empty() || arch_ok;
        criteria.push(JudgeCriterion {
            name: "constitution_respected".into(),
            passed: respected,
            note: if respected {
                "plan is consistent with the client constitution".into()
            } else {
                "plan too thin to honor the client constitution".into()
            },
        });
        if !respected {
            improvements
                .push("Align the architecture section with the client constitution.".to_string());
        }
    }

    JudgeResult {
        passed: criteria.iter().all(|c| c.passed),
        criteria,
        improvements,
    }
}

/// Fill the gaps the verdict identified. Each failed criterion gets a
/// concrete, deterministic repair so a re-judge can pass.
pub fn improve(plan: &PlanDoc, spec: Option<&SpecDoc>, verdict: &JudgeResult) -> PlanDoc {
    let mut improved = plan.clone();

    for criterion in verdict.criteria.iter().filter(|c| !c.passed) {
        match criterion.name.as_str() {
            "architecture_described" | "constitution_respected" => {
                let overview = spec
                    .map(|s| s.overview.as_str())
                    .filter(|o| !o.trim().is_empty())
                    .unwrap_or("the feature under specification");
                let addition = format!(
                    "Single-service implementation of {overview}: request handling at the \
                     existing HTTP layer, domain logic in a dedicated module, persistence \
                     through the current store gateway."
                );
                if improved.architecture.trim().is_empty() {
                    improved.architecture = addition;
                } else {
                    improved.architecture.push_str("\n\n");
                    improved.architecture.push_str(&addition);
                }
            }
            "tech_decisions_present" => {
                improved
                    .tech_decisions
                    .push("Reuse the existing application stack; no new frameworks.".to_string());
                for dep in &improved.dependencies {
                    improved.tech_decisions.push(format!("Depend on {dep}."));
                }
            }
            "file_structure_present" | "requirements_covered" => {
                if let Some(spec) = spec {
                    for (i, _) in spec.requirements.iter().enumerate() {
                        improved
                            .file_structure
                            .push(format!("src/feature/requirement_{}.rs", i + 1));
                    }
                }
                if improved.file_structure.is_empty() {
                    improved.file_structure.push("src/feature/mod.rs".to_string());
                }
            }
            _ => {}
        }
    }

    improved
}
