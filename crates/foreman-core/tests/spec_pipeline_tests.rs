//! Spec pipeline scenarios: constitution reuse, the clarify gate, and the
//! analyze judge + auto-improve loop.

mod common;

use foreman_core::runner::spec_phase::{submit_clarification, ClarifyOutcome};
use foreman_core::types::{
    JobStatus, JobType, PlanDoc, SpecDoc, SpecOutput, SpecPhase,
};

use common::{harness, ScriptedBackend, ScriptedRun};

fn queued_spec_phases(h: &common::Harness) -> Vec<SpecPhase> {
    h.db.list_jobs(Some(JobStatus::Queued), None, None, 100, 0)
        .unwrap()
        .into_iter()
        .filter(|j| j.job_type == JobType::Spec)
        .filter_map(|j| j.spec_phase)
        .collect()
}

#[tokio::test]
async fn constitution_phase_reuses_stored_client_text() {
    let h = harness(ScriptedBackend::new(vec![]));
    h.db.update_client_constitution(h.client_id, "Keep it boring.")
        .unwrap();
    let feature_id = h
        .db
        .insert_feature(h.client_id, "Search", "add search", Some("feature"))
        .unwrap();

    let job_id = h.enqueue(JobType::Spec, |job| {
        job.feature_id = Some(feature_id);
        job.branch_name = format!("spec/feature-{feature_id}");
        job.title = "Search - constitution phase".into();
        job.spec_phase = Some(SpecPhase::Constitution);
    });
    h.dispatch(job_id).await;

    // The agent was never spawned; the stored text was reused verbatim.
    assert_eq!(h.backend.invocation_count(), 0);
    let feature = h.db.get_feature(feature_id).unwrap().unwrap();
    assert_eq!(
        feature.spec_output.unwrap().constitution.as_deref(),
        Some("Keep it boring.")
    );
    assert_eq!(
        h.db.get_feature_stage_code(feature_id).unwrap().as_deref(),
        Some("constitution_complete")
    );

    // The specify phase was auto-enqueued.
    assert_eq!(queued_spec_phases(&h), vec![SpecPhase::Specify]);
    let job = h.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn clarify_gate_blocks_until_all_answers_arrive() {
    let clarify_payload = r#"Here are the open questions.
```json
{"clarifications": [
  {"id": "CLR-001", "question": "Which billing tier?", "context": "pricing"},
  {"id": "CLR-002", "question": "Single region or multi?", "context": "infra"}
]}
```"#;
    let h = harness(ScriptedBackend::new(vec![ScriptedRun::ok(&[clarify_payload])]));

    let feature_id = h
        .db
        .insert_feature(h.client_id, "Billing", "", Some("feature"))
        .unwrap();
    let mut seed = SpecOutput::default();
    seed.spec = Some(SpecDoc {
        overview: "billing rework".into(),
        requirements: vec!["tiered pricing".into()],
        acceptance_criteria: vec![],
        out_of_scope: vec![],
    });
    h.db.update_feature_spec_output(feature_id, &seed).unwrap();

    let job_id = h.enqueue(JobType::Spec, |job| {
        job.feature_id = Some(feature_id);
        job.branch_name = format!("spec/feature-{feature_id}");
        job.spec_phase = Some(SpecPhase::Clarify);
    });
    h.dispatch(job_id).await;

    // Gate: job completes, stage parks at clarify_waiting, no successor.
    let job = h.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        h.db.get_feature_stage_code(feature_id).unwrap().as_deref(),
        Some("clarify_waiting")
    );
    assert!(queued_spec_phases(&h).is_empty());

    // First answer: one question remains, still no successor.
    let outcome = submit_clarification(&h.ctx, feature_id, "CLR-001", "pro tier")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, ClarifyOutcome::Answered { remaining: 1 }));
    assert!(queued_spec_phases(&h).is_empty());

    // Unknown ids are rejected without side effects.
    assert!(submit_clarification(&h.ctx, feature_id, "CLR-999", "x")
        .unwrap()
        .is_none());

    // Last answer: plan phase auto-enqueued, stage advances.
    let outcome = submit_clarification(&h.ctx, feature_id, "CLR-002", "single region")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, ClarifyOutcome::Complete { .. }));
    assert_eq!(
        h.db.get_feature_stage_code(feature_id).unwrap().as_deref(),
        Some("clarify_complete")
    );
    assert_eq!(queued_spec_phases(&h), vec![SpecPhase::Plan]);

    // Both responses are persisted with timestamps.
    let feature = h.db.get_feature(feature_id).unwrap().unwrap();
    let clarifications = feature.spec_output.unwrap().clarifications.unwrap();
    assert!(clarifications
        .iter()
        .all(|c| c.response.is_some() && c.responded_at.is_some()));
}

#[tokio::test]
async fn analyze_gate_auto_improves_a_thin_plan() {
    let analyze_payload = r#"```json
{"analysis": {"passed": false, "issues": [], "suggestions": [], "existingPatterns": ["repo uses axum"]}}
```"#;
    let h = harness(ScriptedBackend::new(vec![ScriptedRun::ok(&[analyze_payload])]));

    let feature_id = h
        .db
        .insert_feature(h.client_id, "Reports", "", Some("feature"))
        .unwrap();
    let mut seed = SpecOutput::default();
    seed.spec = Some(SpecDoc {
        overview: "the reporting module".into(),
        requirements: vec!["daily rollups".into(), "csv export".into()],
        acceptance_criteria: vec![],
        out_of_scope: vec![],
    });
    seed.plan = Some(PlanDoc::default());
    h.db.update_feature_spec_output(feature_id, &seed).unwrap();

    let job_id = h.enqueue(JobType::Spec, |job| {
        job.feature_id = Some(feature_id);
        job.branch_name = format!("spec/feature-{feature_id}");
        job.spec_phase = Some(SpecPhase::Analyze);
    });
    h.dispatch(job_id).await;

    let job = h.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let feature = h.db.get_feature(feature_id).unwrap().unwrap();
    let output = feature.spec_output.unwrap();
    let analysis = output.analysis.unwrap();
    assert!(analysis.passed, "auto-improve should rescue the empty plan");
    assert!(analysis
        .existing_patterns
        .contains(&"repo uses axum".to_string()));

    // The improved plan replaced the empty one, covering both requirements.
    let plan = output.plan.unwrap();
    assert!(!plan.architecture.is_empty());
    assert_eq!(plan.file_structure.len(), 2);

    // The tasks phase was enqueued and the narrative recorded.
    assert_eq!(queued_spec_phases(&h), vec![SpecPhase::Tasks]);
    let messages = h.db.list_messages(job_id, 200).unwrap();
    assert!(messages
        .iter()
        .any(|m| m.content.contains("Auto-improve succeeded")));
}

#[tokio::test]
async fn unparseable_output_fails_after_one_recovery_round() {
    let h = harness(ScriptedBackend::new(vec![
        ScriptedRun::ok(&["no json here at all"]),
        ScriptedRun::ok(&["still nothing structured"]),
    ]));

    let feature_id = h
        .db
        .insert_feature(h.client_id, "Broken", "", Some("feature"))
        .unwrap();
    let job_id = h.enqueue(JobType::Spec, |job| {
        job.feature_id = Some(feature_id);
        job.branch_name = format!("spec/feature-{feature_id}");
        job.spec_phase = Some(SpecPhase::Specify);
    });
    h.dispatch(job_id).await;

    // Two agent runs: the original and the recovery attempt.
    assert_eq!(h.backend.invocation_count(), 2);
    let job = h.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert!(error.contains("unparseable"));
    assert!(error.contains("still nothing structured"));
    assert!(queued_spec_phases(&h).is_empty());
}

#[tokio::test]
async fn tasks_phase_finishes_the_pipeline() {
    let tasks_payload = r#"```json
{"tasks": [
  {"id": "T-001", "title": "scaffold module", "description": "", "files": ["src/reports.rs"], "dependencies": []},
  {"id": "T-002", "title": "wire routes", "description": "", "files": ["src/routes.rs"], "dependencies": ["T-001"]}
]}
```"#;
    let h = harness(ScriptedBackend::new(vec![ScriptedRun::ok(&[tasks_payload])]));

    let feature_id = h
        .db
        .insert_feature(h.client_id, "Reports", "", Some("feature"))
        .unwrap();
    let job_id = h.enqueue(JobType::Spec, |job| {
        job.feature_id = Some(feature_id);
        job.branch_name = format!("spec/feature-{feature_id}");
        job.spec_phase = Some(SpecPhase::Tasks);
    });
    h.dispatch(job_id).await;

    let feature = h.db.get_feature(feature_id).unwrap().unwrap();
    assert_eq!(feature.spec_output.unwrap().tasks.unwrap().len(), 2);
    // Terminal stage, nothing else enqueued.
    assert_eq!(
        h.db.get_feature_stage_code(feature_id).unwrap().as_deref(),
        Some("spec_complete")
    );
    assert!(queued_spec_phases(&h).is_empty());
}

#[tokio::test]
async fn client_scoped_constitution_regeneration_updates_the_client() {
    let constitution_payload = r##"```json
{"constitution": "# Engineering principles\nShip small."}
```"##;
    let h = harness(ScriptedBackend::new(vec![ScriptedRun::ok(&[
        constitution_payload,
    ])]));

    // Client-scoped job: no feature, forceRegenerate set.
    let job_id = h.enqueue(JobType::Spec, |job| {
        job.branch_name = "spec/client-constitution".into();
        job.spec_phase = Some(SpecPhase::Constitution);
        job.spec_output = Some(SpecOutput {
            force_regenerate: Some(true),
            ..SpecOutput::default()
        });
    });
    h.dispatch(job_id).await;

    let job = h.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(h.backend.invocation_count(), 1);

    let client = h.db.get_client(h.client_id).unwrap().unwrap();
    assert!(client.constitution.unwrap().contains("Ship small."));
    assert!(client.constitution_generated_at.is_some());

    // Client-scoped runs never enqueue a successor.
    assert!(queued_spec_phases(&h).is_empty());
}
