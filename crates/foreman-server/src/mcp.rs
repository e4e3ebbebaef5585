//! MCP surface over plain HTTP transport: tool listing and invocation plus a
//! small read-only resource tree mirroring the job and spec state.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Json,
};
use foreman_core::runner::spec_phase::{submit_clarification, ClarifyOutcome};
use foreman_core::spec;
use foreman_core::types::{stage, JobStatus, SpecPhase};
use serde_json::{json, Value};

use crate::routes::{bad_request, enqueue_spec_job, internal, not_found, ApiResult};
use crate::AppState;

const SERVER_NAME: &str = "foreman";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

struct ToolSpec {
    name: &'static str,
    description: &'static str,
    args: &'static str,
}

const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "create_spec",
        description: "Start the spec pipeline for a feature (constitution phase)",
        args: r#"{"featureId": 1}"#,
    },
    ToolSpec {
        name: "get_job_status",
        description: "Status, outcome, and PR fields for one job",
        args: r#"{"jobId": 1}"#,
    },
    ToolSpec {
        name: "list_jobs",
        description: "List jobs, optionally filtered by status",
        args: r#"{"status": "running", "limit": 20}"#,
    },
    ToolSpec {
        name: "get_spec_output",
        description: "The feature's SpecOutput document",
        args: r#"{"featureId": 1}"#,
    },
    ToolSpec {
        name: "answer_clarify",
        description: "Answer one clarification question",
        args: r#"{"featureId": 1, "clarificationId": "CLR-001", "response": "..."}"#,
    },
    ToolSpec {
        name: "approve_spec",
        description: "Approve a plan the judge rejected and resume the pipeline",
        args: r#"{"featureId": 1}"#,
    },
    ToolSpec {
        name: "get_capacity",
        description: "Queue capacity on this worker",
        args: r#"{}"#,
    },
    ToolSpec {
        name: "list_phases",
        description: "Spec pipeline phase metadata",
        args: r#"{}"#,
    },
    ToolSpec {
        name: "run_phase",
        description: "Enqueue one spec phase for a feature",
        args: r#"{"featureId": 1, "phase": "plan"}"#,
    },
];

pub(crate) async fn info(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "name": SERVER_NAME,
        "version": SERVER_VERSION,
        "machine": state.ctx.config.machine_id,
        "tools": TOOLS.len(),
        "resources": ["jobs://active", "jobs://{id}", "features://{id}/spec", "phases://list"],
    }))
}

pub(crate) async fn list_tools() -> Json<Value> {
    let tools: Vec<Value> = TOOLS
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "exampleArguments": t.args,
            })
        })
        .collect();
    Json(json!(tools))
}

fn arg_i64(args: &Value, key: &str) -> ApiResult<i64> {
    args.get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| bad_request(format!("missing or non-numeric argument: {key}")))
}

fn arg_str<'a>(args: &'a Value, key: &str) -> ApiResult<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| bad_request(format!("missing argument: {key}")))
}

pub(crate) async fn call_tool(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(args): Json<Value>,
) -> ApiResult<Json<Value>> {
    match name.as_str() {
        "create_spec" => {
            let feature_id = arg_i64(&args, "featureId")?;
            let feature = state
                .ctx
                .db
                .get_feature(feature_id)
                .map_err(internal)?
                .ok_or_else(|| not_found(format!("feature {feature_id} not found")))?;
            let job_id = enqueue_spec_job(&state, &feature, SpecPhase::Constitution)?;
            Ok(Json(json!({ "jobId": job_id })))
        }
        "get_job_status" => {
            let job_id = arg_i64(&args, "jobId")?;
            let job = state
                .ctx
                .db
                .get_job(job_id)
                .map_err(internal)?
                .ok_or_else(|| not_found(format!("job {job_id} not found")))?;
            Ok(Json(json!({
                "id": job.id,
                "jobType": job.job_type,
                "status": job.status,
                "error": job.error,
                "exitCode": job.exit_code,
                "completionReason": job.completion_reason,
                "currentIteration": job.current_iteration,
                "totalIterations": job.total_iterations,
                "prUrl": job.pr_url,
                "prNumber": job.pr_number,
            })))
        }
        "list_jobs" => {
            let status = match args.get("status").and_then(|v| v.as_str()) {
                Some(s) => Some(
                    JobStatus::parse(s)
                        .ok_or_else(|| bad_request(format!("unknown status: {s}")))?,
                ),
                None => None,
            };
            let limit = args.get("limit").and_then(|v| v.as_i64()).unwrap_or(20);
            let jobs = state
                .ctx
                .db
                .list_jobs(status, None, None, limit.clamp(1, 200), 0)
                .map_err(internal)?;
            Ok(Json(json!(jobs)))
        }
        "get_spec_output" => {
            let feature_id = arg_i64(&args, "featureId")?;
            let feature = state
                .ctx
                .db
                .get_feature(feature_id)
                .map_err(internal)?
                .ok_or_else(|| not_found(format!("feature {feature_id} not found")))?;
            Ok(Json(json!({ "specOutput": feature.spec_output })))
        }
        "answer_clarify" => {
            let feature_id = arg_i64(&args, "featureId")?;
            let clarification_id = arg_str(&args, "clarificationId")?;
            let response = arg_str(&args, "response")?;
            let outcome = submit_clarification(&state.ctx, feature_id, clarification_id, response)
                .map_err(internal)?
                .ok_or_else(|| {
                    not_found(format!("clarification {clarification_id} not found"))
                })?;
            match outcome {
                ClarifyOutcome::Answered { remaining } => {
                    Ok(Json(json!({ "answered": true, "remaining": remaining })))
                }
                ClarifyOutcome::Complete { plan_job_id } => Ok(Json(
                    json!({ "answered": true, "remaining": 0, "planJobId": plan_job_id }),
                )),
            }
        }
        "approve_spec" => {
            // Human override for a failed analyze gate: mark the phase
            // complete and resume with the tasks phase.
            let feature_id = arg_i64(&args, "featureId")?;
            let feature = state
                .ctx
                .db
                .get_feature(feature_id)
                .map_err(internal)?
                .ok_or_else(|| not_found(format!("feature {feature_id} not found")))?;
            let current = state
                .ctx
                .db
                .get_feature_stage_code(feature_id)
                .map_err(internal)?;
            if current.as_deref() != Some(stage::ANALYZE_FAILED) {
                return Err(bad_request("feature is not waiting on spec approval"));
            }
            state
                .ctx
                .db
                .set_feature_stage(feature_id, &stage::complete(SpecPhase::Analyze))
                .map_err(internal)?;
            let job_id = enqueue_spec_job(&state, &feature, SpecPhase::Tasks)?;
            Ok(Json(json!({ "approved": true, "jobId": job_id })))
        }
        "get_capacity" => {
            let (queued, running) = state
                .ctx
                .db
                .count_jobs_by_status(&state.ctx.config.machine_id)
                .map_err(internal)?;
            let max = state.ctx.config.max_concurrent_jobs as i64;
            Ok(Json(json!({
                "maxCapacity": max,
                "running": running,
                "queued": queued,
                "available": (max - running).max(0),
            })))
        }
        "list_phases" => Ok(Json(json!(spec::phase_metadata()))),
        "run_phase" => {
            let feature_id = arg_i64(&args, "featureId")?;
            let phase = SpecPhase::parse(arg_str(&args, "phase")?)
                .ok_or_else(|| bad_request("unknown phase"))?;
            let feature = state
                .ctx
                .db
                .get_feature(feature_id)
                .map_err(internal)?
                .ok_or_else(|| not_found(format!("feature {feature_id} not found")))?;
            let job_id = enqueue_spec_job(&state, &feature, phase)?;
            Ok(Json(json!({ "jobId": job_id })))
        }
        other => Err(not_found(format!("unknown tool: {other}"))),
    }
}

// ── Resources ─────────────────────────────────────────────────────────────

pub(crate) async fn list_resources() -> Json<Value> {
    Json(json!([
        { "uri": "jobs://active", "description": "Jobs currently queued or running" },
        { "uri": "jobs://{id}", "description": "One job with its message log" },
        { "uri": "features://{id}/spec", "description": "A feature's SpecOutput" },
        { "uri": "phases://list", "description": "Spec pipeline phase metadata" },
    ]))
}

pub(crate) async fn get_resource_root(
    State(_state): State<Arc<AppState>>,
    Path(rtype): Path<String>,
) -> ApiResult<Json<Value>> {
    match rtype.as_str() {
        "phases" => Ok(Json(json!(spec::phase_metadata()))),
        other => Err(not_found(format!("unknown resource type: {other}"))),
    }
}

pub(crate) async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path((rtype, id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    match (rtype.as_str(), id.as_str()) {
        ("jobs", "active") => {
            let running = state
                .ctx
                .db
                .list_jobs(Some(JobStatus::Running), None, None, 100, 0)
                .map_err(internal)?;
            let queued = state
                .ctx
                .db
                .list_jobs(Some(JobStatus::Queued), None, None, 100, 0)
                .map_err(internal)?;
            Ok(Json(json!({ "running": running, "queued": queued })))
        }
        ("jobs", id) => {
            let job_id: i64 = id
                .parse()
                .map_err(|_| bad_request(format!("invalid job id: {id}")))?;
            let job = state
                .ctx
                .db
                .get_job(job_id)
                .map_err(internal)?
                .ok_or_else(|| not_found(format!("job {job_id} not found")))?;
            let messages = state.ctx.db.list_messages(job_id, 500).map_err(internal)?;
            let mut v = serde_json::to_value(&job).map_err(internal)?;
            if let Some(obj) = v.as_object_mut() {
                obj.insert("messages".into(), json!(messages));
            }
            Ok(Json(v))
        }
        ("phases", "list") => Ok(Json(json!(spec::phase_metadata()))),
        (other, _) => Err(not_found(format!("unknown resource type: {other}"))),
    }
}

pub(crate) async fn get_resource_sub(
    State(state): State<Arc<AppState>>,
    Path((rtype, id, sub)): Path<(String, String, String)>,
) -> ApiResult<Json<Value>> {
    match (rtype.as_str(), sub.as_str()) {
        ("features", "spec") => {
            let feature_id: i64 = id
                .parse()
                .map_err(|_| bad_request(format!("invalid feature id: {id}")))?;
            let feature = state
                .ctx
                .db
                .get_feature(feature_id)
                .map_err(internal)?
                .ok_or_else(|| not_found(format!("feature {feature_id} not found")))?;
            Ok(Json(json!({
                "specOutput": feature.spec_output,
                "specPhase": feature.spec_phase,
            })))
        }
        _ => Err(not_found(format!("unknown resource: {rtype}/{id}/{sub}"))),
    }
}
