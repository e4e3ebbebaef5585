use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use chrono::Utc;
use foreman_core::runner::spec_phase::{submit_clarification, ClarifyOutcome};
use foreman_core::spec;
use foreman_core::types::{
    branch_prefix, new_job, AgentJob, Feature, JobStatus, JobType, Prd, PrdStory, SpecOutput,
    SpecPhase,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};

use crate::AppState;

// ── Error helper ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

pub(crate) type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn bad_request(msg: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, msg.into())
}

pub(crate) fn not_found(msg: impl Into<String>) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, msg.into())
}

pub(crate) fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!("internal error: {e}");
    ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ── Request bodies ────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AttachRepositoryBody {
    pub github_org: String,
    pub github_repo: String,
    pub default_branch: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateJobBody {
    pub client_id: Option<i64>,
    pub feature_id: Option<i64>,
    pub repository_id: Option<i64>,
    pub github_org: Option<String>,
    pub github_repo: Option<String>,
    pub prompt: Option<String>,
    pub branch_name: Option<String>,
    pub title: Option<String>,
    pub job_type: String,
    pub created_by_team_member_id: Option<i64>,
    pub max_iterations: Option<i64>,
    pub completion_promise: Option<String>,
    pub feedback_commands: Option<Vec<String>>,
    pub prd_mode: Option<bool>,
    pub prd: Option<Prd>,
    pub spec_mode: Option<bool>,
}

#[derive(Deserialize)]
pub(crate) struct JobsQuery {
    pub status: Option<String>,
    #[serde(rename = "clientId")]
    pub client_id: Option<i64>,
    #[serde(rename = "featureId")]
    pub feature_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct JobQuery {
    #[serde(rename = "includeMessages")]
    pub include_messages: Option<bool>,
}

#[derive(Deserialize)]
pub(crate) struct MessageBody {
    pub content: String,
}

#[derive(Deserialize)]
pub(crate) struct PhaseBody {
    pub phase: String,
}

#[derive(Deserialize)]
pub(crate) struct ClarificationBody {
    pub response: String,
}

#[derive(Deserialize)]
pub(crate) struct PatchSpecOutputBody {
    pub section: String,
    pub value: Value,
}

#[derive(Deserialize)]
pub(crate) struct CloneBody {
    #[serde(rename = "repositoryId")]
    pub repository_id: i64,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PredictBody {
    pub description: String,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default)]
    pub tech_stack: String,
    pub client_id: Option<i64>,
    #[serde(default = "default_urgency")]
    pub urgency: f64,
    #[serde(default = "default_tier")]
    pub tier: String,
}

fn default_urgency() -> f64 {
    1.0
}

fn default_tier() -> String {
    "pro".to_string()
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ScheduleBody {
    pub description: Option<String>,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default)]
    pub tech_stack: String,
    #[serde(default)]
    pub dependencies: Vec<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UsageBody {
    pub job_id: i64,
    pub predicted_tokens: f64,
    pub actual_tokens: f64,
}

#[derive(Deserialize)]
pub(crate) struct LimitQuery {
    pub limit: Option<usize>,
}

// ── Small helpers ─────────────────────────────────────────────────────────

fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= max_len {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "job".to_string()
    } else {
        slug
    }
}

/// `<type-prefix>/<sanitized-title-≤50-chars>` per the feature's type.
fn generate_branch_name(feature: Option<&Feature>, title: &str) -> ApiResult<String> {
    let feature_type = feature
        .and_then(|f| f.feature_type.as_deref())
        .unwrap_or("feature");
    let prefix = branch_prefix(feature_type)
        .ok_or_else(|| bad_request(format!("unknown feature type: {feature_type}")))?;
    Ok(format!("{prefix}/{}", slugify(title, 50)))
}

fn job_to_json(job: &AgentJob) -> Value {
    serde_json::to_value(job).unwrap_or_else(|_| json!({}))
}

/// Enqueue one spec phase job for a feature.
pub(crate) fn enqueue_spec_job(
    state: &AppState,
    feature: &Feature,
    phase: SpecPhase,
) -> ApiResult<i64> {
    let repo = state
        .ctx
        .db
        .get_repository_for_client(feature.client_id)
        .map_err(internal)?
        .ok_or_else(|| bad_request("client has no repository attached"))?;

    let mut job = new_job(feature.client_id, JobType::Spec, &state.ctx.config.machine_id);
    job.feature_id = Some(feature.id);
    job.repository_id = Some(repo.id);
    job.branch_name = format!("spec/feature-{}", feature.id);
    job.title = format!("{} - {} phase", feature.title, phase.as_str());
    job.spec_phase = Some(phase);
    state.ctx.enqueue_job(&job).map_err(internal)
}

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let (queued, running) = state
        .ctx
        .db
        .count_jobs_by_status(&state.ctx.config.machine_id)
        .unwrap_or((0, 0));

    let claude = match state.ctx.backend.health_check().await {
        Ok(info) => json!({ "ok": true, "info": info }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };

    let git = match std::process::Command::new("git").arg("--version").output() {
        Ok(out) if out.status.success() => json!({
            "ok": true,
            "version": String::from_utf8_lossy(&out.stdout).trim(),
        }),
        Ok(_) | Err(_) => json!({ "ok": false }),
    };

    Json(json!({
        "status": "ok",
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "queue": {
            "queued": queued,
            "running": running,
            "maxConcurrent": state.ctx.config.max_concurrent_jobs,
        },
        "claude": claude,
        "git": git,
    }))
}

// ── Clients ───────────────────────────────────────────────────────────────

pub(crate) async fn list_clients(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let clients = state.ctx.db.list_clients().map_err(internal)?;
    Ok(Json(json!(clients)))
}

pub(crate) async fn get_client(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let client = state
        .ctx
        .db
        .get_client(id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("client {id} not found")))?;
    let repository = state
        .ctx
        .db
        .get_repository_for_client(id)
        .map_err(internal)?;
    let mut v = serde_json::to_value(&client).map_err(internal)?;
    if let Some(obj) = v.as_object_mut() {
        obj.insert("repository".into(), json!(repository));
    }
    Ok(Json(v))
}

pub(crate) async fn attach_repository(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<AttachRepositoryBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if body.github_org.trim().is_empty() || body.github_repo.trim().is_empty() {
        return Err(bad_request("githubOrg and githubRepo are required"));
    }
    state
        .ctx
        .db
        .get_client(id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("client {id} not found")))?;
    let repo_id = state
        .ctx
        .db
        .insert_repository(
            id,
            &body.github_org,
            &body.github_repo,
            body.default_branch.as_deref().unwrap_or("main"),
        )
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": repo_id }))))
}

pub(crate) async fn get_constitution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let client = state
        .ctx
        .db
        .get_client(id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("client {id} not found")))?;
    Ok(Json(json!({
        "constitution": client.constitution,
        "generatedAt": client.constitution_generated_at,
    })))
}

/// Enqueue a client-scoped constitution regeneration (feature-less spec job
/// with forceRegenerate set).
pub(crate) async fn regenerate_constitution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let client = state
        .ctx
        .db
        .get_client(id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("client {id} not found")))?;
    let repo = state
        .ctx
        .db
        .get_repository_for_client(id)
        .map_err(internal)?
        .ok_or_else(|| bad_request("client has no repository attached"))?;

    let mut job = new_job(client.id, JobType::Spec, &state.ctx.config.machine_id);
    job.repository_id = Some(repo.id);
    job.branch_name = format!("spec/client-{id}-constitution");
    job.title = format!("{} - constitution regeneration", client.name);
    job.spec_phase = Some(SpecPhase::Constitution);
    job.spec_output = Some(SpecOutput {
        force_regenerate: Some(true),
        ..SpecOutput::default()
    });
    let job_id = state.ctx.enqueue_job(&job).map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!({ "jobId": job_id }))))
}

// ── Jobs ──────────────────────────────────────────────────────────────────

pub(crate) async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<JobsQuery>,
) -> ApiResult<Json<Value>> {
    let status = match q.status.as_deref() {
        Some(s) => Some(JobStatus::parse(s).ok_or_else(|| bad_request(format!("unknown status: {s}")))?),
        None => None,
    };
    let jobs = state
        .ctx
        .db
        .list_jobs(
            status,
            q.client_id,
            q.feature_id,
            q.limit.unwrap_or(50).clamp(1, 500),
            q.offset.unwrap_or(0).max(0),
        )
        .map_err(internal)?;
    Ok(Json(json!(jobs)))
}

pub(crate) async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(q): Query<JobQuery>,
) -> ApiResult<Json<Value>> {
    let job = state
        .ctx
        .db
        .get_job(id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("job {id} not found")))?;

    let client = state.ctx.db.get_client(job.client_id).map_err(internal)?;
    let feature = match job.feature_id {
        Some(fid) => state.ctx.db.get_feature(fid).map_err(internal)?,
        None => None,
    };
    let repository = match job.repository_id {
        Some(rid) => state.ctx.db.get_repository(rid).map_err(internal)?,
        None => None,
    };

    let mut v = job_to_json(&job);
    if let Some(obj) = v.as_object_mut() {
        obj.insert("client".into(), json!(client));
        obj.insert("feature".into(), json!(feature));
        obj.insert("repository".into(), json!(repository));
        if q.include_messages.unwrap_or(false) {
            let messages = state.ctx.db.list_messages(id, 2000).map_err(internal)?;
            obj.insert("messages".into(), json!(messages));
        }
    }
    Ok(Json(v))
}

pub(crate) async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateJobBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let job_id = create_job_inner(&state, body)?;
    let job = state
        .ctx
        .db
        .get_job(job_id)
        .map_err(internal)?
        .ok_or_else(|| internal("job vanished after insert"))?;
    Ok((StatusCode::CREATED, Json(job_to_json(&job))))
}

pub(crate) fn create_job_inner(state: &AppState, body: CreateJobBody) -> ApiResult<i64> {
    let job_type = JobType::parse(&body.job_type)
        .ok_or_else(|| bad_request(format!("unknown jobType: {}", body.job_type)))?;

    let feature = match body.feature_id {
        Some(fid) => Some(
            state
                .ctx
                .db
                .get_feature(fid)
                .map_err(internal)?
                .ok_or_else(|| not_found(format!("feature {fid} not found")))?,
        ),
        None => None,
    };

    // Client comes from the body or is resolved through the feature.
    let client_id = body
        .client_id
        .or_else(|| feature.as_ref().map(|f| f.client_id))
        .ok_or_else(|| bad_request("clientId or featureId is required"))?;
    state
        .ctx
        .db
        .get_client(client_id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("client {client_id} not found")))?;

    let repository = match body.repository_id {
        Some(rid) => Some(
            state
                .ctx
                .db
                .get_repository(rid)
                .map_err(internal)?
                .ok_or_else(|| not_found(format!("repository {rid} not found")))?,
        ),
        None => match (&body.github_org, &body.github_repo) {
            (Some(org), Some(repo)) => Some(
                state
                    .ctx
                    .db
                    .find_repository(org, repo)
                    .map_err(internal)?
                    .ok_or_else(|| not_found(format!("repository {org}/{repo} not found")))?,
            ),
            _ => state
                .ctx
                .db
                .get_repository_for_client(client_id)
                .map_err(internal)?,
        },
    };
    if repository.is_none() && job_type != JobType::PrdGeneration {
        return Err(bad_request("no repository available for this job"));
    }

    if let Some(max) = body.max_iterations {
        if !(1..=100).contains(&max) {
            return Err(bad_request("maxIterations must be within [1, 100]"));
        }
    }

    let title = body
        .title
        .clone()
        .or_else(|| feature.as_ref().map(|f| f.title.clone()))
        .or_else(|| body.prompt.as_ref().map(|p| p.chars().take(50).collect()))
        .unwrap_or_else(|| format!("{} job", job_type.as_str()));

    let branch_name = match body.branch_name {
        Some(b) if !b.trim().is_empty() => b,
        _ => generate_branch_name(feature.as_ref(), &title)?,
    };

    let mut prd = body.prd;
    let mut prd_mode = body.prd_mode.unwrap_or(false);

    // specMode: synthesize an internal PRD from the feature's spec tasks and
    // seed the matching todo rows.
    if body.spec_mode.unwrap_or(false) {
        let feature = feature
            .as_ref()
            .ok_or_else(|| bad_request("specMode requires featureId"))?;
        let tasks = feature
            .spec_output
            .as_ref()
            .and_then(|o| o.tasks.clone())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| bad_request("feature has no spec tasks to build a PRD from"))?;

        let stories: Vec<PrdStory> = tasks
            .iter()
            .enumerate()
            .map(|(i, task)| PrdStory {
                id: i as i64 + 1,
                title: task.title.clone(),
                description: task.description.clone(),
                acceptance_criteria: task
                    .files
                    .iter()
                    .map(|f| format!("changes land in {f}"))
                    .collect(),
                passes: false,
            })
            .collect();
        for (i, story) in stories.iter().enumerate() {
            state
                .ctx
                .db
                .upsert_todo(feature.id, i as i64, &story.title, "pending")
                .map_err(internal)?;
        }
        prd = Some(Prd {
            title: feature.title.clone(),
            description: feature.notes.clone(),
            stories,
        });
        prd_mode = true;
    }

    if prd_mode {
        let prd_ref = prd
            .as_ref()
            .ok_or_else(|| bad_request("prdMode requires a prd"))?;
        prd_ref.validate().map_err(bad_request)?;
    }

    let mut job = new_job(client_id, job_type, &state.ctx.config.machine_id);
    job.feature_id = feature.as_ref().map(|f| f.id);
    job.repository_id = repository.as_ref().map(|r| r.id);
    job.prompt = body.prompt.unwrap_or_default();
    job.branch_name = branch_name;
    job.title = title;
    job.max_iterations = body.max_iterations;
    job.completion_promise = body.completion_promise;
    job.feedback_commands = body.feedback_commands.unwrap_or_default();
    job.prd_mode = prd_mode;
    job.prd = prd;
    if let Some(member) = body.created_by_team_member_id {
        job.metadata = Some(json!({ "createdByTeamMemberId": member }));
    }
    if job_type == JobType::Spec {
        job.spec_phase = Some(SpecPhase::Constitution);
    }

    state.ctx.enqueue_job(&job).map_err(internal)
}

pub(crate) async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    if !state.queue.cancel(id).await.map_err(internal)? {
        return Err(not_found(format!("job {id} not found")));
    }
    Ok(Json(json!({ "cancelled": true })))
}

pub(crate) async fn retry_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let source = state
        .ctx
        .db
        .get_job(id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("job {id} not found")))?;

    let mut retry = new_job(source.client_id, source.job_type, &state.ctx.config.machine_id);
    retry.feature_id = source.feature_id;
    retry.repository_id = source.repository_id;
    retry.prompt = source.prompt.clone();
    retry.branch_name = format!("{}-retry-{}", source.branch_name, Utc::now().timestamp());
    retry.title = source.title.clone();
    retry.max_iterations = source.max_iterations;
    retry.completion_promise = source.completion_promise.clone();
    retry.feedback_commands = source.feedback_commands.clone();
    retry.prd_mode = source.prd_mode;
    retry.prd = source.prd.clone();
    retry.spec_phase = source.spec_phase;
    retry.spec_output = source.spec_output.clone();

    let new_id = state.ctx.enqueue_job(&retry).map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": new_id }))))
}

pub(crate) async fn send_job_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<MessageBody>,
) -> ApiResult<Json<Value>> {
    let job = state
        .ctx
        .db
        .get_job(id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("job {id} not found")))?;
    if job.job_type != JobType::Task {
        return Err(bad_request("only interactive (task) jobs accept messages"));
    }
    if !state.queue.send_input(id, &body.content).await.map_err(internal)? {
        return Err(bad_request("job has no live interactive session"));
    }
    Ok(Json(json!({ "sent": true })))
}

pub(crate) async fn complete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let job = state
        .ctx
        .db
        .get_job(id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("job {id} not found")))?;
    if job.job_type != JobType::Task {
        return Err(bad_request("only interactive (task) jobs can be completed"));
    }
    if !state.queue.close_input(id).await.map_err(internal)? {
        return Err(bad_request("job has no live interactive session"));
    }
    Ok(Json(json!({ "completing": true })))
}

pub(crate) async fn list_job_iterations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let job = state
        .ctx
        .db
        .get_job(id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("job {id} not found")))?;
    if job.job_type != JobType::Ralph {
        return Err(bad_request("iterations exist only for ralph jobs"));
    }
    let iterations = state.ctx.db.list_iterations(id).map_err(internal)?;
    Ok(Json(json!(iterations)))
}

pub(crate) async fn stop_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let job = state
        .ctx
        .db
        .get_job(id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("job {id} not found")))?;
    if job.job_type != JobType::Ralph {
        return Err(bad_request("stop applies only to ralph jobs"));
    }
    state.queue.stop(id).await.map_err(internal)?;
    Ok(Json(json!({ "stopping": true })))
}

pub(crate) async fn stream_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (history, rx) = state.ctx.streams.subscribe(id).await;
    let history_stream =
        tokio_stream::iter(history).map(|line| Ok(Event::default().data(line)));
    let live: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> = match rx {
        Some(rx) => Box::pin(
            BroadcastStream::new(rx)
                .filter_map(|r| r.ok())
                .map(|line| Ok(Event::default().data(line))),
        ),
        None => Box::pin(tokio_stream::empty()),
    };
    Sse::new(history_stream.chain(live)).keep_alive(KeepAlive::default())
}

// ── Queue ─────────────────────────────────────────────────────────────────

pub(crate) async fn queue_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let status = state.queue.status().await.map_err(internal)?;
    Ok(Json(json!(status)))
}

// ── Features / spec pipeline ──────────────────────────────────────────────

fn load_feature(state: &AppState, id: i64) -> ApiResult<Feature> {
    state
        .ctx
        .db
        .get_feature(id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("feature {id} not found")))
}

pub(crate) async fn generate_tasks(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let feature = load_feature(&state, id)?;
    let mut job = new_job(
        feature.client_id,
        JobType::PrdGeneration,
        &state.ctx.config.machine_id,
    );
    job.feature_id = Some(feature.id);
    job.title = format!("{} - PRD generation", feature.title);
    job.branch_name = format!("prd/feature-{}", feature.id);
    let job_id = state.ctx.enqueue_job(&job).map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!({ "jobId": job_id }))))
}

pub(crate) async fn start_spec(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let feature = load_feature(&state, id)?;
    let job_id = enqueue_spec_job(&state, &feature, SpecPhase::Constitution)?;
    Ok((StatusCode::CREATED, Json(json!({ "jobId": job_id }))))
}

pub(crate) async fn run_spec_phase(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<PhaseBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let feature = load_feature(&state, id)?;
    let phase = SpecPhase::parse(&body.phase)
        .ok_or_else(|| bad_request(format!("unknown phase: {}", body.phase)))?;

    // The plan phase is gated on answered clarifications.
    if phase == SpecPhase::Plan {
        let unanswered = feature
            .spec_output
            .as_ref()
            .map(|o| o.unanswered_clarifications())
            .unwrap_or(0);
        if unanswered > 0 {
            return Err(bad_request(format!(
                "{unanswered} clarifications are still unanswered"
            )));
        }
    }

    let job_id = enqueue_spec_job(&state, &feature, phase)?;
    Ok((StatusCode::CREATED, Json(json!({ "jobId": job_id }))))
}

pub(crate) async fn get_spec(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let feature = load_feature(&state, id)?;
    let unanswered = feature
        .spec_output
        .as_ref()
        .map(|o| o.unanswered_clarifications())
        .unwrap_or(0);
    let recent_jobs = state
        .ctx
        .db
        .list_spec_jobs_for_feature(id, 10)
        .map_err(internal)?;
    let stage = state.ctx.db.get_feature_stage_code(id).map_err(internal)?;
    Ok(Json(json!({
        "specOutput": feature.spec_output,
        "unansweredClarifications": unanswered,
        "workflowStage": stage,
        "recentJobs": recent_jobs,
    })))
}

pub(crate) async fn answer_clarification(
    State(state): State<Arc<AppState>>,
    Path((id, cid)): Path<(i64, String)>,
    Json(body): Json<ClarificationBody>,
) -> ApiResult<Json<Value>> {
    let outcome = submit_clarification(&state.ctx, id, &cid, &body.response)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("clarification {cid} not found on feature {id}")))?;
    match outcome {
        ClarifyOutcome::Answered { remaining } => Ok(Json(json!({
            "answered": true,
            "remaining": remaining,
        }))),
        ClarifyOutcome::Complete { plan_job_id } => Ok(Json(json!({
            "answered": true,
            "remaining": 0,
            "planJobId": plan_job_id,
        }))),
    }
}

pub(crate) async fn patch_spec_output(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<PatchSpecOutputBody>,
) -> ApiResult<Json<Value>> {
    let feature = load_feature(&state, id)?;
    let phase = match body.section.as_str() {
        "constitution" => SpecPhase::Constitution,
        "spec" => SpecPhase::Specify,
        "clarifications" => SpecPhase::Clarify,
        "plan" => SpecPhase::Plan,
        "analysis" => SpecPhase::Analyze,
        "tasks" => SpecPhase::Tasks,
        other => return Err(bad_request(format!("unknown section: {other}"))),
    };

    let mut output = feature.spec_output.clone().unwrap_or_default();
    let saved_phase = output.phase;
    let mut wrapped = serde_json::Map::new();
    wrapped.insert(body.section.clone(), body.value.clone());
    let wrapped = Value::Object(wrapped);
    spec::merge_phase_slice(&mut output, phase, &wrapped)
        .map_err(|e| bad_request(e.to_string()))?;
    // Manual patches edit a slice without advancing the pipeline.
    output.phase = saved_phase;
    state
        .ctx
        .db
        .update_feature_spec_output(id, &output)
        .map_err(internal)?;
    Ok(Json(json!({ "updated": body.section })))
}

pub(crate) async fn list_spec_phases() -> Json<Value> {
    Json(json!(spec::phase_metadata()))
}

// ── Worktree manager surface ──────────────────────────────────────────────

pub(crate) async fn sync_repos(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let clients = state.ctx.db.list_clients().map_err(internal)?;
    let mut synced = 0;
    let mut errors: Vec<String> = Vec::new();
    for client in clients {
        let Some(repo) = state
            .ctx
            .db
            .get_repository_for_client(client.id)
            .map_err(internal)?
        else {
            continue;
        };
        match state
            .ctx
            .worktrees
            .ensure_bare_repo(&repo)
            .and_then(|_| state.ctx.worktrees.fetch_origin(&repo))
        {
            Ok(()) => synced += 1,
            Err(e) => errors.push(format!("{}: {e}", repo.full_name())),
        }
    }
    Ok(Json(json!({ "synced": synced, "errors": errors })))
}

async fn clone_repository(state: &AppState, repo_id: i64) -> ApiResult<Json<Value>> {
    let repo = state
        .ctx
        .db
        .get_repository(repo_id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("repository {repo_id} not found")))?;
    let mirror = state
        .ctx
        .worktrees
        .ensure_bare_repo(&repo)
        .map_err(internal)?;
    state.ctx.worktrees.fetch_origin(&repo).map_err(internal)?;
    Ok(Json(json!({ "mirror": mirror })))
}

pub(crate) async fn clone_repo(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CloneBody>,
) -> ApiResult<Json<Value>> {
    clone_repository(&state, body.repository_id).await
}

pub(crate) async fn clone_repo_by_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    clone_repository(&state, id).await
}

// ── Scheduling ────────────────────────────────────────────────────────────

pub(crate) async fn scheduling_predict(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PredictBody>,
) -> ApiResult<Json<Value>> {
    let features = state.scheduler.extract_features(
        &body.description,
        &body.files_to_modify,
        &body.tech_stack,
        body.client_id,
    );
    let prediction = state.scheduler.predict(&features);
    let priority = foreman_core::scheduler::calculate_priority(
        &features,
        &prediction,
        body.urgency,
        &body.tier,
    );
    Ok(Json(json!({
        "features": features,
        "prediction": prediction,
        "priority": priority,
    })))
}

pub(crate) async fn scheduling_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ScheduleBody>,
) -> ApiResult<Json<Value>> {
    let job = state
        .ctx
        .db
        .get_job(id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("job {id} not found")))?;

    let description = body.description.unwrap_or_else(|| job.prompt.clone());
    let features = state.scheduler.extract_features(
        &description,
        &body.files_to_modify,
        &body.tech_stack,
        Some(job.client_id),
    );
    let prediction = state.scheduler.predict(&features);

    let (_, running) = state
        .ctx
        .db
        .count_jobs_by_status(&state.ctx.config.machine_id)
        .map_err(internal)?;
    let capacity_available = (running as usize) < state.ctx.config.max_concurrent_jobs;

    let decision = state
        .scheduler
        .schedule_job(
            &state.ctx.db,
            &job,
            &features,
            &prediction,
            &body.dependencies,
            capacity_available,
        )
        .map_err(internal)?;
    Ok(Json(json!(decision)))
}

pub(crate) async fn scheduling_next(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let jobs = state
        .scheduler
        .next_jobs(&state.ctx.db, q.limit.unwrap_or(10).clamp(1, 100))
        .map_err(internal)?;
    Ok(Json(json!(jobs)))
}

pub(crate) async fn scheduling_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.scheduler.metrics()))
}

pub(crate) async fn scheduling_usage(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UsageBody>,
) -> ApiResult<Json<Value>> {
    let job = state
        .ctx
        .db
        .get_job(body.job_id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("job {} not found", body.job_id)))?;
    let features =
        state
            .scheduler
            .extract_features(&job.prompt, &[], "", Some(job.client_id));
    state.scheduler.record_actual_usage(
        job.client_id,
        &features,
        body.predicted_tokens,
        body.actual_tokens,
    );
    Ok(Json(json!({ "recorded": true })))
}

pub(crate) async fn scheduling_capacity(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
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

pub(crate) async fn scheduling_weights(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.scheduler.export_weights()))
}

pub(crate) async fn scheduling_import_weights(
    State(state): State<Arc<AppState>>,
    Json(weights): Json<foreman_core::scheduler::Weights>,
) -> Json<Value> {
    state.scheduler.import_weights(weights);
    Json(json!({ "imported": true }))
}

// ── Logs ──────────────────────────────────────────────────────────────────

pub(crate) async fn recent_logs(State(state): State<Arc<AppState>>) -> Json<Value> {
    let lines: Vec<String> = state
        .log_ring
        .lock()
        .map(|ring| ring.iter().cloned().collect())
        .unwrap_or_default();
    Json(json!(lines))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_bounds_and_charset() {
        assert_eq!(slugify("Add User Login!", 50), "add-user-login");
        assert_eq!(slugify("  ---  ", 50), "job");
        let long = slugify(&"word ".repeat(40), 50);
        assert!(long.len() <= 50);
        assert!(!long.ends_with('-'));
    }

    #[test]
    fn test_generate_branch_name_uses_type_prefix() {
        let feature = Feature {
            id: 1,
            client_id: 1,
            title: "Fix header".into(),
            notes: String::new(),
            feature_type: Some("bug".into()),
            prd: None,
            spec_output: None,
            spec_phase: None,
            feature_workflow_stage_id: None,
            created_at: Utc::now(),
        };
        let branch = generate_branch_name(Some(&feature), "Fix the broken header").unwrap();
        assert_eq!(branch, "fix/fix-the-broken-header");

        let plain = generate_branch_name(None, "Add search").unwrap();
        assert_eq!(plain, "feature/add-search");

        let mut unknown = feature;
        unknown.feature_type = Some("mystery".into());
        assert!(generate_branch_name(Some(&unknown), "x").is_err());
    }
}
