use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Job enums ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Single-shot implementation run that ends in a PR.
    Code,
    /// Interactive session: stdin stays open, no git mutation.
    Task,
    /// Bounded-iteration loop with a progress sidecar.
    Ralph,
    /// One spec pipeline phase.
    Spec,
    /// PRD generation (accepted, not implemented by the core).
    PrdGeneration,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Code => "code",
            JobType::Task => "task",
            JobType::Ralph => "ralph",
            JobType::Spec => "spec",
            JobType::PrdGeneration => "prd_generation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(JobType::Code),
            "task" => Some(JobType::Task),
            "ralph" => Some(JobType::Ralph),
            "spec" => Some(JobType::Spec),
            "prd_generation" => Some(JobType::PrdGeneration),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    PromiseDetected,
    MaxIterations,
    IterationError,
    ManualStop,
    AllStoriesComplete,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::PromiseDetected => "promise_detected",
            CompletionReason::MaxIterations => "max_iterations",
            CompletionReason::IterationError => "iteration_error",
            CompletionReason::ManualStop => "manual_stop",
            CompletionReason::AllStoriesComplete => "all_stories_complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "promise_detected" => Some(CompletionReason::PromiseDetected),
            "max_iterations" => Some(CompletionReason::MaxIterations),
            "iteration_error" => Some(CompletionReason::IterationError),
            "manual_stop" => Some(CompletionReason::ManualStop),
            "all_stories_complete" => Some(CompletionReason::AllStoriesComplete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Stdout,
    Stderr,
    System,
    UserInput,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Stdout => "stdout",
            MessageType::Stderr => "stderr",
            MessageType::System => "system",
            MessageType::UserInput => "user_input",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(MessageType::Stdout),
            "stderr" => Some(MessageType::Stderr),
            "system" => Some(MessageType::System),
            "user_input" => Some(MessageType::UserInput),
            _ => None,
        }
    }
}

// ── Spec phases ──────────────────────────────────────────────────────────

/// Ordered phases of the spec pipeline. Each phase is executed by its own
/// spec job; completing a phase enqueues the next unless a gate blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecPhase {
    Constitution,
    Specify,
    Clarify,
    Plan,
    Analyze,
    Tasks,
}

impl SpecPhase {
    pub const ALL: [SpecPhase; 6] = [
        SpecPhase::Constitution,
        SpecPhase::Specify,
        SpecPhase::Clarify,
        SpecPhase::Plan,
        SpecPhase::Analyze,
        SpecPhase::Tasks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpecPhase::Constitution => "constitution",
            SpecPhase::Specify => "specify",
            SpecPhase::Clarify => "clarify",
            SpecPhase::Plan => "plan",
            SpecPhase::Analyze => "analyze",
            SpecPhase::Tasks => "tasks",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "constitution" => Some(SpecPhase::Constitution),
            "specify" => Some(SpecPhase::Specify),
            "clarify" => Some(SpecPhase::Clarify),
            "plan" => Some(SpecPhase::Plan),
            "analyze" => Some(SpecPhase::Analyze),
            "tasks" => Some(SpecPhase::Tasks),
            _ => None,
        }
    }

    /// Successor in the linear DAG, or None after `tasks`.
    pub fn next(&self) -> Option<SpecPhase> {
        match self {
            SpecPhase::Constitution => Some(SpecPhase::Specify),
            SpecPhase::Specify => Some(SpecPhase::Clarify),
            SpecPhase::Clarify => Some(SpecPhase::Plan),
            SpecPhase::Plan => Some(SpecPhase::Analyze),
            SpecPhase::Analyze => Some(SpecPhase::Tasks),
            SpecPhase::Tasks => None,
        }
    }

    /// Only clarify waits on a human.
    pub fn requires_human_input(&self) -> bool {
        matches!(self, SpecPhase::Clarify)
    }
}

// ── Tenancy ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub name: String,
    /// Reusable long-form constitution text, shared across the client's features.
    pub constitution: Option<String>,
    pub constitution_generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub client_id: i64,
    pub github_org: String,
    pub github_repo: String,
    pub default_branch: String,
    pub provider: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

impl Repository {
    /// Directory key for the bare mirror: `{owner}__{repo}.git`.
    pub fn mirror_key(&self) -> String {
        format!("{}__{}.git", self.github_org, self.github_repo)
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.github_org, self.github_repo)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: i64,
    pub client_id: i64,
    pub title: String,
    pub notes: String,
    /// Enumerated type selecting branch prefix and special behaviors.
    pub feature_type: Option<String>,
    pub prd: Option<Prd>,
    pub spec_output: Option<SpecOutput>,
    pub spec_phase: Option<String>,
    pub feature_workflow_stage_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Branch prefix for a feature type. Unknown types are input errors at the
/// HTTP layer; this helper only maps the known set.
pub fn branch_prefix(feature_type: &str) -> Option<&'static str> {
    match feature_type {
        "feature" => Some("feature"),
        "bug" => Some("fix"),
        "chore" => Some("chore"),
        "cosmetic" => Some("cosmetic"),
        _ => None,
    }
}

/// Cosmetic features trigger UI screenshot collection after the run.
pub fn is_cosmetic(feature_type: Option<&str>) -> bool {
    feature_type == Some("cosmetic")
}

// ── Agent jobs ───────────────────────────────────────────────────────────

/// The unit the queue processes, as stored in `agent_jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentJob {
    pub id: i64,
    pub client_id: i64,
    pub feature_id: Option<i64>,
    pub repository_id: Option<i64>,
    /// May be empty for spec-mode jobs (the phase builds its own prompt).
    pub prompt: String,
    pub branch_name: String,
    pub title: String,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Worker identity; the queue only admits jobs whose target equals the
    /// local machine. Set at enqueue time, never changed.
    pub target_machine: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub worktree_path: Option<String>,
    pub pid: Option<i64>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_files_changed: Option<i64>,

    // Ralph variants
    pub max_iterations: Option<i64>,
    pub completion_promise: Option<String>,
    pub feedback_commands: Vec<String>,
    pub current_iteration: i64,
    pub total_iterations: Option<i64>,
    pub completion_reason: Option<CompletionReason>,
    pub prd_mode: bool,
    pub prd: Option<Prd>,
    pub prd_progress: Option<PrdProgress>,

    // Spec variant
    pub spec_phase: Option<SpecPhase>,
    pub spec_output: Option<SpecOutput>,

    pub metadata: Option<serde_json::Value>,
}

impl AgentJob {
    /// Sentinel string whose appearance on stdout ends a ralph run.
    pub fn promise(&self) -> &str {
        self.completion_promise.as_deref().unwrap_or("RALPH_COMPLETE")
    }
}

/// Fresh queued job with empty variant fields. Callers fill in what their
/// variant needs before insert.
pub fn new_job(client_id: i64, job_type: JobType, target_machine: &str) -> AgentJob {
    AgentJob {
        id: 0,
        client_id,
        feature_id: None,
        repository_id: None,
        prompt: String::new(),
        branch_name: String::new(),
        title: String::new(),
        job_type,
        status: JobStatus::Queued,
        target_machine: target_machine.to_string(),
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        exit_code: None,
        error: None,
        worktree_path: None,
        pid: None,
        pr_url: None,
        pr_number: None,
        pr_files_changed: None,
        max_iterations: None,
        completion_promise: None,
        feedback_commands: Vec::new(),
        current_iteration: 0,
        total_iterations: None,
        completion_reason: None,
        prd_mode: false,
        prd: None,
        prd_progress: None,
        spec_phase: None,
        spec_output: None,
        metadata: None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub id: i64,
    pub job_id: i64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One row per iteration of a ralph-variant job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobIteration {
    pub id: i64,
    pub job_id: i64,
    pub iteration_number: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub prompt_used: Option<String>,
    pub promise_detected: bool,
    pub output_summary: Option<String>,
    pub feedback_results: Vec<FeedbackResult>,
    pub story_id: Option<i64>,
    pub commit_sha: Option<String>,
    pub error: Option<String>,
}

/// Outcome of one feedback command run after a ralph iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackResult {
    pub command: String,
    pub exit_code: i32,
    pub passed: bool,
    /// First 5 KB of each stream.
    pub stdout: String,
    pub stderr: String,
}

// ── PRD ──────────────────────────────────────────────────────────────────

/// Structured plan the agent edits in the worktree (`prd.json`).
/// Field names match the on-disk JSON the agent reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prd {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub stories: Vec<PrdStory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrdStory {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub passes: bool,
}

impl Prd {
    /// PRD jobs require a non-empty story list with unique numeric ids ≥ 1.
    pub fn validate(&self) -> Result<(), String> {
        if self.stories.is_empty() {
            return Err("prd.stories must not be empty".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for story in &self.stories {
            if story.id < 1 {
                return Err(format!("story id {} must be >= 1", story.id));
            }
            if !seen.insert(story.id) {
                return Err(format!("duplicate story id {}", story.id));
            }
        }
        Ok(())
    }

    pub fn incomplete_stories(&self) -> Vec<&PrdStory> {
        self.stories.iter().filter(|s| !s.passes).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrdProgress {
    pub current_story_id: Option<i64>,
    #[serde(default)]
    pub completed_story_ids: Vec<i64>,
    #[serde(default)]
    pub commits: Vec<StoryCommit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryCommit {
    pub story_id: i64,
    pub sha: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// ── Spec output ──────────────────────────────────────────────────────────

/// Single mutable document stored on the feature. Later phases preserve the
/// slices written by earlier phases; each phase overwrites only its own slice
/// plus `phase`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecOutput {
    pub phase: Option<SpecPhase>,
    pub constitution: Option<String>,
    pub spec: Option<SpecDoc>,
    pub clarifications: Option<Vec<Clarification>>,
    pub plan: Option<PlanDoc>,
    pub analysis: Option<AnalysisDoc>,
    pub tasks: Option<Vec<SpecTask>>,
    /// Regenerate the constitution even when the client already has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_regenerate: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecDoc {
    #[serde(default)]
    pub overview: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub out_of_scope: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clarification {
    pub id: String,
    pub question: String,
    #[serde(default)]
    pub context: String,
    pub response: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDoc {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub tech_decisions: Vec<String>,
    #[serde(default)]
    pub file_structure: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisDoc {
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub existing_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl SpecOutput {
    pub fn unanswered_clarifications(&self) -> usize {
        self.clarifications
            .as_ref()
            .map(|cs| cs.iter().filter(|c| c.response.is_none()).count())
            .unwrap_or(0)
    }
}

// ── Git outputs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBranch {
    pub id: i64,
    pub repository_id: i64,
    pub name: String,
    pub job_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodePullRequest {
    pub id: i64,
    pub repository_id: i64,
    pub number: i64,
    pub url: String,
    pub title: String,
    pub files_changed: Option<i64>,
    pub job_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Result of `gh pr create` + `gh pr view`.
#[derive(Debug, Clone, Serialize)]
pub struct PullRequestInfo {
    pub number: i64,
    pub url: String,
    pub title: String,
    pub files_changed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub id: i64,
    pub feature_id: i64,
    pub order_index: i64,
    pub title: String,
    pub status: String,
}

// ── Workflow stages ──────────────────────────────────────────────────────

/// Fixed stage code table. The core authors all transitions.
pub mod stage {
    pub const READY_FOR_REVIEW: &str = "ready_for_review";
    pub const CLARIFY_WAITING: &str = "clarify_waiting";
    pub const ANALYZE_FAILED: &str = "analyze_failed";
    pub const SPEC_COMPLETE: &str = "spec_complete";

    pub fn running(phase: super::SpecPhase) -> String {
        format!("{}_running", phase.as_str())
    }

    pub fn complete(phase: super::SpecPhase) -> String {
        format!("{}_complete", phase.as_str())
    }

    /// Every code the seed migration inserts into `workflow_stages`.
    pub fn all_codes() -> Vec<String> {
        let mut codes = Vec::new();
        for phase in super::SpecPhase::ALL {
            codes.push(running(phase));
            codes.push(complete(phase));
        }
        codes.push(CLARIFY_WAITING.to_string());
        codes.push(ANALYZE_FAILED.to_string());
        codes.push(SPEC_COMPLETE.to_string());
        codes.push(READY_FOR_REVIEW.to_string());
        codes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_successors_cycle_through_pipeline() {
        assert_eq!(SpecPhase::Constitution.next(), Some(SpecPhase::Specify));
        assert_eq!(SpecPhase::Specify.next(), Some(SpecPhase::Clarify));
        assert_eq!(SpecPhase::Clarify.next(), Some(SpecPhase::Plan));
        assert_eq!(SpecPhase::Plan.next(), Some(SpecPhase::Analyze));
        assert_eq!(SpecPhase::Analyze.next(), Some(SpecPhase::Tasks));
        assert_eq!(SpecPhase::Tasks.next(), None);
    }

    #[test]
    fn test_only_clarify_requires_human_input() {
        for phase in SpecPhase::ALL {
            assert_eq!(
                phase.requires_human_input(),
                phase == SpecPhase::Clarify,
                "{}",
                phase.as_str()
            );
        }
    }

    #[test]
    fn test_status_roundtrip() {
        for s in ["queued", "running", "completed", "failed", "cancelled"] {
            let parsed = JobStatus::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!(JobStatus::parse("bogus").is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_prd_validation() {
        let mut prd = Prd {
            title: "T".into(),
            description: String::new(),
            stories: vec![],
        };
        assert!(prd.validate().is_err());

        prd.stories = vec![
            PrdStory {
                id: 1,
                title: "a".into(),
                description: String::new(),
                acceptance_criteria: vec![],
                passes: false,
            },
            PrdStory {
                id: 2,
                title: "b".into(),
                description: String::new(),
                acceptance_criteria: vec![],
                passes: true,
            },
        ];
        assert!(prd.validate().is_ok());
        assert_eq!(prd.incomplete_stories().len(), 1);

        prd.stories[1].id = 1;
        assert!(prd.validate().is_err());

        prd.stories[1].id = 0;
        assert!(prd.validate().is_err());
    }

    #[test]
    fn test_prd_json_field_names_match_disk_format() {
        let json = r#"{
            "title": "Checkout",
            "description": "",
            "stories": [
                {"id": 1, "title": "Add cart", "acceptanceCriteria": ["works"], "passes": false}
            ]
        }"#;
        let prd: Prd = serde_json::from_str(json).unwrap();
        assert_eq!(prd.stories[0].acceptance_criteria, vec!["works"]);
        let out = serde_json::to_string(&prd).unwrap();
        assert!(out.contains("acceptanceCriteria"));
    }

    #[test]
    fn test_branch_prefix_table() {
        assert_eq!(branch_prefix("feature"), Some("feature"));
        assert_eq!(branch_prefix("bug"), Some("fix"));
        assert_eq!(branch_prefix("cosmetic"), Some("cosmetic"));
        assert_eq!(branch_prefix("unknown"), None);
        assert!(is_cosmetic(Some("cosmetic")));
        assert!(!is_cosmetic(Some("bug")));
        assert!(!is_cosmetic(None));
    }

    #[test]
    fn test_stage_codes_cover_all_phases() {
        let codes = stage::all_codes();
        assert!(codes.contains(&"constitution_running".to_string()));
        assert!(codes.contains(&"tasks_complete".to_string()));
        assert!(codes.contains(&stage::CLARIFY_WAITING.to_string()));
        assert!(codes.contains(&stage::READY_FOR_REVIEW.to_string()));
        assert_eq!(codes.len(), 6 * 2 + 4);
    }
}
