use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::types::AgentJob;

const MAX_HISTORY: usize = 1000;
const CLIENT_USAGE_WINDOW: usize = 20;
const DEFAULT_CLIENT_AVG_TOKENS: f64 = 5000.0;
const TOKENS_PER_SECOND: f64 = 50.0;

/// Weighted complexity patterns, matched case-insensitively against the
/// free-text description. Positive entries add, simplicity entries subtract.
const COMPLEXITY_PATTERNS: [(&str, f64); 12] = [
    ("integrate", 0.3),
    ("migrate", 0.4),
    ("security", 0.3),
    ("authentication", 0.4),
    ("real-time", 0.4),
    ("concurrent", 0.4),
    ("distributed", 0.5),
    ("encryption", 0.4),
    ("payment", 0.4),
    ("websocket", 0.3),
    ("performance", 0.3),
    ("api", 0.2),
];

const SIMPLICITY_PATTERNS: [(&str, f64); 5] = [
    ("simple", 0.2),
    ("basic", 0.2),
    ("minor", 0.3),
    ("typo", 0.4),
    ("comment", 0.3),
];

const TECH_STACK_FACTORS: [(&str, f64); 6] = [
    ("rust", 1.2),
    ("kubernetes", 1.3),
    ("react", 1.1),
    ("ml", 1.4),
    ("mobile", 1.2),
    ("legacy", 1.3),
];

// ── Extracted features ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    pub description_length: usize,
    pub files_to_modify: usize,
    pub complexity_score: f64,
    pub client_avg_tokens: f64,
    pub tech_stack_factor: f64,
    pub has_tests: bool,
    pub has_database: bool,
    pub is_refactor: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub input: f64,
    pub output: f64,
    pub confidence: f64,
    pub breakdown: HashMap<String, f64>,
}

impl Prediction {
    pub fn total(&self) -> f64 {
        self.input + self.output
    }
}

/// Adjustable prediction weights; the persistence seam for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Weights {
    pub base_input_tokens: f64,
    pub base_output_tokens: f64,
    pub tokens_per_file: f64,
    pub complexity_multiplier: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            base_input_tokens: 500.0,
            base_output_tokens: 2000.0,
            tokens_per_file: 800.0,
            complexity_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone)]
struct UsageRecord {
    complexity_score: f64,
    files_to_modify: usize,
    predicted: f64,
    actual: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionMetrics {
    pub total_records: usize,
    pub mean_error_pct: f64,
    pub median_error_pct: f64,
    pub within_50_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingDecision {
    pub priority: i64,
    pub estimated_tokens: f64,
    pub estimated_duration_ms: i64,
    pub scheduled_at: DateTime<Utc>,
}

// ── Pure scoring ─────────────────────────────────────────────────────────

/// Weighted pattern score over the description, clamped to [0.5, 3.0].
pub fn complexity_score(description: &str) -> f64 {
    let text = description.to_lowercase();
    let mut score = 1.0;
    for (pattern, weight) in COMPLEXITY_PATTERNS {
        if text.contains(pattern) {
            score += weight;
        }
    }
    for (pattern, weight) in SIMPLICITY_PATTERNS {
        if text.contains(pattern) {
            score -= weight;
        }
    }
    score.clamp(0.5, 3.0)
}

pub fn tech_stack_factor(tech_stack: &str) -> f64 {
    let text = tech_stack.to_lowercase();
    TECH_STACK_FACTORS
        .iter()
        .filter(|(pattern, _)| text.contains(pattern))
        .map(|(_, factor)| *factor)
        .fold(1.0_f64, f64::max)
}

/// Deterministic prediction given features and weights.
pub fn predict_tokens(features: &Features, weights: &Weights, history_len: usize) -> Prediction {
    let mut input = weights.base_input_tokens + 0.5 * features.description_length as f64;
    let mut output = weights.base_output_tokens;

    let file_tokens = features.files_to_modify as f64 * weights.tokens_per_file;
    input += file_tokens * 0.3;
    output += file_tokens * 0.7;

    output *= 1.0 + (features.complexity_score - 1.0) * (weights.complexity_multiplier - 1.0);
    if features.has_tests {
        output *= 1.3;
    }
    if features.has_database {
        output *= 1.4;
    }
    if features.is_refactor {
        output *= 1.2;
    }
    output *= features.tech_stack_factor;

    let mut breakdown = HashMap::new();
    breakdown.insert("baseInput".to_string(), weights.base_input_tokens);
    breakdown.insert("baseOutput".to_string(), weights.base_output_tokens);
    breakdown.insert("fileTokens".to_string(), file_tokens);
    breakdown.insert("complexityScore".to_string(), features.complexity_score);

    // Blend with the client's historical average, preserving the
    // input/output ratio.
    if features.client_avg_tokens > 0.0 {
        let total = input + output;
        let blended = total * 0.7 + features.client_avg_tokens * 0.3;
        let scale = blended / total;
        input *= scale;
        output *= scale;
        breakdown.insert("historicalBlend".to_string(), features.client_avg_tokens);
    }

    let mut confidence: f64 = 0.7;
    if features.client_avg_tokens > 0.0 && features.client_avg_tokens != DEFAULT_CLIENT_AVG_TOKENS
    {
        confidence += 0.1;
    }
    if features.files_to_modify > 0 {
        confidence += 0.1;
    }
    if history_len >= 50 {
        confidence += 0.1;
    }

    Prediction {
        input,
        output,
        confidence: confidence.min(0.95),
        breakdown,
    }
}

/// Priority score: higher runs sooner under predictive ordering.
pub fn calculate_priority(
    features: &Features,
    prediction: &Prediction,
    urgency: f64,
    tier: &str,
) -> i64 {
    let mut priority = 100.0;
    let total = prediction.total();
    if total <= 5000.0 {
        priority += 20.0;
    } else if total >= 20000.0 {
        priority -= 10.0;
    }
    priority *= urgency;
    priority *= match tier {
        "free" => 0.8,
        "enterprise" => 1.5,
        _ => 1.0,
    };
    if features.complexity_score < 1.2 {
        priority += 10.0;
    } else if features.complexity_score > 2.0 {
        priority -= 5.0;
    }
    priority.round() as i64
}

// ── Scheduler state ──────────────────────────────────────────────────────

struct SchedulerState {
    weights: Weights,
    history: VecDeque<UsageRecord>,
    client_usage: HashMap<i64, VecDeque<f64>>,
}

/// Opt-in predictive scheduler. Weight state is intentionally in-memory;
/// `export_weights` / `import_weights` are the persistence seam.
pub struct PredictiveScheduler {
    state: Mutex<SchedulerState>,
}

impl PredictiveScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                weights: Weights::default(),
                history: VecDeque::new(),
                client_usage: HashMap::new(),
            }),
        }
    }

    pub fn extract_features(
        &self,
        description: &str,
        files_to_modify: &[String],
        tech_stack: &str,
        client_id: Option<i64>,
    ) -> Features {
        let text = description.to_lowercase();
        let client_avg = client_id
            .map(|id| self.client_avg_tokens(id))
            .unwrap_or(DEFAULT_CLIENT_AVG_TOKENS);
        Features {
            description_length: description.len(),
            files_to_modify: files_to_modify.len(),
            complexity_score: complexity_score(description),
            client_avg_tokens: client_avg,
            tech_stack_factor: tech_stack_factor(tech_stack),
            has_tests: text.contains("test")
                || files_to_modify.iter().any(|f| f.to_lowercase().contains("test")),
            has_database: ["database", "migration", "schema", "sql"]
                .iter()
                .any(|kw| text.contains(kw)),
            is_refactor: text.contains("refactor"),
        }
    }

    fn client_avg_tokens(&self, client_id: i64) -> f64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.client_usage.get(&client_id) {
            Some(usages) if !usages.is_empty() => {
                usages.iter().sum::<f64>() / usages.len() as f64
            }
            _ => DEFAULT_CLIENT_AVG_TOKENS,
        }
    }

    pub fn predict(&self, features: &Features) -> Prediction {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        predict_tokens(features, &state.weights, state.history.len())
    }

    /// Compute and persist `metadata.scheduling` for a queued job.
    pub fn schedule_job(
        &self,
        db: &Db,
        job: &AgentJob,
        features: &Features,
        prediction: &Prediction,
        dependencies: &[i64],
        capacity_available: bool,
    ) -> anyhow::Result<SchedulingDecision> {
        let now = Utc::now();
        let total = prediction.total();
        let estimated_duration_ms = (total / TOKENS_PER_SECOND * 1000.0) as i64;

        let blocked_on_dependency = dependencies.iter().any(|dep| {
            db.get_job(*dep)
                .ok()
                .flatten()
                .map(|j| j.status != crate::types::JobStatus::Completed)
                .unwrap_or(true)
        });

        let scheduled_at = if blocked_on_dependency {
            now + Duration::minutes(5)
        } else if capacity_available {
            now
        } else {
            now + Duration::milliseconds(estimated_duration_ms)
        };

        let priority = calculate_priority(features, prediction, 1.0, "pro");
        let decision = SchedulingDecision {
            priority,
            estimated_tokens: total,
            estimated_duration_ms,
            scheduled_at,
        };

        let mut metadata = job
            .metadata
            .clone()
            .filter(|m| m.is_object())
            .unwrap_or_else(|| serde_json::json!({}));
        metadata["scheduling"] = serde_json::json!({
            "priority": decision.priority,
            "estimatedTokens": decision.estimated_tokens,
            "estimatedDurationMs": decision.estimated_duration_ms,
            "scheduledAt": decision.scheduled_at.to_rfc3339(),
        });
        db.update_job_metadata(job.id, &metadata)?;
        Ok(decision)
    }

    /// Queued jobs carrying scheduling metadata, ordered by scheduledAt asc
    /// then priority desc, up to `limit`.
    pub fn next_jobs(&self, db: &Db, limit: usize) -> anyhow::Result<Vec<AgentJob>> {
        let mut jobs: Vec<(AgentJob, DateTime<Utc>, i64)> = db
            .list_scheduled_queued()?
            .into_iter()
            .filter_map(|job| {
                let scheduling = job.metadata.as_ref()?.get("scheduling")?.clone();
                let scheduled_at = scheduling
                    .get("scheduledAt")
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc))?;
                let priority = scheduling.get("priority").and_then(|v| v.as_i64())?;
                Some((job, scheduled_at, priority))
            })
            .collect();
        jobs.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)));
        Ok(jobs.into_iter().take(limit).map(|(job, _, _)| job).collect())
    }

    /// Record observed token usage; every 10th record past 20 triggers a
    /// weight adjustment pass.
    pub fn record_actual_usage(
        &self,
        client_id: i64,
        features: &Features,
        predicted: f64,
        actual: f64,
    ) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.history.push_back(UsageRecord {
            complexity_score: features.complexity_score,
            files_to_modify: features.files_to_modify,
            predicted,
            actual,
        });
        if state.history.len() > MAX_HISTORY {
            state.history.pop_front();
        }

        let usage = state.client_usage.entry(client_id).or_default();
        usage.push_back(actual);
        if usage.len() > CLIENT_USAGE_WINDOW {
            usage.pop_front();
        }

        let n = state.history.len();
        if n >= 20 && n % 10 == 0 {
            adjust_weights(&mut state);
        }
    }

    pub fn metrics(&self) -> PredictionMetrics {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut errors: Vec<f64> = state
            .history
            .iter()
            .filter(|r| r.actual > 0.0)
            .map(|r| ((r.actual - r.predicted) / r.actual).abs() * 100.0)
            .collect();
        if errors.is_empty() {
            return PredictionMetrics {
                total_records: 0,
                mean_error_pct: 0.0,
                median_error_pct: 0.0,
                within_50_pct: 0.0,
            };
        }
        errors.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mean = errors.iter().sum::<f64>() / errors.len() as f64;
        let median = errors[errors.len() / 2];
        let within = errors.iter().filter(|e| **e <= 50.0).count() as f64 / errors.len() as f64;
        PredictionMetrics {
            total_records: errors.len(),
            mean_error_pct: mean,
            median_error_pct: median,
            within_50_pct: within,
        }
    }

    pub fn export_weights(&self) -> Weights {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .weights
            .clone()
    }

    pub fn import_weights(&self, weights: Weights) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).weights = weights;
    }
}

impl Default for PredictiveScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Online adjustment from the last 100 records: scale base output by overall
/// signed error, then the complexity and per-file weights by the error of
/// their high-signal subsets.
fn adjust_weights(state: &mut SchedulerState) {
    let recent: Vec<&UsageRecord> = state
        .history
        .iter()
        .rev()
        .take(100)
        .filter(|r| r.actual > 0.0)
        .collect();
    if recent.is_empty() {
        return;
    }

    let mean_error =
        recent.iter().map(|r| (r.actual - r.predicted) / r.actual).sum::<f64>() / recent.len() as f64;
    if mean_error.abs() > 0.1 {
        state.weights.base_output_tokens *= 1.0 + 0.5 * mean_error;
    }

    let complex: Vec<&&UsageRecord> =
        recent.iter().filter(|r| r.complexity_score > 1.5).collect();
    if !complex.is_empty() {
        let signed = complex.iter().map(|r| (r.actual - r.predicted) / r.actual).sum::<f64>()
            / complex.len() as f64;
        let magnitude = complex
            .iter()
            .map(|r| ((r.actual - r.predicted) / r.actual).abs())
            .sum::<f64>()
            / complex.len() as f64;
        if magnitude > 0.15 {
            state.weights.complexity_multiplier *= 1.0 + 0.3 * signed;
        }
    }

    let many_files: Vec<&&UsageRecord> =
        recent.iter().filter(|r| r.files_to_modify > 3).collect();
    if !many_files.is_empty() {
        let signed = many_files.iter().map(|r| (r.actual - r.predicted) / r.actual).sum::<f64>()
            / many_files.len() as f64;
        let magnitude = many_files
            .iter()
            .map(|r| ((r.actual - r.predicted) / r.actual).abs())
            .sum::<f64>()
            / many_files.len() as f64;
        if magnitude > 0.15 {
            state.weights.tokens_per_file *= 1.0 + 0.3 * signed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_features(description: &str, files: usize) -> Features {
        Features {
            description_length: description.len(),
            files_to_modify: files,
            complexity_score: complexity_score(description),
            client_avg_tokens: 0.0,
            tech_stack_factor: 1.0,
            has_tests: false,
            has_database: false,
            is_refactor: false,
        }
    }

    #[test]
    fn test_complexity_simple_text_is_neutral() {
        assert_eq!(complexity_score("add a button"), 1.0);
    }

    #[test]
    fn test_complexity_is_case_insensitive() {
        assert_eq!(
            complexity_score("MIGRATE the AUTHENTICATION flow"),
            complexity_score("migrate the authentication flow")
        );
    }

    #[test]
    fn test_complexity_is_clamped() {
        let heavy =
            "integrate migrate security authentication real-time concurrent distributed encryption";
        assert_eq!(complexity_score(heavy), 3.0);
        assert_eq!(complexity_score("fix typo in comment, minor simple basic"), 0.5);
    }

    #[test]
    fn test_complexity_monotonic_under_added_patterns() {
        let base = complexity_score("update the login page");
        let more = complexity_score("update the login page and integrate authentication");
        assert!(more > base);
    }

    #[test]
    fn test_prediction_is_deterministic() {
        let features = plain_features("add api integration", 3);
        let weights = Weights::default();
        let a = predict_tokens(&features, &weights, 0);
        let b = predict_tokens(&features, &weights, 0);
        assert_eq!(a.input, b.input);
        assert_eq!(a.output, b.output);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn test_prediction_base_values() {
        let features = plain_features("", 0);
        let p = predict_tokens(&features, &Weights::default(), 0);
        assert_eq!(p.input, 500.0);
        assert_eq!(p.output, 2000.0);
        assert_eq!(p.confidence, 0.7);
    }

    #[test]
    fn test_prediction_multipliers_increase_output() {
        let mut features = plain_features("change things", 2);
        let base = predict_tokens(&features, &Weights::default(), 0);
        features.has_tests = true;
        features.has_database = true;
        let boosted = predict_tokens(&features, &Weights::default(), 0);
        assert!(boosted.output > base.output);
        // Input is unaffected by the output multipliers.
        assert_eq!(boosted.input, base.input);
    }

    #[test]
    fn test_historical_blend_preserves_ratio() {
        let mut features = plain_features("work", 2);
        features.client_avg_tokens = 10_000.0;
        let p = predict_tokens(&features, &Weights::default(), 0);
        let unblended = {
            let mut f = features.clone();
            f.client_avg_tokens = 0.0;
            predict_tokens(&f, &Weights::default(), 0)
        };
        let ratio_before = unblended.input / unblended.output;
        let ratio_after = p.input / p.output;
        assert!((ratio_before - ratio_after).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_caps_at_095() {
        let mut features = plain_features("work", 4);
        features.client_avg_tokens = 7000.0;
        let p = predict_tokens(&features, &Weights::default(), 100);
        assert!((p.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_priority_tiers_and_bounds() {
        let features = plain_features("simple fix", 0);
        let p = predict_tokens(&features, &Weights::default(), 0);
        // Small prediction, low complexity: 100 + 20, +10, tier multipliers.
        assert_eq!(calculate_priority(&features, &p, 1.0, "pro"), 130);
        assert_eq!(calculate_priority(&features, &p, 1.0, "free"), 106);
        assert_eq!(calculate_priority(&features, &p, 1.0, "enterprise"), 190);
        assert_eq!(calculate_priority(&features, &p, 2.0, "pro"), 250);
    }

    #[test]
    fn test_record_usage_adjusts_weights_after_threshold() {
        let scheduler = PredictiveScheduler::new();
        let features = plain_features("work item", 1);
        let before = scheduler.export_weights().base_output_tokens;
        // 20 records of heavy underprediction trigger an adjustment at n=20.
        for _ in 0..20 {
            scheduler.record_actual_usage(1, &features, 1000.0, 4000.0);
        }
        let after = scheduler.export_weights().base_output_tokens;
        assert!(after > before, "{after} should exceed {before}");
    }

    #[test]
    fn test_client_average_feeds_extraction() {
        let scheduler = PredictiveScheduler::new();
        for _ in 0..5 {
            scheduler.record_actual_usage(7, &plain_features("x", 0), 1000.0, 3000.0);
        }
        let features = scheduler.extract_features("tweak styles", &[], "", Some(7));
        assert!((features.client_avg_tokens - 3000.0).abs() < 1e-9);
        let unknown = scheduler.extract_features("tweak styles", &[], "", Some(99));
        assert_eq!(unknown.client_avg_tokens, DEFAULT_CLIENT_AVG_TOKENS);
    }

    #[test]
    fn test_metrics_shape() {
        let scheduler = PredictiveScheduler::new();
        scheduler.record_actual_usage(1, &plain_features("x", 0), 1000.0, 1000.0);
        scheduler.record_actual_usage(1, &plain_features("x", 0), 500.0, 1000.0);
        let m = scheduler.metrics();
        assert_eq!(m.total_records, 2);
        assert!(m.mean_error_pct > 0.0);
        assert!((m.within_50_pct - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_schedule_job_persists_metadata_and_defers_on_dependencies() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().unwrap();
        let client_id = db.insert_client("acme").unwrap();
        let scheduler = PredictiveScheduler::new();

        let dep_id = db
            .insert_job(&crate::types::new_job(client_id, crate::types::JobType::Code, "m"))
            .unwrap();
        let job_id = db
            .insert_job(&crate::types::new_job(client_id, crate::types::JobType::Code, "m"))
            .unwrap();
        let job = db.get_job(job_id).unwrap().unwrap();

        let features = plain_features("work", 1);
        let prediction = scheduler.predict(&features);

        // Incomplete dependency pushes the start out by five minutes.
        let decision = scheduler
            .schedule_job(&db, &job, &features, &prediction, &[dep_id], true)
            .unwrap();
        assert!(decision.scheduled_at > Utc::now() + Duration::minutes(4));

        let stored = db.get_job(job_id).unwrap().unwrap();
        let scheduling = stored.metadata.unwrap()["scheduling"].clone();
        assert_eq!(scheduling["priority"].as_i64(), Some(decision.priority));
        assert!(scheduling["estimatedDurationMs"].as_i64().unwrap() > 0);

        // With the dependency completed and capacity free, it starts now.
        db.mark_job_running(dep_id).unwrap();
        db.finish_job(dep_id, crate::types::JobStatus::Completed, Some(0), None)
            .unwrap();
        let decision = scheduler
            .schedule_job(&db, &job, &features, &prediction, &[dep_id], true)
            .unwrap();
        assert!(decision.scheduled_at <= Utc::now() + Duration::seconds(1));
    }

    #[test]
    fn test_next_jobs_orders_by_schedule_then_priority() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().unwrap();
        let client_id = db.insert_client("acme").unwrap();

        let seed = |scheduled_at: &str, priority: i64| {
            let id = db
                .insert_job(&crate::types::new_job(client_id, crate::types::JobType::Code, "m"))
                .unwrap();
            let metadata = serde_json::json!({
                "scheduling": {
                    "priority": priority,
                    "estimatedTokens": 1000.0,
                    "estimatedDurationMs": 20_000,
                    "scheduledAt": scheduled_at,
                }
            });
            db.update_job_metadata(id, &metadata).unwrap();
            id
        };

        let late = seed("2030-01-01T12:00:00Z", 200);
        let early_low = seed("2030-01-01T09:00:00Z", 50);
        let early_high = seed("2030-01-01T09:00:00Z", 150);

        let scheduler = PredictiveScheduler::new();
        let ordered: Vec<i64> = scheduler
            .next_jobs(&db, 10)
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ordered, vec![early_high, early_low, late]);

        let capped = scheduler.next_jobs(&db, 2).unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn test_feature_flags_detected() {
        let scheduler = PredictiveScheduler::new();
        let f = scheduler.extract_features(
            "refactor the database migration tests",
            &["src/db/tests.rs".into()],
            "rust",
            None,
        );
        assert!(f.has_tests);
        assert!(f.has_database);
        assert!(f.is_refactor);
        assert!((f.tech_stack_factor - 1.2).abs() < 1e-9);
    }
}
