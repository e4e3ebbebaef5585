use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    AgentJob, Client, CodeBranch, CodePullRequest, CompletionReason, Feature, JobIteration,
    JobMessage, JobStatus, JobType, MessageType, Prd, PrdProgress, PullRequestInfo, Repository,
    SpecOutput, SpecPhase, Todo,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_ts(&s))
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn now_str() -> String {
    fmt_ts(Utc::now())
}

// ── JSON column helpers ───────────────────────────────────────────────────

fn to_json<T: serde::Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value).ok()
}

fn from_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
    let created_at: String = row.get(4)?;
    Ok(Client {
        id: row.get(0)?,
        name: row.get(1)?,
        constitution: row.get(2)?,
        constitution_generated_at: parse_ts_opt(row.get(3)?),
        created_at: parse_ts(&created_at),
    })
}

fn row_to_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
    let created_at: String = row.get(7)?;
    Ok(Repository {
        id: row.get(0)?,
        client_id: row.get(1)?,
        github_org: row.get(2)?,
        github_repo: row.get(3)?,
        default_branch: row.get(4)?,
        provider: row.get(5)?,
        url: row.get(6)?,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_feature(row: &rusqlite::Row<'_>) -> rusqlite::Result<Feature> {
    let created_at: String = row.get(9)?;
    Ok(Feature {
        id: row.get(0)?,
        client_id: row.get(1)?,
        title: row.get(2)?,
        notes: row.get(3)?,
        feature_type: row.get(4)?,
        prd: from_json(row.get(5)?),
        spec_output: from_json(row.get(6)?),
        spec_phase: row.get(7)?,
        feature_workflow_stage_id: row.get(8)?,
        created_at: parse_ts(&created_at),
    })
}

const JOB_COLUMNS: &str = "id, client_id, feature_id, repository_id, prompt, branch_name, title, \
     job_type, status, target_machine, created_at, started_at, completed_at, exit_code, error, \
     worktree_path, pid, pr_url, pr_number, pr_files_changed, max_iterations, completion_promise, \
     feedback_commands, current_iteration, total_iterations, completion_reason, prd_mode, prd, \
     prd_progress, spec_phase, spec_output, metadata";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentJob> {
    let job_type: String = row.get(7)?;
    let status: String = row.get(8)?;
    let created_at: String = row.get(10)?;
    let completion_reason: Option<String> = row.get(25)?;
    let spec_phase: Option<String> = row.get(29)?;
    let prd_mode: i64 = row.get(26)?;
    let metadata: Option<String> = row.get(31)?;
    Ok(AgentJob {
        id: row.get(0)?,
        client_id: row.get(1)?,
        feature_id: row.get(2)?,
        repository_id: row.get(3)?,
        prompt: row.get(4)?,
        branch_name: row.get(5)?,
        title: row.get(6)?,
        job_type: JobType::parse(&job_type).unwrap_or(JobType::Code),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        target_machine: row.get(9)?,
        created_at: parse_ts(&created_at),
        started_at: parse_ts_opt(row.get(11)?),
        completed_at: parse_ts_opt(row.get(12)?),
        exit_code: row.get(13)?,
        error: row.get(14)?,
        worktree_path: row.get(15)?,
        pid: row.get(16)?,
        pr_url: row.get(17)?,
        pr_number: row.get(18)?,
        pr_files_changed: row.get(19)?,
        max_iterations: row.get(20)?,
        completion_promise: row.get(21)?,
        feedback_commands: from_json(row.get(22)?).unwrap_or_default(),
        current_iteration: row.get(23)?,
        total_iterations: row.get(24)?,
        completion_reason: completion_reason.as_deref().and_then(CompletionReason::parse),
        prd_mode: prd_mode != 0,
        prd: from_json(row.get(27)?),
        prd_progress: from_json(row.get(28)?),
        spec_phase: spec_phase.as_deref().and_then(SpecPhase::parse),
        spec_output: from_json(row.get(30)?),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobMessage> {
    let message_type: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    Ok(JobMessage {
        id: row.get(0)?,
        job_id: row.get(1)?,
        message_type: MessageType::parse(&message_type).unwrap_or(MessageType::System),
        content: row.get(3)?,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_iteration(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobIteration> {
    let started_at: String = row.get(3)?;
    let promise_detected: i64 = row.get(7)?;
    Ok(JobIteration {
        id: row.get(0)?,
        job_id: row.get(1)?,
        iteration_number: row.get(2)?,
        started_at: parse_ts(&started_at),
        completed_at: parse_ts_opt(row.get(4)?),
        exit_code: row.get(5)?,
        prompt_used: row.get(6)?,
        promise_detected: promise_detected != 0,
        output_summary: row.get(8)?,
        feedback_results: from_json(row.get(9)?).unwrap_or_default(),
        story_id: row.get(10)?,
        commit_sha: row.get(11)?,
        error: row.get(12)?,
    })
}

fn row_to_branch(row: &rusqlite::Row<'_>) -> rusqlite::Result<CodeBranch> {
    let created_at: String = row.get(4)?;
    Ok(CodeBranch {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        name: row.get(2)?,
        job_id: row.get(3)?,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_pull_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<CodePullRequest> {
    let created_at: String = row.get(7)?;
    Ok(CodePullRequest {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        number: row.get(2)?,
        url: row.get(3)?,
        title: row.get(4)?,
        files_changed: row.get(5)?,
        job_id: row.get(6)?,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_todo(row: &rusqlite::Row<'_>) -> rusqlite::Result<Todo> {
    Ok(Todo {
        id: row.get(0)?,
        feature_id: row.get(1)?,
        order_index: row.get(2)?,
        title: row.get(3)?,
        status: row.get(4)?,
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        // Seed the fixed workflow stage code table. INSERT OR IGNORE keeps
        // this idempotent across restarts.
        for code in crate::types::stage::all_codes() {
            let label = code.replace('_', " ");
            conn.execute(
                "INSERT OR IGNORE INTO workflow_stages (code, label) VALUES (?1, ?2)",
                params![code, label],
            )
            .context("seed workflow_stages")?;
        }
        Ok(())
    }

    // ── Clients ───────────────────────────────────────────────────────────

    pub fn insert_client(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO clients (name, created_at) VALUES (?1, ?2)",
            params![name, now_str()],
        )
        .context("insert_client")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_client(&self, id: i64) -> Result<Option<Client>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, name, constitution, constitution_generated_at, created_at \
             FROM clients WHERE id = ?1",
            params![id],
            row_to_client,
        )
        .optional()
        .context("get_client")
    }

    pub fn list_clients(&self) -> Result<Vec<Client>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, name, constitution, constitution_generated_at, created_at \
             FROM clients ORDER BY id ASC",
        )?;
        let clients = stmt
            .query_map([], row_to_client)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_clients")?;
        Ok(clients)
    }

    pub fn update_client_constitution(&self, id: i64, constitution: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE clients SET constitution = ?1, constitution_generated_at = ?2 WHERE id = ?3",
            params![constitution, now_str(), id],
        )
        .context("update_client_constitution")?;
        Ok(())
    }

    // ── Repositories ──────────────────────────────────────────────────────

    pub fn insert_repository(
        &self,
        client_id: i64,
        github_org: &str,
        github_repo: &str,
        default_branch: &str,
    ) -> Result<i64> {
        let url = format!("https://github.com/{github_org}/{github_repo}.git");
        self.insert_repository_with_url(client_id, github_org, github_repo, default_branch, &url)
    }

    /// Variant for providers with non-standard clone URLs (also the seam
    /// tests use to point at local origins).
    pub fn insert_repository_with_url(
        &self,
        client_id: i64,
        github_org: &str,
        github_repo: &str,
        default_branch: &str,
        url: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO code_repositories \
             (client_id, github_org, github_repo, default_branch, provider, url, created_at) \
             VALUES (?1, ?2, ?3, ?4, 'github', ?5, ?6)",
            params![client_id, github_org, github_repo, default_branch, url, now_str()],
        )
        .context("insert_repository")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, client_id, github_org, github_repo, default_branch, provider, url, \
             created_at FROM code_repositories WHERE id = ?1",
            params![id],
            row_to_repository,
        )
        .optional()
        .context("get_repository")
    }

    pub fn get_repository_for_client(&self, client_id: i64) -> Result<Option<Repository>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, client_id, github_org, github_repo, default_branch, provider, url, \
             created_at FROM code_repositories WHERE client_id = ?1 ORDER BY id ASC LIMIT 1",
            params![client_id],
            row_to_repository,
        )
        .optional()
        .context("get_repository_for_client")
    }

    pub fn find_repository(&self, github_org: &str, github_repo: &str) -> Result<Option<Repository>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, client_id, github_org, github_repo, default_branch, provider, url, \
             created_at FROM code_repositories WHERE github_org = ?1 AND github_repo = ?2",
            params![github_org, github_repo],
            row_to_repository,
        )
        .optional()
        .context("find_repository")
    }

    // ── Features ──────────────────────────────────────────────────────────

    pub fn insert_feature(
        &self,
        client_id: i64,
        title: &str,
        notes: &str,
        feature_type: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO features (client_id, title, notes, feature_type, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![client_id, title, notes, feature_type, now_str()],
        )
        .context("insert_feature")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_feature(&self, id: i64) -> Result<Option<Feature>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, client_id, title, notes, feature_type, prd, spec_output, spec_phase, \
             feature_workflow_stage_id, created_at FROM features WHERE id = ?1",
            params![id],
            row_to_feature,
        )
        .optional()
        .context("get_feature")
    }

    pub fn update_feature_spec_output(&self, id: i64, output: &SpecOutput) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let phase = output.phase.map(|p| p.as_str().to_string());
        conn.execute(
            "UPDATE features SET spec_output = ?1, spec_phase = ?2 WHERE id = ?3",
            params![to_json(output), phase, id],
        )
        .context("update_feature_spec_output")?;
        Ok(())
    }

    pub fn update_feature_prd(&self, id: i64, prd: &Prd) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE features SET prd = ?1 WHERE id = ?2",
            params![to_json(prd), id],
        )
        .context("update_feature_prd")?;
        Ok(())
    }

    /// Move a feature to a workflow stage by code. Unknown codes are an
    /// internal error: the stage table is seeded from a fixed list.
    pub fn set_feature_stage(&self, feature_id: i64, code: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let stage_id: i64 = conn
            .query_row(
                "SELECT id FROM workflow_stages WHERE code = ?1",
                params![code],
                |r| r.get(0),
            )
            .with_context(|| format!("unknown workflow stage code: {code}"))?;
        conn.execute(
            "UPDATE features SET feature_workflow_stage_id = ?1 WHERE id = ?2",
            params![stage_id, feature_id],
        )
        .context("set_feature_stage")?;
        Ok(())
    }

    pub fn get_feature_stage_code(&self, feature_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT ws.code FROM features f \
             JOIN workflow_stages ws ON ws.id = f.feature_workflow_stage_id \
             WHERE f.id = ?1",
            params![feature_id],
            |r| r.get(0),
        )
        .optional()
        .context("get_feature_stage_code")
    }

    // ── Agent jobs ────────────────────────────────────────────────────────

    /// Insert a job row. `job.id` is ignored; the assigned rowid is returned.
    pub fn insert_job(&self, job: &AgentJob) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO agent_jobs \
             (client_id, feature_id, repository_id, prompt, branch_name, title, job_type, \
              status, target_machine, created_at, max_iterations, completion_promise, \
              feedback_commands, current_iteration, prd_mode, prd, prd_progress, spec_phase, \
              spec_output, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, ?14, ?15, ?16, \
              ?17, ?18, ?19)",
            params![
                job.client_id,
                job.feature_id,
                job.repository_id,
                job.prompt,
                job.branch_name,
                job.title,
                job.job_type.as_str(),
                job.status.as_str(),
                job.target_machine,
                fmt_ts(job.created_at),
                job.max_iterations,
                job.completion_promise,
                to_json(&job.feedback_commands),
                job.prd_mode as i64,
                job.prd.as_ref().and_then(to_json),
                job.prd_progress.as_ref().and_then(to_json),
                job.spec_phase.map(|p| p.as_str().to_string()),
                job.spec_output.as_ref().and_then(to_json),
                job.metadata.as_ref().and_then(to_json),
            ],
        )
        .context("insert_job")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_job(&self, id: i64) -> Result<Option<AgentJob>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM agent_jobs WHERE id = ?1"),
            params![id],
            row_to_job,
        )
        .optional()
        .context("get_job")
    }

    pub fn list_jobs(
        &self,
        status: Option<JobStatus>,
        client_id: Option<i64>,
        feature_id: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AgentJob>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM agent_jobs \
             WHERE (?1 IS NULL OR status = ?1) \
               AND (?2 IS NULL OR client_id = ?2) \
               AND (?3 IS NULL OR feature_id = ?3) \
             ORDER BY id DESC LIMIT ?4 OFFSET ?5"
        ))?;
        let jobs = stmt
            .query_map(
                params![
                    status.map(|s| s.as_str().to_string()),
                    client_id,
                    feature_id,
                    limit,
                    offset
                ],
                row_to_job,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_jobs")?;
        Ok(jobs)
    }

    /// Oldest queued jobs assigned to this machine, FIFO by created_at.
    pub fn list_queued_for_machine(&self, machine: &str, limit: i64) -> Result<Vec<AgentJob>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM agent_jobs \
             WHERE status = 'queued' AND target_machine = ?1 \
             ORDER BY created_at ASC, id ASC LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(params![machine, limit], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_queued_for_machine")?;
        Ok(jobs)
    }

    pub fn list_running_for_machine(&self, machine: &str) -> Result<Vec<AgentJob>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM agent_jobs \
             WHERE status = 'running' AND target_machine = ?1 ORDER BY started_at ASC, id ASC"
        ))?;
        let jobs = stmt
            .query_map(params![machine], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_running_for_machine")?;
        Ok(jobs)
    }

    /// Queued jobs (any machine) carrying `metadata.scheduling`, for the
    /// predictive scheduler's ordering pass.
    pub fn list_scheduled_queued(&self) -> Result<Vec<AgentJob>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM agent_jobs \
             WHERE status = 'queued' AND metadata IS NOT NULL ORDER BY id ASC"
        ))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_scheduled_queued")?;
        Ok(jobs)
    }

    /// Atomic admission: flips queued → running and stamps started_at.
    /// Returns false when another pass already claimed the job.
    pub fn mark_job_running(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "UPDATE agent_jobs SET status = 'running', started_at = ?1 \
                 WHERE id = ?2 AND status = 'queued'",
                params![now_str(), id],
            )
            .context("mark_job_running")?;
        Ok(changed == 1)
    }

    /// Startup sweep: the previous process died, so any row still marked
    /// running on this machine has no live handle. Back to queued.
    pub fn requeue_running_for_machine(&self, machine: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "UPDATE agent_jobs SET status = 'queued', started_at = NULL, pid = NULL \
                 WHERE status = 'running' AND target_machine = ?1",
                params![machine],
            )
            .context("requeue_running_for_machine")?;
        Ok(changed)
    }

    /// Terminal transition. No-op (returns false) when the row is already
    /// terminal, so cancel/complete races resolve to first-writer-wins.
    pub fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        exit_code: Option<i64>,
        error: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "UPDATE agent_jobs SET status = ?1, exit_code = ?2, error = ?3, \
                 completed_at = ?4 \
                 WHERE id = ?5 AND status IN ('queued', 'running')",
                params![status.as_str(), exit_code, error, now_str(), id],
            )
            .context("finish_job")?;
        Ok(changed == 1)
    }

    pub fn set_job_worktree(&self, id: i64, worktree_path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agent_jobs SET worktree_path = ?1 WHERE id = ?2",
            params![worktree_path, id],
        )
        .context("set_job_worktree")?;
        Ok(())
    }

    pub fn set_job_pid(&self, id: i64, pid: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agent_jobs SET pid = ?1 WHERE id = ?2",
            params![pid, id],
        )
        .context("set_job_pid")?;
        Ok(())
    }

    pub fn set_job_pr(&self, id: i64, pr: &PullRequestInfo) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agent_jobs SET pr_url = ?1, pr_number = ?2, pr_files_changed = ?3 \
             WHERE id = ?4",
            params![pr.url, pr.number, pr.files_changed, id],
        )
        .context("set_job_pr")?;
        Ok(())
    }

    pub fn set_job_current_iteration(&self, id: i64, iteration: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agent_jobs SET current_iteration = ?1 WHERE id = ?2",
            params![iteration, id],
        )
        .context("set_job_current_iteration")?;
        Ok(())
    }

    pub fn set_job_totals(
        &self,
        id: i64,
        total_iterations: i64,
        reason: CompletionReason,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agent_jobs SET total_iterations = ?1, completion_reason = ?2 WHERE id = ?3",
            params![total_iterations, reason.as_str(), id],
        )
        .context("set_job_totals")?;
        Ok(())
    }

    pub fn update_job_prd_progress(&self, id: i64, progress: &PrdProgress) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agent_jobs SET prd_progress = ?1 WHERE id = ?2",
            params![to_json(progress), id],
        )
        .context("update_job_prd_progress")?;
        Ok(())
    }

    pub fn update_job_spec_output(&self, id: i64, output: &SpecOutput) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agent_jobs SET spec_output = ?1 WHERE id = ?2",
            params![to_json(output), id],
        )
        .context("update_job_spec_output")?;
        Ok(())
    }

    pub fn update_job_metadata(&self, id: i64, metadata: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agent_jobs SET metadata = ?1 WHERE id = ?2",
            params![to_json(metadata), id],
        )
        .context("update_job_metadata")?;
        Ok(())
    }

    pub fn count_jobs_by_status(&self, machine: &str) -> Result<(i64, i64)> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let queued: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM agent_jobs WHERE status = 'queued' AND target_machine = ?1",
                params![machine],
                |r| r.get(0),
            )
            .context("count queued")?;
        let running: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM agent_jobs WHERE status = 'running' AND target_machine = ?1",
                params![machine],
                |r| r.get(0),
            )
            .context("count running")?;
        Ok((queued, running))
    }

    /// Recent spec jobs for a feature, newest first.
    pub fn list_spec_jobs_for_feature(&self, feature_id: i64, limit: i64) -> Result<Vec<AgentJob>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM agent_jobs \
             WHERE feature_id = ?1 AND job_type = 'spec' ORDER BY id DESC LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(params![feature_id, limit], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_spec_jobs_for_feature")?;
        Ok(jobs)
    }

    // ── Messages ──────────────────────────────────────────────────────────

    pub fn insert_message(&self, job_id: i64, kind: MessageType, content: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO agent_job_messages (job_id, type, content, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![job_id, kind.as_str(), content, now_str()],
        )
        .context("insert_message")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_messages(&self, job_id: i64, limit: i64) -> Result<Vec<JobMessage>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, job_id, type, content, created_at FROM agent_job_messages \
             WHERE job_id = ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let messages = stmt
            .query_map(params![job_id, limit], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_messages")?;
        Ok(messages)
    }

    // ── Iterations ────────────────────────────────────────────────────────

    pub fn insert_iteration(&self, job_id: i64, iteration_number: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO agent_job_iterations (job_id, iteration_number, started_at) \
             VALUES (?1, ?2, ?3)",
            params![job_id, iteration_number, now_str()],
        )
        .context("insert_iteration")?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn complete_iteration(
        &self,
        id: i64,
        exit_code: Option<i64>,
        prompt_used: &str,
        promise_detected: bool,
        output_summary: Option<&str>,
        feedback_results: &[crate::types::FeedbackResult],
        story_id: Option<i64>,
        commit_sha: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agent_job_iterations SET completed_at = ?1, exit_code = ?2, \
             prompt_used = ?3, promise_detected = ?4, output_summary = ?5, \
             feedback_results = ?6, story_id = ?7, commit_sha = ?8, error = ?9 \
             WHERE id = ?10",
            params![
                now_str(),
                exit_code,
                prompt_used,
                promise_detected as i64,
                output_summary,
                to_json(&feedback_results),
                story_id,
                commit_sha,
                error,
                id
            ],
        )
        .context("complete_iteration")?;
        Ok(())
    }

    pub fn list_iterations(&self, job_id: i64) -> Result<Vec<JobIteration>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, job_id, iteration_number, started_at, completed_at, exit_code, \
             prompt_used, promise_detected, output_summary, feedback_results, story_id, \
             commit_sha, error \
             FROM agent_job_iterations WHERE job_id = ?1 ORDER BY iteration_number ASC",
        )?;
        let iterations = stmt
            .query_map(params![job_id], row_to_iteration)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_iterations")?;
        Ok(iterations)
    }

    // ── Branches / PRs ────────────────────────────────────────────────────

    pub fn upsert_branch(&self, repository_id: i64, name: &str, job_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO code_branches (repository_id, name, job_id, created_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (repository_id, name) DO UPDATE SET job_id = excluded.job_id",
            params![repository_id, name, job_id, now_str()],
        )
        .context("upsert_branch")?;
        Ok(())
    }

    pub fn upsert_pull_request(
        &self,
        repository_id: i64,
        pr: &PullRequestInfo,
        job_id: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO code_pull_requests \
             (repository_id, number, url, title, files_changed, job_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT (repository_id, number) DO UPDATE SET \
               url = excluded.url, title = excluded.title, \
               files_changed = excluded.files_changed, job_id = excluded.job_id",
            params![
                repository_id,
                pr.number,
                pr.url,
                pr.title,
                pr.files_changed,
                job_id,
                now_str()
            ],
        )
        .context("upsert_pull_request")?;
        Ok(())
    }

    pub fn list_branches_for_job(&self, job_id: i64) -> Result<Vec<CodeBranch>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, repository_id, name, job_id, created_at FROM code_branches \
             WHERE job_id = ?1 ORDER BY id ASC",
        )?;
        let branches = stmt
            .query_map(params![job_id], row_to_branch)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_branches_for_job")?;
        Ok(branches)
    }

    pub fn list_pull_requests_for_job(&self, job_id: i64) -> Result<Vec<CodePullRequest>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, repository_id, number, url, title, files_changed, job_id, created_at \
             FROM code_pull_requests WHERE job_id = ?1 ORDER BY id ASC",
        )?;
        let prs = stmt
            .query_map(params![job_id], row_to_pull_request)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_pull_requests_for_job")?;
        Ok(prs)
    }

    // ── Todos ─────────────────────────────────────────────────────────────

    pub fn upsert_todo(
        &self,
        feature_id: i64,
        order_index: i64,
        title: &str,
        status: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO todos (feature_id, order_index, title, status) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (feature_id, order_index) DO UPDATE SET \
               title = excluded.title, status = excluded.status",
            params![feature_id, order_index, title, status],
        )
        .context("upsert_todo")?;
        Ok(())
    }

    /// Best-effort status flip for an existing todo row; missing rows are
    /// left alone (the PRD may be wider than the todo list).
    pub fn set_todo_status(&self, feature_id: i64, order_index: i64, status: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "UPDATE todos SET status = ?1 WHERE feature_id = ?2 AND order_index = ?3",
                params![status, feature_id, order_index],
            )
            .context("set_todo_status")?;
        Ok(changed == 1)
    }

    pub fn list_todos(&self, feature_id: i64) -> Result<Vec<Todo>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, feature_id, order_index, title, status FROM todos \
             WHERE feature_id = ?1 ORDER BY order_index ASC",
        )?;
        let todos = stmt
            .query_map(params![feature_id], row_to_todo)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_todos")?;
        Ok(todos)
    }

    // ── Attachments ───────────────────────────────────────────────────────

    pub fn insert_attachment(
        &self,
        job_id: Option<i64>,
        feature_id: Option<i64>,
        kind: &str,
        path: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO attachments (job_id, feature_id, kind, path, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id, feature_id, kind, path, now_str()],
        )
        .context("insert_attachment")?;
        Ok(conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::new_job;

    fn test_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn seed_job(db: &Db, machine: &str) -> i64 {
        let client_id = db.insert_client("acme").unwrap();
        let job = new_job(client_id, JobType::Code, machine);
        db.insert_job(&job).unwrap()
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let db = test_db();
        db.migrate().unwrap();
    }

    #[test]
    fn test_job_roundtrip_preserves_variant_fields() {
        let db = test_db();
        let client_id = db.insert_client("acme").unwrap();
        let mut job = new_job(client_id, JobType::Ralph, "m1");
        job.max_iterations = Some(5);
        job.completion_promise = Some("RALPH_COMPLETE".into());
        job.feedback_commands = vec!["cargo test".into()];
        job.prd_mode = true;
        job.prd = Some(Prd {
            title: "T".into(),
            description: String::new(),
            stories: vec![crate::types::PrdStory {
                id: 1,
                title: "s".into(),
                description: String::new(),
                acceptance_criteria: vec![],
                passes: false,
            }],
        });
        let id = db.insert_job(&job).unwrap();

        let loaded = db.get_job(id).unwrap().unwrap();
        assert_eq!(loaded.job_type, JobType::Ralph);
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.max_iterations, Some(5));
        assert_eq!(loaded.feedback_commands, vec!["cargo test".to_string()]);
        assert!(loaded.prd_mode);
        assert_eq!(loaded.prd.unwrap().stories.len(), 1);
        assert!(loaded.started_at.is_none());
        assert!(loaded.completed_at.is_none());
    }

    #[test]
    fn test_mark_job_running_is_conditional() {
        let db = test_db();
        let id = seed_job(&db, "m1");
        assert!(db.mark_job_running(id).unwrap());
        // Second claim must lose.
        assert!(!db.mark_job_running(id).unwrap());
        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_finish_job_refuses_terminal_rows() {
        let db = test_db();
        let id = seed_job(&db, "m1");
        db.mark_job_running(id).unwrap();
        assert!(db.finish_job(id, JobStatus::Completed, Some(0), None).unwrap());
        // Already terminal; a late cancel must not overwrite.
        assert!(!db.finish_job(id, JobStatus::Cancelled, None, None).unwrap());
        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_requeue_running_only_touches_this_machine() {
        let db = test_db();
        let mine = seed_job(&db, "m1");
        let theirs = seed_job(&db, "m2");
        db.mark_job_running(mine).unwrap();
        db.mark_job_running(theirs).unwrap();

        let swept = db.requeue_running_for_machine("m1").unwrap();
        assert_eq!(swept, 1);
        assert_eq!(db.get_job(mine).unwrap().unwrap().status, JobStatus::Queued);
        assert_eq!(db.get_job(theirs).unwrap().unwrap().status, JobStatus::Running);
    }

    #[test]
    fn test_queued_listing_is_fifo_and_machine_scoped() {
        let db = test_db();
        let a = seed_job(&db, "m1");
        let b = seed_job(&db, "m1");
        let _other = seed_job(&db, "m2");

        let queued = db.list_queued_for_machine("m1", 10).unwrap();
        assert_eq!(queued.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn test_iteration_rows_are_ordered_and_unique() {
        let db = test_db();
        let id = seed_job(&db, "m1");
        let i1 = db.insert_iteration(id, 1).unwrap();
        db.insert_iteration(id, 2).unwrap();
        assert!(db.insert_iteration(id, 2).is_err());

        db.complete_iteration(i1, Some(0), "prompt", true, Some("did things"), &[], None, None, None)
            .unwrap();

        let iterations = db.list_iterations(id).unwrap();
        assert_eq!(iterations.len(), 2);
        assert_eq!(iterations[0].iteration_number, 1);
        assert!(iterations[0].promise_detected);
        assert_eq!(iterations[0].output_summary.as_deref(), Some("did things"));
        assert_eq!(iterations[1].iteration_number, 2);
    }

    #[test]
    fn test_branch_and_pr_uniqueness() {
        let db = test_db();
        let client_id = db.insert_client("acme").unwrap();
        let repo_id = db.insert_repository(client_id, "acme", "shop", "main").unwrap();
        let job_id = seed_job(&db, "m1");

        db.upsert_branch(repo_id, "feature/x", job_id).unwrap();
        db.upsert_branch(repo_id, "feature/x", job_id).unwrap();
        assert_eq!(db.list_branches_for_job(job_id).unwrap().len(), 1);

        let pr = PullRequestInfo {
            number: 7,
            url: "https://github.com/acme/shop/pull/7".into(),
            title: "x".into(),
            files_changed: 3,
        };
        db.upsert_pull_request(repo_id, &pr, job_id).unwrap();
        db.upsert_pull_request(repo_id, &pr, job_id).unwrap();
        assert_eq!(db.list_pull_requests_for_job(job_id).unwrap().len(), 1);
    }

    #[test]
    fn test_feature_stage_codes_resolve() {
        let db = test_db();
        let client_id = db.insert_client("acme").unwrap();
        let feature_id = db.insert_feature(client_id, "F", "", None).unwrap();

        db.set_feature_stage(feature_id, "clarify_waiting").unwrap();
        assert_eq!(
            db.get_feature_stage_code(feature_id).unwrap().as_deref(),
            Some("clarify_waiting")
        );
        assert!(db.set_feature_stage(feature_id, "no_such_stage").is_err());
    }

    #[test]
    fn test_todo_sync_by_order_index() {
        let db = test_db();
        let client_id = db.insert_client("acme").unwrap();
        let feature_id = db.insert_feature(client_id, "F", "", None).unwrap();
        db.upsert_todo(feature_id, 0, "first", "pending").unwrap();

        assert!(db.set_todo_status(feature_id, 0, "done").unwrap());
        assert!(!db.set_todo_status(feature_id, 9, "done").unwrap());
        let todos = db.list_todos(feature_id).unwrap();
        assert_eq!(todos[0].status, "done");
    }
}
