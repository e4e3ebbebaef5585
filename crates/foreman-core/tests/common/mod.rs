//! Shared harness for integration tests: a scripted agent backend, a local
//! git origin standing in for GitHub, a stub `gh` CLI, and a scratch store.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use foreman_core::agent::{
    AgentBackend, AgentExit, AgentIo, AgentSpawn, OutputChunk, OutputStream,
};
use foreman_core::config::Config;
use foreman_core::db::Db;
use foreman_core::git::WorktreeManager;
use foreman_core::memory::MemoryStore;
use foreman_core::runner::RunnerContext;
use foreman_core::stream::JobStreamManager;
use foreman_core::types::{new_job, AgentJob, JobType};

// ── Scripted backend ─────────────────────────────────────────────────────

type RunCallback = Box<dyn Fn(&AgentSpawn) + Send + Sync>;

pub struct ScriptedRun {
    pub stdout: Vec<String>,
    pub exit_code: i32,
    pub on_run: Option<RunCallback>,
}

impl ScriptedRun {
    pub fn ok(lines: &[&str]) -> Self {
        Self {
            stdout: lines.iter().map(|s| s.to_string()).collect(),
            exit_code: 0,
            on_run: None,
        }
    }

    pub fn failing(exit_code: i32) -> Self {
        Self {
            stdout: vec![],
            exit_code,
            on_run: None,
        }
    }

    pub fn with_callback(mut self, cb: impl Fn(&AgentSpawn) + Send + Sync + 'static) -> Self {
        self.on_run = Some(Box::new(cb));
        self
    }
}

/// AgentBackend that replays a queue of scripted runs instead of spawning a
/// subprocess. Each run can mutate the worktree through its callback.
pub struct ScriptedBackend {
    runs: Mutex<VecDeque<ScriptedRun>>,
    pub invocations: AtomicUsize,
    pub delay: Duration,
}

impl ScriptedBackend {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: Mutex::new(runs.into()),
            invocations: AtomicUsize::new(0),
            delay: Duration::from_millis(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn run(&self, spawn: AgentSpawn, io: AgentIo) -> Result<AgentExit> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let run = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| ScriptedRun::ok(&[]));

        if let Some(cb) = &run.on_run {
            cb(&spawn);
        }
        for line in &run.stdout {
            let _ = io.output_tx.send(OutputChunk {
                stream: OutputStream::Stdout,
                text: line.clone(),
            });
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let cancelled = *io.cancel_rx.borrow();
        Ok(AgentExit {
            exit_code: run.exit_code,
            stdout: run.stdout.join("\n"),
            cancelled,
        })
    }

    async fn health_check(&self) -> Result<String> {
        Ok("scripted".to_string())
    }
}

// ── Git fixtures ─────────────────────────────────────────────────────────

fn sh(dir: &Path, program: &str, args: &[&str]) {
    let status = Command::new(program)
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap_or_else(|e| panic!("spawn {program} {args:?}: {e}"));
    assert!(status.success(), "{program} {args:?} failed in {dir:?}");
}

fn set_git_identity() {
    std::env::set_var("GIT_AUTHOR_NAME", "Test");
    std::env::set_var("GIT_AUTHOR_EMAIL", "test@example.com");
    std::env::set_var("GIT_COMMITTER_NAME", "Test");
    std::env::set_var("GIT_COMMITTER_EMAIL", "test@example.com");
}

/// Create a bare origin with one commit on main; returns its path.
fn init_origin(root: &Path) -> String {
    set_git_identity();
    let seed = root.join("seed");
    std::fs::create_dir_all(&seed).unwrap();
    sh(&seed, "git", &["init", "-b", "main"]);
    std::fs::write(seed.join("README.md"), "# demo\n").unwrap();
    sh(&seed, "git", &["add", "-A"]);
    sh(&seed, "git", &["commit", "-m", "initial commit"]);

    let origin = root.join("origin.git");
    sh(root, "git", &["clone", "--bare", "seed", "origin.git"]);
    origin.to_string_lossy().into_owned()
}

/// Stub `gh` that answers `pr create` and `pr view`.
fn write_stub_gh(root: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = root.join("gh-stub");
    std::fs::write(
        &path,
        r#"#!/bin/sh
case "$1 $2" in
  "pr create") echo "https://github.com/acme/demo/pull/1" ;;
  "pr view") echo '{"number":1,"url":"https://github.com/acme/demo/pull/1","title":"stub pr"}' ;;
  *) exit 1 ;;
esac
"#,
    )
    .unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}

/// Commit a file in the given worktree (what the real agent would do).
pub fn commit_file(workdir: &str, filename: &str, message: &str) {
    set_git_identity();
    let dir = Path::new(workdir);
    std::fs::write(dir.join(filename), format!("content for {filename}\n")).unwrap();
    sh(dir, "git", &["add", "-A"]);
    sh(dir, "git", &["commit", "-m", message]);
}

/// Flip one story to passes: true inside the worktree's prd.json.
pub fn pass_story(workdir: &str, story_id: i64) {
    let path = Path::new(workdir).join("prd.json");
    let content = std::fs::read_to_string(&path).unwrap();
    let mut prd: serde_json::Value = serde_json::from_str(&content).unwrap();
    for story in prd["stories"].as_array_mut().unwrap() {
        if story["id"].as_i64() == Some(story_id) {
            story["passes"] = serde_json::Value::Bool(true);
        }
    }
    std::fs::write(&path, serde_json::to_string_pretty(&prd).unwrap()).unwrap();
}

// ── Harness ──────────────────────────────────────────────────────────────

pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub db: Arc<Db>,
    pub ctx: Arc<RunnerContext>,
    pub backend: Arc<ScriptedBackend>,
    pub client_id: i64,
    pub repo_id: i64,
    pub nudge_rx: mpsc::UnboundedReceiver<()>,
}

pub fn harness(backend: ScriptedBackend) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let origin = init_origin(root);
    let gh_bin = write_stub_gh(root);

    let db = Arc::new(Db::open_in_memory().unwrap());
    db.migrate().unwrap();
    let client_id = db.insert_client("acme").unwrap();
    let repo_id = db
        .insert_repository_with_url(client_id, "acme", "demo", "main", &origin)
        .unwrap();

    let config = Arc::new(Config {
        machine_id: "test-machine".to_string(),
        repos_dir: root.join("repos").to_string_lossy().into_owned(),
        worktrees_dir: root.join("worktrees").to_string_lossy().into_owned(),
        gh_bin,
        feedback_timeout_s: 5,
        ..Config::default()
    });

    let backend = Arc::new(backend);
    let (nudge_tx, nudge_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(RunnerContext {
        db: Arc::clone(&db),
        config: Arc::clone(&config),
        worktrees: Arc::new(WorktreeManager::new(&config)),
        backend: Arc::clone(&backend) as Arc<dyn AgentBackend>,
        streams: JobStreamManager::new(),
        memory: Arc::new(MemoryStore::new()),
        nudge_tx,
    });

    Harness {
        tmp,
        db,
        ctx,
        backend,
        client_id,
        repo_id,
        nudge_rx,
    }
}

impl Harness {
    /// Insert a queued job bound to the harness repo.
    pub fn enqueue(&self, job_type: JobType, customize: impl FnOnce(&mut AgentJob)) -> i64 {
        let mut job = new_job(self.client_id, job_type, "test-machine");
        job.repository_id = Some(self.repo_id);
        customize(&mut job);
        self.db.insert_job(&job).unwrap()
    }

    /// Claim a job the way the queue does and run it through the dispatcher.
    pub async fn dispatch(&self, job_id: i64) {
        assert!(self.db.mark_job_running(job_id).unwrap());
        let job = self.db.get_job(job_id).unwrap().unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        foreman_core::runner::dispatch(Arc::clone(&self.ctx), job, cancel_rx, None)
            .await
            .unwrap();
    }
}
