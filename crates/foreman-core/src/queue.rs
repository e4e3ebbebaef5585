//! Machine-scoped queue controller.
//!
//! Loads queued jobs targeted at this machine, admits up to the concurrency
//! cap, and tracks the in-flight handles that make cancellation and stdin
//! injection possible. The store is authoritative: the only runtime state is
//! the handle map, and `init()` reconciles the store against it at startup.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use crate::agent::StdinFrame;
use crate::runner::{self, RunnerContext};
use crate::types::{AgentJob, JobStatus, JobType, MessageType};

/// Local handle for one running job.
struct JobHandle {
    cancel_tx: watch::Sender<bool>,
    /// Present only for interactive (task) jobs.
    stdin_tx: Option<mpsc::UnboundedSender<StdinFrame>>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub running: Vec<AgentJob>,
    pub queued: Vec<AgentJob>,
    pub max_concurrent: usize,
}

pub struct QueueController {
    pub ctx: Arc<RunnerContext>,
    in_flight: Mutex<HashMap<i64, JobHandle>>,
}

impl QueueController {
    pub fn new(ctx: Arc<RunnerContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Startup recovery: any row still `running` for this machine belonged to
    /// a dead process. Back to `queued`, then run one admission pass.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let swept = self
            .ctx
            .db
            .requeue_running_for_machine(&self.ctx.config.machine_id)?;
        if swept > 0 {
            info!("requeued {swept} orphaned running jobs from previous process");
        }
        self.process().await;
        Ok(())
    }

    /// Idempotent admission pass: admit up to `max_concurrent − running`
    /// queued jobs for this machine, oldest first. Safe to call from timers,
    /// nudges, or right after enqueue; the conditional store update makes
    /// concurrent passes race-free.
    pub async fn process(self: &Arc<Self>) {
        let max = self.ctx.config.max_concurrent_jobs;
        let available = {
            let guard = self.in_flight.lock().await;
            max.saturating_sub(guard.len())
        };
        if available == 0 {
            return;
        }

        let queued = match self
            .ctx
            .db
            .list_queued_for_machine(&self.ctx.config.machine_id, available as i64)
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("queue poll failed: {e}");
                return;
            }
        };

        for job in queued {
            let mut guard = self.in_flight.lock().await;
            if guard.len() >= max || guard.contains_key(&job.id) {
                continue;
            }
            // Atomic claim; a concurrent pass (or another poller) may have
            // taken the row already.
            match self.ctx.db.mark_job_running(job.id) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(job_id = job.id, "claim failed: {e}");
                    continue;
                }
            }

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let (stdin_tx, stdin_rx) = if job.job_type == JobType::Task {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
            guard.insert(
                job.id,
                JobHandle {
                    cancel_tx,
                    stdin_tx,
                },
            );
            drop(guard);

            info!(job_id = job.id, job_type = job.job_type.as_str(), "dispatching job");
            let this = Arc::clone(self);
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                let job_id = job.id;
                ctx.streams.start(job_id).await;
                if let Err(e) = runner::dispatch(ctx.clone(), job, cancel_rx, stdin_rx).await {
                    error!(job_id, "runner error: {e}");
                    if let Err(db_err) =
                        ctx.db
                            .finish_job(job_id, JobStatus::Failed, None, Some(&e.to_string()))
                    {
                        error!(job_id, "mark failed: {db_err}");
                    }
                }
                this.in_flight.lock().await.remove(&job_id);
                ctx.streams.end_job(job_id).await;
                // Freed capacity: pull the next queued job without waiting
                // for the timer.
                let _ = ctx.nudge_tx.send(());
            });
        }
    }

    /// Queue status as observed from the store, not just local handles.
    pub async fn status(&self) -> Result<QueueStatus> {
        let running = self
            .ctx
            .db
            .list_running_for_machine(&self.ctx.config.machine_id)?;
        let queued = self
            .ctx
            .db
            .list_queued_for_machine(&self.ctx.config.machine_id, 100)?;
        Ok(QueueStatus {
            running,
            queued,
            max_concurrent: self.ctx.config.max_concurrent_jobs,
        })
    }

    /// Cancel a job: kill the local subprocess when a handle exists, then
    /// move the row to `cancelled`. Returns false for unknown ids; terminal
    /// rows are a no-op returning true.
    pub async fn cancel(&self, job_id: i64) -> Result<bool> {
        let Some(job) = self.ctx.db.get_job(job_id)? else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(true);
        }

        if let Some(handle) = self.in_flight.lock().await.remove(&job_id) {
            let _ = handle.cancel_tx.send(true);
        }
        self.ctx
            .db
            .finish_job(job_id, JobStatus::Cancelled, None, None)?;
        if let Err(e) = self
            .ctx
            .db
            .insert_message(job_id, MessageType::System, "Job cancelled")
        {
            warn!(job_id, "cancel message: {e}");
        }
        Ok(true)
    }

    /// Cooperative stop for ralph variants: flips the row to `cancelled`
    /// without touching the subprocess. The loop observes it at the next
    /// iteration boundary and terminates with `manual_stop`.
    pub async fn stop(&self, job_id: i64) -> Result<bool> {
        let Some(job) = self.ctx.db.get_job(job_id)? else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(true);
        }
        self.ctx
            .db
            .finish_job(job_id, JobStatus::Cancelled, None, None)?;
        Ok(true)
    }

    /// Inject a user message into an interactive job's stdin. Returns false
    /// when the job has no live interactive handle.
    pub async fn send_input(&self, job_id: i64, text: &str) -> Result<bool> {
        let guard = self.in_flight.lock().await;
        let Some(handle) = guard.get(&job_id) else {
            return Ok(false);
        };
        let Some(stdin_tx) = &handle.stdin_tx else {
            return Ok(false);
        };
        if stdin_tx.send(StdinFrame::User(text.to_string())).is_err() {
            return Ok(false);
        }
        drop(guard);
        self.ctx
            .db
            .insert_message(job_id, MessageType::UserInput, text)?;
        Ok(true)
    }

    /// Close an interactive job's stdin; the agent finishes and exits.
    pub async fn close_input(&self, job_id: i64) -> Result<bool> {
        let guard = self.in_flight.lock().await;
        let Some(handle) = guard.get(&job_id) else {
            return Ok(false);
        };
        let Some(stdin_tx) = &handle.stdin_tx else {
            return Ok(false);
        };
        Ok(stdin_tx.send(StdinFrame::Close).is_ok())
    }

    /// Is a local handle live for this job?
    pub async fn is_in_flight(&self, job_id: i64) -> bool {
        self.in_flight.lock().await.contains_key(&job_id)
    }
}
