use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const MAX_HISTORY_LINES: usize = 10_000;

struct JobStream {
    tx: broadcast::Sender<String>,
    history: VecDeque<String>,
    ended: bool,
}

/// Per-job live output manager.
///
/// Each running job broadcasts its output lines here in real time; clients
/// subscribing over SSE get a history replay plus the live tail.
pub struct JobStreamManager {
    streams: Mutex<HashMap<i64, JobStream>>,
}

impl JobStreamManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// Begin streaming for a job (resets any prior state).
    pub async fn start(&self, job_id: i64) {
        let (tx, _) = broadcast::channel(512);
        let mut map = self.streams.lock().await;
        map.insert(
            job_id,
            JobStream {
                tx,
                history: VecDeque::new(),
                ended: false,
            },
        );
    }

    pub async fn push_line(&self, job_id: i64, line: String) {
        let mut map = self.streams.lock().await;
        if let Some(s) = map.get_mut(&job_id) {
            let _ = s.tx.send(line.clone());
            s.history.push_back(line);
            if s.history.len() > MAX_HISTORY_LINES {
                s.history.pop_front();
            }
        }
    }

    /// Mark a job stream as ended (keeps history for late subscribers).
    pub async fn end_job(&self, job_id: i64) {
        let mut map = self.streams.lock().await;
        if let Some(s) = map.get_mut(&job_id) {
            let _ = s.tx.send("[stream end]".to_string());
            s.ended = true;
        }
    }

    /// Returns (history snapshot, live receiver). The receiver is None when
    /// the stream has ended or never existed.
    pub async fn subscribe(
        &self,
        job_id: i64,
    ) -> (Vec<String>, Option<broadcast::Receiver<String>>) {
        let map = self.streams.lock().await;
        match map.get(&job_id) {
            Some(s) => {
                let history = s.history.iter().cloned().collect();
                let rx = if s.ended { None } else { Some(s.tx.subscribe()) };
                (history, rx)
            }
            None => (Vec::new(), None),
        }
    }
}
