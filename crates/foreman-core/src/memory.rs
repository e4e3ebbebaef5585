use std::collections::VecDeque;
use std::sync::Mutex;

const MAX_NOTES: usize = 500;

/// Best-effort in-memory recall used to enrich spec-phase prompts.
///
/// This is intentionally process-local: notes accumulate while the service
/// runs and vanish on restart. Recall failures never affect a job.
pub struct MemoryStore {
    notes: Mutex<VecDeque<(i64, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            notes: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, client_id: i64, note: impl Into<String>) {
        let mut notes = self.notes.lock().unwrap_or_else(|e| e.into_inner());
        notes.push_back((client_id, note.into()));
        if notes.len() > MAX_NOTES {
            notes.pop_front();
        }
    }

    /// Case-insensitive substring recall over the client's notes, newest
    /// first, up to `limit`.
    pub fn recall(&self, client_id: i64, query: &str, limit: usize) -> Vec<String> {
        let needle = query.to_lowercase();
        let notes = self.notes.lock().unwrap_or_else(|e| e.into_inner());
        notes
            .iter()
            .rev()
            .filter(|(cid, note)| {
                *cid == client_id && (needle.is_empty() || note.to_lowercase().contains(&needle))
            })
            .map(|(_, note)| note.clone())
            .take(limit)
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recall_is_scoped_to_client_and_query() {
        let store = MemoryStore::new();
        store.record(1, "uses tailwind for styling");
        store.record(1, "prefers integration tests");
        store.record(2, "tailwind everywhere");

        let hits = store.recall(1, "Tailwind", 10);
        assert_eq!(hits, vec!["uses tailwind for styling".to_string()]);
        assert_eq!(store.recall(1, "", 10).len(), 2);
        assert!(store.recall(3, "tailwind", 10).is_empty());
    }

    #[test]
    fn test_store_is_bounded() {
        let store = MemoryStore::new();
        for i in 0..(MAX_NOTES + 50) {
            store.record(1, format!("note {i}"));
        }
        assert_eq!(store.recall(1, "", usize::MAX).len(), MAX_NOTES);
    }
}
