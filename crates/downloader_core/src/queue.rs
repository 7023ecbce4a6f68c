use crate::entry::{JobEntry, JobId, TransitionError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job id {0} is already tracked")]
    DuplicateId(JobId),
}

/// Live list of tracked jobs, in submission order.
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    entries: Vec<JobEntry>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the queue with entries restored from history.
    ///
    /// Entries whose id collides with one already seeded are dropped.
    pub fn from_history(history: Vec<JobEntry>) -> Self {
        let mut queue = Self::new();
        for entry in history {
            let _ = queue.insert(entry);
        }
        queue
    }

    pub fn insert(&mut self, entry: JobEntry) -> Result<(), QueueError> {
        if self.contains(&entry.id) {
            return Err(QueueError::DuplicateId(entry.id));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    pub fn get(&self, id: &JobId) -> Option<&JobEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut JobEntry> {
        self.entries.iter_mut().find(|e| &e.id == id)
    }

    pub fn entries(&self) -> &[JobEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that still need polling.
    pub fn live_mut(&mut self) -> impl Iterator<Item = &mut JobEntry> {
        self.entries.iter_mut().filter(|e| !e.is_terminal())
    }

    pub fn has_live(&self) -> bool {
        self.entries.iter().any(|e| !e.is_terminal())
    }

    pub fn remove(&mut self, id: &JobId) -> Option<JobEntry> {
        let idx = self.entries.iter().position(|e| &e.id == id)?;
        Some(self.entries.remove(idx))
    }

    /// Drops every complete or failed entry; returns how many were dropped.
    pub fn clear_finished(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.is_terminal());
        before - self.entries.len()
    }

    /// The set written to the history store.
    pub fn terminal_entries(&self) -> Vec<JobEntry> {
        self.entries
            .iter()
            .filter(|e| e.is_terminal())
            .cloned()
            .collect()
    }

    /// Fails every live entry with `message`; returns the ids that were live.
    pub fn interrupt_live(&mut self, message: &str) -> Result<Vec<JobId>, TransitionError> {
        let mut interrupted = Vec::new();
        for entry in self.live_mut() {
            entry.fail(message)?;
            interrupted.push(entry.id.clone());
        }
        Ok(interrupted)
    }
}
