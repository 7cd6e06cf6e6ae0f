//! File-based message queue for ChatRelay.
#![allow(dead_code)]
//!
//! Queue structure under a configured root:
//! - incoming/  : New messages arrive here (any producer may append)
//! - processing/: Messages claimed by the dispatch loop
//! - outgoing/  : Responses ready for a channel connector to deliver
//! - failed/    : Items that exhausted their retry budget, kept for operators
//!
//! A record's filename (`<id>.json`) is preserved across moves so observers
//! can correlate input and output. Moves are renames, never copy+delete.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// Queue item location states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Incoming,
    Processing,
    Outgoing,
    Failed,
}

impl QueueState {
    pub const ALL: [QueueState; 4] = [
        QueueState::Incoming,
        QueueState::Processing,
        QueueState::Outgoing,
        QueueState::Failed,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            QueueState::Incoming => "incoming",
            QueueState::Processing => "processing",
            QueueState::Outgoing => "outgoing",
            QueueState::Failed => "failed",
        }
    }
}

/// Message descriptor, immutable once created by a connector.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MessageData {
    /// Channel (e.g., "telegram", "cli")
    pub channel: String,

    /// Sender name
    pub sender: String,

    /// Sender ID (channel-specific)
    pub sender_id: String,

    /// Message content
    pub body: String,

    /// Unix timestamp (millis) when the connector received the message
    pub received_at: i64,

    /// Clear the agent's conversation window before handling this message
    #[serde(default)]
    pub reset: bool,
}

impl MessageData {
    /// Create a new message with current timestamp.
    pub fn new(channel: &str, sender: &str, sender_id: &str, body: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender: sender.to_string(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            received_at: now_millis(),
            reset: false,
        }
    }

    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }
}

/// Incoming/processing queue record.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueueRecord {
    /// Unique ID (ULID, lexicographically sortable)
    pub id: String,

    /// Explicit target agent, if the producer pre-routed the message
    #[serde(default)]
    pub agent: Option<String>,

    /// Message data
    pub data: MessageData,

    /// When created (unix timestamp, millis)
    pub created_at: i64,
}

impl QueueRecord {
    pub fn new(data: MessageData) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            agent: None,
            data,
            created_at: now_millis(),
        }
    }

    pub fn with_agent(mut self, agent: Option<String>) -> Self {
        self.agent = agent;
        self
    }
}

/// Outgoing record: original descriptor plus the agent's response.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ResponseRecord {
    pub id: String,
    pub agent_id: String,
    pub data: MessageData,
    pub response: String,

    /// Validated outbound file paths extracted from the response
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,

    pub completed_at: i64,
}

/// Failed record: original descriptor plus the error detail.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FailureRecord {
    pub id: String,
    pub agent_id: Option<String>,
    pub data: MessageData,
    pub error: String,
    pub failed_at: i64,
}

/// Queue statistics.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub incoming: usize,
    pub processing: usize,
    pub outgoing: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.incoming + self.processing + self.outgoing + self.failed
    }
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Queue Stats:")?;
        writeln!(f, "  Incoming:   {}", self.incoming)?;
        writeln!(f, "  Processing: {}", self.processing)?;
        writeln!(f, "  Outgoing:   {}", self.outgoing)?;
        writeln!(f, "  Failed:     {}", self.failed)?;
        write!(f, "  Total:      {}", self.total())
    }
}

/// How long a claim lock may sit before another dispatcher treats it as stale.
const CLAIM_LOCK_TIMEOUT_MS: u64 = 5000;

/// Durable work queue over four sibling state directories.
pub struct Queue {
    root: PathBuf,
}

impl Queue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, state: QueueState) -> PathBuf {
        self.root.join(state.dir_name())
    }

    fn record_path(&self, state: QueueState, id: &str) -> PathBuf {
        self.dir(state).join(format!("{}.json", id))
    }

    /// Ensure all queue directories exist.
    pub fn ensure_dirs(&self) -> Result<(), Error> {
        for state in QueueState::ALL {
            let dir = self.dir(state);
            if !dir.exists() {
                fs::create_dir_all(&dir)?;
                tracing::debug!("Created queue directory: {}", dir.display());
            }
        }
        Ok(())
    }

    /// Write a record file via temp + rename so readers never see partial JSON.
    fn write_record<T: Serialize>(&self, state: QueueState, id: &str, record: &T) -> Result<(), Error> {
        let dir = self.dir(state);
        fs::create_dir_all(&dir)?;

        let tmp = dir.join(format!(".tmp-{}", id));
        let content = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, self.record_path(state, id))?;
        Ok(())
    }

    /// Enqueue a message to the incoming queue. Returns the record id.
    pub fn enqueue(&self, record: QueueRecord) -> Result<String, Error> {
        self.ensure_dirs()?;

        let id = record.id.clone();
        self.write_record(QueueState::Incoming, &id, &record)?;

        tracing::debug!("Enqueued message {} to incoming", id);
        Ok(id)
    }

    /// Claim a message: incoming -> processing.
    ///
    /// A rename alone does not provide mutual exclusion between dispatcher
    /// instances, so the move runs under the queue's claim lock. Two claimers
    /// never both succeed for the same id.
    pub fn claim(&self, id: &str) -> Result<QueueRecord, Error> {
        let _lock = self.acquire_claim_lock()?;

        let src = self.record_path(QueueState::Incoming, id);
        let dst = self.record_path(QueueState::Processing, id);

        if !src.exists() {
            return Err(Error::Queue(format!("Message {} not found in incoming", id)));
        }

        fs::rename(&src, &dst)?;
        tracing::debug!("Claimed message {} into processing", id);

        let content = fs::read_to_string(&dst)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Complete a message: write the outgoing record, then drop the
    /// processing marker.
    pub fn complete(&self, response: &ResponseRecord) -> Result<(), Error> {
        self.write_record(QueueState::Outgoing, &response.id, response)?;

        let marker = self.record_path(QueueState::Processing, &response.id);
        if let Err(e) = fs::remove_file(&marker) {
            tracing::warn!("Failed to remove processing marker {}: {}", response.id, e);
        }

        tracing::debug!("Completed message {} to outgoing", response.id);
        Ok(())
    }

    /// Fail a message: write the failure record, then drop the processing
    /// marker. Failed items are never retried automatically.
    pub fn fail(&self, failure: &FailureRecord) -> Result<(), Error> {
        self.write_record(QueueState::Failed, &failure.id, failure)?;

        let marker = self.record_path(QueueState::Processing, &failure.id);
        if let Err(e) = fs::remove_file(&marker) {
            tracing::warn!("Failed to remove processing marker {}: {}", failure.id, e);
        }

        tracing::info!("Moved message {} to failed: {}", failure.id, failure.error);
        Ok(())
    }

    /// Delete a delivered outgoing record. Connectors call this after
    /// successful delivery.
    pub fn remove_outgoing(&self, id: &str) -> Result<(), Error> {
        let path = self.record_path(QueueState::Outgoing, id);
        if path.exists() {
            fs::remove_file(&path)?;
            tracing::debug!("Removed delivered message {}", id);
        }
        Ok(())
    }

    /// List incoming records sorted by id (ULIDs sort in receipt order).
    pub fn list_incoming(&self) -> Result<Vec<QueueRecord>, Error> {
        let mut records: Vec<QueueRecord> = self.read_state_files(QueueState::Incoming)?;
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    /// List outgoing response records sorted by completion time.
    pub fn list_outgoing(&self) -> Result<Vec<ResponseRecord>, Error> {
        let mut records: Vec<ResponseRecord> = self.read_state_files(QueueState::Outgoing)?;
        records.sort_by(|a, b| (a.completed_at, &a.id).cmp(&(b.completed_at, &b.id)));
        Ok(records)
    }

    /// List failed records for operator inspection.
    pub fn list_failed(&self) -> Result<Vec<FailureRecord>, Error> {
        let mut records: Vec<FailureRecord> = self.read_state_files(QueueState::Failed)?;
        records.sort_by(|a, b| (a.failed_at, &a.id).cmp(&(b.failed_at, &b.id)));
        Ok(records)
    }

    fn read_state_files<T: for<'de> Deserialize<'de>>(
        &self,
        state: QueueState,
    ) -> Result<Vec<T>, Error> {
        let dir = self.dir(state);
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                if let Ok(content) = fs::read_to_string(&path) {
                    match serde_json::from_str::<T>(&content) {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            tracing::warn!("Skipping unreadable record {}: {}", path.display(), e)
                        }
                    }
                }
            }
        }
        Ok(records)
    }

    /// Find which state directory currently holds an id, if any.
    pub fn state_of(&self, id: &str) -> Option<QueueState> {
        QueueState::ALL
            .into_iter()
            .find(|state| self.record_path(*state, id).exists())
    }

    /// Get queue statistics.
    pub fn stats(&self) -> Result<QueueStats, Error> {
        let count = |state: QueueState| -> Result<usize, Error> {
            let dir = self.dir(state);
            if !dir.exists() {
                return Ok(0);
            }
            let mut n = 0;
            for entry in fs::read_dir(&dir)? {
                if entry?.path().extension().map_or(false, |ext| ext == "json") {
                    n += 1;
                }
            }
            Ok(n)
        };

        Ok(QueueStats {
            incoming: count(QueueState::Incoming)?,
            processing: count(QueueState::Processing)?,
            outgoing: count(QueueState::Outgoing)?,
            failed: count(QueueState::Failed)?,
        })
    }

    /// Recover messages stranded in processing by a crash.
    ///
    /// A stranded id that already has an outgoing record crashed after
    /// completion; its marker is dropped instead of requeued so the reply is
    /// not produced twice. Everything else is requeued to incoming. Returns
    /// the number of requeued messages.
    pub fn recover_orphaned(&self) -> Result<usize, Error> {
        self.ensure_dirs()?;

        let processing_dir = self.dir(QueueState::Processing);
        let mut recovered = 0;

        for entry in fs::read_dir(&processing_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                let file_name = entry.file_name();
                let id = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("")
                    .to_string();

                if self.record_path(QueueState::Outgoing, &id).exists() {
                    fs::remove_file(&path)?;
                    tracing::info!("Dropped already-completed orphan: {}", id);
                    continue;
                }

                let dst = self.dir(QueueState::Incoming).join(&file_name);
                if fs::rename(&path, &dst).is_ok() {
                    tracing::info!("Recovered orphaned message: {}", id);
                    recovered += 1;
                }
            }
        }

        Ok(recovered)
    }

    /// Acquire the queue-wide claim lock.
    ///
    /// `create_new` makes the acquisition atomic; a lock older than
    /// `CLAIM_LOCK_TIMEOUT_MS` is treated as left behind by a dead dispatcher
    /// and taken over.
    fn acquire_claim_lock(&self) -> Result<ClaimLock, Error> {
        let lock_path = self.root.join("claim.lock");

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                let _ = file.write_all(format!("{}\n", std::process::id()).as_bytes());
                let _ = file.sync_all();
                tracing::trace!("Acquired claim lock: {}", lock_path.display());
                Ok(ClaimLock { path: lock_path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let age_ms = lock_age_millis(&lock_path).unwrap_or(0);
                if age_ms < CLAIM_LOCK_TIMEOUT_MS {
                    return Err(Error::Queue(format!(
                        "Claim lock is held: {}",
                        lock_path.display()
                    )));
                }

                tracing::warn!("Removing stale claim lock: {}", lock_path.display());
                fs::remove_file(&lock_path).ok();
                self.acquire_claim_lock()
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Claim lock handle - releases the lock file when dropped.
struct ClaimLock {
    path: PathBuf,
}

impl Drop for ClaimLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to release claim lock {}: {}", self.path.display(), e);
        }
    }
}

fn lock_age_millis(path: &Path) -> Option<u64> {
    let modified = path.metadata().ok()?.modified().ok()?;
    SystemTime::now()
        .duration_since(modified)
        .ok()
        .map(|d| d.as_millis() as u64)
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_queue() -> (TempDir, Queue) {
        let dir = TempDir::new().unwrap();
        let queue = Queue::new(dir.path());
        queue.ensure_dirs().unwrap();
        (dir, queue)
    }

    fn sample_record(body: &str) -> QueueRecord {
        QueueRecord::new(MessageData::new("cli", "Alice", "u1", body))
    }

    #[test]
    fn enqueue_then_claim_moves_exactly_one_state() {
        let (_dir, queue) = temp_queue();

        let id = queue.enqueue(sample_record("hello")).unwrap();
        assert_eq!(queue.state_of(&id), Some(QueueState::Incoming));

        let record = queue.claim(&id).unwrap();
        assert_eq!(record.data.body, "hello");
        assert_eq!(queue.state_of(&id), Some(QueueState::Processing));
        assert!(queue.list_incoming().unwrap().is_empty());
    }

    #[test]
    fn complete_moves_to_outgoing_only() {
        let (_dir, queue) = temp_queue();
        let id = queue.enqueue(sample_record("hi")).unwrap();
        let record = queue.claim(&id).unwrap();

        queue
            .complete(&ResponseRecord {
                id: id.clone(),
                agent_id: "default".to_string(),
                data: record.data,
                response: "hi there".to_string(),
                files: vec![],
                completed_at: now_millis(),
            })
            .unwrap();

        assert_eq!(queue.state_of(&id), Some(QueueState::Outgoing));
        let outgoing = queue.list_outgoing().unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].response, "hi there");

        queue.remove_outgoing(&id).unwrap();
        assert_eq!(queue.state_of(&id), None);
    }

    #[test]
    fn fail_moves_to_failed_with_error_detail() {
        let (_dir, queue) = temp_queue();
        let id = queue.enqueue(sample_record("hi")).unwrap();
        let record = queue.claim(&id).unwrap();

        queue
            .fail(&FailureRecord {
                id: id.clone(),
                agent_id: Some("default".to_string()),
                data: record.data,
                error: "HTTP 500: upstream exploded".to_string(),
                failed_at: now_millis(),
            })
            .unwrap();

        assert_eq!(queue.state_of(&id), Some(QueueState::Failed));
        let failed = queue.list_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.contains("upstream exploded"));
    }

    #[test]
    fn claim_of_missing_id_fails() {
        let (_dir, queue) = temp_queue();
        assert!(queue.claim("01ARZ3NDEKTSV4RRFFQ69G5FAV").is_err());
    }

    #[test]
    fn second_claimer_cannot_take_the_same_id() {
        let (_dir, queue) = temp_queue();
        let id = queue.enqueue(sample_record("once")).unwrap();

        assert!(queue.claim(&id).is_ok());
        // Item already moved; a second claim must fail, not double-process.
        assert!(queue.claim(&id).is_err());
    }

    #[test]
    fn claim_lock_blocks_while_held() {
        let (_dir, queue) = temp_queue();
        let id = queue.enqueue(sample_record("locked")).unwrap();

        let held = queue.acquire_claim_lock().unwrap();
        assert!(queue.claim(&id).is_err());
        drop(held);
        assert!(queue.claim(&id).is_ok());
    }

    #[test]
    fn incoming_list_is_ordered_by_id() {
        let (_dir, queue) = temp_queue();
        let first = queue.enqueue(sample_record("first")).unwrap();
        // ULIDs are only ordered across milliseconds.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = queue.enqueue(sample_record("second")).unwrap();

        let ids: Vec<String> = queue
            .list_incoming()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![first.clone(), second.clone()]);
        assert!(first < second);
    }

    #[test]
    fn recover_requeues_stranded_processing_items() {
        let (_dir, queue) = temp_queue();
        let id = queue.enqueue(sample_record("stranded")).unwrap();
        queue.claim(&id).unwrap();

        // Simulated crash: daemon restarts with the item still in processing.
        let recovered = queue.recover_orphaned().unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(queue.state_of(&id), Some(QueueState::Incoming));
    }

    #[test]
    fn recover_drops_orphans_that_already_completed() {
        let (_dir, queue) = temp_queue();
        let id = queue.enqueue(sample_record("done")).unwrap();
        let record = queue.claim(&id).unwrap();

        // Crash after the outgoing write but before the marker removal:
        // both files exist.
        queue
            .write_record(
                QueueState::Outgoing,
                &id,
                &ResponseRecord {
                    id: id.clone(),
                    agent_id: "default".to_string(),
                    data: record.data,
                    response: "done".to_string(),
                    files: vec![],
                    completed_at: now_millis(),
                },
            )
            .unwrap();

        let recovered = queue.recover_orphaned().unwrap();
        assert_eq!(recovered, 0);
        assert_eq!(queue.state_of(&id), Some(QueueState::Outgoing));
    }

    #[test]
    fn stats_count_every_state() {
        let (_dir, queue) = temp_queue();
        let a = queue.enqueue(sample_record("a")).unwrap();
        queue.enqueue(sample_record("b")).unwrap();
        queue.claim(&a).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.incoming, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.outgoing, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.total(), 2);
    }

    #[test]
    fn reset_flag_round_trips_and_defaults_to_false() {
        let json = r#"{"channel":"cli","sender":"A","sender_id":"1","body":"x","received_at":5}"#;
        let data: MessageData = serde_json::from_str(json).unwrap();
        assert!(!data.reset);

        let data = MessageData::new("cli", "A", "1", "x").with_reset(true);
        let round: MessageData =
            serde_json::from_str(&serde_json::to_string(&data).unwrap()).unwrap();
        assert!(round.reset);
    }
}
