//! Shared run state: the pollable progress board, the bounded activity log,
//! and the run history.
//!
//! All three are plain in-process structures guarded by mutexes so a detached
//! run and the web handlers can share them through an `Arc`. Time is passed in
//! explicitly, which keeps the staleness rules testable without sleeping.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use courtsync_core::RunStats;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Idle,
    Dedup,
    TeamsLoading,
    TeamsSyncing,
    LeagueWideReconcile,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub run_id: Uuid,
    pub phase: Phase,
    pub current: u64,
    pub total: u64,
    /// Position inside the current root entity's match list.
    pub matches_done: u64,
    pub matches_total: u64,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a poller sees: the raw snapshot plus a status derived from its age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    /// No heartbeat within the poll-staleness window; the run most likely
    /// died without clearing its state.
    Aborted,
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressView {
    #[serde(flatten)]
    pub snapshot: ProgressSnapshot,
    pub status: RunStatus,
}

#[derive(Debug, Error)]
pub enum BeginError {
    #[error("sync run {run_id} already active in phase {phase:?}")]
    Active { run_id: Uuid, phase: Phase },
}

/// Single-slot run lock and progress publisher. Only one run may hold the
/// slot; a slot whose run started longer ago than the stale-lock window is
/// treated as stale and taken over.
#[derive(Debug)]
pub struct ProgressBoard {
    stale_lock_after: Duration,
    snapshot_ttl: Duration,
    poll_staleness: Duration,
    inner: Mutex<Option<ProgressSnapshot>>,
}

impl ProgressBoard {
    pub fn new(stale_lock_secs: u64, snapshot_ttl_secs: u64, poll_staleness_secs: u64) -> Self {
        Self {
            stale_lock_after: Duration::seconds(stale_lock_secs as i64),
            snapshot_ttl: Duration::seconds(snapshot_ttl_secs as i64),
            poll_staleness: Duration::seconds(poll_staleness_secs as i64),
            inner: Mutex::new(None),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Option<ProgressSnapshot>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the run slot. Fails while another run is active and within the
    /// stale-lock window; a run started longer ago than that is taken over
    /// no matter how recently it heartbeated.
    pub fn try_begin(&self, now: DateTime<Utc>) -> Result<Uuid, BeginError> {
        let mut slot = self.guard();
        if let Some(current) = slot.as_ref() {
            if current.phase != Phase::Done && now - current.started_at < self.stale_lock_after {
                return Err(BeginError::Active {
                    run_id: current.run_id,
                    phase: current.phase,
                });
            }
            if current.phase != Phase::Done {
                warn!(
                    run_id = %current.run_id,
                    "taking over stale run lock; previous run never finished"
                );
            }
        }
        let run_id = Uuid::new_v4();
        *slot = Some(ProgressSnapshot {
            run_id,
            phase: Phase::Idle,
            current: 0,
            total: 0,
            matches_done: 0,
            matches_total: 0,
            message: String::new(),
            started_at: now,
            updated_at: now,
        });
        Ok(run_id)
    }

    pub fn update(
        &self,
        now: DateTime<Utc>,
        phase: Phase,
        current: u64,
        total: u64,
        message: impl Into<String>,
    ) {
        let mut slot = self.guard();
        if let Some(snapshot) = slot.as_mut() {
            snapshot.phase = phase;
            snapshot.current = current;
            snapshot.total = total;
            snapshot.matches_done = 0;
            snapshot.matches_total = 0;
            snapshot.message = message.into();
            snapshot.updated_at = now;
        }
    }

    /// Heartbeat at a match boundary within the current root entity.
    pub fn update_matches(&self, now: DateTime<Utc>, done: u64, total: u64) {
        let mut slot = self.guard();
        if let Some(snapshot) = slot.as_mut() {
            snapshot.matches_done = done;
            snapshot.matches_total = total;
            snapshot.updated_at = now;
        }
    }

    pub fn finish(&self, now: DateTime<Utc>) {
        self.update(now, Phase::Done, 0, 0, "finished");
    }

    /// Operator escape hatch: drop the slot regardless of who holds it.
    pub fn force_clear(&self) {
        *self.guard() = None;
    }

    /// Poller view. Snapshots past their TTL read as no run at all; a run
    /// without a recent heartbeat reads as aborted.
    pub fn view(&self, now: DateTime<Utc>) -> Option<ProgressView> {
        let slot = self.guard();
        let snapshot = slot.as_ref()?;
        let age = now - snapshot.updated_at;
        if age > self.snapshot_ttl {
            return None;
        }
        let status = if snapshot.phase == Phase::Done {
            RunStatus::Done
        } else if age > self.poll_staleness {
            RunStatus::Aborted
        } else {
            RunStatus::Running
        };
        Some(ProgressView {
            snapshot: snapshot.clone(),
            status,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Bounded activity log; the oldest entries fall off once the ring is full.
/// Entries also go to the tracing subscriber.
#[derive(Debug)]
pub struct SyncLog {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl SyncLog {
    pub const DEFAULT_CAPACITY: usize = 200;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn push(&self, level: LogLevel, message: String) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            at: Utc::now(),
            level,
            message,
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{message}");
        self.push(LogLevel::Error, message);
    }

    /// Most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SyncLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub stats: RunStats,
    pub error: Option<String>,
}

/// Bounded history of completed runs, newest first.
#[derive(Debug)]
pub struct RunHistory {
    capacity: usize,
    entries: Mutex<VecDeque<RunRecord>>,
}

impl RunHistory {
    pub const DEFAULT_CAPACITY: usize = 50;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, record: RunRecord) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_back();
        }
        entries.push_front(record);
    }

    pub fn recent(&self) -> Vec<RunRecord> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
