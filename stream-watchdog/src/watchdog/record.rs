//! Per-endpoint watchdog records.
//!
//! Every supervised (instance, role) pair owns exactly one [`WatchdogRecord`]
//! in a single concurrent map. The hot path, the polling loop and the
//! lifecycle controller all go through [`WatchdogStore`]; map guards are only
//! held inside the closures passed to it, never across an `.await`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::try_result::TryResult;
use pipeline_graph::EndpointRole;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Identity of a supervised endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WatchdogKey {
    pub instance_id: String,
    pub role: EndpointRole,
}

impl WatchdogKey {
    pub fn new(instance_id: impl Into<String>, role: EndpointRole) -> Self {
        Self {
            instance_id: instance_id.into(),
            role,
        }
    }

    /// Key of the other endpoint of the same instance.
    pub fn peer(&self) -> Self {
        Self {
            instance_id: self.instance_id.clone(),
            role: self.role.peer(),
        }
    }
}

impl fmt::Display for WatchdogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.role)
    }
}

/// Observable position of a watchdog in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogPhase {
    /// Waiting for the first activity after start.
    InitialConnecting,
    /// Activity is flowing.
    Connected,
    /// Silence exceeded a threshold; a reconnect is pending (cooldown).
    SuspectedDisconnected,
    /// A reconnect is in flight.
    Reconnecting,
    /// Maximum attempts reached. Polling continues without reconnects.
    Exhausted,
    /// The loop has exited.
    Stopped,
}

impl WatchdogPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitialConnecting => "initial_connecting",
            Self::Connected => "connected",
            Self::SuspectedDisconnected => "suspected_disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Exhausted => "exhausted",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WatchdogPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable control state of one watchdog.
#[derive(Debug)]
pub struct WatchdogRecord {
    pub key: WatchdogKey,
    /// Distinguishes this record from the one replacing it after a restart.
    pub generation: u64,
    pub last_activity: Option<Instant>,
    /// Set on the first recorded activity and never cleared.
    pub has_connected: bool,
    pub reconnect_attempts: u32,
    pub last_reconnect_attempt: Option<Instant>,
    pub last_successful_reconnect: Option<Instant>,
    pub start_time: Instant,
    pub phase: WatchdogPhase,
    pub stop: CancellationToken,
    pub task: Option<JoinHandle<()>>,
}

impl WatchdogRecord {
    pub fn new(key: WatchdogKey, generation: u64, now: Instant) -> Self {
        Self {
            key,
            generation,
            last_activity: None,
            has_connected: false,
            reconnect_attempts: 0,
            last_reconnect_attempt: None,
            last_successful_reconnect: None,
            start_time: now,
            phase: WatchdogPhase::InitialConnecting,
            stop: CancellationToken::new(),
            task: None,
        }
    }

    /// Record activity observed at `now`.
    pub fn touch(&mut self, now: Instant) {
        // Never move the clock backwards if a stale caller races a newer one.
        if self.last_activity.is_none_or(|last| now > last) {
            self.last_activity = Some(now);
        }
        self.has_connected = true;
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            key: self.key.clone(),
            generation: self.generation,
            last_activity: self.last_activity,
            has_connected: self.has_connected,
            reconnect_attempts: self.reconnect_attempts,
            last_reconnect_attempt: self.last_reconnect_attempt,
            last_successful_reconnect: self.last_successful_reconnect,
            start_time: self.start_time,
            phase: self.phase,
        }
    }
}

/// Point-in-time copy of a record, without its stop token and task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub key: WatchdogKey,
    pub generation: u64,
    pub last_activity: Option<Instant>,
    pub has_connected: bool,
    pub reconnect_attempts: u32,
    pub last_reconnect_attempt: Option<Instant>,
    pub last_successful_reconnect: Option<Instant>,
    pub start_time: Instant,
    pub phase: WatchdogPhase,
}

impl RecordSnapshot {
    pub fn since_start(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start_time)
    }

    /// Silence measured from the last activity, or from start if none yet.
    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity.unwrap_or(self.start_time))
    }
}

/// Shared map of all watchdog records.
#[derive(Debug, Clone, Default)]
pub struct WatchdogStore {
    records: Arc<DashMap<WatchdogKey, WatchdogRecord>>,
    generations: Arc<AtomicU64>,
}

impl WatchdogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a generation number for a new record.
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert a record, returning the one it replaced.
    pub fn insert(&self, record: WatchdogRecord) -> Option<WatchdogRecord> {
        self.records.insert(record.key.clone(), record)
    }

    pub fn contains(&self, key: &WatchdogKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn snapshot(&self, key: &WatchdogKey) -> Option<RecordSnapshot> {
        self.records.get(key).map(|record| record.snapshot())
    }

    /// Snapshots of every record, ordered by key.
    pub fn snapshots(&self) -> Vec<RecordSnapshot> {
        let mut snapshots: Vec<RecordSnapshot> =
            self.records.iter().map(|entry| entry.snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    pub fn keys(&self) -> Vec<WatchdogKey> {
        let mut keys: Vec<WatchdogKey> = self.records.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Mutate a record, waiting for its shard if necessary.
    pub fn update<R>(
        &self,
        key: &WatchdogKey,
        f: impl FnOnce(&mut WatchdogRecord) -> R,
    ) -> Option<R> {
        self.records.get_mut(key).map(|mut record| f(record.value_mut()))
    }

    /// Mutate a record only if it is present and its shard is free.
    pub fn try_update<R>(
        &self,
        key: &WatchdogKey,
        f: impl FnOnce(&mut WatchdogRecord) -> R,
    ) -> Option<R> {
        match self.records.try_get_mut(key) {
            TryResult::Present(mut record) => Some(f(record.value_mut())),
            TryResult::Absent | TryResult::Locked => None,
        }
    }

    /// Mutate a record only while it still belongs to `generation`.
    pub fn update_generation<R>(
        &self,
        key: &WatchdogKey,
        generation: u64,
        f: impl FnOnce(&mut WatchdogRecord) -> R,
    ) -> Option<R> {
        self.records
            .get_mut(key)
            .filter(|record| record.generation == generation)
            .map(|mut record| f(record.value_mut()))
    }

    pub fn remove(&self, key: &WatchdogKey) -> Option<WatchdogRecord> {
        self.records.remove(key).map(|(_, record)| record)
    }

    /// Remove a record only if it still belongs to `generation`.
    pub fn remove_if_generation(&self, key: &WatchdogKey, generation: u64) -> bool {
        self.records
            .remove_if(key, |_, record| record.generation == generation)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
