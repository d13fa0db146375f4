//! In-memory grant table and liveness state.
//!
//! Both live in [`GuardState`], which the gate keeps behind a single mutex:
//! a grant can never be inserted between a liveness timeout and the table
//! being cleared.

use crate::types::{Grant, LivenessState, PermissionSnapshot};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Live grants keyed by canonical path. At most one per path.
#[derive(Debug, Default)]
pub struct ActivePermissionTable {
    grants: HashMap<PathBuf, Grant>,
}

impl ActivePermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a grant, returning the one it replaced.
    pub fn insert(&mut self, grant: Grant) -> Option<Grant> {
        self.grants.insert(grant.canonical_path.clone(), grant)
    }

    pub fn get(&self, path: &Path) -> Option<&Grant> {
        self.grants.get(path)
    }

    pub fn remove(&mut self, path: &Path) -> Option<Grant> {
        self.grants.remove(path)
    }

    /// Remove and return every grant whose window has closed.
    pub fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<Grant> {
        let expired: Vec<PathBuf> = self
            .grants
            .values()
            .filter(|grant| grant.is_expired_at(now))
            .map(|grant| grant.canonical_path.clone())
            .collect();

        expired
            .iter()
            .filter_map(|path| self.grants.remove(path))
            .collect()
    }

    /// Empty the table.
    pub fn drain(&mut self) -> Vec<Grant> {
        self.grants.drain().map(|(_, grant)| grant).collect()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// Snapshots ordered by path.
    pub fn snapshots(&self, now: DateTime<Utc>) -> Vec<PermissionSnapshot> {
        let mut snapshots: Vec<PermissionSnapshot> = self
            .grants
            .values()
            .map(|grant| PermissionSnapshot {
                file_path: grant.canonical_path.clone(),
                task_id: grant.task_id.clone(),
                agent_name: grant.agent_name.clone(),
                granted_at: grant.granted_at,
                expires_at: grant.expires_at,
                expires_in: grant.expires_in(now),
            })
            .collect();
        snapshots.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        snapshots
    }
}

/// Liveness of the supervising process. Starts in lockdown: nothing is
/// granted until the first heartbeat arrives.
#[derive(Debug, Clone)]
pub struct Liveness {
    state: LivenessState,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            state: LivenessState::Lockdown,
            last_heartbeat: None,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == LivenessState::Active
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat
    }

    /// Record a heartbeat and return the state it arrived in.
    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) -> LivenessState {
        let previous = self.state;
        self.last_heartbeat = Some(now);
        self.state = LivenessState::Active;
        previous
    }

    /// Whether an active guard has gone longer than `timeout` without a
    /// heartbeat.
    pub fn timed_out(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match (self.state, self.last_heartbeat) {
            (LivenessState::Active, Some(last)) => now - last > timeout,
            (LivenessState::Active, None) => true,
            (LivenessState::Lockdown, _) => false,
        }
    }

    /// Returns false if already in lockdown.
    pub fn enter_lockdown(&mut self) -> bool {
        let changed = self.state != LivenessState::Lockdown;
        self.state = LivenessState::Lockdown;
        changed
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything guarded by the gate's lock.
#[derive(Debug, Default)]
pub struct GuardState {
    pub table: ActivePermissionTable,
    pub liveness: Liveness,
    /// Lockdown walks currently re-locking the tree outside the lock.
    pub relocking: usize,
}
