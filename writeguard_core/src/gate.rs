//! The public façade.
//!
//! `ProtectionGate` composes scope resolution, the grant table, the file mode
//! enforcer and the ledger into the guard operations. Every mutation runs
//! under one mutex covering the table and the liveness state. The only work
//! done outside it is the recursive re-lock after a lockdown, which is slow
//! and happens after the table has already been emptied.

use crate::clock::{Clock, SystemClock};
use crate::config::GuardConfig;
use crate::enforcer::{FileModeEnforcer, LockReport};
use crate::error::{GuardError, Result};
use crate::ledger::PermissionLedger;
use crate::scope::ProtectedScopeResolver;
use crate::table::{GuardState, Liveness};
use crate::types::{
    AuditAction, AuditEvent, Decision, Grant, GrantStatus, GuardStatus, LivenessState,
    REASON_MONITORING_DOWN, REASON_NOT_FOUND, SYSTEM_PATH, SYSTEM_TASK,
};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What a lockdown did.
#[derive(Debug, Default, Clone)]
pub struct LockdownReport {
    /// Grants removed from the table.
    pub grants_cleared: usize,
    pub files: LockReport,
    /// Set when the `LOCKDOWN` row could not be written.
    pub audit_error: Option<String>,
}

/// What an expiry sweep did.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    /// Grants removed from the table.
    pub expired: usize,
    pub failures: Vec<(PathBuf, String)>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ProtectionGate {
    config: GuardConfig,
    scope: ProtectedScopeResolver,
    enforcer: FileModeEnforcer,
    ledger: PermissionLedger,
    clock: Arc<dyn Clock>,
    state: Mutex<GuardState>,
}

impl fmt::Debug for ProtectionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectionGate")
            .field("roots", &self.scope.roots())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl ProtectionGate {
    /// Open the ledger named by the configuration and lock every protected
    /// root.
    pub fn new(config: GuardConfig) -> Result<Self> {
        let ledger = PermissionLedger::open(&config.ledger_path)?;
        Self::with_parts(config, ledger, Arc::new(SystemClock))
    }

    /// Build a gate from explicit parts. The gate starts in lockdown with
    /// every protected file write-locked.
    pub fn with_parts(
        config: GuardConfig,
        ledger: PermissionLedger,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let gate = Self {
            scope: ProtectedScopeResolver::new(&config.protected_roots),
            enforcer: FileModeEnforcer::from_config(&config),
            ledger,
            clock,
            state: Mutex::new(GuardState {
                liveness: Liveness::new(),
                ..GuardState::default()
            }),
            config,
        };

        let stale = gate.ledger.revoke_all_active()?;
        if stale > 0 {
            warn!("Marked {} grant(s) from a previous run as revoked", stale);
        }

        let report = gate.relock_roots(Vec::new());
        info!(
            "Protection gate started in lockdown: {} file(s) locked under {} root(s)",
            report.files.locked,
            gate.scope.roots().len()
        );
        Ok(gate)
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn ledger(&self) -> &PermissionLedger {
        &self.ledger
    }

    pub fn protected_roots(&self) -> &[PathBuf] {
        self.scope.roots()
    }

    pub fn liveness(&self) -> LivenessState {
        self.state.lock().liveness.state()
    }

    /// Open `path` for writing on behalf of `task_id`.
    ///
    /// Returns `Ok(false)` while monitoring is down, `Ok(true)` for paths
    /// outside every protected root (nothing is tracked or changed), and
    /// `Ok(true)` once the grant is recorded and the file unlocked. The grant
    /// row and its audit rows are committed before the file mode changes; if
    /// that commit fails the file, the table and the ledger are left exactly
    /// as they were.
    pub fn grant_permission(
        &self,
        path: impl AsRef<Path>,
        task_id: &str,
        agent_name: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let path = path.as_ref();
        let Some(canonical) = self.scope.resolve(path) else {
            debug!("Grant for unprotected path {:?} passes through", path);
            return Ok(true);
        };
        if self.enforcer.is_excluded(&canonical) {
            return Err(GuardError::InvalidRequest(format!(
                "{} belongs to the permission ledger",
                canonical.display()
            )));
        }

        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        if ttl.is_zero() {
            return Err(GuardError::InvalidRequest(
                "grant TTL must be greater than zero".to_string(),
            ));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| GuardError::InvalidRequest(format!("grant TTL out of range: {}", e)))?;

        let mut state = self.state.lock();
        if !state.liveness.is_active() || state.relocking > 0 {
            warn!(
                "Refusing grant on {:?} for task {}: monitoring is down",
                canonical, task_id
            );
            return Ok(false);
        }

        let now = self.clock.now();
        let grant = Grant::new(canonical.clone(), task_id, agent_name, now, ttl)?;

        if let Err(e) = self.enforcer.ensure_file(&canonical) {
            error!("Refusing grant on {:?}: {}", canonical, e);
            self.record_failure(&canonical, AuditAction::Granted, task_id, &e);
            return Err(e);
        }

        let superseded = state
            .table
            .get(&canonical)
            .filter(|prior| prior.task_id != task_id)
            .cloned();
        let mut events = Vec::with_capacity(2);
        if let Some(prior) = &superseded {
            events.push(AuditEvent::succeeded(
                path_str(&canonical),
                AuditAction::Superseded,
                prior.task_id.as_str(),
                now,
            ));
        }
        events.push(AuditEvent::succeeded(
            path_str(&canonical),
            AuditAction::Granted,
            task_id,
            now,
        ));

        if let Err(e) = self.ledger.record_grant(&grant, superseded.as_ref(), &events) {
            error!("Failed to persist grant for {:?}: {}", canonical, e);
            self.record_failure(&canonical, AuditAction::Granted, task_id, &e);
            return Err(e);
        }
        if let Some(prior) = &superseded {
            info!(
                "Grant on {:?} for task {} superseded by task {}",
                canonical, prior.task_id, task_id
            );
        }

        if let Err(e) = self.enforcer.unlock(&canonical) {
            error!("Failed to unlock {:?}: {}", canonical, e);
            self.record_failure(&canonical, AuditAction::Granted, task_id, &e);
            self.close_after_failure(&grant);
            // The commit above already replaced any prior grant on the path.
            state.table.remove(&canonical);
            self.lock_after_failure(&canonical);
            return Err(e);
        }

        info!(
            "Granted write access to {:?} for task {} ({}) until {}",
            canonical, task_id, agent_name, grant.expires_at
        );
        state.table.insert(grant);
        Ok(true)
    }

    /// Revoke the active grant on `path`. With `task_id`, only a grant held
    /// by that task is revoked; a mismatch returns `Ok(false)` and leaves the
    /// grant in place.
    pub fn revoke_permission(&self, path: impl AsRef<Path>, task_id: Option<&str>) -> Result<bool> {
        let canonical = self.scope.canonicalize(path.as_ref());
        let mut state = self.state.lock();

        let holder = match state.table.get(&canonical) {
            Some(grant) => grant.task_id.clone(),
            None => {
                debug!("No active grant to revoke on {:?}", canonical);
                return Ok(false);
            }
        };

        if let Some(requested) = task_id {
            if requested != holder {
                warn!(
                    "Task {} may not revoke grant on {:?} held by task {}",
                    requested, canonical, holder
                );
                return Ok(false);
            }
        }

        let Some(grant) = state.table.remove(&canonical) else {
            return Ok(false);
        };
        self.retire(&grant, GrantStatus::Revoked, AuditAction::Revoked)?;
        info!("Revoked write access to {:?} for task {}", canonical, holder);
        Ok(true)
    }

    /// Whether `path` may currently be written. An expired grant found here
    /// is revoked on the spot and its file locked again.
    pub fn check_permission(&self, path: impl AsRef<Path>) -> Decision {
        let path = path.as_ref();
        let Some(canonical) = self.scope.resolve(path) else {
            return Decision::unprotected();
        };

        let now = self.clock.now();
        let mut state = self.state.lock();

        let expired = match state.table.get(&canonical) {
            Some(grant) if !grant.is_expired_at(now) => return Decision::allowed(grant, now),
            Some(_) => true,
            None => false,
        };

        if expired {
            if let Some(grant) = state.table.remove(&canonical) {
                info!(
                    "Grant on {:?} for task {} expired at {}",
                    canonical, grant.task_id, grant.expires_at
                );
                if let Err(e) = self.retire(&grant, GrantStatus::Expired, AuditAction::Expired) {
                    error!("Failed to retire expired grant on {:?}: {}", canonical, e);
                }
            }
        }

        debug!("Denied write check on {:?}", canonical);
        if state.liveness.is_active() {
            Decision::denied(REASON_NOT_FOUND)
        } else {
            Decision::denied(REASON_MONITORING_DOWN)
        }
    }

    /// Record a liveness signal from monitoring and return the state it
    /// arrived in. Leaving lockdown does not reopen any file.
    pub fn heartbeat(&self) -> LivenessState {
        let now = self.clock.now();
        let previous = self.state.lock().liveness.record_heartbeat(now);
        match previous {
            LivenessState::Lockdown => info!("Heartbeat received, leaving lockdown"),
            LivenessState::Active => debug!("Heartbeat received at {}", now),
        }
        previous
    }

    /// Revoke every grant whose window has closed. Grants are always taken
    /// out of the table; files that could not be locked again or rows that
    /// could not be written are listed in the report.
    pub fn cleanup_expired(&self) -> SweepReport {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let expired = state.table.take_expired(now);

        let mut report = SweepReport {
            expired: expired.len(),
            ..SweepReport::default()
        };
        for grant in &expired {
            info!(
                "Sweeping expired grant on {:?} for task {}",
                grant.canonical_path, grant.task_id
            );
            if let Err(e) = self.retire(grant, GrantStatus::Expired, AuditAction::Expired) {
                error!(
                    "Failed to retire expired grant on {:?}: {}",
                    grant.canonical_path, e
                );
                report
                    .failures
                    .push((grant.canonical_path.clone(), e.to_string()));
            }
        }

        report
    }

    pub fn get_status(&self) -> GuardStatus {
        let now = self.clock.now();
        let state = self.state.lock();
        GuardStatus {
            monitoring_active: state.liveness.is_active(),
            liveness: state.liveness.state(),
            last_heartbeat: state.liveness.last_heartbeat(),
            protected_dirs: self.scope.roots().to_vec(),
            active_permissions: state.table.len(),
            permissions: state.table.snapshots(now),
        }
    }

    /// Enter lockdown if monitoring has been silent for longer than the
    /// heartbeat timeout. The check and the transition are atomic with
    /// respect to `heartbeat`.
    pub fn check_liveness(&self) -> Option<LockdownReport> {
        let now = self.clock.now();
        let Some(timeout) = i64::try_from(self.config.heartbeat_timeout_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
        else {
            error!(
                "Heartbeat timeout of {}s is out of range, treating monitoring as lost",
                self.config.heartbeat_timeout_seconds
            );
            return self.enter_lockdown();
        };
        self.lockdown_when(|liveness| {
            let timed_out = liveness.timed_out(now, timeout);
            if timed_out {
                warn!(
                    "No heartbeat since {:?}, timeout is {}s",
                    liveness.last_heartbeat(),
                    timeout.num_seconds()
                );
            }
            timed_out
        })
    }

    /// Enter lockdown unconditionally. Returns `None` when already in
    /// lockdown; the transition is not repeated and nothing is audited.
    pub fn enter_lockdown(&self) -> Option<LockdownReport> {
        self.lockdown_when(|_| true)
    }

    fn lockdown_when(&self, trigger: impl FnOnce(&Liveness) -> bool) -> Option<LockdownReport> {
        let drained = {
            let mut state = self.state.lock();
            if !state.liveness.is_active() {
                debug!("Already in lockdown");
                return None;
            }
            if !trigger(&state.liveness) {
                return None;
            }
            state.liveness.enter_lockdown();
            state.relocking += 1;
            state.table.drain()
        };

        warn!(
            "Entering lockdown: cleared {} grant(s), re-locking protected roots",
            drained.len()
        );
        let report = self.relock_roots(drained);
        self.state.lock().relocking -= 1;
        Some(report)
    }

    /// Lock the files of `drained` grants first, then walk every root, then
    /// write one `LOCKDOWN` row describing the outcome.
    fn relock_roots(&self, drained: Vec<Grant>) -> LockdownReport {
        let mut report = LockdownReport {
            grants_cleared: drained.len(),
            ..LockdownReport::default()
        };

        for grant in &drained {
            if let Err(e) = self.enforcer.lock(&grant.canonical_path) {
                error!("Failed to lock {:?}: {}", grant.canonical_path, e);
                report
                    .files
                    .failures
                    .push((grant.canonical_path.clone(), e.to_string()));
            }
            if let Err(e) = self
                .ledger
                .close_grant(&grant.canonical_path, &grant.task_id, GrantStatus::Revoked)
            {
                error!(
                    "Failed to close ledger row for {:?}: {}",
                    grant.canonical_path, e
                );
            }
        }

        for root in self.scope.roots() {
            report.files.merge(self.enforcer.lock_tree(root));
        }

        let now = self.clock.now();
        let event = match report.files.failure_summary() {
            None => AuditEvent::succeeded(SYSTEM_PATH, AuditAction::Lockdown, SYSTEM_TASK, now),
            Some(summary) => {
                error!("Lockdown left files unlocked: {}", summary);
                AuditEvent::failed(SYSTEM_PATH, AuditAction::Lockdown, SYSTEM_TASK, now, summary)
            }
        };
        if let Err(e) = self.ledger.append(&event) {
            error!("Failed to audit lockdown: {}", e);
            report.audit_error = Some(e.to_string());
        }

        report
    }

    /// Lock a grant's file, close its ledger row and audit the outcome. The
    /// grant must already be out of the table.
    fn retire(&self, grant: &Grant, status: GrantStatus, action: AuditAction) -> Result<()> {
        let now = self.clock.now();
        let locked = self.enforcer.lock(&grant.canonical_path);

        let event = match &locked {
            Ok(()) => AuditEvent::succeeded(
                path_str(&grant.canonical_path),
                action,
                grant.task_id.as_str(),
                now,
            ),
            Err(e) => AuditEvent::failed(
                path_str(&grant.canonical_path),
                action,
                grant.task_id.as_str(),
                now,
                e,
            ),
        };

        let persisted = self
            .ledger
            .close_grant(&grant.canonical_path, &grant.task_id, status)
            .and_then(|_| self.ledger.append(&event));

        locked?;
        persisted
    }

    fn record_failure(&self, path: &Path, action: AuditAction, task_id: &str, err: &GuardError) {
        let event = AuditEvent::failed(path_str(path), action, task_id, self.clock.now(), err);
        if let Err(e) = self.ledger.append(&event) {
            error!("Failed to audit {} failure on {:?}: {}", action, path, e);
        }
    }

    fn close_after_failure(&self, grant: &Grant) {
        if let Err(e) = self
            .ledger
            .close_grant(&grant.canonical_path, &grant.task_id, GrantStatus::Revoked)
        {
            error!(
                "Failed to close ledger row for {:?}: {}",
                grant.canonical_path, e
            );
        }
    }

    fn lock_after_failure(&self, path: &Path) {
        if path.exists() {
            if let Err(e) = self.enforcer.lock(path) {
                error!("Failed to re-lock {:?}: {}", path, e);
            }
        }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
