use crate::error::GuardError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Lifecycle of a grant. Only `Active` grants live in memory; the terminal
/// states exist in the ledger alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantStatus {
    Active,
    Expired,
    Revoked,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantStatus::Active => "active",
            GrantStatus::Expired => "expired",
            GrantStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(GrantStatus::Active),
            "expired" => Ok(GrantStatus::Expired),
            "revoked" => Ok(GrantStatus::Revoked),
            other => Err(format!("Unknown grant status: {}", other)),
        }
    }
}

/// A time-boxed authorization to write one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub canonical_path: PathBuf,
    pub task_id: String,
    pub agent_name: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: GrantStatus,
}

impl Grant {
    /// Fails when `granted_at + ttl` is not a representable instant.
    pub fn new(
        canonical_path: PathBuf,
        task_id: impl Into<String>,
        agent_name: impl Into<String>,
        granted_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> crate::error::Result<Self> {
        let expires_at = granted_at.checked_add_signed(ttl).ok_or_else(|| {
            GuardError::InvalidRequest(format!("grant TTL of {}s is out of range", ttl.num_seconds()))
        })?;
        Ok(Self {
            canonical_path,
            task_id: task_id.into(),
            agent_name: agent_name.into(),
            granted_at,
            expires_at,
            status: GrantStatus::Active,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whole seconds left before expiry, floored at zero.
    pub fn expires_in(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_seconds().max(0) as u64
    }
}

/// Kinds of rows in the audit table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Granted,
    Revoked,
    Expired,
    Superseded,
    Lockdown,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Granted => "GRANTED",
            AuditAction::Revoked => "REVOKED",
            AuditAction::Expired => "EXPIRED",
            AuditAction::Superseded => "SUPERSEDED",
            AuditAction::Lockdown => "LOCKDOWN",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GRANTED" => Ok(AuditAction::Granted),
            "REVOKED" => Ok(AuditAction::Revoked),
            "EXPIRED" => Ok(AuditAction::Expired),
            "SUPERSEDED" => Ok(AuditAction::Superseded),
            "LOCKDOWN" => Ok(AuditAction::Lockdown),
            other => Err(format!("Unknown audit action: {}", other)),
        }
    }
}

/// Path and task recorded for events that concern the whole tree.
pub const SYSTEM_PATH: &str = "*";
pub const SYSTEM_TASK: &str = "system";

/// One append-only audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub file_path: String,
    pub action: AuditAction,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl AuditEvent {
    pub fn succeeded(
        file_path: impl Into<String>,
        action: AuditAction,
        task_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            action,
            task_id: task_id.into(),
            timestamp,
            success: true,
            error_message: None,
        }
    }

    pub fn failed(
        file_path: impl Into<String>,
        action: AuditAction,
        task_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            action,
            task_id: task_id.into(),
            timestamp,
            success: false,
            error_message: Some(error.to_string()),
        }
    }
}

/// Monitoring liveness as seen by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LivenessState {
    Active,
    Lockdown,
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LivenessState::Active => f.write_str("ACTIVE"),
            LivenessState::Lockdown => f.write_str("LOCKDOWN"),
        }
    }
}

/// Answer to `check_permission`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub const REASON_MONITORING_DOWN: &str = "No active permission or monitoring is down";
pub const REASON_NOT_FOUND: &str = "No active permission for this file";
pub const REASON_OUT_OF_SCOPE: &str = "Path is outside all protected roots";

impl Decision {
    pub fn allowed(grant: &Grant, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            task_id: Some(grant.task_id.clone()),
            agent: Some(grant.agent_name.clone()),
            expires_in: Some(grant.expires_in(now)),
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            task_id: None,
            agent: None,
            expires_in: None,
            reason: Some(reason.into()),
        }
    }

    pub fn unprotected() -> Self {
        Self {
            allowed: true,
            task_id: None,
            agent: None,
            expires_in: None,
            reason: Some(REASON_OUT_OF_SCOPE.to_string()),
        }
    }
}

/// One live grant as reported by `get_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSnapshot {
    pub file_path: PathBuf,
    pub task_id: String,
    pub agent_name: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expires_in: u64,
}

/// Read-only view for dashboards and health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardStatus {
    pub monitoring_active: bool,
    pub liveness: LivenessState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub protected_dirs: Vec<PathBuf>,
    pub active_permissions: usize,
    pub permissions: Vec<PermissionSnapshot>,
}
