//! Fail-safe, time-boxed write-access guard.
//!
//! Every file under a protected root is kept read-only. A supervising
//! process opens individual files for writing with short-lived grants and
//! proves it is alive with heartbeats; when the heartbeats stop, every grant
//! is dropped and the whole tree is locked again.

pub mod clock;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod scope;
pub mod supervisor;
pub mod table;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GuardConfig;
pub use enforcer::{FileModeEnforcer, LockReport};
pub use error::{GuardError, Result};
pub use gate::{LockdownReport, ProtectionGate, SweepReport};
pub use ledger::PermissionLedger;
pub use scope::ProtectedScopeResolver;
pub use supervisor::{HeartbeatSupervisor, SupervisorHandle};
pub use table::{ActivePermissionTable, GuardState, Liveness};
pub use types::{
    AuditAction, AuditEvent, Decision, Grant, GrantStatus, GuardStatus, LivenessState,
    PermissionSnapshot,
};
