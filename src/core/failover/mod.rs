// src/core/failover/mod.rs

//! The failover engine and its collaborators: command substitution and the
//! primary prober.

pub mod command;
pub mod engine;
pub mod primary;

pub use command::{CommandRunner, ShellCommandRunner, SubstitutionContext, expand};
pub use engine::{FailoverEngine, RestartDecision, decide_restart};
pub use primary::{NetworkPrimaryProber, PrimaryProber};
