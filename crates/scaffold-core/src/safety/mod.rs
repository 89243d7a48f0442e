//! Safety subsystems: per-task pre-execution validation with retry
//! accounting ([`rails`]) and session-wide hard limits ([`monitor`]).

pub mod monitor;
pub mod rails;

pub use monitor::{LimitBreach, RemainingBudget, SafetyMonitor, SafetyMonitorConfig};
pub use rails::{
    CostEstimate, EstimateMethod, RetryState, SafetyRails, SafetyRailsConfig, ValidationFailure,
    ValidationFailureKind,
};
