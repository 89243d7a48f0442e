//! Session-wide hard limits, independent of per-task retry budgets.
//!
//! The monitor is owned and mutated only by the orchestrator's coordinator
//! loop, which is the serialization point for all budget accounting: a
//! limit check and the accounting that follows it can never interleave
//! with another worker's.

use std::time::{Duration, Instant};

/// Hard limits for one session.
#[derive(Debug, Clone)]
pub struct SafetyMonitorConfig {
    pub max_cost_usd: f64,
    pub max_time_hours: f64,
    pub max_consecutive_failures: u32,
}

impl Default for SafetyMonitorConfig {
    fn default() -> Self {
        Self {
            max_cost_usd: 5.0,
            max_time_hours: 4.0,
            max_consecutive_failures: 3,
        }
    }
}

/// Which hard limit was breached.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitBreach {
    CostExceeded { spent: f64, max: f64 },
    TimeExceeded { elapsed_hours: f64, max: f64 },
    TooManyFailures { count: u32, max: u32 },
}

impl std::fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitBreach::CostExceeded { spent, max } => {
                write!(f, "cost limit exceeded (${spent:.2} of ${max:.2})")
            }
            LimitBreach::TimeExceeded { elapsed_hours, max } => {
                write!(f, "time limit exceeded ({elapsed_hours:.2}h of {max:.1}h)")
            }
            LimitBreach::TooManyFailures { count, max } => {
                write!(f, "too many consecutive failures ({count} of {max})")
            }
        }
    }
}

/// What is left before each limit trips.
#[derive(Debug, Clone, PartialEq)]
pub struct RemainingBudget {
    pub cost_usd: f64,
    pub hours: f64,
    pub failures: u32,
}

/// Tracks session totals against the configured hard limits.
#[derive(Debug)]
pub struct SafetyMonitor {
    config: SafetyMonitorConfig,
    started: Instant,
    total_cost: f64,
    consecutive_failures: u32,
}

impl SafetyMonitor {
    pub fn new(config: SafetyMonitorConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            total_cost: 0.0,
            consecutive_failures: 0,
        }
    }

    /// Evaluated before each task acquisition. A breach means the session
    /// acquires no further work; in-flight tasks finish their current
    /// phase.
    pub fn check_limits(&self) -> Result<(), LimitBreach> {
        if self.total_cost >= self.config.max_cost_usd {
            return Err(LimitBreach::CostExceeded {
                spent: self.total_cost,
                max: self.config.max_cost_usd,
            });
        }
        let elapsed_hours = self.elapsed().as_secs_f64() / 3600.0;
        if elapsed_hours >= self.config.max_time_hours {
            return Err(LimitBreach::TimeExceeded {
                elapsed_hours,
                max: self.config.max_time_hours,
            });
        }
        if self.consecutive_failures >= self.config.max_consecutive_failures {
            return Err(LimitBreach::TooManyFailures {
                count: self.consecutive_failures,
                max: self.config.max_consecutive_failures,
            });
        }
        Ok(())
    }

    /// Whether committing to an estimated cost would push the cumulative
    /// total past the cap. Used as the post-acquisition cost check.
    pub fn would_exceed_cost(&self, estimated_cost_usd: f64) -> bool {
        self.total_cost + estimated_cost_usd > self.config.max_cost_usd
    }

    pub fn record_success(&mut self, cost_usd: f64) {
        self.total_cost += cost_usd;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining_budget(&self) -> RemainingBudget {
        let elapsed_hours = self.elapsed().as_secs_f64() / 3600.0;
        RemainingBudget {
            cost_usd: (self.config.max_cost_usd - self.total_cost).max(0.0),
            hours: (self.config.max_time_hours - elapsed_hours).max(0.0),
            failures: self
                .config
                .max_consecutive_failures
                .saturating_sub(self.consecutive_failures),
        }
    }

    /// Shift the session start back in time. Test hook for exercising the
    /// time limit without sleeping.
    #[cfg(test)]
    fn backdate(&mut self, by: Duration) {
        if let Some(earlier) = self.started.checked_sub(by) {
            self.started = earlier;
        }
    }
}
