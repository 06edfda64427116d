use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{BenchConfig, ShutdownState};

/// Outcome of one control-loop evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Continue,
    StopTimeout,
    StopConverged,
    StopConfirmed,
    AwaitConfirmation,
}

impl Verdict {
    pub fn is_stop(&self) -> bool {
        matches!(
            self,
            Verdict::StopTimeout | Verdict::StopConverged | Verdict::StopConfirmed
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    pub elapsed: Duration,
    /// Most recent average latencies, oldest first
    pub recent: &'a [f64],
    pub shutdown: ShutdownState,
}

/// Decides when a run ends: timeout, flattened latency, or operator abort
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerminationPolicy {
    pub timeout: Duration,
    pub window: usize,
    pub threshold: f64,
}

impl TerminationPolicy {
    pub fn from_config(config: &BenchConfig) -> Self {
        Self {
            timeout: config.timeout,
            window: config.convergence_window,
            threshold: config.convergence_threshold,
        }
    }

    pub fn decide(&self, input: PolicyInput<'_>) -> Verdict {
        if input.shutdown == ShutdownState::Confirmed {
            return Verdict::StopConfirmed;
        }
        if input.elapsed >= self.timeout {
            return Verdict::StopTimeout;
        }
        if input.shutdown == ShutdownState::InterruptRequested {
            return Verdict::AwaitConfirmation;
        }
        if self.converged(input.recent) {
            return Verdict::StopConverged;
        }
        Verdict::Continue
    }

    fn converged(&self, recent: &[f64]) -> bool {
        if self.window == 0 || recent.len() < self.window {
            return false;
        }
        population_variance(&recent[recent.len() - self.window..]) < self.threshold
    }
}

/// Mean squared deviation from the mean; 0.0 for an empty slice
pub fn population_variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}
