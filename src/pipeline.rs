//! Retry policy shared by every job a [`Connection`](crate::connection::Connection)
//! runs. The FIFO queue, single-flight serialization, and waiter slot this
//! spec's component breakdown calls "the request pipeline" are folded
//! into `Connection` itself: its own data model already lists
//! `request_queue`, `processing`, and `outstanding` as connection state,
//! so there is no separate pipeline object to hold them.

use std::time::Duration;

use crate::config::Config;

/// A label naming which job contract is running, used only for tracing
/// spans (not wire-visible).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Read,
    Write,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Read => write!(f, "read"),
            JobKind::Write => write!(f, "write"),
        }
    }
}

/// Bounded exponential backoff: `delay *= multiplier` after each failed
/// attempt, up to `max_retries` total attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_retries: cfg.max_retries.max(1),
            initial_backoff: cfg.initial_backoff,
            multiplier: cfg.backoff_multiplier,
        }
    }

    /// Delay to sleep after the `attempt`-th failed attempt (0-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.initial_backoff.mul_f64(self.multiplier.powi(attempt as i32))
    }
}
