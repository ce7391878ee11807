//! Run-wide cap on individually logged outcomes

use harvest_common::logging::LogLevel;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::LogLimitConfig;

/// How an outcome should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDecision {
    /// Below the configured level; counted in the summary only
    Quiet,
    /// Within the limit; log and keep the details
    Detailed,
    /// Over the limit; counted but not logged
    Suppressed,
}

/// Atomic counter shared by every worker of a run
#[derive(Debug)]
pub struct LogLimiter {
    enabled: bool,
    level: LogLevel,
    limit: usize,
    seen: AtomicUsize,
}

impl LogLimiter {
    pub fn new(config: &LogLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            level: config.level,
            limit: config.limit,
            seen: AtomicUsize::new(0),
        }
    }

    /// Decide for one outcome of the given level
    pub fn admit(&self, level: LogLevel) -> LogDecision {
        if !self.level.admits(level) {
            return LogDecision::Quiet;
        }

        let seen = self.seen.fetch_add(1, Ordering::Relaxed);
        if self.enabled && seen < self.limit {
            LogDecision::Detailed
        } else {
            LogDecision::Suppressed
        }
    }

    /// Loggable outcomes seen so far
    pub fn seen(&self) -> usize {
        self.seen.load(Ordering::Relaxed)
    }

    /// Loggable outcomes that were not logged individually
    pub fn suppressed(&self) -> usize {
        let seen = self.seen();
        if self.enabled {
            seen.saturating_sub(self.limit)
        } else {
            seen
        }
    }
}
