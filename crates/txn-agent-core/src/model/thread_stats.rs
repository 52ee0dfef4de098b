// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thread resource statistics with explicit "not available" propagation.
//!
//! A stat that could not be measured is `None`, never zero. Once any merged
//! sample reports a stat as unavailable, the merged value stays unavailable:
//! a partial sum would silently look like a real (smaller) number.

use serde::Serialize;

use crate::constants::NANOSECONDS_PER_MILLISECOND;

/// Resource usage of one thread context. `None` means not available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStats {
    pub cpu_nanos: Option<i64>,
    pub blocked_millis: Option<i64>,
    pub waited_millis: Option<i64>,
    pub allocated_bytes: Option<i64>,
}

impl ThreadStats {
    /// Nothing could be measured.
    pub const NA: ThreadStats = ThreadStats {
        cpu_nanos: None,
        blocked_millis: None,
        waited_millis: None,
        allocated_bytes: None,
    };
}

/// Point-in-time reading used to compute a [`ThreadStats`] delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStatsReading {
    cpu_nanos: Option<i64>,
}

impl ThreadStatsReading {
    /// Reads the calling thread's counters.
    #[must_use]
    pub fn capture() -> Self {
        Self {
            cpu_nanos: current_thread_cpu_nanos(),
        }
    }

    /// Stats accrued on the calling thread since `self` was captured.
    ///
    /// Blocked/waited time and allocation tracking have no portable source, so
    /// they are always reported as not available.
    #[must_use]
    pub fn delta_to_now(&self) -> ThreadStats {
        let end = Self::capture();
        ThreadStats {
            cpu_nanos: match (self.cpu_nanos, end.cpu_nanos) {
                (Some(start), Some(end)) => Some((end - start).max(0)),
                _ => None,
            },
            blocked_millis: None,
            waited_millis: None,
            allocated_bytes: None,
        }
    }
}

#[cfg(unix)]
fn current_thread_cpu_nanos() -> Option<i64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if ret != 0 {
        return None;
    }
    #[allow(clippy::unnecessary_cast)]
    Some(ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64)
}

#[cfg(not(unix))]
fn current_thread_cpu_nanos() -> Option<i64> {
    None
}

/// Wire form of merged thread stats, all values in nanoseconds or bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateThreadStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cpu_nanos: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_blocked_nanos: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_waited_nanos: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_allocated_bytes: Option<f64>,
}

/// Accumulates thread stats across contexts or transactions.
///
/// `merge(None)` records a sample where stats could not be captured at all,
/// which makes every stat unavailable from then on.
#[derive(Debug, Clone, Copy)]
pub struct ThreadStatsCollector {
    // f64 to avoid (unlikely) 292 year nanosecond rollover in long-lived aggregates
    cpu_nanos: Option<f64>,
    blocked_millis: Option<f64>,
    waited_millis: Option<f64>,
    allocated_bytes: Option<f64>,
    empty: bool,
}

impl Default for ThreadStatsCollector {
    fn default() -> Self {
        Self {
            cpu_nanos: Some(0.0),
            blocked_millis: Some(0.0),
            waited_millis: Some(0.0),
            allocated_bytes: Some(0.0),
            empty: true,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn add(total: Option<f64>, value: Option<i64>) -> Option<f64> {
    match (total, value) {
        (Some(total), Some(value)) => Some(total + value as f64),
        _ => None,
    }
}

impl ThreadStatsCollector {
    pub fn merge(&mut self, stats: Option<&ThreadStats>) {
        let stats = stats.unwrap_or(&ThreadStats::NA);
        self.cpu_nanos = add(self.cpu_nanos, stats.cpu_nanos);
        self.blocked_millis = add(self.blocked_millis, stats.blocked_millis);
        self.waited_millis = add(self.waited_millis, stats.waited_millis);
        self.allocated_bytes = add(self.allocated_bytes, stats.allocated_bytes);
        self.empty = false;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// Merged stats in their original units, `None` if nothing was merged.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn merged(&self) -> Option<ThreadStats> {
        if self.empty {
            return None;
        }
        Some(ThreadStats {
            cpu_nanos: self.cpu_nanos.map(|v| v as i64),
            blocked_millis: self.blocked_millis.map(|v| v as i64),
            waited_millis: self.waited_millis.map(|v| v as i64),
            allocated_bytes: self.allocated_bytes.map(|v| v as i64),
        })
    }

    /// `None` means no sample was ever merged, as opposed to samples whose
    /// individual stats were all unavailable.
    #[must_use]
    pub fn build(&self) -> Option<AggregateThreadStats> {
        if self.empty {
            return None;
        }
        Some(AggregateThreadStats {
            total_cpu_nanos: self.cpu_nanos,
            total_blocked_nanos: self
                .blocked_millis
                .map(|v| v * NANOSECONDS_PER_MILLISECOND),
            total_waited_nanos: self
                .waited_millis
                .map(|v| v * NANOSECONDS_PER_MILLISECOND),
            total_allocated_bytes: self.allocated_bytes,
        })
    }
}
