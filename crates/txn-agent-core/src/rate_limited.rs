// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Emits at most one warning per window, counting what it swallowed.
///
/// Used for backpressure warnings that can fire once per dropped item under
/// load. Never blocks: a contended call is counted as suppressed.
#[derive(Debug)]
pub struct RateLimitedLogger {
    name: &'static str,
    window: Duration,
    last_emitted: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl RateLimitedLogger {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self::with_window(name, DEFAULT_WINDOW)
    }

    #[must_use]
    pub fn with_window(name: &'static str, window: Duration) -> Self {
        Self {
            name,
            window,
            last_emitted: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns whether the message was emitted.
    pub fn warn(&self, args: fmt::Arguments<'_>) -> bool {
        let Ok(mut last_emitted) = self.last_emitted.try_lock() else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let now = Instant::now();
        if last_emitted.is_some_and(|last| now.duration_since(last) < self.window) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        *last_emitted = Some(now);
        let suppressed = self.suppressed.swap(0, Ordering::Relaxed);
        if suppressed == 0 {
            warn!(logger = self.name, "{}", args);
        } else {
            warn!(
                logger = self.name,
                "{} (suppressed {} similar messages)", args, suppressed
            );
        }
        true
    }
}
