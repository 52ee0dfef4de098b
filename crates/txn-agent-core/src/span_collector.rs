// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwards end-user-monitoring spans reported by browser agents.
//!
//! Spans arrive as raw query strings on application threads. Enqueueing never
//! blocks: once [`SPAN_PENDING_LIMIT`] spans are waiting, new ones are dropped.
//! Parsing and delivery happen on a background task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::collector::{Collector, Span};
use crate::constants::{SHUTDOWN_TIMEOUT, SPAN_PENDING_LIMIT};
use crate::errors::{AggregatorError, SpanCollectorError};
use crate::rate_limited::RateLimitedLogger;

const TRACE_ID_PARAM: &str = "trace-id";
const DURATION_PARAM: &str = "duration-millis";

/// Decodes `trace-id=...&duration-millis=...` into a span.
///
/// # Errors
///
/// Returns an error if either parameter is missing or the duration is not a
/// non-negative number.
pub fn parse_eum_span(query_string: &str) -> Result<Span, SpanCollectorError> {
    let mut trace_id = None;
    let mut duration = None;
    for pair in query_string.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            TRACE_ID_PARAM if !value.is_empty() => trace_id = Some(value),
            DURATION_PARAM => duration = Some(value),
            _ => {}
        }
    }
    let trace_id =
        trace_id.ok_or_else(|| SpanCollectorError::MissingTraceId(query_string.to_string()))?;
    let duration = duration
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SpanCollectorError::MissingDuration(query_string.to_string()))?;
    let millis: f64 = duration
        .parse()
        .map_err(|_| SpanCollectorError::InvalidDuration(query_string.to_string()))?;
    if !millis.is_finite() || millis < 0.0 {
        return Err(SpanCollectorError::InvalidDuration(
            query_string.to_string(),
        ));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let duration_nanos = (millis * 1_000_000.0).round() as u64;
    Ok(Span {
        eum: true,
        trace_id: trace_id.to_string(),
        duration_nanos,
    })
}

pub struct SpanCollector {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
    backlog_logger: RateLimitedLogger,
}

impl SpanCollector {
    /// Spawns the consumer task. Must be called from within a tokio runtime.
    pub fn start(collector: Arc<dyn Collector>) -> Self {
        let (tx, rx) = mpsc::channel(SPAN_PENDING_LIMIT);
        let consumer = tokio::spawn(consume_spans(collector, rx));
        Self {
            tx: Mutex::new(Some(tx)),
            consumer: Mutex::new(Some(consumer)),
            dropped: AtomicU64::new(0),
            backlog_logger: RateLimitedLogger::new("span backlog"),
        }
    }

    /// Queues a raw EUM query string. Returns whether it was accepted.
    pub fn collect_eum_span_from_query_string(&self, query_string: &str) -> bool {
        #[allow(clippy::expect_used)]
        let sender = self.tx.lock().expect("lock poisoned").clone();
        let Some(sender) = sender else {
            debug!("Span collector closed, discarding span");
            return false;
        };
        match sender.try_send(query_string.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.backlog_logger.warn(format_args!(
                    "Not sending a span because of an excessive backlog of {SPAN_PENDING_LIMIT} spans already waiting to be sent"
                ));
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Span consumer stopped, discarding span");
                false
            }
        }
    }

    #[must_use]
    pub fn dropped_span_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops accepting spans and waits for queued ones to be delivered.
    ///
    /// # Errors
    ///
    /// [`AggregatorError::ShutdownTimeout`] if delivery does not finish within
    /// [`SHUTDOWN_TIMEOUT`], [`AggregatorError::Closed`] on a second call.
    pub async fn close(&self) -> Result<(), AggregatorError> {
        #[allow(clippy::expect_used)]
        let sender = self.tx.lock().expect("lock poisoned").take();
        if sender.is_none() {
            return Err(AggregatorError::Closed);
        }
        drop(sender);
        #[allow(clippy::expect_used)]
        let consumer = self.consumer.lock().expect("lock poisoned").take();
        let Some(consumer) = consumer else {
            return Ok(());
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, consumer).await {
            Ok(result) => result.map_err(AggregatorError::from),
            Err(_) => Err(AggregatorError::ShutdownTimeout {
                executor: "span",
                timeout: SHUTDOWN_TIMEOUT,
            }),
        }
    }
}

async fn consume_spans(collector: Arc<dyn Collector>, mut rx: mpsc::Receiver<String>) {
    while let Some(query_string) = rx.recv().await {
        let span = match parse_eum_span(&query_string) {
            Ok(span) => span,
            Err(e) => {
                warn!("Discarding eum span: {e}");
                continue;
            }
        };
        if let Err(e) = collector.collect_spans(vec![span]).await {
            error!("Failed to collect eum span: {e}");
        }
    }
}
