// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the agent core.

use std::time::Duration;

/// Errors produced while reading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Aggregate interval must be greater than zero")]
    ZeroInterval,
}

/// Errors surfaced by the aggregation pipeline lifecycle.
///
/// Nothing in here ever reaches instrumented application code; these are only
/// returned to whoever owns the [`crate::aggregator::Aggregator`].
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    /// A background executor did not terminate in time. The agent's own
    /// machinery is stuck, so callers should treat this as unrecoverable.
    #[error("Could not terminate {executor} executor within {timeout:?}")]
    ShutdownTimeout {
        executor: &'static str,
        timeout: Duration,
    },

    #[error("Aggregator is already closed")]
    Closed,

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Errors returned by a collector sink.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Sink rejected payload: {0}")]
    Sink(String),

    #[error("Failed to encode payload: {0}")]
    Encode(String),
}

/// Errors raised while decoding an end-user-monitoring span.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SpanCollectorError {
    #[error("missing trace-id in eum query string: {0}")]
    MissingTraceId(String),

    #[error("missing duration-millis in eum query string: {0}")]
    MissingDuration(String),

    #[error("invalid duration-millis in eum query string: {0}")]
    InvalidDuration(String),
}
