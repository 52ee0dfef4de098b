// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Back pressure on transaction collection.
pub const TRANSACTION_PENDING_LIMIT: usize = 1000;

/// Back pressure on aggregate flushing.
pub const AGGREGATE_PENDING_LIMIT: usize = 5;

/// Back pressure on span delivery to the collector sink.
pub const SPAN_PENDING_LIMIT: usize = 60;

/// Bound on each executor's termination during shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on how long the processing task parks while the queue is empty.
pub const MAX_IDLE_WAIT: Duration = Duration::from_millis(10);

pub const LIMIT_EXCEEDED_BUCKET: &str = "LIMIT EXCEEDED BUCKET";

/// Name of the root timer of every auxiliary thread context.
pub const AUXILIARY_THREAD_TIMER_NAME: &str = "auxiliary thread";

// the overall aggregate sees every transaction of a type, so it is allowed to keep far more
// distinct entries than a single transaction name while still accumulating
pub const OVERALL_AGGREGATE_QUERIES_HARD_LIMIT_MULTIPLIER: usize = 10;
pub const TRANSACTION_AGGREGATE_QUERIES_HARD_LIMIT_MULTIPLIER: usize = 2;
pub const OVERALL_AGGREGATE_SERVICE_CALLS_HARD_LIMIT_MULTIPLIER: usize = 10;
pub const TRANSACTION_AGGREGATE_SERVICE_CALLS_HARD_LIMIT_MULTIPLIER: usize = 2;

/// Per-transaction bound on distinct query texts, before folding into limit-exceeded buckets.
pub const TRANSACTION_QUERIES_HARD_LIMIT_MULTIPLIER: usize = 2;

pub const NANOSECONDS_PER_MILLISECOND: f64 = 1_000_000.0;
