// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Transaction Agent Core
//!
//! In-process core of an always-on profiling agent: it models each unit of
//! work (a [`transaction::Transaction`]) as a tree of timers and trace
//! entries spread over one or more threads, and folds completed transactions
//! into fixed-width time intervals of aggregates that are handed to an
//! external [`collector::Collector`].
//!
//! ## Architecture
//!
//! - [`transaction_service`] and [`thread_context`]: the per-call hot path,
//!   run on application threads
//! - [`transaction_registry`]: transactions that are still in flight
//! - [`aggregator`]: completion queue, interval rollover and flushing
//! - [`interval_collector`] and [`aggregate_collector`]: per-interval and
//!   per-name aggregation
//! - [`span_collector`]: end-user-monitoring spans
//! - [`advice`]: extension points called by instrumented methods
//!
//! Everything that must not stall the host application (aggregation,
//! flushing, span delivery) runs on tokio tasks behind bounded queues that
//! drop work instead of growing.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::module_name_repetitions)]

/// Instrumentation extension points
pub mod advice;

/// Folding transactions of one name or type into an aggregate
pub mod aggregate_collector;

/// Completion queue, interval rollover and aggregate flushing
pub mod aggregator;

/// Wall clock and monotonic ticker abstractions
pub mod clock;

/// Sink contract for aggregates and spans
pub mod collector;

/// Runtime configuration and change listeners
pub mod config;

pub mod constants;

pub mod errors;

/// Aggregates of one interval, keyed by transaction type and name
pub mod interval_collector;

/// Summaries served to live readers
pub mod live;

/// Logging setup and formatting
pub mod logger;

/// Aggregation data model
pub mod model;

pub mod rate_limited;

/// End-user-monitoring span forwarding
pub mod span_collector;

pub mod thread_context;

pub mod transaction;

pub mod transaction_registry;

pub mod transaction_service;
