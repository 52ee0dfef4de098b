// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read-side views over in-memory interval collectors.
//!
//! These are what a UI or API layer reads for intervals that have not been
//! flushed yet. Each `get_*` view covers one interval; the summary
//! collectors accumulate across many intervals.

use fnv::FnvHashMap;
use serde::Serialize;
use std::cmp::Ordering;

use crate::model::aggregate_timer::AggregateTimer;
use crate::model::histogram::{AggregateHistogram, LazyHistogram};
use crate::model::thread_stats::AggregateThreadStats;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewAggregate {
    pub capture_time: i64,
    pub total_duration_nanos: f64,
    pub transaction_count: u64,
    pub error_count: u64,
    pub async_transactions: bool,
    pub main_thread_root_timers: Vec<AggregateTimer>,
    pub aux_thread_root_timers: Vec<AggregateTimer>,
    pub async_timers: Vec<AggregateTimer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_thread_stats: Option<AggregateThreadStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux_thread_stats: Option<AggregateThreadStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileAggregate {
    pub capture_time: i64,
    pub total_duration_nanos: f64,
    pub transaction_count: u64,
    pub duration_nanos_histogram: AggregateHistogram,
}

impl PercentileAggregate {
    /// Duration at `percentile` (0.0 ..= 100.0), `None` if no transaction
    /// was recorded.
    #[must_use]
    pub fn value_at_percentile(&self, percentile: f64) -> Option<u64> {
        let mut histogram = LazyHistogram::default();
        histogram.merge_built(&self.duration_nanos_histogram);
        histogram.value_at_percentile(percentile)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputAggregate {
    pub capture_time: i64,
    pub transaction_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallSummary {
    pub total_duration_nanos: f64,
    pub transaction_count: u64,
}

/// Sums the overall summary over intervals. `last_capture_time` tells a
/// caller merging flushed data where the in-memory part begins.
#[derive(Debug, Clone, Default)]
pub struct OverallSummaryCollector {
    summary: OverallSummary,
    last_capture_time: i64,
}

impl OverallSummaryCollector {
    pub fn merge_summary(
        &mut self,
        total_duration_nanos: f64,
        transaction_count: u64,
        capture_time: i64,
    ) {
        self.summary.total_duration_nanos += total_duration_nanos;
        self.summary.transaction_count += transaction_count;
        self.last_capture_time = self.last_capture_time.max(capture_time);
    }

    #[must_use]
    pub fn summary(&self) -> OverallSummary {
        self.summary
    }

    #[must_use]
    pub fn last_capture_time(&self) -> i64 {
        self.last_capture_time
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionNameSummary {
    pub transaction_name: String,
    pub total_duration_nanos: f64,
    pub transaction_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarySortOrder {
    TotalTime,
    AverageTime,
    Throughput,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionNameSummaryCollector {
    summaries: FnvHashMap<String, OverallSummary>,
    last_capture_time: i64,
}

impl TransactionNameSummaryCollector {
    pub fn collect(
        &mut self,
        transaction_name: &str,
        total_duration_nanos: f64,
        transaction_count: u64,
        capture_time: i64,
    ) {
        let summary = self
            .summaries
            .entry(transaction_name.to_string())
            .or_default();
        summary.total_duration_nanos += total_duration_nanos;
        summary.transaction_count += transaction_count;
        self.last_capture_time = self.last_capture_time.max(capture_time);
    }

    #[must_use]
    pub fn last_capture_time(&self) -> i64 {
        self.last_capture_time
    }

    /// At most `limit` summaries in `order`, heaviest first.
    #[must_use]
    pub fn result(&self, order: SummarySortOrder, limit: usize) -> Vec<TransactionNameSummary> {
        let mut summaries: Vec<TransactionNameSummary> = self
            .summaries
            .iter()
            .map(|(name, summary)| TransactionNameSummary {
                transaction_name: name.clone(),
                total_duration_nanos: summary.total_duration_nanos,
                transaction_count: summary.transaction_count,
            })
            .collect();
        summaries.sort_by(|left, right| {
            sort_key(right, order)
                .partial_cmp(&sort_key(left, order))
                .unwrap_or(Ordering::Equal)
                .then_with(|| left.transaction_name.cmp(&right.transaction_name))
        });
        summaries.truncate(limit);
        summaries
    }
}

#[allow(clippy::cast_precision_loss)]
fn sort_key(summary: &TransactionNameSummary, order: SummarySortOrder) -> f64 {
    match order {
        SummarySortOrder::TotalTime => summary.total_duration_nanos,
        SummarySortOrder::AverageTime if summary.transaction_count == 0 => 0.0,
        SummarySortOrder::AverageTime => {
            summary.total_duration_nanos / summary.transaction_count as f64
        }
        SummarySortOrder::Throughput => summary.transaction_count as f64,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub error_count: u64,
    pub transaction_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct OverallErrorSummaryCollector {
    summary: ErrorSummary,
    last_capture_time: i64,
}

impl OverallErrorSummaryCollector {
    pub fn merge_error_summary(
        &mut self,
        error_count: u64,
        transaction_count: u64,
        capture_time: i64,
    ) {
        self.summary.error_count += error_count;
        self.summary.transaction_count += transaction_count;
        self.last_capture_time = self.last_capture_time.max(capture_time);
    }

    #[must_use]
    pub fn summary(&self) -> ErrorSummary {
        self.summary
    }

    #[must_use]
    pub fn last_capture_time(&self) -> i64 {
        self.last_capture_time
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionNameErrorSummary {
    pub transaction_name: String,
    pub error_count: u64,
    pub transaction_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionNameErrorSummaryCollector {
    summaries: FnvHashMap<String, ErrorSummary>,
    last_capture_time: i64,
}

impl TransactionNameErrorSummaryCollector {
    pub fn collect(
        &mut self,
        transaction_name: &str,
        error_count: u64,
        transaction_count: u64,
        capture_time: i64,
    ) {
        let summary = self
            .summaries
            .entry(transaction_name.to_string())
            .or_default();
        summary.error_count += error_count;
        summary.transaction_count += transaction_count;
        self.last_capture_time = self.last_capture_time.max(capture_time);
    }

    #[must_use]
    pub fn last_capture_time(&self) -> i64 {
        self.last_capture_time
    }

    /// Names with at least one error, by error count then error rate.
    #[must_use]
    pub fn result(&self, limit: usize) -> Vec<TransactionNameErrorSummary> {
        let mut summaries: Vec<TransactionNameErrorSummary> = self
            .summaries
            .iter()
            .filter(|(_, summary)| summary.error_count > 0)
            .map(|(name, summary)| TransactionNameErrorSummary {
                transaction_name: name.clone(),
                error_count: summary.error_count,
                transaction_count: summary.transaction_count,
            })
            .collect();
        summaries.sort_by(|left, right| {
            right
                .error_count
                .cmp(&left.error_count)
                .then_with(|| {
                    // fewer transactions for the same error count is a higher error rate
                    left.transaction_count.cmp(&right.transaction_count)
                })
                .then_with(|| left.transaction_name.cmp(&right.transaction_name))
        });
        summaries.truncate(limit);
        summaries
    }
}
