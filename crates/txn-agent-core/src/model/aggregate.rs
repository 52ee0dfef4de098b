// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;

use crate::model::aggregate_timer::AggregateTimer;
use crate::model::histogram::AggregateHistogram;
use crate::model::profile::Profile;
use crate::model::thread_stats::AggregateThreadStats;
use crate::model::top_n::{AggregateQuery, AggregateServiceCall};

/// Wire-ready summary of every transaction of one bucket in one interval.
///
/// Lazily collected data is `None` when no transaction contributed to it, so
/// "never measured" and "measured as zero" stay distinguishable downstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub total_duration_nanos: f64,
    pub transaction_count: u64,
    pub error_count: u64,
    pub async_transactions: bool,
    pub main_thread_root_timers: Vec<AggregateTimer>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aux_thread_root_timers: Vec<AggregateTimer>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub async_timers: Vec<AggregateTimer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_thread_stats: Option<AggregateThreadStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux_thread_stats: Option<AggregateThreadStats>,
    pub duration_nanos_histogram: AggregateHistogram,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queries: Option<Vec<AggregateQuery>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_calls: Option<Vec<AggregateServiceCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_thread_profile: Option<Profile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux_thread_profile: Option<Profile>,
}
