// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded "top N by total time" collectors for queries and service calls.
//!
//! While an interval is still accumulating, up to `limit * hard_limit_multiplier`
//! distinct entries are retained; only [`TopNCollector::build`] truncates to
//! `limit`. Truncating early could evict an entry whose early samples were
//! cheap but which ends up in the top N once the whole interval is seen.
//! Entries beyond the retention bound, and entries cut at build time, are
//! folded into one `LIMIT EXCEEDED BUCKET` row per destination.

use fnv::FnvHashMap;
use serde::Serialize;
use std::cmp::Ordering;

use crate::constants::LIMIT_EXCEEDED_BUCKET;

pub trait CallStats: Default + Clone {
    fn total_duration_nanos(&self) -> f64;
    fn add(&mut self, other: &Self);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    pub total_duration_nanos: f64,
    pub execution_count: u64,
    /// `None` unless at least one execution navigated a result set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub active: bool,
}

impl CallStats for QueryStats {
    fn total_duration_nanos(&self) -> f64 {
        self.total_duration_nanos
    }

    fn add(&mut self, other: &Self) {
        self.total_duration_nanos += other.total_duration_nanos;
        self.execution_count += other.execution_count;
        self.total_rows = match (self.total_rows, other.total_rows) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
        self.active |= other.active;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCallStats {
    pub total_duration_nanos: f64,
    pub execution_count: u64,
}

impl CallStats for ServiceCallStats {
    fn total_duration_nanos(&self) -> f64 {
        self.total_duration_nanos
    }

    fn add(&mut self, other: &Self) {
        self.total_duration_nanos += other.total_duration_nanos;
        self.execution_count += other.execution_count;
    }
}

/// One built row. `dest` identifies the target (e.g. "SQL" or "HTTP").
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopNEntry<S> {
    pub dest: String,
    pub text: String,
    #[serde(flatten)]
    pub stats: S,
}

impl<S> TopNEntry<S> {
    #[must_use]
    pub fn is_limit_exceeded_bucket(&self) -> bool {
        self.text == LIMIT_EXCEEDED_BUCKET
    }
}

pub type AggregateQuery = TopNEntry<QueryStats>;
pub type AggregateServiceCall = TopNEntry<ServiceCallStats>;

#[derive(Debug, Clone)]
pub struct TopNCollector<S> {
    // first key is dest, second key is the query or service call text
    entries: FnvHashMap<String, FnvHashMap<String, S>>,
    limit_exceeded_buckets: FnvHashMap<String, S>,
    limit: usize,
    hard_limit_multiplier: usize,
    entry_count: usize,
}

pub type QueryCollector = TopNCollector<QueryStats>;
pub type ServiceCallCollector = TopNCollector<ServiceCallStats>;

impl<S: CallStats> TopNCollector<S> {
    #[must_use]
    pub fn new(limit: usize, hard_limit_multiplier: usize) -> Self {
        Self {
            entries: FnvHashMap::default(),
            limit_exceeded_buckets: FnvHashMap::default(),
            limit,
            hard_limit_multiplier,
            entry_count: 0,
        }
    }

    pub fn merge(&mut self, dest: &str, text: &str, stats: &S) {
        if text == LIMIT_EXCEEDED_BUCKET {
            self.limit_exceeded_bucket_mut(dest).add(stats);
            return;
        }
        let retain_new = self.entry_count < self.limit.saturating_mul(self.hard_limit_multiplier);
        let for_dest = self.entries.entry(dest.to_string()).or_default();
        if let Some(existing) = for_dest.get_mut(text) {
            existing.add(stats);
            return;
        }
        if retain_new {
            let mut entry = S::default();
            entry.add(stats);
            for_dest.insert(text.to_string(), entry);
            self.entry_count += 1;
        } else {
            self.limit_exceeded_bucket_mut(dest).add(stats);
        }
    }

    fn limit_exceeded_bucket_mut(&mut self, dest: &str) -> &mut S {
        self.limit_exceeded_buckets
            .entry(dest.to_string())
            .or_default()
    }

    pub fn merge_into(&self, collector: &mut TopNCollector<S>) {
        for (dest, for_dest) in &self.entries {
            for (text, stats) in for_dest {
                collector.merge(dest, text, stats);
            }
        }
        for (dest, bucket) in &self.limit_exceeded_buckets {
            collector.limit_exceeded_bucket_mut(dest).add(bucket);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0 && self.limit_exceeded_buckets.is_empty()
    }

    /// Sorted by total duration descending and truncated to `limit`, plus
    /// limit exceeded buckets. The collector itself is left untouched.
    #[must_use]
    pub fn build(&self) -> Vec<TopNEntry<S>> {
        let mut all: Vec<TopNEntry<S>> = self
            .entries
            .iter()
            .flat_map(|(dest, for_dest)| {
                for_dest.iter().map(move |(text, stats)| TopNEntry {
                    dest: dest.clone(),
                    text: text.clone(),
                    stats: stats.clone(),
                })
            })
            .collect();
        sort(&mut all);
        // work on copies so building twice yields the same result
        let mut buckets = self.limit_exceeded_buckets.clone();
        if all.len() > self.limit {
            for exceeded in all.split_off(self.limit) {
                buckets.entry(exceeded.dest).or_default().add(&exceeded.stats);
            }
        }
        all.extend(buckets.into_iter().map(|(dest, stats)| TopNEntry {
            dest,
            text: LIMIT_EXCEEDED_BUCKET.to_string(),
            stats,
        }));
        sort(&mut all);
        all
    }
}

fn sort<S: CallStats>(entries: &mut [TopNEntry<S>]) {
    entries.sort_by(|left, right| {
        right
            .stats
            .total_duration_nanos()
            .partial_cmp(&left.stats.total_duration_nanos())
            .unwrap_or(Ordering::Equal)
    });
}
