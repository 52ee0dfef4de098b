// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! All aggregate collectors of one interval.
//!
//! Only the processing task writes to an interval collector; the mutex is
//! there for live readers and for the flusher building the final aggregates.

use fnv::FnvHashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::aggregate_collector::{AggregateCollector, TopNLimits};
use crate::collector::{AggregateReader, TypeAggregates};
use crate::config::AdvancedConfig;
use crate::constants::{
    LIMIT_EXCEEDED_BUCKET, OVERALL_AGGREGATE_QUERIES_HARD_LIMIT_MULTIPLIER,
    OVERALL_AGGREGATE_SERVICE_CALLS_HARD_LIMIT_MULTIPLIER,
    TRANSACTION_AGGREGATE_QUERIES_HARD_LIMIT_MULTIPLIER,
    TRANSACTION_AGGREGATE_SERVICE_CALLS_HARD_LIMIT_MULTIPLIER,
};
use crate::live::{
    OverallErrorSummaryCollector, OverallSummaryCollector, OverviewAggregate,
    PercentileAggregate, ThroughputAggregate, TransactionNameErrorSummaryCollector,
    TransactionNameSummaryCollector,
};
use crate::model::profile::Profile;
use crate::model::top_n::{QueryCollector, ServiceCallCollector};
use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalLimits {
    pub max_transaction_aggregates: usize,
    pub max_query_aggregates: usize,
    pub max_service_call_aggregates: usize,
}

impl IntervalLimits {
    #[must_use]
    pub fn from_config(config: &AdvancedConfig) -> Self {
        Self {
            max_transaction_aggregates: config.max_transaction_aggregates,
            max_query_aggregates: config.max_query_aggregates,
            max_service_call_aggregates: config.max_service_call_aggregates,
        }
    }

    fn overall(&self) -> TopNLimits {
        TopNLimits {
            max_query_aggregates: self.max_query_aggregates,
            query_hard_limit_multiplier: OVERALL_AGGREGATE_QUERIES_HARD_LIMIT_MULTIPLIER,
            max_service_call_aggregates: self.max_service_call_aggregates,
            service_call_hard_limit_multiplier:
                OVERALL_AGGREGATE_SERVICE_CALLS_HARD_LIMIT_MULTIPLIER,
        }
    }

    fn transaction(&self) -> TopNLimits {
        TopNLimits {
            max_query_aggregates: self.max_query_aggregates,
            query_hard_limit_multiplier: TRANSACTION_AGGREGATE_QUERIES_HARD_LIMIT_MULTIPLIER,
            max_service_call_aggregates: self.max_service_call_aggregates,
            service_call_hard_limit_multiplier:
                TRANSACTION_AGGREGATE_SERVICE_CALLS_HARD_LIMIT_MULTIPLIER,
        }
    }
}

#[derive(Debug)]
struct TypeCollector {
    overall: AggregateCollector,
    transactions: FnvHashMap<String, AggregateCollector>,
}

#[derive(Debug)]
pub struct AggregateIntervalCollector {
    capture_time: i64,
    limits: IntervalLimits,
    types: Mutex<FnvHashMap<String, TypeCollector>>,
}

impl AggregateIntervalCollector {
    #[must_use]
    pub fn new(capture_time: i64, limits: IntervalLimits) -> Self {
        Self {
            capture_time,
            limits,
            types: Mutex::new(FnvHashMap::default()),
        }
    }

    /// End of the interval, inclusive. Identifies the interval.
    #[must_use]
    pub fn capture_time(&self) -> i64 {
        self.capture_time
    }

    fn lock(&self) -> MutexGuard<'_, FnvHashMap<String, TypeCollector>> {
        // a panic while folding one transaction must not take the interval down with it
        self.types.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn add(&self, transaction: &Transaction) {
        let limits = self.limits;
        let transaction_name = transaction.transaction_name();
        let mut types = self.lock();
        let type_collector = types
            .entry(transaction.transaction_type().to_string())
            .or_insert_with(|| TypeCollector {
                overall: AggregateCollector::new(limits.overall()),
                transactions: FnvHashMap::default(),
            });
        type_collector.overall.add(transaction);
        let key = if type_collector.transactions.contains_key(&transaction_name)
            || type_collector.transactions.len() < limits.max_transaction_aggregates
        {
            transaction_name
        } else {
            LIMIT_EXCEEDED_BUCKET.to_string()
        };
        type_collector
            .transactions
            .entry(key)
            .or_insert_with(|| AggregateCollector::new(limits.transaction()))
            .add(transaction);
    }

    /// Builds every aggregate. The collector itself is left untouched.
    #[must_use]
    pub fn build_reader(&self) -> AggregateReader {
        let types = self.lock();
        let mut built: Vec<TypeAggregates> = types
            .iter()
            .map(|(transaction_type, collector)| {
                let mut transactions: Vec<(String, _)> = collector
                    .transactions
                    .iter()
                    .map(|(name, c)| (name.clone(), c.build()))
                    .collect();
                transactions.sort_by(|left, right| left.0.cmp(&right.0));
                TypeAggregates {
                    transaction_type: transaction_type.clone(),
                    overall: collector.overall.build(),
                    transactions,
                }
            })
            .collect();
        built.sort_by(|left, right| left.transaction_type.cmp(&right.transaction_type));
        AggregateReader::new(self.capture_time, built)
    }

    fn with_collector<R>(
        &self,
        transaction_type: &str,
        transaction_name: Option<&str>,
        f: impl FnOnce(&AggregateCollector) -> R,
    ) -> Option<R> {
        let types = self.lock();
        let type_collector = types.get(transaction_type)?;
        let collector = match transaction_name {
            None => &type_collector.overall,
            Some(name) => type_collector.transactions.get(name)?,
        };
        Some(f(collector))
    }

    /// `transaction_name` of `None` selects the overall aggregate.
    #[must_use]
    pub fn get_overview_aggregate(
        &self,
        transaction_type: &str,
        transaction_name: Option<&str>,
    ) -> Option<OverviewAggregate> {
        self.with_collector(transaction_type, transaction_name, |c| {
            c.get_overview_aggregate(self.capture_time)
        })
    }

    #[must_use]
    pub fn get_percentile_aggregate(
        &self,
        transaction_type: &str,
        transaction_name: Option<&str>,
    ) -> Option<PercentileAggregate> {
        self.with_collector(transaction_type, transaction_name, |c| {
            c.get_percentile_aggregate(self.capture_time)
        })
    }

    #[must_use]
    pub fn get_throughput_aggregate(
        &self,
        transaction_type: &str,
        transaction_name: Option<&str>,
    ) -> Option<ThroughputAggregate> {
        self.with_collector(transaction_type, transaction_name, |c| {
            c.get_throughput_aggregate(self.capture_time)
        })
    }

    pub fn merge_overall_summary_into(
        &self,
        transaction_type: &str,
        collector: &mut OverallSummaryCollector,
    ) {
        self.with_collector(transaction_type, None, |c| {
            c.merge_overall_summary_into(collector, self.capture_time);
        });
    }

    pub fn merge_transaction_summaries_into(
        &self,
        transaction_type: &str,
        collector: &mut TransactionNameSummaryCollector,
    ) {
        let types = self.lock();
        if let Some(type_collector) = types.get(transaction_type) {
            for (name, c) in &type_collector.transactions {
                c.merge_transaction_summary_into(name, collector, self.capture_time);
            }
        }
    }

    pub fn merge_overall_error_summary_into(
        &self,
        transaction_type: &str,
        collector: &mut OverallErrorSummaryCollector,
    ) {
        self.with_collector(transaction_type, None, |c| {
            c.merge_overall_error_summary_into(collector, self.capture_time);
        });
    }

    pub fn merge_transaction_error_summaries_into(
        &self,
        transaction_type: &str,
        collector: &mut TransactionNameErrorSummaryCollector,
    ) {
        let types = self.lock();
        if let Some(type_collector) = types.get(transaction_type) {
            for (name, c) in &type_collector.transactions {
                c.merge_transaction_error_summary_into(name, collector, self.capture_time);
            }
        }
    }

    pub fn merge_queries_into(
        &self,
        transaction_type: &str,
        transaction_name: Option<&str>,
        collector: &mut QueryCollector,
    ) {
        self.with_collector(transaction_type, transaction_name, |c| {
            c.merge_queries_into(collector);
        });
    }

    pub fn merge_service_calls_into(
        &self,
        transaction_type: &str,
        transaction_name: Option<&str>,
        collector: &mut ServiceCallCollector,
    ) {
        self.with_collector(transaction_type, transaction_name, |c| {
            c.merge_service_calls_into(collector);
        });
    }

    pub fn merge_main_thread_profile_into(
        &self,
        transaction_type: &str,
        transaction_name: Option<&str>,
        profile: &mut Profile,
    ) {
        self.with_collector(transaction_type, transaction_name, |c| {
            c.merge_main_thread_profile_into(profile);
        });
    }

    pub fn merge_aux_thread_profile_into(
        &self,
        transaction_type: &str,
        transaction_name: Option<&str>,
        profile: &mut Profile,
    ) {
        self.with_collector(transaction_type, transaction_name, |c| {
            c.merge_aux_thread_profile_into(profile);
        });
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
