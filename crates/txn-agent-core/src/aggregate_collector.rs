// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Accumulates completed transactions of one bucket (overall or one
//! transaction name) within one interval. Pure accumulation, no I/O.

use crate::live::{
    OverallErrorSummaryCollector, OverallSummaryCollector, OverviewAggregate,
    PercentileAggregate, ThroughputAggregate, TransactionNameErrorSummaryCollector,
    TransactionNameSummaryCollector,
};
use crate::model::aggregate::Aggregate;
use crate::model::aggregate_timer::RootTimerCollector;
use crate::model::histogram::LazyHistogram;
use crate::model::profile::Profile;
use crate::model::thread_stats::ThreadStatsCollector;
use crate::model::top_n::{QueryCollector, ServiceCallCollector};
use crate::transaction::Transaction;

/// Bounds for the top-N collectors of one aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopNLimits {
    pub max_query_aggregates: usize,
    pub query_hard_limit_multiplier: usize,
    pub max_service_call_aggregates: usize,
    pub service_call_hard_limit_multiplier: usize,
}

#[derive(Debug, Clone)]
pub struct AggregateCollector {
    limits: TopNLimits,
    // f64 so sums over unboundedly many transactions cannot overflow
    total_duration_nanos: f64,
    transaction_count: u64,
    error_count: u64,
    async_transactions: bool,
    main_thread_root_timers: RootTimerCollector,
    aux_thread_root_timers: RootTimerCollector,
    async_timers: RootTimerCollector,
    main_thread_stats: ThreadStatsCollector,
    aux_thread_stats: ThreadStatsCollector,
    duration_nanos_histogram: LazyHistogram,
    // lazy: stay None until a transaction actually contributes
    queries: Option<QueryCollector>,
    service_calls: Option<ServiceCallCollector>,
    main_thread_profile: Option<Profile>,
    aux_thread_profile: Option<Profile>,
}

impl AggregateCollector {
    #[must_use]
    pub fn new(limits: TopNLimits) -> Self {
        Self {
            limits,
            total_duration_nanos: 0.0,
            transaction_count: 0,
            error_count: 0,
            async_transactions: false,
            main_thread_root_timers: RootTimerCollector::default(),
            aux_thread_root_timers: RootTimerCollector::default(),
            async_timers: RootTimerCollector::default(),
            main_thread_stats: ThreadStatsCollector::default(),
            aux_thread_stats: ThreadStatsCollector::default(),
            duration_nanos_histogram: LazyHistogram::default(),
            queries: None,
            service_calls: None,
            main_thread_profile: None,
            aux_thread_profile: None,
        }
    }

    #[must_use]
    pub fn transaction_count(&self) -> u64 {
        self.transaction_count
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn add(&mut self, transaction: &Transaction) {
        let duration_nanos = transaction.duration_nanos();
        self.total_duration_nanos += duration_nanos as f64;
        self.transaction_count += 1;
        if transaction.error().is_some() {
            self.error_count += 1;
        }
        if transaction.is_async() {
            self.async_transactions = true;
        }
        self.duration_nanos_histogram.add(duration_nanos);

        {
            let contexts = transaction.lock_contexts();
            if let Some(main) = &contexts.main {
                self.main_thread_root_timers
                    .merge_root_timer(&main.root_timer);
                self.main_thread_stats.merge(main.thread_stats.as_ref());
                self.merge_calls(&main.queries, &main.service_calls);
            }
            for aux in &contexts.aux {
                self.aux_thread_root_timers.merge_root_timer(&aux.root_timer);
                self.aux_thread_stats.merge(aux.thread_stats.as_ref());
                self.merge_calls(&aux.queries, &aux.service_calls);
            }
        }
        for timer in transaction.async_timer_snapshots() {
            self.async_timers.merge_root_timer(&timer);
        }

        let profiles = transaction.lock_profiles();
        if !profiles.main.is_empty() {
            self.main_thread_profile
                .get_or_insert_with(Profile::default)
                .merge(&profiles.main);
        }
        if !profiles.aux.is_empty() {
            self.aux_thread_profile
                .get_or_insert_with(Profile::default)
                .merge(&profiles.aux);
        }
    }

    fn merge_calls(&mut self, queries: &QueryCollector, service_calls: &ServiceCallCollector) {
        let limits = self.limits;
        if !queries.is_empty() {
            queries.merge_into(self.queries.get_or_insert_with(|| {
                QueryCollector::new(
                    limits.max_query_aggregates,
                    limits.query_hard_limit_multiplier,
                )
            }));
        }
        if !service_calls.is_empty() {
            service_calls.merge_into(self.service_calls.get_or_insert_with(|| {
                ServiceCallCollector::new(
                    limits.max_service_call_aggregates,
                    limits.service_call_hard_limit_multiplier,
                )
            }));
        }
    }

    #[must_use]
    pub fn build(&self) -> Aggregate {
        Aggregate {
            total_duration_nanos: self.total_duration_nanos,
            transaction_count: self.transaction_count,
            error_count: self.error_count,
            async_transactions: self.async_transactions,
            main_thread_root_timers: self.main_thread_root_timers.build(),
            aux_thread_root_timers: self.aux_thread_root_timers.build(),
            async_timers: self.async_timers.build(),
            main_thread_stats: self.main_thread_stats.build(),
            aux_thread_stats: self.aux_thread_stats.build(),
            duration_nanos_histogram: self.duration_nanos_histogram.build(),
            queries: self.queries.as_ref().map(QueryCollector::build),
            service_calls: self.service_calls.as_ref().map(ServiceCallCollector::build),
            main_thread_profile: self.main_thread_profile.clone(),
            aux_thread_profile: self.aux_thread_profile.clone(),
        }
    }

    #[must_use]
    pub fn get_overview_aggregate(&self, capture_time: i64) -> OverviewAggregate {
        OverviewAggregate {
            capture_time,
            total_duration_nanos: self.total_duration_nanos,
            transaction_count: self.transaction_count,
            error_count: self.error_count,
            async_transactions: self.async_transactions,
            main_thread_root_timers: self.main_thread_root_timers.build(),
            aux_thread_root_timers: self.aux_thread_root_timers.build(),
            async_timers: self.async_timers.build(),
            main_thread_stats: self.main_thread_stats.build(),
            aux_thread_stats: self.aux_thread_stats.build(),
        }
    }

    #[must_use]
    pub fn get_percentile_aggregate(&self, capture_time: i64) -> PercentileAggregate {
        PercentileAggregate {
            capture_time,
            total_duration_nanos: self.total_duration_nanos,
            transaction_count: self.transaction_count,
            duration_nanos_histogram: self.duration_nanos_histogram.build(),
        }
    }

    #[must_use]
    pub fn get_throughput_aggregate(&self, capture_time: i64) -> ThroughputAggregate {
        ThroughputAggregate {
            capture_time,
            transaction_count: self.transaction_count,
            error_count: self.error_count,
        }
    }

    pub fn merge_overall_summary_into(
        &self,
        collector: &mut OverallSummaryCollector,
        capture_time: i64,
    ) {
        collector.merge_summary(
            self.total_duration_nanos,
            self.transaction_count,
            capture_time,
        );
    }

    pub fn merge_transaction_summary_into(
        &self,
        transaction_name: &str,
        collector: &mut TransactionNameSummaryCollector,
        capture_time: i64,
    ) {
        collector.collect(
            transaction_name,
            self.total_duration_nanos,
            self.transaction_count,
            capture_time,
        );
    }

    pub fn merge_overall_error_summary_into(
        &self,
        collector: &mut OverallErrorSummaryCollector,
        capture_time: i64,
    ) {
        collector.merge_error_summary(self.error_count, self.transaction_count, capture_time);
    }

    pub fn merge_transaction_error_summary_into(
        &self,
        transaction_name: &str,
        collector: &mut TransactionNameErrorSummaryCollector,
        capture_time: i64,
    ) {
        collector.collect(
            transaction_name,
            self.error_count,
            self.transaction_count,
            capture_time,
        );
    }

    pub fn merge_queries_into(&self, collector: &mut QueryCollector) {
        if let Some(queries) = &self.queries {
            queries.merge_into(collector);
        }
    }

    pub fn merge_service_calls_into(&self, collector: &mut ServiceCallCollector) {
        if let Some(service_calls) = &self.service_calls {
            service_calls.merge_into(collector);
        }
    }

    pub fn merge_main_thread_profile_into(&self, profile: &mut Profile) {
        if let Some(main) = &self.main_thread_profile {
            profile.merge(main);
        }
    }

    pub fn merge_aux_thread_profile_into(&self, profile: &mut Profile) {
        if let Some(aux) = &self.aux_thread_profile {
            profile.merge(aux);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, ManualTicker};
    use crate::config::{AdvancedConfig, ConfigService};
    use crate::model::timer::TimerName;
    use crate::model::trace_entry::{ErrorMessage, MessageSupplier};
    use crate::transaction::CompletionCallback;
    use crate::transaction_registry::TransactionRegistry;
    use crate::transaction_service::TransactionService;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Completed(Mutex<Vec<Arc<Transaction>>>);

    impl CompletionCallback for Completed {
        fn completed(&self, transaction: Arc<Transaction>) {
            self.0.lock().expect("lock").push(transaction);
        }
    }

    fn limits() -> TopNLimits {
        TopNLimits {
            max_query_aggregates: 10,
            query_hard_limit_multiplier: 2,
            max_service_call_aggregates: 10,
            service_call_hard_limit_multiplier: 2,
        }
    }

    struct Fixture {
        service: TransactionService,
        ticker: Arc<ManualTicker>,
        completed: Arc<Completed>,
    }

    fn fixture() -> Fixture {
        let config = ConfigService::new(AdvancedConfig {
            capture_thread_stats: false,
            ..AdvancedConfig::default()
        });
        let ticker = Arc::new(ManualTicker::new(0));
        let completed = Arc::new(Completed::default());
        Fixture {
            service: TransactionService::new(
                &config,
                Arc::new(TransactionRegistry::new()),
                completed.clone(),
                Arc::new(ManualClock::new(0)),
                ticker.clone(),
            ),
            ticker,
            completed,
        }
    }

    impl Fixture {
        fn last_completed(&self) -> Arc<Transaction> {
            let completed = self.completed.0.lock().expect("lock");
            Arc::clone(completed.last().expect("a completed transaction"))
        }
    }

    #[test]
    fn test_overview_of_single_transaction() {
        let fixture = fixture();
        let mut context = fixture.service.start_transaction(
            "Web",
            "/orders",
            MessageSupplier::from_text("GET /orders"),
            TimerName::new("http request"),
        );
        let sql = context.start_timer(TimerName::new("sql"));
        fixture.ticker.advance(4_000_000);
        context.stop_timer(sql);
        fixture.ticker.advance(6_000_000);
        context.end();

        let mut collector = AggregateCollector::new(limits());
        collector.add(&fixture.last_completed());
        let overview = collector.get_overview_aggregate(60_000);
        assert_eq!(overview.total_duration_nanos, 1e7);
        assert_eq!(overview.transaction_count, 1);
        assert_eq!(overview.error_count, 0);
        let root = &overview.main_thread_root_timers[0];
        assert_eq!(root.name, "http request");
        assert_eq!(root.child_timers[0].name, "sql");
        assert_eq!(root.child_timers[0].count, 1);
        // capture disabled, so every stat is unavailable rather than zero
        let stats = overview.main_thread_stats.expect("stats merged");
        assert_eq!(stats.total_cpu_nanos, None);
    }

    #[test]
    fn test_lazy_fields_stay_absent() {
        let fixture = fixture();
        let context = fixture.service.start_transaction(
            "Web",
            "/",
            MessageSupplier::from_text("GET /"),
            TimerName::new("http request"),
        );
        context.end();

        let mut collector = AggregateCollector::new(limits());
        collector.add(&fixture.last_completed());
        let aggregate = collector.build();
        assert!(aggregate.queries.is_none());
        assert!(aggregate.service_calls.is_none());
        assert!(aggregate.main_thread_profile.is_none());
        assert!(aggregate.aux_thread_profile.is_none());

        let json = serde_json::to_value(&aggregate).expect("serializable");
        assert!(json.get("queries").is_none());
        assert!(json.get("mainThreadProfile").is_none());
        assert_eq!(json["transactionCount"], 1);
    }

    #[test]
    fn test_nested_wire_fields_are_camel_case() {
        let fixture = fixture();
        let mut context = fixture.service.start_transaction(
            "Web",
            "/",
            MessageSupplier::from_text("GET /"),
            TimerName::new("http request"),
        );
        let query = context.start_query_entry(
            "SQL",
            "select 1",
            MessageSupplier::from_text("select 1"),
            TimerName::new("jdbc query"),
        );
        fixture.ticker.advance(100);
        context.end_trace_entry(query);
        assert!(context
            .transaction()
            .add_stack_trace(&["work", "main"], false));
        context.end();

        let mut collector = AggregateCollector::new(limits());
        collector.add(&fixture.last_completed());
        let json = serde_json::to_value(collector.build()).expect("serializable");
        assert_eq!(json["queries"][0]["executionCount"], 1);
        assert!(json["queries"][0].get("totalDurationNanos").is_some());
        assert!(json["mainThreadRootTimers"][0].get("totalNanos").is_some());
        assert!(json["mainThreadRootTimers"][0].get("childTimers").is_some());
        assert_eq!(json["mainThreadProfile"]["sampleCount"], 1);
        assert_eq!(json["mainThreadProfile"]["rootNodes"][0]["sampleCount"], 1);
        assert!(json["durationNanosHistogram"]
            .get("orderedRawValues")
            .is_some());
    }

    #[test]
    fn test_queries_profiles_and_errors() {
        let fixture = fixture();
        let mut context = fixture.service.start_transaction(
            "Web",
            "/",
            MessageSupplier::from_text("GET /"),
            TimerName::new("http request"),
        );
        let query = context.start_query_entry(
            "SQL",
            "select 1",
            MessageSupplier::from_text("select 1"),
            TimerName::new("jdbc query"),
        );
        fixture.ticker.advance(100);
        context.end_trace_entry(query);
        assert!(context
            .transaction()
            .add_stack_trace(&["work", "main"], false));
        context.end_with_error(ErrorMessage::from_message("failed"));

        let mut collector = AggregateCollector::new(limits());
        collector.add(&fixture.last_completed());
        let aggregate = collector.build();
        assert_eq!(aggregate.error_count, 1);
        let queries = aggregate.queries.expect("queries present");
        assert_eq!(queries[0].text, "select 1");
        assert_eq!(queries[0].stats.execution_count, 1);
        assert_eq!(
            aggregate.main_thread_profile.expect("profile").sample_count,
            1
        );
        assert!(aggregate.aux_thread_profile.is_none());

        let mut merged = QueryCollector::new(10, 1);
        collector.merge_queries_into(&mut merged);
        assert_eq!(merged.build().len(), 1);
    }

    #[test]
    fn test_aux_thread_timers_merge_under_one_root() {
        let fixture = fixture();
        let context = fixture.service.start_transaction(
            "Background",
            "job",
            MessageSupplier::from_text("job"),
            TimerName::new("job"),
        );
        for _ in 0..3 {
            let token = context.create_aux_thread_context();
            std::thread::spawn(move || token.start().end())
                .join()
                .expect("aux thread");
        }
        context.end();

        let mut collector = AggregateCollector::new(limits());
        collector.add(&fixture.last_completed());
        let aggregate = collector.build();
        assert_eq!(aggregate.aux_thread_root_timers.len(), 1);
        assert_eq!(aggregate.aux_thread_root_timers[0].count, 3);
        assert!(aggregate.aux_thread_stats.is_some());
    }

    #[test]
    fn test_summaries() {
        let fixture = fixture();
        let mut collector = AggregateCollector::new(limits());
        for _ in 0..2 {
            let context = fixture.service.start_transaction(
                "Web",
                "/",
                MessageSupplier::from_text("GET /"),
                TimerName::new("http request"),
            );
            fixture.ticker.advance(50);
            context.end();
            collector.add(&fixture.last_completed());
        }
        let mut overall = OverallSummaryCollector::default();
        collector.merge_overall_summary_into(&mut overall, 60_000);
        assert_eq!(overall.summary().transaction_count, 2);
        assert_eq!(overall.summary().total_duration_nanos, 100.0);
        assert_eq!(overall.last_capture_time(), 60_000);

        let throughput = collector.get_throughput_aggregate(60_000);
        assert_eq!(throughput.transaction_count, 2);
        let percentile = collector.get_percentile_aggregate(60_000);
        assert_eq!(percentile.value_at_percentile(99.0), Some(50));
    }
}
