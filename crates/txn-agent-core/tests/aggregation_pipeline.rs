// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests of the transaction to aggregate pipeline
//!
//! Each test runs on the current-thread runtime, so background tasks only make
//! progress while the test awaits. Transactions completed between two awaits
//! are therefore queued together.

mod common;

use common::helpers::{wait_until, Pipeline};
use common::mocks::{visit, MockCollector};
use std::sync::Arc;
use tokio::sync::Semaphore;
use txn_agent_core::config::AdvancedConfig;
use txn_agent_core::constants::LIMIT_EXCEEDED_BUCKET;
use txn_agent_core::live::{SummarySortOrder, TransactionNameSummaryCollector};
use txn_agent_core::model::trace_entry::ErrorMessage;
use txn_agent_core::span_collector::SpanCollector;

#[tokio::test]
async fn test_rollover_assigns_intervals_by_capture_time() {
    let collector = MockCollector::new();
    let pipeline = Pipeline::start(collector.clone());

    pipeline.complete_at(50, "/orders", 1_000_000);
    pipeline.complete_at(150, "/orders", 1_000_000);
    pipeline.complete_at(250, "/orders", 1_000_000);

    assert!(wait_until(|| collector.capture_times() == vec![100, 200]).await);
    assert_eq!(
        pipeline.aggregator.active_interval_collector().capture_time(),
        300
    );

    pipeline.aggregator.close().await.expect("close");
    assert_eq!(collector.capture_times(), vec![100, 200, 300]);
    for reader in collector.readers() {
        let visited = visit(&reader);
        assert_eq!(visited.len(), 2);
        assert!(visited.iter().all(|v| v.aggregate.transaction_count == 1));
    }
}

#[tokio::test]
async fn test_idle_interval_closes_without_new_transactions() {
    let collector = MockCollector::new();
    let pipeline = Pipeline::start(collector.clone());

    pipeline.complete_at(50, "/orders", 1_000_000);
    assert!(wait_until(|| pipeline.aggregator.pending_transaction_count() == 0).await);
    pipeline.clock.set(120);

    assert!(wait_until(|| collector.capture_times() == vec![100]).await);
    assert_eq!(
        pipeline.aggregator.active_interval_collector().capture_time(),
        200
    );
}

#[tokio::test]
async fn test_empty_interval_is_not_flushed() {
    let collector = MockCollector::new();
    let pipeline = Pipeline::start(collector.clone());

    pipeline.clock.set(150);
    assert!(wait_until(|| {
        pipeline.aggregator.active_interval_collector().capture_time() == 200
    })
    .await);
    pipeline.aggregator.close().await.expect("close");
    assert_eq!(collector.flush_attempts(), 0);
}

#[tokio::test]
async fn test_failed_flush_does_not_stop_pipeline() {
    let collector = MockCollector::failing_first(1);
    let pipeline = Pipeline::start(collector.clone());

    pipeline.complete_at(50, "/orders", 1_000_000);
    pipeline.complete_at(150, "/orders", 1_000_000);
    pipeline.aggregator.close().await.expect("close");

    assert_eq!(collector.flush_attempts(), 2);
    assert_eq!(collector.capture_times(), vec![200]);
}

#[tokio::test]
async fn test_close_drains_queued_transactions() {
    let collector = MockCollector::new();
    let pipeline = Pipeline::start(collector.clone());

    for i in 0..20 {
        pipeline.complete_at(10 + i, &format!("/item/{}", i % 4), 2_000_000);
    }
    assert_eq!(pipeline.aggregator.pending_transaction_count(), 20);
    pipeline.aggregator.close().await.expect("close");

    let readers = collector.readers();
    assert_eq!(readers.len(), 1);
    let visited = visit(&readers[0]);
    let overall = visited
        .iter()
        .find(|v| v.transaction_name.is_none())
        .expect("overall aggregate");
    assert_eq!(overall.aggregate.transaction_count, 20);
    assert!((overall.aggregate.total_duration_nanos - 40_000_000.0).abs() < f64::EPSILON);
    assert_eq!(visited.len(), 5);
    assert!(pipeline.registry.is_empty());
}

#[tokio::test]
async fn test_live_reads_of_active_interval() {
    let collector = MockCollector::new();
    let pipeline = Pipeline::start(collector.clone());

    pipeline.complete_at(20, "/a", 10_000_000);
    pipeline.complete_at(30, "/a", 30_000_000);
    let context = pipeline.begin("Web", "/b");
    pipeline.ticker.advance(20_000_000);
    pipeline.clock.set(40);
    context.end_with_error(ErrorMessage::from_message("boom"));
    assert!(wait_until(|| pipeline.aggregator.pending_transaction_count() == 0).await);

    let collectors = pipeline
        .aggregator
        .get_ordered_interval_collectors_in_range(0, 100);
    assert_eq!(collectors.len(), 1);
    let interval = &collectors[0];

    let overview = interval
        .get_overview_aggregate("Web", None)
        .expect("overall aggregate");
    assert_eq!(overview.capture_time, 100);
    assert_eq!(overview.transaction_count, 3);
    assert_eq!(overview.error_count, 1);
    assert!((overview.total_duration_nanos - 60_000_000.0).abs() < f64::EPSILON);

    let percentiles = interval
        .get_percentile_aggregate("Web", Some("/a"))
        .expect("per-name aggregate");
    assert_eq!(percentiles.transaction_count, 2);
    assert!(percentiles.value_at_percentile(100.0).is_some());
    assert!(interval.get_overview_aggregate("Web", Some("/c")).is_none());
    assert!(interval.get_overview_aggregate("Background", None).is_none());

    let mut summaries = TransactionNameSummaryCollector::default();
    interval.merge_transaction_summaries_into("Web", &mut summaries);
    let by_total = summaries.result(SummarySortOrder::TotalTime, 10);
    let names: Vec<&str> = by_total
        .iter()
        .map(|s| s.transaction_name.as_str())
        .collect();
    assert_eq!(names, vec!["/a", "/b"]);

    pipeline.aggregator.clear_in_memory_aggregate();
    assert!(pipeline.aggregator.active_interval_collector().is_empty());
}

#[tokio::test]
async fn test_in_range_readers_include_pending_intervals() {
    let gate = Arc::new(Semaphore::new(0));
    let collector = MockCollector::gated(gate.clone());
    let pipeline = Pipeline::start(collector.clone());

    pipeline.complete_at(50, "/orders", 1_000_000);
    pipeline.complete_at(150, "/orders", 1_000_000);
    assert!(wait_until(|| collector.flush_attempts() == 1).await);

    let capture_times = |from, to| -> Vec<i64> {
        pipeline
            .aggregator
            .get_ordered_interval_collectors_in_range(from, to)
            .iter()
            .map(|c| c.capture_time())
            .collect()
    };
    assert_eq!(capture_times(0, 200), vec![100, 200]);
    assert_eq!(capture_times(100, 200), vec![200]);
    assert_eq!(capture_times(0, 100), vec![100]);
    assert!(capture_times(200, 1000).is_empty());

    gate.add_permits(10);
    assert!(wait_until(|| capture_times(0, 200) == vec![200]).await);
    assert_eq!(collector.capture_times(), vec![100]);
}

#[tokio::test]
async fn test_transaction_name_limit_folds_into_bucket() {
    let collector = MockCollector::new();
    let pipeline = Pipeline::start_with(
        collector.clone(),
        AdvancedConfig {
            aggregate_interval_millis: 100,
            max_transaction_aggregates: 2,
            capture_thread_stats: false,
            ..AdvancedConfig::default()
        },
    );

    for name in ["/a", "/b", "/c", "/d", "/a"] {
        pipeline.complete_at(50, name, 1_000_000);
    }
    pipeline.aggregator.close().await.expect("close");

    let readers = collector.readers();
    let visited = visit(&readers[0]);
    let names: Vec<Option<&str>> = visited
        .iter()
        .map(|v| v.transaction_name.as_deref())
        .collect();
    assert_eq!(
        names,
        vec![None, Some("/a"), Some("/b"), Some(LIMIT_EXCEEDED_BUCKET)]
    );
    let bucket = &visited[3].aggregate;
    assert_eq!(bucket.transaction_count, 2);
    assert_eq!(visited[1].aggregate.transaction_count, 2);
}

#[tokio::test]
async fn test_registry_tracks_in_flight_transactions() {
    let collector = MockCollector::new();
    let pipeline = Pipeline::start(collector.clone());

    let context = pipeline.begin("Web", "/slow");
    let threads = pipeline.registry.active_thread_contexts();
    assert_eq!(threads.len(), 1);
    assert!(!threads[0].is_auxiliary());
    assert_eq!(threads[0].transaction.transaction_name(), "/slow");

    pipeline.clock.set(60);
    context.end();
    assert!(wait_until(|| pipeline.registry.is_empty()).await);
    assert!(pipeline.registry.active_thread_contexts().is_empty());
}

#[tokio::test]
async fn test_async_transaction_completes_on_mark() {
    let collector = MockCollector::new();
    let pipeline = Pipeline::start(collector.clone());

    let context = pipeline.begin("Web", "/async");
    context.set_transaction_async();
    let transaction = Arc::clone(context.transaction());
    pipeline.ticker.advance(5_000_000);
    context.end();
    assert!(!transaction.is_completed());
    assert_eq!(pipeline.registry.len(), 1);

    pipeline.ticker.advance(5_000_000);
    pipeline.clock.set(70);
    transaction.mark_async_complete();
    pipeline.aggregator.close().await.expect("close");

    assert_eq!(transaction.capture_time(), Some(70));
    assert_eq!(transaction.duration_nanos(), 10_000_000);
    let readers = collector.readers();
    let visited = visit(&readers[0]);
    let overall = &visited[0].aggregate;
    assert!(overall.async_transactions);
    assert_eq!(overall.transaction_count, 1);
}

#[tokio::test]
async fn test_eum_spans_reach_collector() {
    let collector = MockCollector::new();
    let spans = SpanCollector::start(collector.clone());

    assert!(spans.collect_eum_span_from_query_string("trace-id=abc&duration-millis=250"));
    spans.close().await.expect("close");

    let received = collector.spans();
    assert_eq!(received.len(), 1);
    assert!(received[0].eum);
    assert_eq!(received[0].trace_id, "abc");
    assert_eq!(received[0].duration_nanos, 250_000_000);
    assert_eq!(spans.dropped_span_count(), 0);
}
