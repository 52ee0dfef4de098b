// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock collector sink for testing the aggregation pipeline

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use txn_agent_core::collector::{AggregateReader, AggregateVisitor, Collector, Span};
use txn_agent_core::errors::CollectorError;
use txn_agent_core::model::aggregate::Aggregate;

/// One aggregate seen through [`AggregateReader::accept`]. `transaction_name`
/// is `None` for the overall aggregate of a type.
#[derive(Debug, Clone)]
pub struct VisitedAggregate {
    pub transaction_type: String,
    pub transaction_name: Option<String>,
    pub aggregate: Aggregate,
}

#[derive(Default)]
struct Visitor(Vec<VisitedAggregate>);

impl AggregateVisitor for Visitor {
    fn visit_overall_aggregate(&mut self, transaction_type: &str, aggregate: &Aggregate) {
        self.0.push(VisitedAggregate {
            transaction_type: transaction_type.to_string(),
            transaction_name: None,
            aggregate: aggregate.clone(),
        });
    }

    fn visit_transaction_aggregate(
        &mut self,
        transaction_type: &str,
        transaction_name: &str,
        aggregate: &Aggregate,
    ) {
        self.0.push(VisitedAggregate {
            transaction_type: transaction_type.to_string(),
            transaction_name: Some(transaction_name.to_string()),
            aggregate: aggregate.clone(),
        });
    }
}

pub fn visit(reader: &AggregateReader) -> Vec<VisitedAggregate> {
    let mut visitor = Visitor::default();
    reader.accept(&mut visitor);
    visitor.0
}

/// Records every reader and span it receives.
///
/// Optionally fails the first N aggregate flushes, or holds each flush until
/// a permit is added to its gate.
#[derive(Default)]
pub struct MockCollector {
    readers: Mutex<Vec<AggregateReader>>,
    spans: Mutex<Vec<Span>>,
    failures_remaining: AtomicUsize,
    flush_attempts: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl MockCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_first(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: AtomicUsize::new(failures),
            ..Self::default()
        })
    }

    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Self::default()
        })
    }

    pub fn readers(&self) -> Vec<AggregateReader> {
        self.readers.lock().expect("lock").clone()
    }

    pub fn capture_times(&self) -> Vec<i64> {
        self.readers().iter().map(AggregateReader::capture_time).collect()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().expect("lock").clone()
    }

    pub fn flush_attempts(&self) -> usize {
        self.flush_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Collector for MockCollector {
    async fn collect_aggregates(&self, reader: AggregateReader) -> Result<(), CollectorError> {
        self.flush_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CollectorError::Sink("backend unavailable".to_string()));
        }
        self.readers.lock().expect("lock").push(reader);
        Ok(())
    }

    async fn collect_spans(&self, spans: Vec<Span>) -> Result<(), CollectorError> {
        self.spans.lock().expect("lock").extend(spans);
        Ok(())
    }
}
