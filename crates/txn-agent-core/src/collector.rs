// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contract with the external sink that stores or ships collected data.

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::CollectorError;
use crate::model::aggregate::Aggregate;

/// Raw span handed to the sink outside of aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    /// End-user-monitoring span reported by a browser agent.
    pub eum: bool,
    pub trace_id: String,
    pub duration_nanos: u64,
}

/// Receives each built aggregate of an interval.
pub trait AggregateVisitor {
    fn visit_overall_aggregate(&mut self, transaction_type: &str, aggregate: &Aggregate);

    fn visit_transaction_aggregate(
        &mut self,
        transaction_type: &str,
        transaction_name: &str,
        aggregate: &Aggregate,
    );
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TypeAggregates {
    pub(crate) transaction_type: String,
    pub(crate) overall: Aggregate,
    // sorted by transaction name
    pub(crate) transactions: Vec<(String, Aggregate)>,
}

/// Every aggregate of one closed interval, built and detached from the
/// interval's collectors.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateReader {
    capture_time: i64,
    types: Vec<TypeAggregates>,
}

impl AggregateReader {
    pub(crate) fn new(capture_time: i64, types: Vec<TypeAggregates>) -> Self {
        Self {
            capture_time,
            types,
        }
    }

    #[must_use]
    pub fn capture_time(&self) -> i64 {
        self.capture_time
    }

    /// Overall aggregate of each transaction type first, then its
    /// per-name aggregates.
    pub fn accept(&self, visitor: &mut dyn AggregateVisitor) {
        for type_aggregates in &self.types {
            visitor.visit_overall_aggregate(
                &type_aggregates.transaction_type,
                &type_aggregates.overall,
            );
            for (name, aggregate) in &type_aggregates.transactions {
                visitor.visit_transaction_aggregate(
                    &type_aggregates.transaction_type,
                    name,
                    aggregate,
                );
            }
        }
    }
}

#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect_aggregates(&self, reader: AggregateReader) -> Result<(), CollectorError>;

    async fn collect_spans(&self, spans: Vec<Span>) -> Result<(), CollectorError>;
}
