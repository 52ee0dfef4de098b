// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::sync::Arc;
use std::time::Duration;
use txn_agent_core::aggregator::Aggregator;
use txn_agent_core::clock::{ManualClock, ManualTicker};
use txn_agent_core::collector::Collector;
use txn_agent_core::config::{AdvancedConfig, ConfigService};
use txn_agent_core::model::timer::TimerName;
use txn_agent_core::model::trace_entry::MessageSupplier;
use txn_agent_core::thread_context::ThreadContext;
use txn_agent_core::transaction_registry::TransactionRegistry;
use txn_agent_core::transaction_service::TransactionService;

pub const INTERVAL_MILLIS: u64 = 100;

/// Pipeline wired the way an agent wires it, with manual time sources.
pub struct Pipeline {
    pub aggregator: Arc<Aggregator>,
    pub service: TransactionService,
    pub registry: Arc<TransactionRegistry>,
    pub config: Arc<ConfigService>,
    pub clock: Arc<ManualClock>,
    pub ticker: Arc<ManualTicker>,
}

impl Pipeline {
    /// Must be called from within a tokio runtime. The clock starts at 1 ms so
    /// the first interval ends at [`INTERVAL_MILLIS`].
    pub fn start(collector: Arc<dyn Collector>) -> Self {
        Self::start_with(
            collector,
            AdvancedConfig {
                aggregate_interval_millis: INTERVAL_MILLIS,
                capture_thread_stats: false,
                ..AdvancedConfig::default()
            },
        )
    }

    pub fn start_with(collector: Arc<dyn Collector>, config: AdvancedConfig) -> Self {
        let config = Arc::new(ConfigService::new(config));
        let clock = Arc::new(ManualClock::new(1));
        let ticker = Arc::new(ManualTicker::new(0));
        let registry = Arc::new(TransactionRegistry::new());
        let aggregator = Arc::new(Aggregator::start(
            collector,
            registry.clone(),
            config.clone(),
            clock.clone(),
        ));
        let service = TransactionService::new(
            &config,
            registry.clone(),
            aggregator.clone(),
            clock.clone(),
            ticker.clone(),
        );
        Self {
            aggregator,
            service,
            registry,
            config,
            clock,
            ticker,
        }
    }

    pub fn begin(&self, transaction_type: &str, name: &str) -> ThreadContext {
        self.service.start_transaction(
            transaction_type,
            name,
            MessageSupplier::from_text(name),
            TimerName::new("http request"),
        )
    }

    /// Runs a transaction of `duration_nanos` that completes at `end_millis`.
    pub fn complete_at(&self, end_millis: i64, name: &str, duration_nanos: u64) {
        let context = self.begin("Web", name);
        self.ticker.advance(duration_nanos);
        self.clock.set(end_millis);
        context.end();
    }
}

/// Polls `condition` until it holds, giving background tasks time to run.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..2000 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    false
}
