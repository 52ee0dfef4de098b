// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point for starting transactions.

use std::sync::Arc;
use tracing::trace;

use crate::clock::{Clock, Ticker};
use crate::config::{CachedLimits, ConfigService, ListenerRegistration};
use crate::model::timer::TimerName;
use crate::model::trace_entry::MessageSupplier;
use crate::thread_context::{ContextId, ParentLink, ThreadContext};
use crate::transaction::{CompletionCallback, Transaction};
use crate::transaction_registry::TransactionRegistry;

pub struct TransactionService {
    registry: Arc<TransactionRegistry>,
    completion: Arc<dyn CompletionCallback>,
    limits: Arc<CachedLimits>,
    clock: Arc<dyn Clock>,
    ticker: Arc<dyn Ticker>,
    _config_registration: ListenerRegistration,
}

impl TransactionService {
    pub fn new(
        config: &ConfigService,
        registry: Arc<TransactionRegistry>,
        completion: Arc<dyn CompletionCallback>,
        clock: Arc<dyn Clock>,
        ticker: Arc<dyn Ticker>,
    ) -> Self {
        let limits = Arc::new(CachedLimits::new(&config.advanced_config()));
        let config_registration = config.add_listener(limits.clone());
        Self {
            registry,
            completion,
            limits,
            clock,
            ticker,
            _config_registration: config_registration,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    /// Starts a transaction whose main thread context runs on the calling
    /// thread. Limits in effect now apply for the transaction's whole life.
    pub fn start_transaction(
        &self,
        transaction_type: &str,
        transaction_name: &str,
        message: MessageSupplier,
        timer_name: TimerName,
    ) -> ThreadContext {
        let transaction = Arc::new(Transaction::new(
            transaction_type,
            transaction_name,
            self.clock.current_time_millis(),
            self.limits.snapshot(),
            Arc::clone(&self.ticker),
            Arc::clone(&self.completion),
        ));
        self.registry.add(&transaction);
        trace!("Started {transaction_type} transaction {transaction_name}");
        ThreadContext::start(
            transaction,
            ContextId::MAIN,
            ParentLink::None,
            timer_name,
            message,
            Arc::clone(&self.ticker),
        )
    }
}
