// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Extension points called by instrumented methods.
//!
//! Instrumentation wires each call site to one of a fixed set of advices. An
//! advice that is disabled hands out no handle, and the matching
//! `on_return`/`on_throw`/`on_after` call is then a no-op, so call sites
//! never branch on configuration themselves.

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::model::timer::TimerName;
use crate::model::trace_entry::{ErrorMessage, MessageSupplier};
use crate::thread_context::{ThreadContext, TimerHandle, TraceEntryHandle};
use crate::transaction_service::TransactionService;

/// Advice around a method that records a trace entry.
///
/// `detail` is whatever the call site extracted from the method's arguments:
/// a message, a query text, a service call target.
pub trait EntryAdvice: Send + Sync {
    fn enabled(&self) -> bool {
        true
    }

    fn start(&self, context: &mut ThreadContext, detail: &str) -> TraceEntryHandle;

    fn on_before(&self, context: &mut ThreadContext, detail: &str) -> Option<TraceEntryHandle> {
        self.enabled().then(|| self.start(context, detail))
    }

    fn on_return(&self, context: &mut ThreadContext, handle: Option<TraceEntryHandle>) {
        if let Some(handle) = handle {
            context.end_trace_entry(handle);
        }
    }

    fn on_throw(
        &self,
        context: &mut ThreadContext,
        handle: Option<TraceEntryHandle>,
        error: &(dyn Error + 'static),
    ) {
        if let Some(handle) = handle {
            context.end_trace_entry_with_error(handle, ErrorMessage::from_error(error));
        }
    }
}

/// Timer-only advice, for methods worth timing but not worth a trace entry.
pub trait TimerAdvice: Send + Sync {
    fn enabled(&self) -> bool {
        true
    }

    fn timer_name(&self) -> TimerName;

    fn on_before(&self, context: &mut ThreadContext) -> Option<TimerHandle> {
        self.enabled()
            .then(|| context.start_timer(self.timer_name()))
    }

    fn on_after(&self, context: &mut ThreadContext, handle: Option<TimerHandle>) {
        if let Some(handle) = handle {
            context.stop_timer(handle);
        }
    }
}

/// Runtime switch shared by the advices below.
#[derive(Debug)]
pub struct AdviceSwitch(AtomicBool);

impl AdviceSwitch {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self(AtomicBool::new(enabled))
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for AdviceSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Plain trace entry whose message is `prefix` followed by the detail.
#[derive(Debug)]
pub struct TraceEntryAdvice {
    pub prefix: String,
    pub timer_name: TimerName,
    pub switch: AdviceSwitch,
}

impl TraceEntryAdvice {
    #[must_use]
    pub fn new(prefix: &str, timer_name: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            timer_name: TimerName::new(timer_name),
            switch: AdviceSwitch::default(),
        }
    }
}

impl EntryAdvice for TraceEntryAdvice {
    fn enabled(&self) -> bool {
        self.switch.get()
    }

    fn start(&self, context: &mut ThreadContext, detail: &str) -> TraceEntryHandle {
        let message = format!("{}{detail}", self.prefix);
        context.start_trace_entry(MessageSupplier::from_text(message), self.timer_name)
    }
}

/// Query execution. The detail is the query text; the query type (e.g. "SQL")
/// is fixed per advice.
#[derive(Debug)]
pub struct QueryAdvice {
    pub query_type: String,
    pub timer_name: TimerName,
    pub switch: AdviceSwitch,
}

impl QueryAdvice {
    #[must_use]
    pub fn new(query_type: &str, timer_name: &str) -> Self {
        Self {
            query_type: query_type.to_string(),
            timer_name: TimerName::new(timer_name),
            switch: AdviceSwitch::default(),
        }
    }
}

impl EntryAdvice for QueryAdvice {
    fn enabled(&self) -> bool {
        self.switch.get()
    }

    fn start(&self, context: &mut ThreadContext, detail: &str) -> TraceEntryHandle {
        let message = format!("{} query: {detail}", self.query_type);
        context.start_query_entry(
            &self.query_type,
            detail,
            MessageSupplier::from_text(message),
            self.timer_name,
        )
    }
}

/// Outbound call. The detail is the call text, e.g. `GET http://host/path`.
#[derive(Debug)]
pub struct ServiceCallAdvice {
    pub call_type: String,
    pub timer_name: TimerName,
    pub switch: AdviceSwitch,
}

impl ServiceCallAdvice {
    #[must_use]
    pub fn new(call_type: &str, timer_name: &str) -> Self {
        Self {
            call_type: call_type.to_string(),
            timer_name: TimerName::new(timer_name),
            switch: AdviceSwitch::default(),
        }
    }
}

impl EntryAdvice for ServiceCallAdvice {
    fn enabled(&self) -> bool {
        self.switch.get()
    }

    fn start(&self, context: &mut ThreadContext, detail: &str) -> TraceEntryHandle {
        context.start_service_call_entry(
            &self.call_type,
            detail,
            MessageSupplier::from_text(detail.to_string()),
            self.timer_name,
        )
    }
}

#[derive(Debug)]
pub struct MethodTimerAdvice {
    pub timer_name: TimerName,
    pub switch: AdviceSwitch,
}

impl MethodTimerAdvice {
    #[must_use]
    pub fn new(timer_name: &str) -> Self {
        Self {
            timer_name: TimerName::new(timer_name),
            switch: AdviceSwitch::default(),
        }
    }
}

impl TimerAdvice for MethodTimerAdvice {
    fn enabled(&self) -> bool {
        self.switch.get()
    }

    fn timer_name(&self) -> TimerName {
        self.timer_name
    }
}

/// Starts a transaction at the outermost instrumented entry point, e.g. a
/// servlet or a message listener.
#[derive(Debug)]
pub struct TransactionAdvice {
    pub transaction_type: String,
    pub timer_name: TimerName,
    pub switch: AdviceSwitch,
}

impl TransactionAdvice {
    #[must_use]
    pub fn new(transaction_type: &str, timer_name: &str) -> Self {
        Self {
            transaction_type: transaction_type.to_string(),
            timer_name: TimerName::new(timer_name),
            switch: AdviceSwitch::default(),
        }
    }

    /// `nested` is true when the calling thread already runs a transaction;
    /// inner entry points then contribute nothing.
    pub fn on_before(
        &self,
        service: &TransactionService,
        transaction_name: &str,
        nested: bool,
    ) -> Option<ThreadContext> {
        if nested || !self.switch.get() {
            return None;
        }
        Some(service.start_transaction(
            &self.transaction_type,
            transaction_name,
            MessageSupplier::from_text(transaction_name.to_string()),
            self.timer_name,
        ))
    }

    pub fn on_return(&self, context: Option<ThreadContext>) {
        if let Some(context) = context {
            context.end();
        }
    }

    pub fn on_throw(&self, context: Option<ThreadContext>, error: &(dyn Error + 'static)) {
        if let Some(context) = context {
            context.end_with_error(ErrorMessage::from_error(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, ManualTicker};
    use crate::config::{AdvancedConfig, ConfigService};
    use crate::transaction::{CompletionCallback, Transaction};
    use crate::transaction_registry::TransactionRegistry;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Completed(Mutex<Vec<Arc<Transaction>>>);

    impl CompletionCallback for Completed {
        fn completed(&self, transaction: Arc<Transaction>) {
            self.0.lock().expect("lock").push(transaction);
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("connection reset")]
    struct ConnectionReset;

    fn service(completed: Arc<Completed>, ticker: Arc<ManualTicker>) -> TransactionService {
        TransactionService::new(
            &ConfigService::new(AdvancedConfig::default()),
            Arc::new(TransactionRegistry::new()),
            completed,
            Arc::new(ManualClock::new(0)),
            ticker,
        )
    }

    #[test]
    fn test_advice_records_entries_and_timers() {
        let completed = Arc::new(Completed::default());
        let ticker = Arc::new(ManualTicker::new(0));
        let service = service(completed.clone(), ticker.clone());
        let transaction_advice = TransactionAdvice::new("Web", "http request");
        let query_advice = QueryAdvice::new("SQL", "jdbc query");
        let timer_advice = MethodTimerAdvice::new("render");

        let mut context = transaction_advice
            .on_before(&service, "/orders", false)
            .expect("enabled");
        assert!(transaction_advice.on_before(&service, "/inner", true).is_none());

        let query = query_advice.on_before(&mut context, "select 1");
        ticker.advance(5);
        query_advice.on_return(&mut context, query);

        let timer = timer_advice.on_before(&mut context);
        ticker.advance(7);
        timer_advice.on_after(&mut context, timer);

        let transaction = Arc::clone(context.transaction());
        transaction_advice.on_return(Some(context));

        let snapshot = transaction.trace_snapshot();
        let entries = &snapshot.thread_contexts[0].entries;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].message, "SQL query: select 1");
        let contexts = transaction.lock_contexts();
        let root = &contexts.main.as_ref().expect("main").root_timer;
        assert_eq!(root.child("jdbc query").map(|t| t.total_nanos), Some(5));
        assert_eq!(root.child("render").map(|t| t.total_nanos), Some(7));
        assert_eq!(completed.0.lock().expect("lock").len(), 1);
    }

    #[test]
    fn test_disabled_advice_is_noop() {
        let completed = Arc::new(Completed::default());
        let service = service(completed, Arc::new(ManualTicker::new(0)));
        let mut context = service.start_transaction(
            "Web",
            "/orders",
            MessageSupplier::from_text("GET /orders"),
            TimerName::new("http request"),
        );
        let advice = TraceEntryAdvice::new("call ", "method");
        advice.switch.set(false);

        let handle = advice.on_before(&mut context, "x");
        assert!(handle.is_none());
        advice.on_throw(&mut context, handle, &ConnectionReset);

        let transaction = Arc::clone(context.transaction());
        context.end();
        assert_eq!(transaction.trace_snapshot().thread_contexts[0].entries.len(), 1);
        assert!(transaction.error().is_none());
    }

    #[test]
    fn test_on_throw_records_error() {
        let completed = Arc::new(Completed::default());
        let service = service(completed, Arc::new(ManualTicker::new(0)));
        let transaction_advice = TransactionAdvice::new("Background", "job");
        let call_advice = ServiceCallAdvice::new("HTTP", "http client request");

        let mut context = transaction_advice.on_before(&service, "nightly", false);
        let ctx = context.as_mut().expect("enabled");
        let call = call_advice.on_before(ctx, "GET http://billing/invoices");
        call_advice.on_throw(ctx, call, &ConnectionReset);
        let transaction = Arc::clone(ctx.transaction());
        transaction_advice.on_throw(context, &ConnectionReset);

        let snapshot = transaction.trace_snapshot();
        let entries = &snapshot.thread_contexts[0].entries;
        assert_eq!(
            entries[1].error.as_ref().map(|e| e.message.as_str()),
            Some("connection reset")
        );
        assert_eq!(
            transaction.error().map(|e| e.message),
            Some("connection reset".to_string())
        );
    }
}
