// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread execution record of a transaction.
//!
//! A [`ThreadContext`] is owned by the thread it runs on and is only ever used
//! through `&mut`, so timers and entries are updated without synchronization.
//! Work handed to another thread goes through an [`AuxThreadContext`] token,
//! which is `Send` and starts a new auxiliary context on the receiving thread.

use serde::Serialize;
use std::backtrace::Backtrace;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::clock::Ticker;
use crate::constants::{AUXILIARY_THREAD_TIMER_NAME, TRANSACTION_QUERIES_HARD_LIMIT_MULTIPLIER};
use crate::model::thread_stats::{ThreadStats, ThreadStatsReading};
use crate::model::timer::{TimerId, TimerName, TimerSnapshot, TimerTree};
use crate::model::top_n::{QueryCollector, QueryStats, ServiceCallCollector, ServiceCallStats};
use crate::model::trace_entry::{EntryId, ErrorMessage, MessageSupplier, TraceEntry};
use crate::transaction::{ActiveThread, AsyncTimerState, ThreadContextTrace, Transaction};

/// Index of a thread context within its transaction. The main context is 0,
/// auxiliary contexts are numbered in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ContextId(pub(crate) u32);

impl ContextId {
    pub const MAIN: ContextId = ContextId(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryRef {
    pub context: ContextId,
    pub entry: EntryId,
}

/// Link from an auxiliary context back to the entry that spawned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParentLink {
    /// Main thread context.
    None,
    /// Too many auxiliary contexts: the context keeps timing but retains no
    /// trace detail and no link to its parent.
    LimitExceeded,
    Entry(EntryRef),
}

/// Data a thread context hands to its transaction when it ends.
pub(crate) struct ThreadContextData {
    pub(crate) context_id: ContextId,
    pub(crate) parent: ParentLink,
    pub(crate) thread_name: Option<String>,
    pub(crate) start_tick: u64,
    pub(crate) end_tick: u64,
    pub(crate) root_timer: TimerSnapshot,
    pub(crate) entries: Vec<TraceEntry>,
    pub(crate) queries: QueryCollector,
    pub(crate) service_calls: ServiceCallCollector,
    /// `None` when thread stats capture is disabled.
    pub(crate) thread_stats: Option<ThreadStats>,
}

impl ThreadContextData {
    pub(crate) fn trace(&self) -> ThreadContextTrace {
        ThreadContextTrace {
            context_id: self.context_id,
            parent: self.parent,
            thread_name: self.thread_name.clone(),
            entries: self
                .entries
                .iter()
                .map(|entry| entry.snapshot(self.start_tick, self.end_tick))
                .collect(),
        }
    }
}

#[derive(Debug)]
enum CallData {
    Query {
        dest: String,
        text: String,
        rows: Option<u64>,
    },
    ServiceCall {
        dest: String,
        text: String,
    },
}

/// Handle returned by the `start_*_entry` methods; pass it back to
/// [`ThreadContext::end_trace_entry`].
#[must_use = "an entry that is never ended keeps its timer running"]
#[derive(Debug)]
pub struct TraceEntryHandle {
    timer: TimerId,
    entry: Option<EntryId>,
    start_tick: u64,
    call: Option<CallData>,
}

impl TraceEntryHandle {
    /// Whether this entry is kept in the trace detail. Entries past the
    /// per-transaction limit are timed but not retained.
    #[must_use]
    pub fn is_retained(&self) -> bool {
        self.entry.is_some()
    }

    #[must_use]
    pub fn entry_id(&self) -> Option<EntryId> {
        self.entry
    }

    /// Marks a query as having navigated its result set, so its row count is
    /// reported even when it stays zero.
    pub fn row_navigation_attempted(&mut self) {
        if let Some(CallData::Query { rows, .. }) = &mut self.call {
            rows.get_or_insert(0);
        }
    }

    pub fn add_rows(&mut self, count: u64) {
        if let Some(CallData::Query { rows, .. }) = &mut self.call {
            *rows.get_or_insert(0) += count;
        }
    }
}

#[must_use = "a timer that is never stopped keeps running"]
#[derive(Debug)]
pub struct TimerHandle {
    timer: TimerId,
}

/// Timer of work that outlives the thread starting it. It can be stopped
/// from any thread.
#[derive(Clone)]
pub struct AsyncTimer {
    state: Arc<AsyncTimerState>,
    transaction: Arc<Transaction>,
    ticker: Arc<dyn Ticker>,
}

impl std::fmt::Debug for AsyncTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTimer")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl AsyncTimer {
    pub fn stop(&self) {
        // only the first stop counts
        let _ = self.state.end_tick.compare_exchange(
            u64::MAX,
            self.ticker.read(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.end_tick.load(Ordering::Acquire) == u64::MAX
    }

    /// Starts a new segment of the same timer, e.g. when a stopped async
    /// operation resumes.
    #[must_use]
    pub fn extend(&self) -> AsyncTimer {
        AsyncTimer {
            state: self.transaction.register_async_timer(self.state.name),
            transaction: Arc::clone(&self.transaction),
            ticker: Arc::clone(&self.ticker),
        }
    }
}

pub struct ThreadContext {
    transaction: Arc<Transaction>,
    context_id: ContextId,
    parent: ParentLink,
    ticker: Arc<dyn Ticker>,
    start_tick: u64,
    timers: TimerTree,
    entries: Vec<TraceEntry>,
    // open retained entries, the context's root entry at the bottom
    entry_stack: Vec<EntryId>,
    retain_entries: bool,
    queries: QueryCollector,
    service_calls: ServiceCallCollector,
    thread_stats: Option<ThreadStatsReading>,
    thread_name: Option<String>,
    thread_key: usize,
    complete_async_on_end: bool,
    ended: bool,
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("context_id", &self.context_id)
            .field("parent", &self.parent)
            .field("entries", &self.entries.len())
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

impl ThreadContext {
    pub(crate) fn start(
        transaction: Arc<Transaction>,
        context_id: ContextId,
        parent: ParentLink,
        root_timer: TimerName,
        root_message: MessageSupplier,
        ticker: Arc<dyn Ticker>,
    ) -> Self {
        let start_tick = if context_id == ContextId::MAIN {
            transaction.start_tick()
        } else {
            ticker.read()
        };
        let limits = *transaction.limits();
        let current = std::thread::current();
        let thread_name = current.name().map(str::to_string);
        let thread_key = transaction.register_thread(ActiveThread {
            thread_id: current.id(),
            thread_name: thread_name.clone(),
            context_id,
        });
        let root_entry = TraceEntry::new(root_message, None, 0, TimerId::ROOT, start_tick);
        Self {
            context_id,
            parent,
            start_tick,
            timers: TimerTree::new(root_timer, start_tick),
            entries: vec![root_entry],
            entry_stack: vec![EntryId::ROOT],
            retain_entries: parent != ParentLink::LimitExceeded,
            queries: QueryCollector::new(
                limits.max_query_aggregates,
                TRANSACTION_QUERIES_HARD_LIMIT_MULTIPLIER,
            ),
            service_calls: ServiceCallCollector::new(
                limits.max_service_call_aggregates,
                TRANSACTION_QUERIES_HARD_LIMIT_MULTIPLIER,
            ),
            thread_stats: limits
                .capture_thread_stats
                .then(ThreadStatsReading::capture),
            thread_name,
            thread_key,
            complete_async_on_end: false,
            ended: false,
            transaction,
            ticker,
        }
    }

    #[must_use]
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    #[must_use]
    pub fn parent(&self) -> ParentLink {
        self.parent
    }

    /// Innermost retained entry that is still open.
    #[must_use]
    pub fn current_entry(&self) -> EntryId {
        self.entry_stack.last().copied().unwrap_or(EntryId::ROOT)
    }

    pub fn start_trace_entry(
        &mut self,
        message: MessageSupplier,
        timer_name: TimerName,
    ) -> TraceEntryHandle {
        self.start_entry(message, timer_name, None)
    }

    pub fn start_query_entry(
        &mut self,
        query_type: &str,
        query_text: &str,
        message: MessageSupplier,
        timer_name: TimerName,
    ) -> TraceEntryHandle {
        let call = CallData::Query {
            dest: query_type.to_string(),
            text: query_text.to_string(),
            rows: None,
        };
        self.start_entry(message, timer_name, Some(call))
    }

    pub fn start_service_call_entry(
        &mut self,
        call_type: &str,
        call_text: &str,
        message: MessageSupplier,
        timer_name: TimerName,
    ) -> TraceEntryHandle {
        let call = CallData::ServiceCall {
            dest: call_type.to_string(),
            text: call_text.to_string(),
        };
        self.start_entry(message, timer_name, Some(call))
    }

    fn start_entry(
        &mut self,
        message: MessageSupplier,
        timer_name: TimerName,
        call: Option<CallData>,
    ) -> TraceEntryHandle {
        let start_tick = self.ticker.read();
        let timer = self.timers.start_timer(timer_name, start_tick);
        let entry = if self.retain_entries && self.transaction.allow_another_entry() {
            let parent = self.current_entry();
            #[allow(clippy::cast_possible_truncation)]
            let depth = self.entry_stack.len() as u32;
            #[allow(clippy::cast_possible_truncation)]
            let id = EntryId(self.entries.len() as u32);
            self.entries
                .push(TraceEntry::new(message, Some(parent), depth, timer, start_tick));
            self.entry_stack.push(id);
            Some(id)
        } else {
            None
        };
        TraceEntryHandle {
            timer,
            entry,
            start_tick,
            call,
        }
    }

    pub fn end_trace_entry(&mut self, handle: TraceEntryHandle) {
        self.end_entry(handle, None);
    }

    pub fn end_trace_entry_with_error(&mut self, handle: TraceEntryHandle, error: ErrorMessage) {
        self.end_entry(handle, Some(error));
    }

    fn end_entry(&mut self, handle: TraceEntryHandle, error: Option<ErrorMessage>) {
        let end_tick = self.ticker.read();
        self.timers.stop(handle.timer, end_tick);
        let duration_nanos = end_tick.saturating_sub(handle.start_tick);
        #[allow(clippy::cast_precision_loss)]
        let total_duration_nanos = duration_nanos as f64;
        match handle.call {
            Some(CallData::Query { dest, text, rows }) => self.queries.merge(
                &dest,
                &text,
                &QueryStats {
                    total_duration_nanos,
                    execution_count: 1,
                    total_rows: rows,
                    active: false,
                },
            ),
            Some(CallData::ServiceCall { dest, text }) => self.service_calls.merge(
                &dest,
                &text,
                &ServiceCallStats {
                    total_duration_nanos,
                    execution_count: 1,
                },
            ),
            None => {}
        }
        let Some(id) = handle.entry else {
            return;
        };
        // entries ended out of order also close everything opened after them
        if let Some(position) = self.entry_stack.iter().rposition(|e| *e == id) {
            self.entry_stack.truncate(position.max(1));
        }
        let threshold = self.transaction.limits().stack_threshold_nanos;
        let Some(entry) = self.entries.get_mut(id.index()) else {
            debug!("Ignoring trace entry handle from another thread context");
            return;
        };
        entry.end_tick = Some(end_tick);
        entry.error = error;
        if threshold.is_some_and(|threshold| duration_nanos >= threshold) {
            entry.location_stack_trace = Some(Backtrace::force_capture().to_string());
        }
    }

    pub fn start_timer(&mut self, name: TimerName) -> TimerHandle {
        TimerHandle {
            timer: self.timers.start_timer(name, self.ticker.read()),
        }
    }

    pub fn stop_timer(&mut self, handle: TimerHandle) {
        self.timers.stop(handle.timer, self.ticker.read());
    }

    pub fn start_async_timer(&mut self, name: TimerName) -> AsyncTimer {
        AsyncTimer {
            state: self.transaction.register_async_timer(name),
            transaction: Arc::clone(&self.transaction),
            ticker: Arc::clone(&self.ticker),
        }
    }

    /// Creates the token used to continue this transaction on another thread.
    ///
    /// Past the per-transaction auxiliary context limit the token no longer
    /// links back to the current entry, so the new context cannot keep this
    /// context's entries reachable.
    pub fn create_aux_thread_context(&self) -> AuxThreadContext {
        let (context_id, within_limit) = self.transaction.next_aux_context();
        let parent = if within_limit {
            ParentLink::Entry(EntryRef {
                context: self.context_id,
                entry: self.current_entry(),
            })
        } else {
            ParentLink::LimitExceeded
        };
        AuxThreadContext {
            transaction: Arc::clone(&self.transaction),
            context_id,
            parent,
            ticker: Arc::clone(&self.ticker),
        }
    }

    pub fn set_transaction_async(&self) {
        self.transaction.set_async();
    }

    /// Completes the (async) transaction once this context ends.
    pub fn complete_async_transaction_on_end(&mut self) {
        self.complete_async_on_end = true;
    }

    pub fn end(mut self) {
        self.finish(None);
    }

    /// Ends the context, recording `error` on its root entry. For the main
    /// context this is also the transaction error.
    pub fn end_with_error(mut self, error: ErrorMessage) {
        self.finish(Some(error));
    }

    fn finish(&mut self, error: Option<ErrorMessage>) {
        if self.ended {
            return;
        }
        self.ended = true;
        let end_tick = self.ticker.read();
        self.timers.stop_all(end_tick);
        for entry in &mut self.entries {
            entry.end_tick.get_or_insert(end_tick);
        }
        if let Some(error) = &error {
            self.entries[EntryId::ROOT.index()].error = Some(error.clone());
        }
        self.transaction.unregister_thread(self.thread_key);
        let data = ThreadContextData {
            context_id: self.context_id,
            parent: self.parent,
            thread_name: self.thread_name.take(),
            start_tick: self.start_tick,
            end_tick,
            root_timer: self.timers.snapshot(end_tick),
            entries: std::mem::take(&mut self.entries),
            queries: std::mem::replace(&mut self.queries, QueryCollector::new(0, 0)),
            service_calls: std::mem::replace(
                &mut self.service_calls,
                ServiceCallCollector::new(0, 0),
            ),
            thread_stats: self.thread_stats.map(|reading| reading.delta_to_now()),
        };
        if self.context_id == ContextId::MAIN {
            if let Some(error) = error {
                self.transaction.set_error(error);
            }
            self.transaction.store_main_context(data, end_tick);
        } else {
            self.transaction.store_aux_context(data);
            if self.complete_async_on_end {
                self.transaction.mark_async_complete();
            }
        }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        if !self.ended {
            debug!("Thread context {:?} dropped without being ended", self.context_id);
            self.finish(None);
        }
    }
}

/// Token that continues a transaction on another thread.
#[must_use]
pub struct AuxThreadContext {
    transaction: Arc<Transaction>,
    context_id: ContextId,
    parent: ParentLink,
    ticker: Arc<dyn Ticker>,
}

impl std::fmt::Debug for AuxThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuxThreadContext")
            .field("context_id", &self.context_id)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

impl AuxThreadContext {
    #[must_use]
    pub fn parent(&self) -> ParentLink {
        self.parent
    }

    /// Starts the auxiliary context on the calling thread.
    pub fn start(self) -> AuxSpan {
        self.start_context(false)
    }

    /// Like [`AuxThreadContext::start`], and completes the async transaction
    /// when the started context ends.
    pub fn start_and_mark_async_transaction_complete(self) -> AuxSpan {
        self.start_context(true)
    }

    fn start_context(self, complete_async_on_end: bool) -> AuxSpan {
        if self.transaction.is_completed() || self.transaction.is_async_complete() {
            return AuxSpan::Nop;
        }
        let mut context = ThreadContext::start(
            self.transaction,
            self.context_id,
            self.parent,
            TimerName::new(AUXILIARY_THREAD_TIMER_NAME),
            MessageSupplier::from_text(AUXILIARY_THREAD_TIMER_NAME),
            self.ticker,
        );
        context.complete_async_on_end = complete_async_on_end;
        AuxSpan::Started(context)
    }
}

/// Result of starting an auxiliary context. `Nop` when the transaction has
/// already completed.
#[must_use]
#[derive(Debug)]
pub enum AuxSpan {
    Nop,
    Started(ThreadContext),
}

impl AuxSpan {
    #[must_use]
    pub fn is_nop(&self) -> bool {
        matches!(self, AuxSpan::Nop)
    }

    pub fn context_mut(&mut self) -> Option<&mut ThreadContext> {
        match self {
            AuxSpan::Nop => None,
            AuxSpan::Started(context) => Some(context),
        }
    }

    pub fn end(self) {
        if let AuxSpan::Started(context) = self {
            context.end();
        }
    }
}
