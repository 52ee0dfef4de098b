// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The top-level unit of work.
//!
//! A [`Transaction`] is shared (`Arc`) between the thread contexts working on
//! it, the active registry and, once complete, the aggregation queue. Thread
//! contexts are owned by the threads running them; they only hand their data
//! to the transaction when they end, so the per-call hot path never takes a
//! transaction lock.

use serde::Serialize;
use slab::Slab;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::ThreadId;
use tracing::debug;

use crate::clock::Ticker;
use crate::config::TransactionLimits;
use crate::model::profile::Profile;
use crate::model::timer::{TimerName, TimerSnapshot};
use crate::model::trace_entry::{ErrorMessage, TraceEntrySnapshot};
use crate::thread_context::{ContextId, ParentLink, ThreadContextData};

const ACTIVE: u8 = 0;
const COMPLETING: u8 = 1;
const COMPLETED: u8 = 2;

/// Receives every transaction exactly once, when it completes.
pub trait CompletionCallback: Send + Sync {
    fn completed(&self, transaction: Arc<Transaction>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionState {
    Active,
    /// Ended, waiting for a capture time from the completion queue.
    Completing,
    Completed,
}

#[derive(Default)]
pub(crate) struct Contexts {
    pub(crate) main: Option<ThreadContextData>,
    pub(crate) aux: Vec<ThreadContextData>,
    main_ended: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Profiles {
    pub(crate) main: Profile,
    pub(crate) aux: Profile,
    samples: usize,
    dropped: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct ActiveThread {
    pub(crate) thread_id: ThreadId,
    pub(crate) thread_name: Option<String>,
    pub(crate) context_id: ContextId,
}

#[derive(Debug)]
pub(crate) struct AsyncTimerState {
    pub(crate) name: TimerName,
    pub(crate) start_tick: u64,
    // u64::MAX while running
    pub(crate) end_tick: AtomicU64,
}

impl AsyncTimerState {
    fn snapshot(&self, now_tick: u64) -> TimerSnapshot {
        let end_tick = self.end_tick.load(Ordering::Acquire);
        let active = end_tick == u64::MAX;
        let end_tick = if active { now_tick } else { end_tick };
        TimerSnapshot {
            name: self.name,
            count: 1,
            total_nanos: end_tick.saturating_sub(self.start_tick),
            active,
            children: Vec::new(),
        }
    }
}

pub struct Transaction {
    transaction_type: String,
    transaction_name: Mutex<String>,
    user: Mutex<Option<String>>,
    headline: Mutex<Option<String>>,
    start_time_millis: i64,
    start_tick: u64,
    limits: TransactionLimits,
    ticker: Arc<dyn Ticker>,
    state: AtomicU8,
    is_async: AtomicBool,
    async_complete: AtomicBool,
    error: Mutex<Option<ErrorMessage>>,
    end_tick: OnceLock<u64>,
    capture_time: OnceLock<i64>,
    entry_count: AtomicUsize,
    entry_limit_exceeded: AtomicBool,
    aux_context_count: AtomicUsize,
    contexts: Mutex<Contexts>,
    active_threads: Mutex<Slab<ActiveThread>>,
    async_timers: Mutex<Vec<Arc<AsyncTimerState>>>,
    profiles: Mutex<Profiles>,
    registry_key: OnceLock<usize>,
    completion: Arc<dyn CompletionCallback>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("transaction_type", &self.transaction_type)
            .field("transaction_name", &self.transaction_name())
            .field("state", &self.state())
            .field("capture_time", &self.capture_time.get())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(
        transaction_type: &str,
        transaction_name: &str,
        start_time_millis: i64,
        limits: TransactionLimits,
        ticker: Arc<dyn Ticker>,
        completion: Arc<dyn CompletionCallback>,
    ) -> Self {
        let start_tick = ticker.read();
        Self {
            transaction_type: transaction_type.to_string(),
            transaction_name: Mutex::new(transaction_name.to_string()),
            user: Mutex::new(None),
            headline: Mutex::new(None),
            start_time_millis,
            start_tick,
            limits,
            ticker,
            state: AtomicU8::new(ACTIVE),
            is_async: AtomicBool::new(false),
            async_complete: AtomicBool::new(false),
            error: Mutex::new(None),
            end_tick: OnceLock::new(),
            capture_time: OnceLock::new(),
            entry_count: AtomicUsize::new(0),
            entry_limit_exceeded: AtomicBool::new(false),
            aux_context_count: AtomicUsize::new(0),
            contexts: Mutex::new(Contexts::default()),
            active_threads: Mutex::new(Slab::new()),
            async_timers: Mutex::new(Vec::new()),
            profiles: Mutex::new(Profiles::default()),
            registry_key: OnceLock::new(),
            completion,
        }
    }

    #[must_use]
    pub fn transaction_type(&self) -> &str {
        &self.transaction_type
    }

    #[must_use]
    pub fn transaction_name(&self) -> String {
        #[allow(clippy::expect_used)]
        let name = self.transaction_name.lock().expect("lock poisoned");
        name.clone()
    }

    pub fn set_transaction_name(&self, name: &str) {
        if self.is_completed() {
            debug!("Ignoring transaction name {name} set after completion");
            return;
        }
        #[allow(clippy::expect_used)]
        let mut current = self.transaction_name.lock().expect("lock poisoned");
        *current = name.to_string();
    }

    #[must_use]
    pub fn user(&self) -> Option<String> {
        #[allow(clippy::expect_used)]
        let user = self.user.lock().expect("lock poisoned");
        user.clone()
    }

    pub fn set_user(&self, user: &str) {
        #[allow(clippy::expect_used)]
        let mut current = self.user.lock().expect("lock poisoned");
        *current = Some(user.to_string());
    }

    /// Short description shown in trace listings, when the instrumentation
    /// provides one.
    #[must_use]
    pub fn headline(&self) -> Option<String> {
        #[allow(clippy::expect_used)]
        let headline = self.headline.lock().expect("lock poisoned");
        headline.clone()
    }

    pub fn set_headline(&self, headline: &str) {
        #[allow(clippy::expect_used)]
        let mut current = self.headline.lock().expect("lock poisoned");
        *current = Some(headline.to_string());
    }

    #[must_use]
    pub fn start_time_millis(&self) -> i64 {
        self.start_time_millis
    }

    pub(crate) fn start_tick(&self) -> u64 {
        self.start_tick
    }

    pub(crate) fn limits(&self) -> &TransactionLimits {
        &self.limits
    }

    /// Assigned once by the completion queue, under its lock.
    #[must_use]
    pub fn capture_time(&self) -> Option<i64> {
        self.capture_time.get().copied()
    }

    /// Final duration once ended, otherwise the time elapsed so far.
    #[must_use]
    pub fn duration_nanos(&self) -> u64 {
        let end_tick = self
            .end_tick
            .get()
            .copied()
            .unwrap_or_else(|| self.ticker.read());
        end_tick.saturating_sub(self.start_tick)
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => TransactionState::Active,
            COMPLETING => TransactionState::Completing,
            _ => TransactionState::Completed,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) != ACTIVE
    }

    #[must_use]
    pub fn is_async(&self) -> bool {
        self.is_async.load(Ordering::Acquire)
    }

    /// The transaction will not complete when its main thread context ends,
    /// only once [`Transaction::mark_async_complete`] is called as well.
    pub fn set_async(&self) {
        self.is_async.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_async_complete(&self) -> bool {
        self.async_complete.load(Ordering::Acquire)
    }

    /// Signals the end of an async transaction. Auxiliary contexts started
    /// after this point are no-ops.
    pub fn mark_async_complete(self: &Arc<Self>) {
        let complete = {
            let contexts = self.lock_contexts();
            self.async_complete.store(true, Ordering::Release);
            contexts.main_ended
        };
        if complete {
            self.complete(self.ticker.read());
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<ErrorMessage> {
        #[allow(clippy::expect_used)]
        let error = self.error.lock().expect("lock poisoned");
        error.clone()
    }

    /// Records the transaction error. The first error set wins.
    pub fn set_error(&self, error: ErrorMessage) {
        #[allow(clippy::expect_used)]
        let mut current = self.error.lock().expect("lock poisoned");
        if current.is_none() {
            *current = Some(error);
        }
    }

    #[must_use]
    pub fn entry_limit_exceeded(&self) -> bool {
        self.entry_limit_exceeded.load(Ordering::Acquire)
    }

    /// Claims a slot for one more retained trace entry.
    pub(crate) fn allow_another_entry(&self) -> bool {
        if self.entry_count.fetch_add(1, Ordering::AcqRel) < self.limits.max_trace_entries {
            return true;
        }
        self.entry_limit_exceeded.store(true, Ordering::Release);
        false
    }

    /// Allocates the next auxiliary context id, and whether that context may
    /// still link to (and so retain) its parent entry.
    pub(crate) fn next_aux_context(&self) -> (ContextId, bool) {
        let count = self.aux_context_count.fetch_add(1, Ordering::AcqRel) + 1;
        #[allow(clippy::cast_possible_truncation)]
        let id = ContextId(count.min(u32::MAX as usize) as u32);
        (id, count <= self.limits.max_aux_thread_contexts)
    }

    /// Records one sampled stack. Returns `false` once the per-transaction
    /// sample limit is reached. An empty stack is not a sample.
    pub fn add_stack_trace<S: AsRef<str>>(&self, frames: &[S], auxiliary: bool) -> bool {
        if frames.is_empty() {
            return true;
        }
        #[allow(clippy::expect_used)]
        let mut profiles = self.profiles.lock().expect("lock poisoned");
        if profiles.samples >= self.limits.max_profile_samples {
            profiles.dropped += 1;
            return false;
        }
        profiles.samples += 1;
        if auxiliary {
            profiles.aux.add_stack_trace(frames);
        } else {
            profiles.main.add_stack_trace(frames);
        }
        true
    }

    #[must_use]
    pub fn dropped_profile_samples(&self) -> u64 {
        self.lock_profiles().dropped
    }

    pub(crate) fn lock_profiles(&self) -> MutexGuard<'_, Profiles> {
        #[allow(clippy::expect_used)]
        let profiles = self.profiles.lock().expect("lock poisoned");
        profiles
    }

    pub(crate) fn lock_contexts(&self) -> MutexGuard<'_, Contexts> {
        #[allow(clippy::expect_used)]
        let contexts = self.contexts.lock().expect("lock poisoned");
        contexts
    }

    pub(crate) fn register_async_timer(&self, name: TimerName) -> Arc<AsyncTimerState> {
        let state = Arc::new(AsyncTimerState {
            name,
            start_tick: self.ticker.read(),
            end_tick: AtomicU64::new(u64::MAX),
        });
        #[allow(clippy::expect_used)]
        self.async_timers
            .lock()
            .expect("lock poisoned")
            .push(Arc::clone(&state));
        state
    }

    pub(crate) fn async_timer_snapshots(&self) -> Vec<TimerSnapshot> {
        let now_tick = self.ticker.read();
        #[allow(clippy::expect_used)]
        let timers = self.async_timers.lock().expect("lock poisoned");
        timers.iter().map(|t| t.snapshot(now_tick)).collect()
    }

    pub(crate) fn register_thread(&self, thread: ActiveThread) -> usize {
        #[allow(clippy::expect_used)]
        let key = self
            .active_threads
            .lock()
            .expect("lock poisoned")
            .insert(thread);
        key
    }

    pub(crate) fn unregister_thread(&self, key: usize) {
        #[allow(clippy::expect_used)]
        let mut threads = self.active_threads.lock().expect("lock poisoned");
        if threads.contains(key) {
            threads.remove(key);
        }
    }

    pub(crate) fn active_threads(&self) -> Vec<ActiveThread> {
        #[allow(clippy::expect_used)]
        let threads = self.active_threads.lock().expect("lock poisoned");
        threads.iter().map(|(_, t)| t.clone()).collect()
    }

    pub(crate) fn registry_key(&self) -> Option<usize> {
        self.registry_key.get().copied()
    }

    pub(crate) fn set_registry_key(&self, key: usize) {
        if self.registry_key.set(key).is_err() {
            debug!("Transaction registered more than once");
        }
    }

    pub(crate) fn store_main_context(self: &Arc<Self>, data: ThreadContextData, end_tick: u64) {
        let complete = {
            let mut contexts = self.lock_contexts();
            contexts.main = Some(data);
            contexts.main_ended = true;
            !self.is_async() || self.is_async_complete()
        };
        if complete {
            self.complete(end_tick);
        }
    }

    pub(crate) fn store_aux_context(&self, data: ThreadContextData) {
        let mut contexts = self.lock_contexts();
        if self.is_completed() {
            debug!(
                "Discarding auxiliary thread context {:?} that ended after transaction completion",
                data.context_id
            );
            return;
        }
        contexts.aux.push(data);
    }

    fn complete(self: &Arc<Self>, end_tick: u64) {
        if self
            .state
            .compare_exchange(ACTIVE, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if self.end_tick.set(end_tick).is_err() {
            debug!("Transaction end tick already set");
        }
        self.completion.completed(Arc::clone(self));
    }

    pub(crate) fn set_capture_time(&self, capture_time: i64) {
        if self.capture_time.set(capture_time).is_err() {
            debug!("Transaction capture time already set");
        }
        self.state.store(COMPLETED, Ordering::Release);
    }

    /// Resolves the retained trace detail of every thread context that has
    /// ended so far, main thread first.
    #[must_use]
    pub fn trace_snapshot(&self) -> TraceSnapshot {
        let thread_contexts = {
            let contexts = self.lock_contexts();
            contexts
                .main
                .iter()
                .chain(contexts.aux.iter())
                .map(ThreadContextData::trace)
                .collect()
        };
        TraceSnapshot {
            transaction_type: self.transaction_type.clone(),
            transaction_name: self.transaction_name(),
            user: self.user(),
            headline: self.headline(),
            start_time_millis: self.start_time_millis,
            capture_time: self.capture_time(),
            duration_nanos: self.duration_nanos(),
            state: self.state(),
            is_async: self.is_async(),
            error: self.error(),
            entry_limit_exceeded: self.entry_limit_exceeded(),
            thread_contexts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadContextTrace {
    pub context_id: ContextId,
    pub parent: ParentLink,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    /// Entries in start order; the first one stands for the context itself.
    pub entries: Vec<TraceEntrySnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSnapshot {
    pub transaction_type: String,
    pub transaction_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
    pub start_time_millis: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_time: Option<i64>,
    pub duration_nanos: u64,
    pub state: TransactionState,
    pub is_async: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMessage>,
    pub entry_limit_exceeded: bool,
    pub thread_contexts: Vec<ThreadContextTrace>,
}
