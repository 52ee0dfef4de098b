// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Completion queue and interval rollover.
//!
//! # Architecture
//!
//! ```text
//! app threads ──add()──> completion queue ──> processing task ──> active interval
//!                        (capture time                               │ rollover
//!                         assigned here)                             v
//!                                              flushing task <── pending intervals
//!                                                   │
//!                                                   v
//!                                               Collector
//! ```
//!
//! Completed transactions get their capture time under the same lock that
//! appends them to the queue. The queue is FIFO with a single consumer, so
//! transactions are folded in non-decreasing capture time order. That is
//! what lets the processing task close an interval as soon as it sees either
//! a later transaction or an empty queue past the interval end, without
//! consulting application threads.
//!
//! Closed intervals are flushed on a separate task so a slow sink never
//! stalls aggregation.
//!
//! # Backpressure
//!
//! - More than [`TRANSACTION_PENDING_LIMIT`] queued transactions: the new
//!   transaction is dropped.
//! - [`AGGREGATE_PENDING_LIMIT`] intervals already waiting to be flushed: the
//!   newly closed interval is dropped.
//!
//! Both are logged through a rate-limited warning and counted.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};

use crate::clock::Clock;
use crate::collector::Collector;
use crate::config::ConfigService;
use crate::constants::{
    AGGREGATE_PENDING_LIMIT, MAX_IDLE_WAIT, SHUTDOWN_TIMEOUT, TRANSACTION_PENDING_LIMIT,
};
use crate::errors::AggregatorError;
use crate::interval_collector::{AggregateIntervalCollector, IntervalLimits};
use crate::rate_limited::RateLimitedLogger;
use crate::transaction::{CompletionCallback, Transaction};
use crate::transaction_registry::TransactionRegistry;

type FlushSender = mpsc::Sender<Arc<AggregateIntervalCollector>>;

/// End of the interval containing `capture_time`: the first multiple of
/// `interval_millis` that is `>= capture_time`.
#[must_use]
pub fn interval_end(capture_time: i64, interval_millis: i64) -> i64 {
    let interval_millis = interval_millis.max(1);
    capture_time.div_euclid(interval_millis) * interval_millis
        + if capture_time.rem_euclid(interval_millis) == 0 {
            0
        } else {
            interval_millis
        }
}

struct Shared {
    queue: Mutex<VecDeque<Arc<Transaction>>>,
    queue_notify: Notify,
    registry: Arc<TransactionRegistry>,
    config: Arc<ConfigService>,
    clock: Arc<dyn Clock>,
    active: RwLock<Arc<AggregateIntervalCollector>>,
    pending: Mutex<Vec<Arc<AggregateIntervalCollector>>>,
    flush_tx: Mutex<Option<FlushSender>>,
    /// Only written while holding the queue lock.
    closed: AtomicBool,
    dropped_transactions: AtomicU64,
    dropped_aggregates: AtomicU64,
    transaction_backlog_logger: RateLimitedLogger,
    aggregate_backlog_logger: RateLimitedLogger,
    closed_logger: RateLimitedLogger,
    #[cfg(test)]
    consumed_capture_times: Mutex<Vec<i64>>,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Arc<Transaction>>> {
        #[allow(clippy::expect_used)]
        let queue = self.queue.lock().expect("lock poisoned");
        queue
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<Arc<AggregateIntervalCollector>>> {
        #[allow(clippy::expect_used)]
        let pending = self.pending.lock().expect("lock poisoned");
        pending
    }

    fn active_interval(&self) -> Arc<AggregateIntervalCollector> {
        #[allow(clippy::expect_used)]
        let active = self.active.read().expect("lock poisoned");
        Arc::clone(&active)
    }

    fn interval_millis(&self) -> i64 {
        let millis = self.config.advanced_config().aggregate_interval_millis;
        i64::try_from(millis).unwrap_or(i64::MAX)
    }

    fn new_interval(&self, capture_time: i64) -> Arc<AggregateIntervalCollector> {
        let config = self.config.advanced_config();
        Arc::new(AggregateIntervalCollector::new(
            interval_end(capture_time, self.interval_millis()),
            IntervalLimits::from_config(&config),
        ))
    }

    fn add(&self, transaction: Arc<Transaction>) {
        let mut queue = self.lock_queue();
        if self.closed.load(Ordering::Acquire) {
            drop(queue);
            self.drop_transaction(&transaction);
            self.closed_logger.warn(format_args!(
                "Not storing a transaction because the aggregator has been shut down"
            ));
            return;
        }
        transaction.set_capture_time(self.clock.current_time_millis());
        if queue.len() >= TRANSACTION_PENDING_LIMIT {
            drop(queue);
            self.drop_transaction(&transaction);
            self.transaction_backlog_logger.warn(format_args!(
                "Not storing a transaction because of an excessive backlog of {TRANSACTION_PENDING_LIMIT} transactions already waiting to be stored"
            ));
            return;
        }
        queue.push_back(transaction);
        drop(queue);
        self.queue_notify.notify_one();
    }

    fn drop_transaction(&self, transaction: &Transaction) {
        self.registry.remove(transaction);
        self.dropped_transactions.fetch_add(1, Ordering::Relaxed);
    }

    /// Sets `closed` unless already set. Returns the previous value.
    fn mark_closed(&self) -> bool {
        let _queue = self.lock_queue();
        self.closed.swap(true, Ordering::AcqRel)
    }

    fn process_one(&self, transaction: &Transaction) {
        self.registry.remove(transaction);
        let capture_time = transaction
            .capture_time()
            .unwrap_or_else(|| self.clock.current_time_millis());
        #[cfg(test)]
        self.consumed_capture_times
            .lock()
            .expect("lock poisoned")
            .push(capture_time);
        if capture_time > self.active_interval().capture_time() {
            self.close_active_interval(capture_time);
        }
        let active = self.active_interval();
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| active.add(transaction)))
        {
            error!(
                "Failed to aggregate {} transaction {}: {}",
                transaction.transaction_type(),
                transaction.transaction_name(),
                panic_message(panic.as_ref())
            );
        }
    }

    /// Closes the active interval if it ended and the queue is empty.
    fn maybe_end_of_interval(&self) -> bool {
        if self.clock.current_time_millis() <= self.active_interval().capture_time() {
            return false;
        }
        // Capture times are assigned under this lock, so an empty queue here
        // means nothing with an earlier capture time can still show up.
        let queue = self.lock_queue();
        if !queue.is_empty() {
            return false;
        }
        self.close_active_interval(self.clock.current_time_millis());
        true
    }

    /// Replaces the active interval with the one containing `capture_time`
    /// and hands the old one to the flusher.
    fn close_active_interval(&self, capture_time: i64) {
        let closed = self.active_interval();
        // pending first, so readers see the closed interval in one of the two places
        self.enqueue_flush(Arc::clone(&closed));
        let next = self.new_interval(capture_time);
        debug!(
            "Closing aggregate interval {}, next interval ends at {}",
            closed.capture_time(),
            next.capture_time()
        );
        #[allow(clippy::expect_used)]
        let mut active = self.active.write().expect("lock poisoned");
        *active = next;
    }

    fn enqueue_flush(&self, interval: Arc<AggregateIntervalCollector>) {
        if interval.is_empty() {
            return;
        }
        let mut pending = self.lock_pending();
        if pending.len() >= AGGREGATE_PENDING_LIMIT {
            drop(pending);
            self.drop_aggregate();
            return;
        }
        #[allow(clippy::expect_used)]
        let sender = self.flush_tx.lock().expect("lock poisoned").clone();
        let sent = sender.is_some_and(|tx| tx.try_send(Arc::clone(&interval)).is_ok());
        if sent {
            pending.push(interval);
        } else {
            drop(pending);
            self.drop_aggregate();
        }
    }

    fn drop_aggregate(&self) {
        self.dropped_aggregates.fetch_add(1, Ordering::Relaxed);
        self.aggregate_backlog_logger.warn(format_args!(
            "Not storing aggregates because of an excessive backlog of {AGGREGATE_PENDING_LIMIT} aggregates already waiting to be stored"
        ));
    }

    fn remove_pending(&self, interval: &Arc<AggregateIntervalCollector>) {
        self.lock_pending()
            .retain(|pending| !Arc::ptr_eq(pending, interval));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn process_transactions(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let next = shared.lock_queue().pop_front();
        if let Some(transaction) = next {
            shared.process_one(&transaction);
            continue;
        }
        if shared.maybe_end_of_interval() {
            continue;
        }
        // `closed` is set under the queue lock before cancelling, so once the
        // queue is seen empty here no add can slip in behind it
        if cancel.is_cancelled() && shared.lock_queue().is_empty() {
            break;
        }
        // the sleep bounds how late an idle interval is closed
        tokio::select! {
            () = shared.queue_notify.notified() => {}
            () = tokio::time::sleep(MAX_IDLE_WAIT) => {}
            () = cancel.cancelled() => {}
        }
    }
    // queue is drained at this point, hand over whatever the active interval holds
    let active = shared.active_interval();
    debug!(
        "Flushing active aggregate interval {} on shutdown",
        active.capture_time()
    );
    shared.enqueue_flush(active);
}

async fn flush_intervals(
    shared: Arc<Shared>,
    collector: Arc<dyn Collector>,
    mut rx: mpsc::Receiver<Arc<AggregateIntervalCollector>>,
) {
    while let Some(interval) = rx.recv().await {
        let capture_time = interval.capture_time();
        let reader = interval.build_reader();
        let sink = Arc::clone(&collector);
        // a panicking sink surfaces as a JoinError instead of killing this loop
        let result = tokio::spawn(
            async move { sink.collect_aggregates(reader).await }
                .instrument(info_span!("aggregate_flush", capture_time)),
        )
        .await;
        match result {
            Ok(Ok(())) => debug!("Flushed aggregates for interval {capture_time}"),
            Ok(Err(e)) => error!("Failed to flush aggregates for interval {capture_time}: {e}"),
            Err(e) => error!("Aggregate flush for interval {capture_time} panicked: {e}"),
        }
        // not retried: the interval is gone either way
        shared.remove_pending(&interval);
    }
}

async fn join_with_timeout(
    executor: &'static str,
    handle: JoinHandle<()>,
) -> Result<(), AggregatorError> {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
        Ok(result) => result.map_err(AggregatorError::from),
        Err(_) => Err(AggregatorError::ShutdownTimeout {
            executor,
            timeout: SHUTDOWN_TIMEOUT,
        }),
    }
}

pub struct Aggregator {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    processing: Mutex<Option<JoinHandle<()>>>,
    flushing: Mutex<Option<JoinHandle<()>>>,
}

impl Aggregator {
    /// Spawns the processing and flushing tasks. Must be called from within a
    /// tokio runtime.
    pub fn start(
        collector: Arc<dyn Collector>,
        registry: Arc<TransactionRegistry>,
        config: Arc<ConfigService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (flush_tx, flush_rx) = mpsc::channel(AGGREGATE_PENDING_LIMIT);
        let advanced = config.advanced_config();
        let interval_millis = i64::try_from(advanced.aggregate_interval_millis).unwrap_or(i64::MAX);
        let active = Arc::new(AggregateIntervalCollector::new(
            interval_end(clock.current_time_millis(), interval_millis),
            IntervalLimits::from_config(&advanced),
        ));
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            registry,
            config,
            clock,
            active: RwLock::new(active),
            pending: Mutex::new(Vec::new()),
            flush_tx: Mutex::new(Some(flush_tx)),
            closed: AtomicBool::new(false),
            dropped_transactions: AtomicU64::new(0),
            dropped_aggregates: AtomicU64::new(0),
            transaction_backlog_logger: RateLimitedLogger::new("transaction backlog"),
            aggregate_backlog_logger: RateLimitedLogger::new("aggregate backlog"),
            closed_logger: RateLimitedLogger::new("closed aggregator"),
            #[cfg(test)]
            consumed_capture_times: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();
        let processing = tokio::spawn(process_transactions(Arc::clone(&shared), cancel.clone()));
        let flushing = tokio::spawn(flush_intervals(Arc::clone(&shared), collector, flush_rx));
        Self {
            shared,
            cancel,
            processing: Mutex::new(Some(processing)),
            flushing: Mutex::new(Some(flushing)),
        }
    }

    /// Queues a completed transaction for aggregation. Never blocks beyond
    /// the brief queue lock.
    pub fn add(&self, transaction: Arc<Transaction>) {
        self.shared.add(transaction);
    }

    #[must_use]
    pub fn pending_transaction_count(&self) -> usize {
        self.shared.lock_queue().len()
    }

    #[must_use]
    pub fn dropped_transaction_count(&self) -> u64 {
        self.shared.dropped_transactions.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_aggregate_count(&self) -> u64 {
        self.shared.dropped_aggregates.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active_interval_collector(&self) -> Arc<AggregateIntervalCollector> {
        self.shared.active_interval()
    }

    /// Interval collectors still in memory whose capture time is in
    /// `(from, to]`, oldest first.
    #[must_use]
    pub fn get_ordered_interval_collectors_in_range(
        &self,
        from: i64,
        to: i64,
    ) -> Vec<Arc<AggregateIntervalCollector>> {
        // Active first: a rollover moves it to pending before replacing it, so
        // it shows up in at least one of the two reads. Duplicates are removed
        // below.
        let active = self.shared.active_interval();
        let mut collectors = self.shared.lock_pending().clone();
        collectors.push(active);
        let mut ordered: Vec<Arc<AggregateIntervalCollector>> = Vec::new();
        for collector in collectors {
            let capture_time = collector.capture_time();
            if capture_time > from
                && capture_time <= to
                && !ordered.iter().any(|c| Arc::ptr_eq(c, &collector))
            {
                ordered.push(collector);
            }
        }
        ordered.sort_by_key(|c| c.capture_time());
        ordered
    }

    pub fn clear_in_memory_aggregate(&self) {
        self.shared.active_interval().clear();
    }

    /// Stops accepting transactions, folds whatever is still queued, flushes
    /// the active interval and waits for pending flushes to finish.
    ///
    /// # Errors
    ///
    /// [`AggregatorError::ShutdownTimeout`] if a background task does not
    /// finish within [`SHUTDOWN_TIMEOUT`]; the agent should treat this as
    /// fatal.
    pub async fn close(&self) -> Result<(), AggregatorError> {
        if self.shared.mark_closed() {
            return Err(AggregatorError::Closed);
        }
        self.cancel.cancel();
        #[allow(clippy::expect_used)]
        let processing = self.processing.lock().expect("lock poisoned").take();
        if let Some(handle) = processing {
            join_with_timeout("processing", handle).await?;
        }
        // dropping the sender lets the flusher exit once its queue is empty
        #[allow(clippy::expect_used)]
        self.shared.flush_tx.lock().expect("lock poisoned").take();
        #[allow(clippy::expect_used)]
        let flushing = self.flushing.lock().expect("lock poisoned").take();
        if let Some(handle) = flushing {
            join_with_timeout("flushing", handle).await?;
        }
        Ok(())
    }
}

impl CompletionCallback for Aggregator {
    fn completed(&self, transaction: Arc<Transaction>) {
        self.add(transaction);
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, ManualTicker};
    use crate::collector::{AggregateReader, Span};
    use crate::config::AdvancedConfig;
    use crate::errors::CollectorError;
    use crate::model::timer::TimerName;
    use crate::model::trace_entry::MessageSupplier;
    use crate::transaction_service::TransactionService;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tracing_test::traced_test;

    struct GatedCollector {
        readers: Mutex<Vec<AggregateReader>>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Collector for GatedCollector {
        async fn collect_aggregates(&self, reader: AggregateReader) -> Result<(), CollectorError> {
            self.gate.acquire().await.expect("gate open").forget();
            self.readers.lock().expect("lock").push(reader);
            Ok(())
        }

        async fn collect_spans(&self, _spans: Vec<Span>) -> Result<(), CollectorError> {
            Ok(())
        }
    }

    struct Fixture {
        aggregator: Arc<Aggregator>,
        service: TransactionService,
        registry: Arc<TransactionRegistry>,
        clock: Arc<ManualClock>,
        collector: Arc<GatedCollector>,
        gate: Arc<Semaphore>,
    }

    fn fixture(open_permits: usize) -> Fixture {
        let config = Arc::new(ConfigService::new(AdvancedConfig {
            aggregate_interval_millis: 100,
            capture_thread_stats: false,
            ..AdvancedConfig::default()
        }));
        let clock = Arc::new(ManualClock::new(1));
        let registry = Arc::new(TransactionRegistry::new());
        let gate = Arc::new(Semaphore::new(open_permits));
        let collector = Arc::new(GatedCollector {
            readers: Mutex::new(Vec::new()),
            gate: gate.clone(),
        });
        let aggregator = Arc::new(Aggregator::start(
            collector.clone(),
            registry.clone(),
            config.clone(),
            clock.clone(),
        ));
        let service = TransactionService::new(
            &config,
            registry.clone(),
            aggregator.clone(),
            clock.clone(),
            Arc::new(ManualTicker::new(0)),
        );
        Fixture {
            aggregator,
            service,
            registry,
            clock,
            collector,
            gate,
        }
    }

    fn run_transaction(fixture: &Fixture, name: &str) -> Arc<Transaction> {
        let context = fixture.service.start_transaction(
            "Web",
            name,
            MessageSupplier::from_text(name),
            TimerName::new("http request"),
        );
        let transaction = Arc::clone(context.transaction());
        context.end();
        transaction
    }

    fn capture_times(collectors: &[Arc<AggregateIntervalCollector>]) -> Vec<i64> {
        collectors.iter().map(|c| c.capture_time()).collect()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_interval_end() {
        assert_eq!(interval_end(50, 100), 100);
        assert_eq!(interval_end(100, 100), 100);
        assert_eq!(interval_end(101, 100), 200);
        assert_eq!(interval_end(0, 100), 0);
        assert_eq!(interval_end(61_234, 60_000), 120_000);
    }

    #[test]
    fn test_panic_message() {
        let panic = std::panic::catch_unwind(|| panic!("bad transaction")).expect_err("panics");
        assert_eq!(panic_message(panic.as_ref()), "bad transaction");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_transaction_backlog_drops_newest() {
        let fixture = fixture(Semaphore::MAX_PERMITS);
        // the processing task cannot run before this test yields
        let queued: Vec<Arc<Transaction>> = (0..TRANSACTION_PENDING_LIMIT)
            .map(|i| run_transaction(&fixture, &format!("/{i}")))
            .collect();
        assert_eq!(fixture.aggregator.dropped_transaction_count(), 0);
        let dropped = run_transaction(&fixture, "/overflow");

        assert_eq!(fixture.aggregator.dropped_transaction_count(), 1);
        assert_eq!(
            fixture.aggregator.pending_transaction_count(),
            TRANSACTION_PENDING_LIMIT
        );
        assert!(!fixture.registry.contains(&dropped));
        assert!(queued.iter().all(|t| fixture.registry.contains(t)));
        assert_eq!(fixture.registry.len(), TRANSACTION_PENDING_LIMIT);
        assert!(logs_contain("excessive backlog of 1000 transactions"));

        fixture.aggregator.close().await.expect("close");
        assert!(fixture.registry.is_empty());
        let readers = fixture.collector.readers.lock().expect("lock").clone();
        assert_eq!(readers.len(), 1);
        assert_eq!(readers[0].capture_time(), 100);
    }

    #[tokio::test]
    async fn test_aggregate_backlog_drops_interval() {
        let fixture = fixture(0);
        for i in 0..7 {
            fixture.clock.set(i * 100 + 50);
            run_transaction(&fixture, "/orders");
        }
        let aggregator = fixture.aggregator.clone();
        wait_until(|| aggregator.pending_transaction_count() == 0).await;
        wait_until(|| aggregator.dropped_aggregate_count() == 1).await;
        assert_eq!(
            aggregator.active_interval_collector().capture_time(),
            700
        );

        fixture.gate.add_permits(100);
        aggregator.close().await.expect("close");
        let capture_times: Vec<i64> = fixture
            .collector
            .readers
            .lock()
            .expect("lock")
            .iter()
            .map(AggregateReader::capture_time)
            .collect();
        assert_eq!(capture_times, vec![100, 200, 300, 400, 500, 700]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_times_out_on_stuck_flush() {
        let fixture = fixture(0);
        run_transaction(&fixture, "/orders");

        let result = fixture.aggregator.close().await;
        assert!(matches!(
            result,
            Err(AggregatorError::ShutdownTimeout {
                executor: "flushing",
                ..
            })
        ));
        assert!(matches!(
            fixture.aggregator.close().await,
            Err(AggregatorError::Closed)
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_add_after_close_is_dropped() {
        let fixture = fixture(10);
        fixture.aggregator.close().await.expect("close");
        let late = run_transaction(&fixture, "/late");
        assert!(!fixture.registry.contains(&late));
        assert!(fixture.registry.is_empty());
        assert_eq!(fixture.aggregator.pending_transaction_count(), 0);
        assert_eq!(fixture.aggregator.dropped_transaction_count(), 1);
        assert!(logs_contain("aggregator has been shut down"));
        assert!(fixture.collector.readers.lock().expect("lock").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_with_concurrent_producers_strands_nothing() {
        for _ in 0..50 {
            let fixture = Arc::new(fixture(Semaphore::MAX_PERMITS));
            let stop = Arc::new(AtomicBool::new(false));
            let producers: Vec<_> = (0..3)
                .map(|producer| {
                    let fixture = Arc::clone(&fixture);
                    let stop = Arc::clone(&stop);
                    std::thread::spawn(move || {
                        let mut completed = 0_u64;
                        while !stop.load(Ordering::Acquire) {
                            run_transaction(&fixture, &format!("/{producer}"));
                            completed += 1;
                        }
                        completed
                    })
                })
                .collect();
            tokio::time::sleep(Duration::from_millis(2)).await;
            fixture.aggregator.close().await.expect("close");
            stop.store(true, Ordering::Release);
            let completed: u64 = producers
                .into_iter()
                .map(|p| p.join().expect("producer"))
                .sum();

            let aggregator = &fixture.aggregator;
            assert_eq!(aggregator.pending_transaction_count(), 0);
            assert!(fixture.registry.is_empty());
            let consumed = aggregator
                .shared
                .consumed_capture_times
                .lock()
                .expect("lock")
                .len();
            assert_eq!(
                u64::try_from(consumed).expect("fits") + aggregator.dropped_transaction_count(),
                completed
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_adds_are_consumed_in_capture_time_order() {
        let fixture = fixture(Semaphore::MAX_PERMITS);
        std::thread::scope(|scope| {
            for producer in 0..4 {
                let fixture = &fixture;
                scope.spawn(move || {
                    for i in 0..200 {
                        fixture.clock.advance(1);
                        run_transaction(fixture, &format!("/{producer}/{i}"));
                    }
                });
            }
        });
        fixture.aggregator.close().await.expect("close");

        assert_eq!(fixture.aggregator.dropped_transaction_count(), 0);
        let consumed = fixture
            .aggregator
            .shared
            .consumed_capture_times
            .lock()
            .expect("lock")
            .clone();
        assert_eq!(consumed.len(), 800);
        assert!(
            consumed.windows(2).all(|pair| pair[0] <= pair[1]),
            "consumed out of order: {consumed:?}"
        );
        assert_eq!(consumed.last().copied(), Some(801));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_range_reads_see_every_interval_during_rollover() {
        for _ in 0..20 {
            let fixture = fixture(0);
            let stop = AtomicBool::new(false);
            let gaps = std::thread::scope(|scope| {
                let reader = scope.spawn(|| {
                    let mut gaps = Vec::new();
                    while !stop.load(Ordering::Acquire) {
                        let seen = capture_times(
                            &fixture
                                .aggregator
                                .get_ordered_interval_collectors_in_range(0, i64::MAX),
                        );
                        // every interval gets a transaction and none is flushed,
                        // so the result must be contiguous from the first one
                        let expected: Vec<i64> =
                            (1_i64..).map(|i| i * 100).take(seen.len()).collect();
                        if seen != expected {
                            gaps.push(seen);
                        }
                    }
                    gaps
                });
                for i in 0..5 {
                    fixture.clock.set(i * 100 + 50);
                    run_transaction(&fixture, "/orders");
                    std::thread::sleep(Duration::from_millis(1));
                }
                while fixture.aggregator.pending_transaction_count() > 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
                stop.store(true, Ordering::Release);
                reader.join().expect("reader")
            });
            assert!(gaps.is_empty(), "intervals missing from range reads: {gaps:?}");

            fixture.gate.add_permits(10);
            fixture.aggregator.close().await.expect("close");
        }
    }
}
