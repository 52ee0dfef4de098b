// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dynamic agent configuration.
//!
//! [`ConfigService`] publishes the current [`AdvancedConfig`] and notifies
//! registered [`ConfigListener`]s on every update. Listeners are expected to
//! copy the values they need into their own caches (see [`CachedLimits`]) so
//! that hot paths never take a lock to read configuration.

use serde::Deserialize;
use slab::Slab;
use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::debug;

use crate::errors::ConfigError;

const ENV_PREFIX: &str = "TXN_AGENT_";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    /// width of every aggregation interval, in milliseconds
    pub aggregate_interval_millis: u64,
    pub max_trace_entries_per_transaction: usize,
    pub max_query_aggregates: usize,
    pub max_service_call_aggregates: usize,
    /// distinct transaction names per type before names fold into the limit exceeded bucket
    pub max_transaction_aggregates: usize,
    pub max_profile_samples_per_transaction: usize,
    pub max_aux_thread_contexts_per_transaction: usize,
    pub capture_thread_stats: bool,
    /// trace entries slower than this capture a location stack trace
    pub trace_entry_stack_threshold_millis: Option<u64>,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            aggregate_interval_millis: 60_000,
            max_trace_entries_per_transaction: 2000,
            max_query_aggregates: 500,
            max_service_call_aggregates: 500,
            max_transaction_aggregates: 500,
            max_profile_samples_per_transaction: 50_000,
            max_aux_thread_contexts_per_transaction: 2000,
            capture_thread_stats: true,
            trace_entry_stack_threshold_millis: None,
        }
    }
}

impl AdvancedConfig {
    /// Builds a config from `TXN_AGENT_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<AdvancedConfig, ConfigError> {
        let defaults = AdvancedConfig::default();
        let config = AdvancedConfig {
            aggregate_interval_millis: env_or(
                "TXN_AGENT_AGGREGATE_INTERVAL_MILLIS",
                defaults.aggregate_interval_millis,
            )?,
            max_trace_entries_per_transaction: env_or(
                "TXN_AGENT_MAX_TRACE_ENTRIES_PER_TRANSACTION",
                defaults.max_trace_entries_per_transaction,
            )?,
            max_query_aggregates: env_or(
                "TXN_AGENT_MAX_QUERY_AGGREGATES",
                defaults.max_query_aggregates,
            )?,
            max_service_call_aggregates: env_or(
                "TXN_AGENT_MAX_SERVICE_CALL_AGGREGATES",
                defaults.max_service_call_aggregates,
            )?,
            max_transaction_aggregates: env_or(
                "TXN_AGENT_MAX_TRANSACTION_AGGREGATES",
                defaults.max_transaction_aggregates,
            )?,
            max_profile_samples_per_transaction: env_or(
                "TXN_AGENT_MAX_PROFILE_SAMPLES_PER_TRANSACTION",
                defaults.max_profile_samples_per_transaction,
            )?,
            max_aux_thread_contexts_per_transaction: env_or(
                "TXN_AGENT_MAX_AUX_THREAD_CONTEXTS_PER_TRANSACTION",
                defaults.max_aux_thread_contexts_per_transaction,
            )?,
            capture_thread_stats: env_or(
                "TXN_AGENT_CAPTURE_THREAD_STATS",
                defaults.capture_thread_stats,
            )?,
            trace_entry_stack_threshold_millis: match env::var(
                "TXN_AGENT_TRACE_ENTRY_STACK_THRESHOLD_MILLIS",
            ) {
                Ok(value) => Some(parse_value(
                    "TXN_AGENT_TRACE_ENTRY_STACK_THRESHOLD_MILLIS",
                    &value,
                )?),
                Err(_) => None,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregate_interval_millis == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    debug_assert!(name.starts_with(ENV_PREFIX));
    match env::var(name) {
        Ok(value) => parse_value(name, &value),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        })
}

/// Receives a callback whenever the published configuration changes.
pub trait ConfigListener: Send + Sync {
    fn on_change(&self, config: &AdvancedConfig);
}

struct ListenerSet {
    listeners: Mutex<Slab<Arc<dyn ConfigListener>>>,
}

/// Scope-bound listener registration; dropping it unregisters the listener.
#[must_use = "dropping the registration unregisters the listener"]
pub struct ListenerRegistration {
    key: usize,
    set: Weak<ListenerSet>,
}

impl ListenerRegistration {
    pub fn unregister(self) {
        // Drop does the work
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            #[allow(clippy::expect_used)]
            let mut listeners = set.listeners.lock().expect("lock poisoned");
            if listeners.contains(self.key) {
                listeners.remove(self.key);
            }
        }
    }
}

pub struct ConfigService {
    current: RwLock<Arc<AdvancedConfig>>,
    listeners: Arc<ListenerSet>,
}

impl ConfigService {
    #[must_use]
    pub fn new(config: AdvancedConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            listeners: Arc::new(ListenerSet {
                listeners: Mutex::new(Slab::new()),
            }),
        }
    }

    #[must_use]
    pub fn advanced_config(&self) -> Arc<AdvancedConfig> {
        #[allow(clippy::expect_used)]
        let current = self.current.read().expect("lock poisoned");
        Arc::clone(&current)
    }

    /// Registers a listener and immediately invokes it with the current config.
    pub fn add_listener(&self, listener: Arc<dyn ConfigListener>) -> ListenerRegistration {
        listener.on_change(&self.advanced_config());
        #[allow(clippy::expect_used)]
        let key = self
            .listeners
            .listeners
            .lock()
            .expect("lock poisoned")
            .insert(listener);
        ListenerRegistration {
            key,
            set: Arc::downgrade(&self.listeners),
        }
    }

    pub fn update(&self, config: AdvancedConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        {
            #[allow(clippy::expect_used)]
            let mut current = self.current.write().expect("lock poisoned");
            *current = Arc::clone(&config);
        }
        // listeners are cloned out so a listener may register or unregister from its callback
        let listeners: Vec<Arc<dyn ConfigListener>> = {
            #[allow(clippy::expect_used)]
            let guard = self.listeners.listeners.lock().expect("lock poisoned");
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        debug!("Notifying {} config listeners", listeners.len());
        for listener in listeners {
            listener.on_change(&config);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        let count = self.listeners.listeners.lock().expect("lock poisoned").len();
        count
    }
}

/// Lock-free cache of the limits read on the transaction hot path.
#[derive(Debug)]
pub struct CachedLimits {
    max_trace_entries: AtomicUsize,
    max_aux_thread_contexts: AtomicUsize,
    max_profile_samples: AtomicUsize,
    max_query_aggregates: AtomicUsize,
    max_service_call_aggregates: AtomicUsize,
    capture_thread_stats: AtomicBool,
    stack_threshold_nanos: AtomicU64,
}

impl CachedLimits {
    #[must_use]
    pub fn new(config: &AdvancedConfig) -> Self {
        let limits = Self {
            max_trace_entries: AtomicUsize::new(0),
            max_aux_thread_contexts: AtomicUsize::new(0),
            max_profile_samples: AtomicUsize::new(0),
            max_query_aggregates: AtomicUsize::new(0),
            max_service_call_aggregates: AtomicUsize::new(0),
            capture_thread_stats: AtomicBool::new(false),
            stack_threshold_nanos: AtomicU64::new(u64::MAX),
        };
        limits.on_change(config);
        limits
    }

    pub fn snapshot(&self) -> TransactionLimits {
        let stack_threshold_nanos = self.stack_threshold_nanos.load(Ordering::Acquire);
        TransactionLimits {
            max_trace_entries: self.max_trace_entries.load(Ordering::Acquire),
            max_aux_thread_contexts: self.max_aux_thread_contexts.load(Ordering::Acquire),
            max_profile_samples: self.max_profile_samples.load(Ordering::Acquire),
            max_query_aggregates: self.max_query_aggregates.load(Ordering::Acquire),
            max_service_call_aggregates: self
                .max_service_call_aggregates
                .load(Ordering::Acquire),
            capture_thread_stats: self.capture_thread_stats.load(Ordering::Acquire),
            stack_threshold_nanos: (stack_threshold_nanos != u64::MAX)
                .then_some(stack_threshold_nanos),
        }
    }
}

impl ConfigListener for CachedLimits {
    fn on_change(&self, config: &AdvancedConfig) {
        self.max_trace_entries
            .store(config.max_trace_entries_per_transaction, Ordering::Release);
        self.max_aux_thread_contexts.store(
            config.max_aux_thread_contexts_per_transaction,
            Ordering::Release,
        );
        self.max_profile_samples
            .store(config.max_profile_samples_per_transaction, Ordering::Release);
        self.max_query_aggregates
            .store(config.max_query_aggregates, Ordering::Release);
        self.max_service_call_aggregates
            .store(config.max_service_call_aggregates, Ordering::Release);
        self.capture_thread_stats
            .store(config.capture_thread_stats, Ordering::Release);
        let threshold = config
            .trace_entry_stack_threshold_millis
            .map_or(u64::MAX, |millis| millis.saturating_mul(1_000_000));
        self.stack_threshold_nanos
            .store(threshold, Ordering::Release);
    }
}

/// Limits fixed for the lifetime of one transaction, taken when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionLimits {
    pub max_trace_entries: usize,
    pub max_aux_thread_contexts: usize,
    pub max_profile_samples: usize,
    pub max_query_aggregates: usize,
    pub max_service_call_aggregates: usize,
    pub capture_thread_stats: bool,
    pub stack_threshold_nanos: Option<u64>,
}

impl Default for TransactionLimits {
    fn default() -> Self {
        CachedLimits::new(&AdvancedConfig::default()).snapshot()
    }
}
