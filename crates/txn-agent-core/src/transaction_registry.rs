// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registry of active transactions.
//!
//! Adding returns a slab key which the transaction keeps, so removal is O(1)
//! and needs no search. Readers (e.g. a stack sampler) take a point-in-time
//! copy of the active set and never hold the lock while inspecting it.

use slab::Slab;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use crate::thread_context::ContextId;
use crate::transaction::Transaction;

/// One thread currently running a thread context of an active transaction.
#[derive(Debug, Clone)]
pub struct ActiveThreadContext {
    pub transaction: Arc<Transaction>,
    pub thread_id: ThreadId,
    pub thread_name: Option<String>,
    pub context_id: ContextId,
}

impl ActiveThreadContext {
    #[must_use]
    pub fn is_auxiliary(&self) -> bool {
        self.context_id != ContextId::MAIN
    }
}

#[derive(Debug, Default)]
pub struct TransactionRegistry {
    transactions: Mutex<Slab<Arc<Transaction>>>,
}

impl TransactionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, transaction: &Arc<Transaction>) {
        #[allow(clippy::expect_used)]
        let key = self
            .transactions
            .lock()
            .expect("lock poisoned")
            .insert(Arc::clone(transaction));
        transaction.set_registry_key(key);
    }

    pub fn remove(&self, transaction: &Transaction) {
        let Some(key) = transaction.registry_key() else {
            return;
        };
        #[allow(clippy::expect_used)]
        let mut transactions = self.transactions.lock().expect("lock poisoned");
        // the key may already have been reused by another transaction
        if transactions
            .get(key)
            .is_some_and(|registered| std::ptr::eq(registered.as_ref(), transaction))
        {
            transactions.remove(key);
        }
    }

    #[must_use]
    pub fn contains(&self, transaction: &Transaction) -> bool {
        let Some(key) = transaction.registry_key() else {
            return false;
        };
        #[allow(clippy::expect_used)]
        let transactions = self.transactions.lock().expect("lock poisoned");
        transactions
            .get(key)
            .is_some_and(|registered| std::ptr::eq(registered.as_ref(), transaction))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let len = self.transactions.lock().expect("lock poisoned").len();
        len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn transactions(&self) -> Vec<Arc<Transaction>> {
        #[allow(clippy::expect_used)]
        let transactions = self.transactions.lock().expect("lock poisoned");
        transactions.iter().map(|(_, t)| Arc::clone(t)).collect()
    }

    /// Every thread currently running on behalf of an active transaction.
    #[must_use]
    pub fn active_thread_contexts(&self) -> Vec<ActiveThreadContext> {
        self.transactions()
            .into_iter()
            .flat_map(|transaction| {
                transaction
                    .active_threads()
                    .into_iter()
                    .map(move |thread| ActiveThreadContext {
                        transaction: Arc::clone(&transaction),
                        thread_id: thread.thread_id,
                        thread_name: thread.thread_name,
                        context_id: thread.context_id,
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
