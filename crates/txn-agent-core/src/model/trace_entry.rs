// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace entries: the retained detail of a thread context.

use serde::Serialize;
use std::error::Error;
use std::fmt;

use crate::model::timer::TimerId;

/// Lazily produces an entry's message. It is only invoked when a trace is
/// actually read, which keeps string formatting off the instrumented path.
pub struct MessageSupplier(Box<dyn Fn() -> String + Send + Sync>);

impl MessageSupplier {
    pub fn new<F>(supplier: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self(Box::new(supplier))
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self(Box::new(move || text.clone()))
    }

    #[must_use]
    pub fn get(&self) -> String {
        (self.0)()
    }
}

impl fmt::Debug for MessageSupplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageSupplier")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorMessage {
    pub message: String,
    /// Messages of the error's source chain, outermost first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl ErrorMessage {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            causes: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_error(error: &(dyn Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            causes,
        }
    }
}

/// Index of an entry inside its thread context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EntryId(pub(crate) u32);

impl EntryId {
    /// The entry that stands for the thread context itself.
    pub const ROOT: EntryId = EntryId(0);

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub(crate) struct TraceEntry {
    pub(crate) message: MessageSupplier,
    pub(crate) parent: Option<EntryId>,
    pub(crate) depth: u32,
    pub(crate) timer: TimerId,
    pub(crate) start_tick: u64,
    pub(crate) end_tick: Option<u64>,
    pub(crate) error: Option<ErrorMessage>,
    pub(crate) location_stack_trace: Option<String>,
}

impl TraceEntry {
    pub(crate) fn new(
        message: MessageSupplier,
        parent: Option<EntryId>,
        depth: u32,
        timer: TimerId,
        start_tick: u64,
    ) -> Self {
        Self {
            message,
            parent,
            depth,
            timer,
            start_tick,
            end_tick: None,
            error: None,
            location_stack_trace: None,
        }
    }

    pub(crate) fn snapshot(&self, context_start_tick: u64, now_tick: u64) -> TraceEntrySnapshot {
        let end_tick = self.end_tick.unwrap_or(now_tick);
        TraceEntrySnapshot {
            message: self.message.get(),
            depth: self.depth,
            start_offset_nanos: self.start_tick.saturating_sub(context_start_tick),
            duration_nanos: end_tick.saturating_sub(self.start_tick),
            active: self.end_tick.is_none(),
            error: self.error.clone(),
            location_stack_trace: self.location_stack_trace.clone(),
        }
    }
}

/// Read-only copy of one entry, with its message resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntrySnapshot {
    pub message: String,
    pub depth: u32,
    pub start_offset_nanos: u64,
    pub duration_nanos: u64,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_stack_trace: Option<String>,
}
