// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log formatting for agent diagnostics.
//!
//! Every line is prefixed with `TXN_AGENT` so agent output can be told apart
//! from the host application's own logs:
//!
//! ```text
//! TXN_AGENT | WARN | not aggregating a transaction because of an excessive backlog
//! TXN_AGENT | ERROR | aggregate_flush{capture_time=60000}: Failed to flush aggregates
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "TXN_AGENT | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the agent formatter as the global subscriber.
///
/// `directives` uses `EnvFilter` syntax, e.g. `"info"` or `"txn_agent_core=debug"`.
/// Returns `false` if a global subscriber was already installed.
pub fn init(directives: &str) -> bool {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(directives))
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}
