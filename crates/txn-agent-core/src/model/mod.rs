// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod aggregate;
pub mod aggregate_timer;
pub mod histogram;
pub mod profile;
pub mod thread_stats;
pub mod timer;
pub mod top_n;
pub mod trace_entry;
