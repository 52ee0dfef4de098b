// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities for integration tests

#![allow(dead_code)]

pub mod helpers;
pub mod mocks;
