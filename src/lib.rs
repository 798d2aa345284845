// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

pub mod config;
pub mod error;
pub mod logs;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod sentinel;
pub mod stream;
pub mod upstream;
