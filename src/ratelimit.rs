// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Per-API-key sliding-window admission.
//
// Each key owns a bucket of recent admission instants. A caller is
// admitted when fewer than `count` admissions fall inside the trailing
// window; otherwise it sleeps until the oldest admission ages out and
// re-checks. Suspension is cancelled by dropping the future, which is
// exactly what happens when the client disconnects mid-wait.

use axum::http::{header, HeaderMap};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub struct RateLimiter {
    count: usize,
    window: Duration,
    buckets: DashMap<String, Arc<Bucket>>,
}

struct Bucket {
    admissions: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(count: usize, window: Duration) -> Self {
        Self {
            // A zero limit would deadlock every waiter.
            count: count.max(1),
            window,
            buckets: DashMap::new(),
        }
    }

    /// Suspend until the key may be admitted, then record the admission.
    pub async fn wait(&self, key: &str) {
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Bucket {
                    admissions: Mutex::new(VecDeque::new()),
                })
            })
            .clone();

        loop {
            let deadline = {
                let mut admissions = bucket.admissions.lock().unwrap();
                let now = Instant::now();
                while admissions
                    .front()
                    .is_some_and(|&oldest| now.duration_since(oldest) >= self.window)
                {
                    admissions.pop_front();
                }
                if admissions.len() < self.count {
                    admissions.push_back(now);
                    return;
                }
                // Full: wake when the oldest admission leaves the window.
                match admissions.front() {
                    Some(&oldest) => oldest + self.window,
                    None => now,
                }
            };
            tokio::time::sleep_until(deadline).await;
        }
    }

    /// Drop buckets whose newest admission has aged out of the window.
    pub fn prune_idle(&self) {
        self.buckets.retain(|_, bucket| {
            let admissions = bucket.admissions.lock().unwrap();
            admissions
                .back()
                .is_some_and(|&newest| newest.elapsed() < self.window)
        });
    }

    /// Number of live buckets (for tests and observability).
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// The rate-limit key for a request: `X-Goog-Api-Key`, else the bearer
/// token from `Authorization`.
pub fn api_key_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers
        .get("x-goog-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return Some(key.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
