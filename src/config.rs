// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Env-driven configuration.
//
// Every option has a usable default so the proxy starts with no
// environment at all. Values that fail to parse fall back to the
// default rather than aborting startup.

use std::time::Duration;

/// Upstream used when no base URL is configured.
pub const DEFAULT_UPSTREAM_BASE: &str = "https://generativelanguage.googleapis.com";

/// Runtime configuration, loaded once at startup and shared via `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ordered list of upstream base URLs rotated over round-robin.
    /// Never empty: falls back to `DEFAULT_UPSTREAM_BASE`.
    pub upstream_bases: Vec<String>,
    /// Model identifier prefixes that enable the anti-truncation engine.
    pub antiblock_model_prefixes: Vec<String>,
    /// Retry budget shared across initial-call retries and continuations.
    pub max_consecutive_retries: u32,
    /// Fixed delay between retry attempts.
    pub retry_delay: Duration,
    /// Drop `thought: true` parts from forwarded events after the first retry.
    pub swallow_thoughts_after_retry: bool,
    pub enable_rate_limit: bool,
    pub rate_limit_count: usize,
    pub rate_limit_window: Duration,
    /// Accept a terminal-punctuation ending as completion when the
    /// upstream closes without an explicit terminal finish reason.
    pub enable_punctuation_heuristic: bool,
    pub debug_mode: bool,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_bases: vec![DEFAULT_UPSTREAM_BASE.to_string()],
            antiblock_model_prefixes: vec!["gemini-2.5-pro".to_string()],
            max_consecutive_retries: 100,
            retry_delay: Duration::from_millis(750),
            swallow_thoughts_after_retry: true,
            enable_rate_limit: false,
            rate_limit_count: 10,
            rate_limit_window: Duration::from_secs(60),
            enable_punctuation_heuristic: true,
            debug_mode: true,
            port: 8080,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// The lookup seam lets tests inject variables without mutating the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();

        let worker_url = string_var(&lookup, "UPSTREAM_WORKER_URL");
        let auth_token = string_var(&lookup, "UPSTREAM_AUTH_TOKEN");

        let mut upstream_bases = lookup("UPSTREAM_URL_BASE")
            .map(|raw| parse_base_list(&raw))
            .unwrap_or_default();
        if upstream_bases.is_empty() {
            if let Some(base) = worker_upstream(worker_url.as_deref(), auth_token.as_deref()) {
                upstream_bases.push(base);
            }
        }
        if upstream_bases.is_empty() {
            upstream_bases = defaults.upstream_bases.clone();
        }

        Self {
            upstream_bases,
            antiblock_model_prefixes: list_var(&lookup, "ANTIBLOCK_MODEL_PREFIXES")
                .unwrap_or(defaults.antiblock_model_prefixes),
            max_consecutive_retries: int_var(&lookup, "MAX_CONSECUTIVE_RETRIES")
                .unwrap_or(defaults.max_consecutive_retries),
            retry_delay: int_var(&lookup, "RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            swallow_thoughts_after_retry: bool_var(&lookup, "SWALLOW_THOUGHTS_AFTER_RETRY")
                .unwrap_or(defaults.swallow_thoughts_after_retry),
            enable_rate_limit: bool_var(&lookup, "ENABLE_RATE_LIMIT")
                .unwrap_or(defaults.enable_rate_limit),
            rate_limit_count: int_var(&lookup, "RATE_LIMIT_COUNT")
                .unwrap_or(defaults.rate_limit_count),
            rate_limit_window: int_var(&lookup, "RATE_LIMIT_WINDOW_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_window),
            enable_punctuation_heuristic: bool_var(&lookup, "ENABLE_PUNCTUATION_HEURISTIC")
                .unwrap_or(defaults.enable_punctuation_heuristic),
            debug_mode: bool_var(&lookup, "DEBUG_MODE").unwrap_or(defaults.debug_mode),
            port: int_var(&lookup, "PORT").unwrap_or(defaults.port),
        }
    }
}

/// Split a configured upstream list on commas, semicolons, or newlines.
fn parse_base_list(raw: &str) -> Vec<String> {
    raw.split(|c| c == ',' || c == ';' || c == '\n')
        .map(|s| s.trim().trim_end_matches('/'))
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Compose the worker-relay upstream base: `{worker}/{token}/gemini`.
fn worker_upstream(worker: Option<&str>, token: Option<&str>) -> Option<String> {
    let worker = worker?.trim_end_matches('/');
    let token = token?.trim_matches('/');
    if worker.is_empty() || token.is_empty() {
        return None;
    }
    Some(format!("{worker}/{token}/gemini"))
}

fn string_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn int_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    string_var(lookup, key).and_then(|v| v.parse().ok())
}

fn bool_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    string_var(lookup, key).and_then(|v| match v.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    })
}

fn list_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Vec<String>> {
    let raw = string_var(lookup, key)?;
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}
