//! Environment-backed tuning for room controllers.

use std::{env, fmt::Display, str::FromStr, time::Duration};

use roomline_core::{EventLog, ProjectionConfig};
use thiserror::Error;

const DEFAULT_INITIAL_LOAD_LIMIT: u32 = 40;
const DEFAULT_PAGE_SIZE: u16 = 50;
const DEFAULT_PAGINATION_LIMIT_CAP: u16 = 100;
const DEFAULT_FALLBACK_TIMEOUT_MS: u64 = 1_500;
const DEFAULT_THUMBNAIL_SIZE_PX: u32 = 320;
const DEFAULT_TYPING_IDLE_MS: u64 = 4_000;
const DEFAULT_THREAD_PAGE_LIMIT: u16 = 60;

/// Runtime tuning shared by every conversation a hub opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Items requested from `load_recent` when a room opens.
    pub initial_load_limit: u32,
    /// Items requested per back-pagination.
    pub page_size: u16,
    /// Upper bound applied to `page_size`.
    pub pagination_limit_cap: u16,
    /// How long pagination may go without growing the log before the
    /// controller falls back to a fresh snapshot.
    pub fallback_timeout: Duration,
    pub reaction_window: usize,
    pub thumbnail_window: usize,
    pub thread_window: usize,
    /// Edge length of requested (square, cropped) thumbnails.
    pub thumbnail_size_px: u32,
    /// Idle time after the last keystroke before typing is cleared.
    pub typing_idle: Duration,
    /// Replies requested per thread page.
    pub thread_page_limit: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let windows = ProjectionConfig::default();
        Self {
            initial_load_limit: DEFAULT_INITIAL_LOAD_LIMIT,
            page_size: DEFAULT_PAGE_SIZE,
            pagination_limit_cap: DEFAULT_PAGINATION_LIMIT_CAP,
            fallback_timeout: Duration::from_millis(DEFAULT_FALLBACK_TIMEOUT_MS),
            reaction_window: windows.reaction_window,
            thumbnail_window: windows.thumbnail_window,
            thread_window: windows.thread_window,
            thumbnail_size_px: DEFAULT_THUMBNAIL_SIZE_PX,
            typing_idle: Duration::from_millis(DEFAULT_TYPING_IDLE_MS),
            thread_page_limit: DEFAULT_THREAD_PAGE_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Parse configuration from `ROOMLINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let windows = ProjectionConfig::default();
        let initial_load_limit = parse_positive(
            "ROOMLINE_INITIAL_LOAD_LIMIT",
            DEFAULT_INITIAL_LOAD_LIMIT,
            &mut lookup,
        )?;
        let page_size = parse_positive("ROOMLINE_PAGE_SIZE", DEFAULT_PAGE_SIZE, &mut lookup)?;
        let pagination_limit_cap = parse_positive(
            "ROOMLINE_PAGINATION_LIMIT_CAP",
            DEFAULT_PAGINATION_LIMIT_CAP,
            &mut lookup,
        )?;
        let fallback_timeout_ms = parse_positive(
            "ROOMLINE_FALLBACK_TIMEOUT_MS",
            DEFAULT_FALLBACK_TIMEOUT_MS,
            &mut lookup,
        )?;
        let reaction_window = parse_optional(
            "ROOMLINE_REACTION_WINDOW",
            windows.reaction_window,
            &mut lookup,
        )?;
        let thumbnail_window = parse_optional(
            "ROOMLINE_THUMBNAIL_WINDOW",
            windows.thumbnail_window,
            &mut lookup,
        )?;
        let thread_window = parse_optional(
            "ROOMLINE_THREAD_WINDOW",
            windows.thread_window,
            &mut lookup,
        )?;
        let thumbnail_size_px = parse_positive(
            "ROOMLINE_THUMBNAIL_SIZE_PX",
            DEFAULT_THUMBNAIL_SIZE_PX,
            &mut lookup,
        )?;
        let typing_idle_ms = parse_positive(
            "ROOMLINE_TYPING_IDLE_MS",
            DEFAULT_TYPING_IDLE_MS,
            &mut lookup,
        )?;
        let thread_page_limit = parse_positive(
            "ROOMLINE_THREAD_PAGE_LIMIT",
            DEFAULT_THREAD_PAGE_LIMIT,
            &mut lookup,
        )?;

        Ok(Self {
            initial_load_limit,
            page_size,
            pagination_limit_cap,
            fallback_timeout: Duration::from_millis(fallback_timeout_ms),
            reaction_window,
            thumbnail_window,
            thread_window,
            thumbnail_size_px,
            typing_idle: Duration::from_millis(typing_idle_ms),
            thread_page_limit,
        })
    }

    /// Page size after applying the pagination cap.
    pub fn effective_page_size(&self) -> u16 {
        EventLog::bounded_paginate_limit(self.page_size, self.pagination_limit_cap)
    }

    pub fn projection(&self) -> ProjectionConfig {
        ProjectionConfig {
            reaction_window: self.reaction_window,
            thumbnail_window: self.thumbnail_window,
            thread_window: self.thread_window,
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn parse_optional<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<T>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_positive<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq + Display,
    T::Err: Display,
    F: FnMut(&str) -> Option<String>,
{
    let parsed = parse_optional(key, default, lookup)?;
    if parsed == T::default() {
        return Err(ConfigError::InvalidValue {
            key,
            value: parsed.to_string(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(parsed)
}
