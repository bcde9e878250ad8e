//! Shared core abstractions for the relay dispatch substrate.
//!
//! This crate defines cross-crate contracts used by the queue, courier,
//! server, and worker crates: task/run records, status enums, the structured
//! quota error, the external-protocol (A2A) sum types, and the async traits
//! injected at process boundaries.
//!
//! # API notes
//! `relay-core` is an internal crate (`publish = false`). Its public API
//! uses a few third-party types (`uuid::Uuid`, `chrono::DateTime<Utc>`,
//! `serde_json::Value`) as part of the relay contract.

use std::fmt;

pub mod a2a;
pub mod runtime;
pub mod task;

pub use task::{
    ChannelState, NotificationChannel, NotificationStatus, TaskLimitExceeded, TaskRun,
    TaskRunStatus, WorkerIdentity,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    inner: anyhow::Error,
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            inner: anyhow::anyhow!(message.into()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self { inner: value }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self {
            inner: anyhow::Error::from(value),
        }
    }
}

/// Upper bound on persisted error text. Upstream agent failures can carry
/// multi-kilobyte tracebacks; everything stored in `last_error` or a
/// notification error column is clipped to this.
pub const MAX_ERROR_LEN: usize = 500;

/// Clip an error message to [`MAX_ERROR_LEN`] on a char boundary.
pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::truncate_error;

    #[test]
    fn truncate_error_keeps_short_messages() {
        assert_eq!(truncate_error("boom"), "boom");
    }

    #[test]
    fn truncate_error_clips_long_messages() {
        let long = "x".repeat(2048);
        assert_eq!(truncate_error(&long).len(), 500);
    }

    #[test]
    fn truncate_error_respects_char_boundaries() {
        let long = "é".repeat(400);
        let clipped = truncate_error(&long);
        assert!(clipped.len() <= 500);
        assert!(clipped.chars().all(|c| c == 'é'));
    }
}
