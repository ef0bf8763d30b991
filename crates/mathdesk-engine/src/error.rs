use std::path::PathBuf;

use thiserror::Error;

pub type TurnResult<T> = Result<T, TurnError>;

/// Errors surfaced by the turn controller.
///
/// Only `Config` is fatal; it is raised before a session starts. Everything
/// else is converted to a rendered message at the UI boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TurnError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("image upload failed: {0}")]
    Store(String),

    #[error("completion service error: {0}")]
    Service(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),

    #[error("session has ended")]
    Terminated,
}

/// Failure reported by an image store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unsupported image: {0}")]
    Unsupported(String),

    #[error("{store} upload failed ({status}): {body}")]
    Rejected {
        store: String,
        status: u16,
        body: String,
    },

    #[error("{store} upload request failed")]
    Transport {
        store: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed writing {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure reported by a completion service: the request could not be
/// delivered, the service answered with an error status, or the answer was
/// unusable.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{provider} request failed")]
    Transport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} request failed ({status}): {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} returned an unusable response: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing: &String| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
