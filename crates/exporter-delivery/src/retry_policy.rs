//! Classification of failed sends.
//!
//! | outcome | class |
//! |---|---|
//! | no response (refused, reset, timeout, DNS, other) | retryable |
//! | 5xx, 429 | retryable |
//! | 400, 401, 403, 404 | non-retryable, never spooled |
//! | 409 | conflict: already recorded, counts as success |
//! | anything else | unclassified: not retried in-process, spooled |

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::error::SendError;

/// Network failures, 5xx and 429.
pub fn is_retryable(err: &SendError) -> bool {
    match err {
        SendError::Network { .. } => true,
        SendError::Http { status, .. } => *status == 429 || (500..=599).contains(status),
    }
}

/// Exactly 400, 401, 403 and 404.
pub fn is_non_retryable(err: &SendError) -> bool {
    err.status().is_some_and(is_non_retryable_status)
}

pub fn is_non_retryable_status(status: u16) -> bool {
    matches!(status, 400 | 401 | 403 | 404)
}

/// Exactly 409. The partner API has already recorded this batch.
pub fn is_conflict(err: &SendError) -> bool {
    err.status() == Some(409)
}

/// Server-requested delay carried by the error.
pub fn retry_after(err: &SendError) -> Option<Duration> {
    match err {
        SendError::Http { retry_after, .. } => *retry_after,
        SendError::Network { .. } => None,
    }
}

/// Parse a `Retry-After` header given in whole seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
