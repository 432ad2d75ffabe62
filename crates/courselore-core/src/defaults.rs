//! Centralized default constants for Courselore.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration structs read these when the corresponding environment
//! variable is absent.

// =============================================================================
// MESSAGES
// =============================================================================

/// Window in which a chat post by the same author is appended to the
/// previous message instead of creating a new one.
pub const CHAT_MERGE_WINDOW_SECS: i64 = 5 * 60;

/// Separator inserted between the previous content and an appended chat post.
pub const CHAT_MERGE_SEPARATOR: &str = "\n\n";

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Delay before a notification job becomes eligible. Edits to the same message
/// inside this window coalesce into the one pending job.
pub const NOTIFICATION_JOB_DELAY_SECS: i64 = 5 * 60;

/// Lifetime of a notification job after its start time.
pub const NOTIFICATION_JOB_EXPIRY_SECS: i64 = 5 * 60 * 60;

/// Lifetime of an outbound email job after its start time.
pub const SEND_EMAIL_JOB_EXPIRY_SECS: i64 = 20 * 60;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// A claimed job whose `started_at` is older than this is released for retry.
pub const JOB_CLAIM_TIMEOUT_SECS: i64 = 2 * 60;

/// Pause between two processed jobs in one drain.
pub const JOB_THROTTLE_MS: u64 = 100;

/// Sleep after a drain finds nothing to do (cut short by a wake signal).
pub const JOB_IDLE_INTERVAL_MS: u64 = 2 * 60 * 1000;

// =============================================================================
// LIVE UPDATES
// =============================================================================

/// Debounce window before a refresh is fanned out to open connections.
pub const LIVE_UPDATE_DEBOUNCE_MS: u64 = 1000;

/// SSE keep-alive interval in seconds.
pub const LIVE_UPDATE_KEEPALIVE_SECS: u64 = 15;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 4000;

/// Default database location.
pub const DATABASE_URL: &str = "sqlite://courselore.db";

/// Default public base URL used in email links.
pub const BASE_URL: &str = "http://localhost:4000";

/// Default sender address for outbound mail.
pub const MAIL_FROM: &str = "Courselore <notifications@courselore.org>";

/// Default SMTP port.
pub const SMTP_PORT: u16 = 587;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_timing_is_ordered() {
        assert!(JOB_CLAIM_TIMEOUT_SECS < NOTIFICATION_JOB_EXPIRY_SECS);
        assert!(NOTIFICATION_JOB_DELAY_SECS < NOTIFICATION_JOB_EXPIRY_SECS);
        assert!((JOB_THROTTLE_MS as i64) < JOB_CLAIM_TIMEOUT_SECS * 1000);
    }

    #[test]
    fn test_chat_merge_window_is_five_minutes() {
        assert_eq!(CHAT_MERGE_WINDOW_SECS, 300);
    }
}
