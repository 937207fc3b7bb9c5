//! Crate-wide constants.
//!
//! Centralizes the defaults that configuration falls back to, grouped by
//! concern.

use std::time::Duration;

// ============================================================================
// Reconnection
// ============================================================================

/// Reconnection attempts allowed after an unclean close before an endpoint
/// is given up on.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Delay before the first reconnection attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for exponential backoff between attempts.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

// ============================================================================
// Endpoints
// ============================================================================

/// Origin used when neither the config file nor the environment names one.
pub const DEFAULT_ORIGIN: &str = "http://localhost:8000";

// ============================================================================
// CLI
// ============================================================================

/// How long `sockmux send` waits for the socket to open.
pub const SEND_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while `sockmux send` waits for the socket to open.
pub const SEND_OPEN_POLL_INTERVAL: Duration = Duration::from_millis(50);
