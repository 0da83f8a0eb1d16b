//! Application-wide constants for chatrelay.
//!
//! Centralizes the defaults and tuning values used by the relay and the
//! client session.

use std::time::Duration;

// ============================================================================
// Admission & Limits
// ============================================================================

/// Default number of routing slots (concurrent sessions).
///
/// Two slots model two independent display destinations.
pub const DEFAULT_SLOTS: usize = 2;

/// Default time a new connection may take to send its identity frame.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the configured slot count.
pub const MAX_SLOTS: usize = 1024;

/// Default largest frame payload the relay accepts (16 MB).
pub const DEFAULT_MAX_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Default number of outgoing frames queued per client. A client whose
/// queue fills up has stopped reading and is disconnected.
pub const DEFAULT_WRITE_QUEUE_FRAMES: usize = 256;

// ============================================================================
// Relay Loop
// ============================================================================

/// Back-off after a failed `accept()` before the loop retries.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Configuration
// ============================================================================

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "config.txt";

/// Environment variable overriding the listen/connect host.
pub const ENV_HOST: &str = "CHATRELAY_HOST";

/// Environment variable overriding the TCP port.
pub const ENV_PORT: &str = "CHATRELAY_PORT";

/// Environment variable overriding the slot count.
pub const ENV_SLOTS: &str = "CHATRELAY_SLOTS";

/// Environment variable overriding the handshake timeout (seconds).
pub const ENV_HANDSHAKE_TIMEOUT: &str = "CHATRELAY_HANDSHAKE_TIMEOUT";

/// Environment variable redirecting log output to a file.
pub const ENV_LOG_FILE: &str = "CHATRELAY_LOG_FILE";
