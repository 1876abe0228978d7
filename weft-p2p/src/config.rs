//! Peer configuration.

use std::time::Duration;

/// Version of the base wire protocol spoken in hello messages.
pub const PROTOCOL_VERSION: u32 = 1;

/// Number of message codes reserved for the base protocol.
///
/// Subprotocol code windows are allocated contiguously above this value.
/// Only codes 0..=5 are assigned today; the rest is headroom.
pub const BASE_PROTOCOL_LENGTH: u64 = 16;

/// Payloads at or below this size are buffered whole by the framer before
/// being handed to the dispatcher. Larger payloads are streamed.
pub const WHOLE_PAYLOAD_SIZE: u32 = 8 * 1024;

/// Maximum size of a single message payload (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Default quiet period before the base protocol emits a ping.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(2);

/// Default pause between writing a disconnect reason and closing the
/// socket, giving the remote end a chance to read the reason.
pub const DISCONNECT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Default deadline for completing the handshake phases.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);

/// Configuration for a single peer connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Whether to run the encrypted channel handshake before the base
    /// protocol. Plaintext connections use the same frame format without
    /// encryption or authentication.
    pub encrypted: bool,

    /// Quiet period before the base protocol emits a ping. A missed pong
    /// within the same window disconnects the peer.
    pub inactivity_timeout: Duration,

    /// Pause between writing a disconnect reason and closing the socket.
    pub disconnect_grace_period: Duration,

    /// Deadline for the crypto handshake and for the remote hello.
    pub handshake_timeout: Duration,

    /// Payload size threshold below which the framer buffers whole
    /// messages. Exposed for tests; the default is right for production.
    pub whole_payload_size: u32,

    /// Maximum accepted payload size.
    pub max_message_size: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            encrypted: false,
            inactivity_timeout: INACTIVITY_TIMEOUT,
            disconnect_grace_period: DISCONNECT_GRACE_PERIOD,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            whole_payload_size: WHOLE_PAYLOAD_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl PeerConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the encrypted channel.
    pub fn with_encryption(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Set the inactivity timeout driving the keepalive ping.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Set the disconnect grace period.
    pub fn with_disconnect_grace_period(mut self, period: Duration) -> Self {
        self.disconnect_grace_period = period;
        self
    }

    /// Set the handshake deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the whole-payload buffering threshold.
    pub fn with_whole_payload_size(mut self, size: u32) -> Self {
        self.whole_payload_size = size;
        self
    }

    /// Set the maximum accepted payload size.
    pub fn with_max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PeerConfig::default();
        assert!(!config.encrypted);
        assert_eq!(config.inactivity_timeout, INACTIVITY_TIMEOUT);
        assert_eq!(config.whole_payload_size, WHOLE_PAYLOAD_SIZE);
    }

    #[test]
    fn test_config_builder() {
        let config = PeerConfig::new()
            .with_encryption(true)
            .with_inactivity_timeout(Duration::from_millis(100))
            .with_whole_payload_size(64);

        assert!(config.encrypted);
        assert_eq!(config.inactivity_timeout, Duration::from_millis(100));
        assert_eq!(config.whole_payload_size, 64);
    }
}
