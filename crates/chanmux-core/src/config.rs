//! Centralized configuration for chanmux.
//!
//! Protocol constants live on the unit structs below. Runtime-tunable values
//! have option structs next to the component that consumes them
//! (`MultiplexerOptions`, `BackoffConfig`, `ClientConnectionOptions`), whose
//! defaults come from here.

use std::time::Duration;

/// Channel and multiplexer constants.
pub struct ChannelConfig;

impl ChannelConfig {
    /// Idle period after which a heartbeat envelope is sent.
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
    /// Prefix of generated client ids (`CLIENT_ID_<uuid>`).
    pub const CLIENT_ID_PREFIX: &'static str = "CLIENT_ID_";
    /// Path of the channel that carries RPC traffic.
    pub const RPC_CHANNEL_PATH: &'static str = "RPCService";
    /// Registry token under which the client bootstrap publishes its multiplexer.
    pub const MULTIPLEXER_TOKEN: &'static str = "ChannelMultiplexer";
    /// Capacity of the connection event broadcast.
    pub const EVENT_BUFFER: usize = 64;
}

/// Transport constants.
pub struct TransportConfig;

impl TransportConfig {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);
    pub const MAX_SERVER_CONNECTIONS: usize = 64;

    // WebSocket-compatible close codes
    pub const NORMAL_CLOSE_CODE: u16 = 1000;
    pub const GOING_AWAY_CODE: u16 = 1001;
    pub const ABNORMAL_CLOSE_CODE: u16 = 1006;
}

/// RPC constants.
pub struct RpcConfig;

impl RpcConfig {
    pub const JSONRPC_VERSION: &'static str = "2.0";
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds_are_ordered() {
        assert!(TransportConfig::RECONNECT_BASE_DELAY < TransportConfig::RECONNECT_MAX_DELAY);
        assert!(ChannelConfig::HEARTBEAT_INTERVAL > Duration::ZERO);
    }
}
