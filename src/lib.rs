//! event driven client side websocket protocol engine
//!
//! The engine implements RFC 6455 as a pure state machine: the
//! application (or an I/O layer built on top) owns sockets, TLS and
//! timers behind the [`Transport`] trait, feeds [`TransportEvent`]s in,
//! and receives protocol [`Event`]s out. [`WsContext`] ties connections,
//! the service loop and cross thread marshalling together.

#![warn(missing_docs)]

use std::time::Duration;

pub use http;

/// base context, service loop and cross thread handle
pub mod base;
/// connection state machine and protocol events
pub mod connection;
/// websocket error definitions
pub mod errors;
/// frame header codec and masking
pub mod frame;
/// opening handshake request/response handling
pub mod handshake;
/// token bucket rate limiting
pub mod limiter;
/// inbound frame parser state machine
pub mod parser;
/// the transport seam the engine drives
pub mod transport;
/// incremental utf-8 validation
pub mod utf8;

pub use base::{ConnId, EngineHandle, WsContext};
pub use connection::{ConnState, Connection, DeliveryMode, Event, SendToken, TimeoutKind};
pub use errors::{ProtocolError, WsError};
pub use transport::{TimerKind, TlsMode, Transport, TransportEvent};

/// per connection configuration
///
/// All knobs have working defaults: unlimited frame and message sizes,
/// no timeouts, no rate limits, buffered message delivery and automatic
/// pong replies.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// outbound fragmentation threshold in bytes, 0 means unlimited
    pub max_frame_size: u64,
    /// inbound per message cap in bytes, 0 means unlimited
    pub max_message_size: u64,
    /// TLS behavior for `wss://` endpoints
    pub tls: TlsMode,
    /// connect timeout, from `connect` to the transport reporting connected
    pub connect_timeout: Option<Duration>,
    /// inbound idle timeout while handshaking or open
    pub recv_timeout: Option<Duration>,
    /// time the outbound queue may stay non empty
    pub send_timeout: Option<Duration>,
    /// time an outstanding ping may stay unanswered
    pub pong_timeout: Option<Duration>,
    /// bound on the closing handshake before the transport is torn down
    pub close_grace: Duration,
    /// inbound bytes per second, 0 disables read limiting
    pub read_rate: u64,
    /// read bucket burst in bytes
    pub read_burst: u64,
    /// outbound bytes per second, 0 disables write limiting
    pub write_rate: u64,
    /// write bucket burst in bytes
    pub write_burst: u64,
    /// `Origin` header for the upgrade request
    pub origin: Option<String>,
    /// additional upgrade request headers
    pub extra_headers: Vec<(String, String)>,
    /// subprotocols to offer, in preference order
    pub subprotocols: Vec<String>,
    /// how inbound data is delivered
    pub delivery: connection::DeliveryMode,
    /// echo pings automatically
    pub auto_pong: bool,
    /// reject outbound text that is not valid utf-8
    pub validate_send_utf8: bool,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 0,
            max_message_size: 0,
            tls: TlsMode::Off,
            connect_timeout: None,
            recv_timeout: None,
            send_timeout: None,
            pong_timeout: None,
            close_grace: Duration::from_secs(10),
            read_rate: 0,
            read_burst: 0,
            write_rate: 0,
            write_burst: 0,
            origin: None,
            extra_headers: Vec::new(),
            subprotocols: Vec::new(),
            delivery: connection::DeliveryMode::Message,
            auto_pong: true,
            validate_send_utf8: true,
        }
    }
}

impl WsConfig {
    /// create a config with defaults
    pub fn new() -> Self {
        Default::default()
    }

    /// set the outbound fragmentation threshold, 0 for unlimited
    pub fn max_frame_size(self, max_frame_size: u64) -> Self {
        Self {
            max_frame_size,
            ..self
        }
    }

    /// set the inbound per message cap, 0 for unlimited
    pub fn max_message_size(self, max_message_size: u64) -> Self {
        Self {
            max_message_size,
            ..self
        }
    }

    /// set TLS behavior for `wss://` endpoints
    pub fn tls(self, tls: TlsMode) -> Self {
        Self { tls, ..self }
    }

    /// set the connect timeout
    pub fn connect_timeout(self, timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(timeout),
            ..self
        }
    }

    /// set the inbound idle timeout
    pub fn recv_timeout(self, timeout: Duration) -> Self {
        Self {
            recv_timeout: Some(timeout),
            ..self
        }
    }

    /// set the outbound drain timeout
    pub fn send_timeout(self, timeout: Duration) -> Self {
        Self {
            send_timeout: Some(timeout),
            ..self
        }
    }

    /// set the pong timeout
    pub fn pong_timeout(self, timeout: Duration) -> Self {
        Self {
            pong_timeout: Some(timeout),
            ..self
        }
    }

    /// bound the closing handshake
    pub fn close_grace(self, close_grace: Duration) -> Self {
        Self {
            close_grace,
            ..self
        }
    }

    /// throttle inbound bytes
    pub fn read_rate_limit(self, rate: u64, burst: u64) -> Self {
        Self {
            read_rate: rate,
            read_burst: burst,
            ..self
        }
    }

    /// throttle outbound bytes
    pub fn write_rate_limit(self, rate: u64, burst: u64) -> Self {
        Self {
            write_rate: rate,
            write_burst: burst,
            ..self
        }
    }

    /// set the `Origin` request header
    pub fn origin(self, origin: String) -> Self {
        Self {
            origin: Some(origin),
            ..self
        }
    }

    /// add an upgrade request header
    pub fn header<K: ToString, V: ToString>(mut self, name: K, value: V) -> Self {
        self.extra_headers
            .push((name.to_string(), value.to_string()));
        self
    }

    /// set the upgrade request headers
    ///
    /// **NOTE** it will clear headers set by previous `header` calls
    pub fn headers(self, extra_headers: Vec<(String, String)>) -> Self {
        Self {
            extra_headers,
            ..self
        }
    }

    /// offer a subprotocol
    pub fn subprotocol(mut self, protocol: String) -> Self {
        self.subprotocols.push(protocol);
        self
    }

    /// set the offered subprotocols
    ///
    /// **NOTE** it will clear protocols set by `subprotocol` calls
    pub fn subprotocols(self, subprotocols: Vec<String>) -> Self {
        Self {
            subprotocols,
            ..self
        }
    }

    /// pick how inbound data is delivered
    pub fn delivery(self, delivery: connection::DeliveryMode) -> Self {
        Self { delivery, ..self }
    }

    /// enable or disable automatic pong replies
    pub fn auto_pong(self, auto_pong: bool) -> Self {
        Self { auto_pong, ..self }
    }

    /// enable or disable outbound text validation
    pub fn validate_send_utf8(self, validate_send_utf8: bool) -> Self {
        Self {
            validate_send_utf8,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates() {
        let config = WsConfig::new()
            .max_frame_size(1024)
            .subprotocol("chat".to_string())
            .subprotocol("superchat".to_string())
            .header("X-Auth", "token")
            .origin("http://a.example".to_string());
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.subprotocols, vec!["chat", "superchat"]);
        assert_eq!(config.extra_headers.len(), 1);
        assert_eq!(config.origin.as_deref(), Some("http://a.example"));
    }
}
