use std::io;
use std::time::{Duration, Instant};

use bytes::BytesMut;

/// TLS behavior requested from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// plain TCP
    Off,
    /// TLS with certificate verification
    On,
    /// TLS accepting self signed certificates
    AllowSelfSigned,
}

/// engine owned timers, one slot per kind and connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// connect timeout
    Connect,
    /// inbound idle timeout
    Recv,
    /// outbound drain timeout
    Send,
    /// pong timeout
    Pong,
    /// bound on the closing handshake
    CloseGrace,
    /// resume a rate limited read
    ReadRate,
    /// resume a rate limited write
    WriteRate,
}

/// what the transport reports into the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// TCP (and TLS, when enabled) established
    Connected,
    /// buffered inbound bytes are ready for `read_available`
    BytesAvailable,
    /// the transport can accept more outbound bytes
    Writable,
    /// the peer or the transport closed the connection
    Closed,
    /// DNS, connect, TLS or socket failure
    Error(String),
    /// a timer scheduled through [`Transport::schedule_timer`] expired
    TimerFired(TimerKind),
}

/// the buffered nonblocking byte transport the engine drives
///
/// Implementations own sockets, TLS and DNS; the engine never touches
/// file descriptors. Calls must not block: `write` accepts what fits and
/// returns the count, `read_available` moves already buffered bytes.
/// Scheduling an already scheduled timer kind resets it.
pub trait Transport {
    /// resolve and connect, completion is signaled with [`TransportEvent::Connected`]
    fn connect(&mut self, host: &str, port: u16, tls: TlsMode) -> io::Result<()>;

    /// move up to `max` buffered inbound bytes into `dst`, returning the count
    fn read_available(&mut self, dst: &mut BytesMut, max: usize) -> io::Result<usize>;

    /// write as many bytes as currently fit, returning the count
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// tear down the connection; a [`TransportEvent::Closed`] follows
    fn close(&mut self);

    /// arm (or reset) the deferred timer of the given kind
    fn schedule_timer(&mut self, kind: TimerKind, after: Duration);

    /// disarm a timer; firing after cancellation is not allowed
    fn cancel_timer(&mut self, kind: TimerKind);

    /// transport clock, the only time source the engine uses
    fn now(&self) -> Instant;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::HashMap;

    /// scripted transport for engine tests: inbound bytes are staged by
    /// the test, written bytes and timer traffic are recorded
    pub(crate) struct MockTransport {
        pub connected_to: Option<(String, u16, TlsMode)>,
        pub inbound: BytesMut,
        pub written: Vec<u8>,
        pub closed: bool,
        pub timers: HashMap<TimerKind, Duration>,
        pub cancelled: Vec<TimerKind>,
        pub clock: Instant,
        /// cap on a single `write`, None writes everything
        pub write_limit: Option<usize>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                connected_to: None,
                inbound: BytesMut::new(),
                written: Vec::new(),
                closed: false,
                timers: HashMap::new(),
                cancelled: Vec::new(),
                clock: Instant::now(),
                write_limit: None,
            }
        }

        pub fn stage(&mut self, bytes: &[u8]) {
            self.inbound.extend_from_slice(bytes);
        }

        pub fn take_written(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.written)
        }
    }

    impl Transport for MockTransport {
        fn connect(&mut self, host: &str, port: u16, tls: TlsMode) -> io::Result<()> {
            self.connected_to = Some((host.to_string(), port, tls));
            Ok(())
        }

        fn read_available(&mut self, dst: &mut BytesMut, max: usize) -> io::Result<usize> {
            let n = self.inbound.len().min(max);
            dst.extend_from_slice(&self.inbound.split_to(n));
            Ok(n)
        }

        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            let n = match self.write_limit {
                Some(limit) => data.len().min(limit),
                None => data.len(),
            };
            self.written.extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn schedule_timer(&mut self, kind: TimerKind, after: Duration) {
            self.timers.insert(kind, after);
        }

        fn cancel_timer(&mut self, kind: TimerKind) {
            self.timers.remove(&kind);
            self.cancelled.push(kind);
        }

        fn now(&self) -> Instant {
            self.clock
        }
    }
}
