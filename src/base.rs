use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::connection::{ConnState, Connection, Event, SendToken};
use crate::errors::WsError;
use crate::transport::{Transport, TransportEvent};
use crate::WsConfig;

/// identifies a connection within its context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

enum Input {
    Transport { conn: ConnId, event: TransportEvent },
    Close { conn: ConnId, code: u16, reason: String },
    Send { conn: ConnId, data: Bytes, is_binary: bool },
    Quit,
}

struct Slot<T> {
    conn: Connection,
    transport: T,
}

/// process scoped engine context
///
/// Owns every connection and its transport. All engine state is touched
/// by exactly one thread, the one calling [`service`](Self::service) or
/// [`service_blocking`](Self::service_blocking). Other threads interact
/// through the clonable [`EngineHandle`], whose inputs are marshalled
/// onto the engine thread via a channel and executed on the next
/// service iteration.
pub struct WsContext<T: Transport> {
    slots: HashMap<ConnId, Slot<T>>,
    next_id: u64,
    tx: Sender<Input>,
    rx: Receiver<Input>,
    quit: bool,
}

impl<T: Transport> Default for WsContext<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> WsContext<T> {
    /// create an empty context
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            slots: HashMap::new(),
            next_id: 0,
            tx,
            rx,
            quit: false,
        }
    }

    /// create a connection and start connecting its transport
    pub fn connect(
        &mut self,
        config: WsConfig,
        uri: http::Uri,
        transport: T,
    ) -> Result<ConnId, WsError> {
        let id = ConnId(self.next_id);
        let mut conn = Connection::new(id.0, config, &uri)?;
        let mut transport = transport;
        conn.connect(&mut transport)?;
        self.next_id += 1;
        self.slots.insert(id, Slot { conn, transport });
        debug!(%id, %uri, "connection registered");
        Ok(id)
    }

    /// clonable handle for other threads
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.tx.clone(),
        }
    }

    /// deliver a transport event directly (engine thread only)
    pub fn dispatch(&mut self, conn: ConnId, event: TransportEvent) -> Result<(), WsError> {
        let slot = self
            .slots
            .get_mut(&conn)
            .ok_or(WsError::UnknownConnection(conn.0))?;
        slot.conn.handle_event(&mut slot.transport, event);
        Ok(())
    }

    /// borrow a connection, e.g. to query its state or subprotocol
    pub fn connection(&self, conn: ConnId) -> Option<&Connection> {
        self.slots.get(&conn).map(|slot| &slot.conn)
    }

    /// borrow a connection's transport
    pub fn transport_mut(&mut self, conn: ConnId) -> Option<&mut T> {
        self.slots.get_mut(&conn).map(|slot| &mut slot.transport)
    }

    /// send a message on a connection
    pub fn send(
        &mut self,
        conn: ConnId,
        payload: &[u8],
        is_binary: bool,
    ) -> Result<SendToken, WsError> {
        let slot = self
            .slots
            .get_mut(&conn)
            .ok_or(WsError::UnknownConnection(conn.0))?;
        slot.conn.send(&mut slot.transport, payload, is_binary)
    }

    /// send a ping on a connection
    pub fn ping(&mut self, conn: ConnId, payload: &[u8]) -> Result<(), WsError> {
        let slot = self
            .slots
            .get_mut(&conn)
            .ok_or(WsError::UnknownConnection(conn.0))?;
        slot.conn.ping(&mut slot.transport, payload)
    }

    /// start the closing handshake on a connection
    pub fn close(&mut self, conn: ConnId, code: u16, reason: &str) -> Result<(), WsError> {
        let slot = self
            .slots
            .get_mut(&conn)
            .ok_or(WsError::UnknownConnection(conn.0))?;
        slot.conn.close(&mut slot.transport, code, reason)
    }

    /// tear a connection down without the closing handshake
    pub fn close_immediately(&mut self, conn: ConnId) -> Result<(), WsError> {
        let slot = self
            .slots
            .get_mut(&conn)
            .ok_or(WsError::UnknownConnection(conn.0))?;
        slot.conn.close_immediately(&mut slot.transport);
        Ok(())
    }

    /// true once `quit` has been processed
    pub fn is_quit(&self) -> bool {
        self.quit
    }

    /// run one service iteration: execute marshalled inputs, then hand
    /// buffered events to `sink`; returns false once quit was requested
    pub fn service<F: FnMut(ConnId, Event)>(&mut self, mut sink: F) -> bool {
        while let Ok(input) = self.rx.try_recv() {
            self.execute(input);
        }
        self.deliver(&mut sink);
        !self.quit
    }

    /// run service iterations until `quit` is called
    pub fn service_blocking<F: FnMut(ConnId, Event)>(&mut self, mut sink: F) {
        while !self.quit {
            match self.rx.recv() {
                Ok(input) => self.execute(input),
                Err(_) => break,
            }
            while let Ok(input) = self.rx.try_recv() {
                self.execute(input);
            }
            self.deliver(&mut sink);
        }
    }

    /// request the service loop to stop
    pub fn quit(&self) {
        let _ = self.tx.send(Input::Quit);
    }

    /// request the service loop to stop after a delay
    pub fn quit_delay(&self, delay: Duration) {
        let tx = self.tx.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            let _ = tx.send(Input::Quit);
        });
    }

    fn execute(&mut self, input: Input) {
        match input {
            Input::Transport { conn, event } => {
                if self.dispatch(conn, event).is_err() {
                    warn!(%conn, "event for unknown connection dropped");
                }
            }
            Input::Close { conn, code, reason } => {
                if let Err(error) = self.close(conn, code, &reason) {
                    warn!(%conn, %error, "marshalled close failed");
                }
            }
            Input::Send {
                conn,
                data,
                is_binary,
            } => {
                if let Err(error) = self.send(conn, &data, is_binary) {
                    warn!(%conn, %error, "marshalled send failed");
                }
            }
            Input::Quit => self.quit = true,
        }
    }

    fn deliver<F: FnMut(ConnId, Event)>(&mut self, sink: &mut F) {
        let ids: Vec<ConnId> = self.slots.keys().copied().collect();
        for id in ids {
            let mut done = false;
            if let Some(slot) = self.slots.get_mut(&id) {
                while let Some(event) = slot.conn.poll_event() {
                    sink(id, event);
                }
                done = slot.conn.state() == ConnState::Closed;
            }
            if done {
                self.slots.remove(&id);
            }
        }
    }
}

/// thread safe entry into a [`WsContext`]
///
/// The only operations usable from outside the engine thread. Each call
/// enqueues an input that the engine thread executes on its next
/// service iteration.
#[derive(Clone)]
pub struct EngineHandle {
    tx: Sender<Input>,
}

impl EngineHandle {
    /// forward a transport event onto the engine thread
    pub fn feed(&self, conn: ConnId, event: TransportEvent) -> Result<(), WsError> {
        self.tx
            .send(Input::Transport { conn, event })
            .map_err(|_| WsError::ContextGone)
    }

    /// start a closing handshake from any thread
    pub fn close_threadsafe(&self, conn: ConnId, code: u16, reason: &str) -> Result<(), WsError> {
        self.tx
            .send(Input::Close {
                conn,
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| WsError::ContextGone)
    }

    /// send a message from any thread
    pub fn send_msg_threadsafe(
        &self,
        conn: ConnId,
        data: Bytes,
        is_binary: bool,
    ) -> Result<(), WsError> {
        self.tx
            .send(Input::Send {
                conn,
                data,
                is_binary,
            })
            .map_err(|_| WsError::ContextGone)
    }

    /// request the service loop to stop
    pub fn quit(&self) -> Result<(), WsError> {
        self.tx.send(Input::Quit).map_err(|_| WsError::ContextGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::cal_accept_key;
    use crate::transport::mock::MockTransport;

    fn open_in_context() -> (WsContext<MockTransport>, ConnId) {
        let mut ctx = WsContext::new();
        let uri: http::Uri = "ws://example.com/".parse().unwrap();
        let id = ctx
            .connect(WsConfig::default(), uri, MockTransport::new())
            .unwrap();
        ctx.dispatch(id, TransportEvent::Connected).unwrap();
        let request = ctx.transport_mut(id).unwrap().take_written();
        let text = String::from_utf8(request).unwrap();
        let key = text
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap();
        let resp = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            cal_accept_key(key)
        );
        ctx.transport_mut(id).unwrap().stage(resp.as_bytes());
        ctx.dispatch(id, TransportEvent::BytesAvailable).unwrap();
        let mut events = vec![];
        ctx.service(|conn, event| events.push((conn, event)));
        assert!(matches!(&events[..], [(got, Event::Open { .. })] if *got == id));
        (ctx, id)
    }

    #[test]
    fn service_delivers_open_and_messages() {
        let (mut ctx, id) = open_in_context();
        ctx.transport_mut(id).unwrap().stage(&[0x81, 0x02, b'h', b'i']);
        ctx.dispatch(id, TransportEvent::BytesAvailable).unwrap();
        let mut events = vec![];
        ctx.service(|_, event| events.push(event));
        assert!(matches!(
            &events[..],
            [Event::Message { data, .. }] if data.as_ref() == b"hi"
        ));
    }

    #[test]
    fn marshalled_inputs_run_on_service() {
        let (mut ctx, id) = open_in_context();
        let handle = ctx.handle();
        handle
            .send_msg_threadsafe(id, Bytes::from_static(b"hello"), true)
            .unwrap();
        handle.close_threadsafe(id, 1000, "done").unwrap();
        ctx.service(|_, _| {});
        let wire = ctx.transport_mut(id).unwrap().take_written();
        // message frame first, then the close frame
        assert_eq!(wire[0] & 0x0F, 0x02);
        assert_eq!(
            ctx.connection(id).map(|c| c.state()),
            Some(ConnState::Closing)
        );
    }

    #[test]
    fn closed_connections_are_pruned_after_delivery() {
        let (mut ctx, id) = open_in_context();
        ctx.close_immediately(id).unwrap();
        let mut events = vec![];
        ctx.service(|_, event| events.push(event));
        assert!(matches!(&events[..], [Event::Closed { .. }]));
        assert!(ctx.connection(id).is_none());
        assert!(matches!(
            ctx.send(id, b"x", true),
            Err(WsError::UnknownConnection(_))
        ));
    }

    #[test]
    fn quit_stops_blocking_service() {
        let (mut ctx, _id) = open_in_context();
        ctx.quit();
        ctx.service_blocking(|_, _| {});
        assert!(ctx.is_quit());
    }

    #[test]
    fn quit_delay_stops_blocking_service() {
        let (mut ctx, _id) = open_in_context();
        ctx.quit_delay(Duration::from_millis(10));
        ctx.service_blocking(|_, _| {});
        assert!(ctx.is_quit());
    }

    #[test]
    fn handle_survives_threads() {
        let (mut ctx, id) = open_in_context();
        let handle = ctx.handle();
        let worker = thread::spawn(move || {
            handle
                .send_msg_threadsafe(id, Bytes::from_static(b"from afar"), true)
                .unwrap();
            handle.quit().unwrap();
        });
        worker.join().unwrap();
        ctx.service_blocking(|_, _| {});
        let wire = ctx.transport_mut(id).unwrap().take_written();
        assert!(!wire.is_empty());
    }
}
