use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::errors::{ProtocolError, WsError};
use crate::frame::{
    apply_mask_fast32, apply_mask_offset, is_acceptable_close_code, is_sendable_close_code,
    FrameHeader, OpCode,
};
use crate::handshake;
use crate::limiter::TokenBucket;
use crate::parser::{FrameParser, ParseOutput, ParseState};
use crate::transport::{TimerKind, TlsMode, Transport, TransportEvent};
use crate::utf8::Utf8Validator;
use crate::WsConfig;

/// connection lifecycle position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// created, not yet connecting
    Idle,
    /// transport connect in progress
    Connecting,
    /// upgrade request sent, awaiting the 101
    Handshaking,
    /// messages flow
    Open,
    /// closing handshake in progress
    Closing,
    /// terminal
    Closed,
}

/// how inbound data reaches the application, fixed per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// whole messages, buffered until FIN
    Message,
    /// one event per complete data frame
    Frame,
    /// zero copy payload chunks as they arrive
    Stream,
}

/// which configured timeout fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// the transport did not report connected in time
    Connect,
    /// the peer went silent
    Recv,
    /// the outbound queue did not drain in time
    Send,
}

/// identifies a queued outbound message until its completion event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendToken(pub u64);

/// protocol events emitted by a connection
#[derive(Debug)]
pub enum Event {
    /// handshake accepted, the connection is open
    Open { subprotocol: Option<String> },
    /// a complete message (message mode)
    Message { data: Bytes, is_binary: bool },
    /// first frame of a message arrived (frame and stream modes)
    MessageBegin { is_binary: bool },
    /// one complete data frame (frame mode)
    MessageFrame { data: Bytes, fin: bool },
    /// the current message is complete (frame and stream modes)
    MessageEnd,
    /// a data frame header arrived (stream mode)
    FrameBegin { payload_len: u64, fin: bool },
    /// a payload chunk, bounded by what the transport buffered (stream mode)
    FrameData { data: Bytes },
    /// the current frame is complete (stream mode)
    FrameEnd,
    /// ping from the peer, echoed automatically unless disabled
    Ping { payload: Bytes },
    /// pong from the peer
    Pong { payload: Bytes },
    /// close frame from the peer
    PeerClose { code: Option<u16>, reason: String },
    /// the message behind this token has fully left the engine
    SendComplete { token: SendToken },
    /// a configured timeout fired, teardown follows
    Timeout { kind: TimeoutKind },
    /// an outstanding ping was not answered within the pong timeout
    PongTimeout,
    /// connection failure, a `Closed` event follows
    Error { error: WsError },
    /// terminal event, fired exactly once per connection
    Closed { code: u16, reason: String },
}

/// a fully framed (or raw, during the handshake) outbound unit
struct OutFrame {
    data: BytesMut,
    token: Option<SendToken>,
    /// a streaming frame whose declared payload is not yet supplied
    open: bool,
}

/// bookkeeping for a streaming outbound message
struct StreamOut {
    opcode: OpCode,
    first_sent: bool,
    key: [u8; 4],
    /// declared bytes of the current frame not yet supplied
    remaining: u64,
    mask_offset: usize,
}

/// one client WebSocket session driven by transport events
pub struct Connection {
    id: u64,
    state: ConnState,
    config: WsConfig,
    host: String,
    port: u16,
    path: String,
    tls: TlsMode,
    key: String,
    subprotocol: Option<String>,

    hs_buf: BytesMut,
    read_buf: BytesMut,
    parser: FrameParser,
    utf8: Utf8Validator,
    /// inbound frame currently being consumed
    cur_frame: Option<FrameHeader>,
    /// opcode of the in-progress inbound message
    in_msg_opcode: Option<OpCode>,
    in_msg_len: u64,
    msg_buf: BytesMut,
    frame_buf: BytesMut,
    ctl_buf: BytesMut,
    /// inbound is unreliable after a protocol error, drain and discard
    inbound_dead: bool,

    out: VecDeque<OutFrame>,
    out_cursor: usize,
    next_token: u64,
    stream_out: Option<StreamOut>,
    send_timer_armed: bool,

    pending_pongs: Vec<Bytes>,

    local_close_sent: bool,
    peer_close_received: bool,
    close_code: Option<u16>,
    close_reason: String,

    read_limiter: TokenBucket,
    write_limiter: TokenBucket,

    events: VecDeque<Event>,
}

fn build_frame(opcode: OpCode, fin: bool, payload: &[u8], token: Option<SendToken>) -> OutFrame {
    let key: [u8; 4] = rand::random();
    let header = FrameHeader::new(fin, opcode, Some(key), payload.len() as u64);
    let mut data = BytesMut::with_capacity(header.encoded_len() + payload.len());
    header.encode_into(&mut data);
    let start = data.len();
    data.extend_from_slice(payload);
    apply_mask_fast32(&mut data[start..], key);
    OutFrame {
        data,
        token,
        open: false,
    }
}

const ALL_TIMERS: [TimerKind; 7] = [
    TimerKind::Connect,
    TimerKind::Recv,
    TimerKind::Send,
    TimerKind::Pong,
    TimerKind::CloseGrace,
    TimerKind::ReadRate,
    TimerKind::WriteRate,
];

impl Connection {
    /// build a connection for a `ws://` or `wss://` uri
    pub fn new(id: u64, config: WsConfig, uri: &http::Uri) -> Result<Self, WsError> {
        let secure = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("ws") => false,
            Some(s) if s.eq_ignore_ascii_case("wss") => true,
            Some(s) => return Err(WsError::InvalidUri(format!("unknown scheme {s}"))),
            None => return Err(WsError::InvalidUri("missing scheme".into())),
        };
        let host = uri
            .host()
            .ok_or_else(|| WsError::InvalidUri("missing host".into()))?
            .to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if secure { 443 } else { 80 });
        let path = uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());
        let tls = if secure {
            match config.tls {
                TlsMode::Off => TlsMode::On,
                mode => mode,
            }
        } else {
            TlsMode::Off
        };
        let read_limiter = TokenBucket::new(config.read_rate, config.read_burst);
        let write_limiter = TokenBucket::new(config.write_rate, config.write_burst);
        Ok(Self {
            id,
            state: ConnState::Idle,
            host,
            port,
            path,
            tls,
            key: handshake::gen_key(),
            subprotocol: None,
            hs_buf: BytesMut::new(),
            read_buf: BytesMut::new(),
            parser: FrameParser::new(),
            utf8: Utf8Validator::new(),
            cur_frame: None,
            in_msg_opcode: None,
            in_msg_len: 0,
            msg_buf: BytesMut::new(),
            frame_buf: BytesMut::new(),
            ctl_buf: BytesMut::new(),
            inbound_dead: false,
            out: VecDeque::new(),
            out_cursor: 0,
            next_token: 0,
            stream_out: None,
            send_timer_armed: false,
            pending_pongs: Vec::new(),
            local_close_sent: false,
            peer_close_received: false,
            close_code: None,
            close_reason: String::new(),
            read_limiter,
            write_limiter,
            events: VecDeque::new(),
            config,
        })
    }

    /// identifier given at creation
    pub fn id(&self) -> u64 {
        self.id
    }

    /// current lifecycle state
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// protocol negotiated during the handshake
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// inbound parser position, for diagnostics
    pub fn parse_state(&self) -> ParseState {
        self.parser.state()
    }

    /// take the next buffered protocol event
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// start connecting the transport
    pub fn connect<T: Transport>(&mut self, t: &mut T) -> Result<(), WsError> {
        if self.state != ConnState::Idle {
            return Err(WsError::InvalidState(self.state));
        }
        debug!(id = self.id, host = %self.host, port = self.port, "connecting");
        t.connect(&self.host, self.port, self.tls)?;
        self.state = ConnState::Connecting;
        if let Some(timeout) = self.config.connect_timeout {
            t.schedule_timer(TimerKind::Connect, timeout);
        }
        Ok(())
    }

    /// feed one transport event into the engine
    pub fn handle_event<T: Transport>(&mut self, t: &mut T, event: TransportEvent) {
        if self.state == ConnState::Closed {
            return;
        }
        let result = match event {
            TransportEvent::Connected => self.on_connected(t),
            TransportEvent::BytesAvailable => self.on_readable(t),
            TransportEvent::Writable => self.flush(t),
            TransportEvent::Closed => {
                self.on_transport_closed(t);
                Ok(())
            }
            TransportEvent::Error(message) => {
                self.on_error(t, WsError::Transport(message));
                Ok(())
            }
            TransportEvent::TimerFired(kind) => self.on_timer(t, kind),
        };
        if let Err(error) = result {
            self.on_error(t, error);
        }
    }

    /// send a complete message, fragmenting above `max_frame_size`
    pub fn send<T: Transport>(
        &mut self,
        t: &mut T,
        payload: &[u8],
        is_binary: bool,
    ) -> Result<SendToken, WsError> {
        self.ensure_sendable()?;
        if !is_binary && self.config.validate_send_utf8 && std::str::from_utf8(payload).is_err() {
            return Err(WsError::InvalidUtf8);
        }
        let token = self.next_send_token();
        let opcode = if is_binary { OpCode::Binary } else { OpCode::Text };
        let max = self.config.max_frame_size;
        if max == 0 || payload.len() as u64 <= max {
            let frame = build_frame(opcode, true, payload, Some(token));
            self.enqueue_data(t, frame);
        } else {
            let chunks: Vec<&[u8]> = payload.chunks(max as usize).collect();
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.iter().enumerate() {
                let code = if i == 0 { opcode } else { OpCode::Continue };
                let fin = i == last;
                let frame = build_frame(code, fin, chunk, fin.then_some(token));
                self.enqueue_data(t, frame);
            }
        }
        self.flush(t)?;
        Ok(token)
    }

    /// send a ping and start (or refresh) the pong timeout
    pub fn ping<T: Transport>(&mut self, t: &mut T, payload: &[u8]) -> Result<(), WsError> {
        if self.state != ConnState::Open {
            return Err(WsError::InvalidState(self.state));
        }
        if payload.len() > 125 {
            return Err(WsError::ControlFrameTooBig);
        }
        self.pending_pongs.push(Bytes::copy_from_slice(payload));
        if let Some(timeout) = self.config.pong_timeout {
            t.schedule_timer(TimerKind::Pong, timeout);
        }
        let frame = build_frame(OpCode::Ping, true, payload, None);
        self.enqueue_control(t, frame);
        self.flush(t)
    }

    /// send an unsolicited pong
    pub fn pong<T: Transport>(&mut self, t: &mut T, payload: &[u8]) -> Result<(), WsError> {
        if self.state != ConnState::Open {
            return Err(WsError::InvalidState(self.state));
        }
        if payload.len() > 125 {
            return Err(WsError::ControlFrameTooBig);
        }
        let frame = build_frame(OpCode::Pong, true, payload, None);
        self.enqueue_control(t, frame);
        self.flush(t)
    }

    /// start the closing handshake
    ///
    /// Before the connection is open nothing is on the wire yet, so the
    /// transport is torn down directly and `Closed` reports the given
    /// status. Calling again while closing is a no-op.
    pub fn close<T: Transport>(
        &mut self,
        t: &mut T,
        code: u16,
        reason: &str,
    ) -> Result<(), WsError> {
        match self.state {
            ConnState::Idle | ConnState::Closed => Err(WsError::InvalidState(self.state)),
            ConnState::Closing => Ok(()),
            ConnState::Connecting | ConnState::Handshaking => {
                if !is_sendable_close_code(code) {
                    return Err(WsError::InvalidCloseCode(code));
                }
                t.close();
                self.finish(t, code, reason.to_string());
                Ok(())
            }
            ConnState::Open => {
                if !is_sendable_close_code(code) {
                    return Err(WsError::InvalidCloseCode(code));
                }
                if reason.len() > 123 {
                    return Err(WsError::CloseReasonTooLong);
                }
                self.close_code = Some(code);
                self.close_reason = reason.to_string();
                self.send_close_frame(t, Some(code), reason)?;
                self.enter_closing(t);
                self.maybe_close_transport(t);
                Ok(())
            }
        }
    }

    /// tear down the transport without the closing handshake
    pub fn close_immediately<T: Transport>(&mut self, t: &mut T) {
        if self.state == ConnState::Closed {
            return;
        }
        t.close();
        let code = self.close_code.unwrap_or(1006);
        let reason = std::mem::take(&mut self.close_reason);
        self.finish(t, code, reason);
    }

    /// begin a streaming outbound message
    pub fn msg_begin(&mut self, is_binary: bool) -> Result<(), WsError> {
        self.ensure_sendable()?;
        if self.stream_out.is_some() {
            return Err(WsError::StreamAlreadyActive);
        }
        self.stream_out = Some(StreamOut {
            opcode: if is_binary {
                OpCode::Binary
            } else {
                OpCode::Text
            },
            first_sent: false,
            key: [0; 4],
            remaining: 0,
            mask_offset: 0,
        });
        Ok(())
    }

    /// declare the next frame of the streaming message and its total length
    pub fn frame_begin<T: Transport>(&mut self, t: &mut T, payload_len: u64) -> Result<(), WsError> {
        self.ensure_sendable()?;
        let stream = self.stream_out.as_mut().ok_or(WsError::NoStreamingMessage)?;
        if stream.remaining > 0 {
            return Err(WsError::StreamUnderrun(stream.remaining));
        }
        let key: [u8; 4] = rand::random();
        let opcode = if stream.first_sent {
            OpCode::Continue
        } else {
            stream.opcode
        };
        let header = FrameHeader::new(false, opcode, Some(key), payload_len);
        let mut data = BytesMut::with_capacity(header.encoded_len());
        header.encode_into(&mut data);
        stream.first_sent = true;
        stream.key = key;
        stream.remaining = payload_len;
        stream.mask_offset = 0;
        self.out.push_back(OutFrame {
            data,
            token: None,
            open: payload_len > 0,
        });
        self.arm_send_timer(t);
        self.flush(t)
    }

    /// supply payload bytes for the declared frame
    pub fn frame_data<T: Transport>(&mut self, t: &mut T, data: &[u8]) -> Result<(), WsError> {
        self.ensure_sendable()?;
        let stream = self.stream_out.as_mut().ok_or(WsError::NoStreamingMessage)?;
        if data.len() as u64 > stream.remaining {
            return Err(WsError::StreamOverrun);
        }
        let frame = match self.out.iter_mut().rfind(|f| f.open) {
            Some(frame) => frame,
            None => return Err(WsError::StreamOverrun),
        };
        let start = frame.data.len();
        frame.data.extend_from_slice(data);
        apply_mask_offset(&mut frame.data[start..], stream.key, stream.mask_offset);
        stream.mask_offset = (stream.mask_offset + data.len()) % 4;
        stream.remaining -= data.len() as u64;
        if stream.remaining == 0 {
            frame.open = false;
        }
        self.flush(t)
    }

    /// finish the streaming message with an empty FIN continuation
    pub fn msg_end<T: Transport>(&mut self, t: &mut T) -> Result<SendToken, WsError> {
        self.ensure_sendable()?;
        let stream = self.stream_out.as_ref().ok_or(WsError::NoStreamingMessage)?;
        if stream.remaining > 0 {
            return Err(WsError::StreamUnderrun(stream.remaining));
        }
        // a message with no explicit frames still needs its data opcode
        let opcode = if stream.first_sent {
            OpCode::Continue
        } else {
            stream.opcode
        };
        self.stream_out = None;
        let token = self.next_send_token();
        let frame = build_frame(opcode, true, &[], Some(token));
        self.out.push_back(frame);
        self.arm_send_timer(t);
        self.flush(t)?;
        Ok(token)
    }

    fn ensure_sendable(&self) -> Result<(), WsError> {
        if self.state != ConnState::Open {
            return Err(WsError::InvalidState(self.state));
        }
        Ok(())
    }

    fn next_send_token(&mut self) -> SendToken {
        self.next_token += 1;
        SendToken(self.next_token)
    }

    fn on_connected<T: Transport>(&mut self, t: &mut T) -> Result<(), WsError> {
        if self.state != ConnState::Connecting {
            return Ok(());
        }
        self.state = ConnState::Handshaking;
        t.cancel_timer(TimerKind::Connect);
        let request = handshake::build_request(
            &self.host,
            self.port,
            &self.path,
            &self.key,
            self.config.origin.as_deref(),
            &self.config.subprotocols,
            &self.config.extra_headers,
        );
        trace!(id = self.id, "sending upgrade request");
        self.out.push_back(OutFrame {
            data: BytesMut::from(request.as_bytes()),
            token: None,
            open: false,
        });
        self.arm_recv_timer(t);
        self.flush(t)
    }

    fn on_readable<T: Transport>(&mut self, t: &mut T) -> Result<(), WsError> {
        match self.state {
            ConnState::Handshaking => {
                let room = handshake::MAX_RESPONSE_LEN + 1 - self.hs_buf.len();
                t.read_available(&mut self.hs_buf, room)?;
                let end = match handshake::header_block_end(&self.hs_buf) {
                    Some(end) => end,
                    None => {
                        if self.hs_buf.len() > handshake::MAX_RESPONSE_LEN {
                            return Err(WsError::HandshakeFailed(
                                "oversized handshake response".to_string(),
                            ));
                        }
                        return Ok(());
                    }
                };
                let outcome = handshake::check_response(
                    &self.hs_buf[..end],
                    &self.key,
                    &self.config.subprotocols,
                )?;
                self.subprotocol = outcome.subprotocol;
                let rest = self.hs_buf.split_off(end);
                self.hs_buf.clear();
                self.read_buf.extend_from_slice(&rest);
                self.state = ConnState::Open;
                t.cancel_timer(TimerKind::Connect);
                self.events.push_back(Event::Open {
                    subprotocol: self.subprotocol.clone(),
                });
                self.arm_recv_timer(t);
                self.process_frames(t)
            }
            ConnState::Open | ConnState::Closing => {
                if self.inbound_dead {
                    let mut sink = BytesMut::new();
                    t.read_available(&mut sink, usize::MAX)?;
                    return Ok(());
                }
                let now = t.now();
                let allowed = self.read_limiter.available(now);
                if allowed == 0 {
                    let wait = self.read_limiter.deadline_for(now, 1);
                    t.schedule_timer(TimerKind::ReadRate, wait);
                    return Ok(());
                }
                let max = usize::try_from(allowed).unwrap_or(usize::MAX);
                let n = t.read_available(&mut self.read_buf, max)?;
                self.read_limiter.spend(n as u64);
                if n == 0 {
                    return Ok(());
                }
                if self.state == ConnState::Open {
                    self.arm_recv_timer(t);
                }
                self.process_frames(t)?;
                if n == max {
                    // the bucket, not the transport, bounded this read
                    let wait = self.read_limiter.deadline_for(t.now(), 1);
                    t.schedule_timer(TimerKind::ReadRate, wait);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn process_frames<T: Transport>(&mut self, t: &mut T) -> Result<(), WsError> {
        loop {
            match self.parser.next(&mut self.read_buf)? {
                None => return Ok(()),
                Some(output) => self.on_parse_output(t, output)?,
            }
        }
    }

    fn on_parse_output<T: Transport>(
        &mut self,
        t: &mut T,
        output: ParseOutput,
    ) -> Result<(), WsError> {
        match output {
            ParseOutput::Header(header) => self.on_frame_header(header),
            ParseOutput::Data(chunk) => self.on_frame_data(chunk),
            ParseOutput::End => self.on_frame_end(t),
        }
    }

    fn on_frame_header(&mut self, header: FrameHeader) -> Result<(), WsError> {
        if header.opcode.is_control() {
            self.ctl_buf.clear();
            self.cur_frame = Some(header);
            return Ok(());
        }
        match header.opcode {
            OpCode::Continue => {
                if self.in_msg_opcode.is_none() {
                    return Err(ProtocolError::MissInitialFragmentedFrame.into());
                }
            }
            OpCode::Text | OpCode::Binary => {
                if self.in_msg_opcode.is_some() {
                    return Err(ProtocolError::NotContinueFrameAfterFragmented.into());
                }
                self.in_msg_opcode = Some(header.opcode);
                self.in_msg_len = 0;
                if header.opcode == OpCode::Text {
                    self.utf8.reset();
                }
                if matches!(
                    self.config.delivery,
                    DeliveryMode::Frame | DeliveryMode::Stream
                ) {
                    self.events.push_back(Event::MessageBegin {
                        is_binary: header.opcode == OpCode::Binary,
                    });
                }
            }
            _ => {}
        }
        let cap = self.config.max_message_size;
        if cap != 0 && self.in_msg_len + header.payload_len > cap {
            return Err(ProtocolError::MessageTooBig(cap).into());
        }
        if self.config.delivery == DeliveryMode::Stream {
            self.events.push_back(Event::FrameBegin {
                payload_len: header.payload_len,
                fin: header.fin,
            });
        }
        if self.config.delivery == DeliveryMode::Frame {
            self.frame_buf.clear();
        }
        self.cur_frame = Some(header);
        Ok(())
    }

    fn on_frame_data(&mut self, chunk: Bytes) -> Result<(), WsError> {
        let header = match self.cur_frame {
            Some(header) => header,
            None => return Ok(()),
        };
        if header.opcode.is_control() {
            self.ctl_buf.extend_from_slice(&chunk);
            return Ok(());
        }
        if self.in_msg_opcode == Some(OpCode::Text) && self.utf8.feed(&chunk).is_err() {
            return Err(ProtocolError::InvalidUtf8.into());
        }
        self.in_msg_len += chunk.len() as u64;
        match self.config.delivery {
            DeliveryMode::Message => self.msg_buf.extend_from_slice(&chunk),
            DeliveryMode::Frame => self.frame_buf.extend_from_slice(&chunk),
            DeliveryMode::Stream => self.events.push_back(Event::FrameData { data: chunk }),
        }
        Ok(())
    }

    fn on_frame_end<T: Transport>(&mut self, t: &mut T) -> Result<(), WsError> {
        let header = match self.cur_frame.take() {
            Some(header) => header,
            None => return Ok(()),
        };
        if header.opcode.is_control() {
            let payload = self.ctl_buf.split().freeze();
            return self.dispatch_control(t, header.opcode, payload);
        }
        match self.config.delivery {
            DeliveryMode::Frame => {
                let data = self.frame_buf.split().freeze();
                self.events.push_back(Event::MessageFrame {
                    data,
                    fin: header.fin,
                });
            }
            DeliveryMode::Stream => self.events.push_back(Event::FrameEnd),
            DeliveryMode::Message => {}
        }
        if !header.fin {
            return Ok(());
        }
        let opcode = self.in_msg_opcode.take().unwrap_or(header.opcode);
        self.in_msg_len = 0;
        if opcode == OpCode::Text && !self.utf8.is_complete() {
            return Err(ProtocolError::InvalidUtf8.into());
        }
        match self.config.delivery {
            DeliveryMode::Message => {
                let data = self.msg_buf.split().freeze();
                self.events.push_back(Event::Message {
                    data,
                    is_binary: opcode == OpCode::Binary,
                });
            }
            DeliveryMode::Frame | DeliveryMode::Stream => {
                self.events.push_back(Event::MessageEnd);
            }
        }
        Ok(())
    }

    fn dispatch_control<T: Transport>(
        &mut self,
        t: &mut T,
        opcode: OpCode,
        payload: Bytes,
    ) -> Result<(), WsError> {
        match opcode {
            OpCode::Ping => {
                trace!(id = self.id, len = payload.len(), "ping received");
                self.events.push_back(Event::Ping {
                    payload: payload.clone(),
                });
                if self.config.auto_pong && !self.local_close_sent {
                    let frame = build_frame(OpCode::Pong, true, &payload, None);
                    self.enqueue_control(t, frame);
                    self.flush(t)?;
                }
            }
            OpCode::Pong => {
                // unsolicited pongs are fine, matched ones settle a ping
                if let Some(pos) = self.pending_pongs.iter().position(|p| *p == payload) {
                    self.pending_pongs.remove(pos);
                }
                if self.pending_pongs.is_empty() {
                    t.cancel_timer(TimerKind::Pong);
                }
                self.events.push_back(Event::Pong { payload });
            }
            OpCode::Close => self.on_peer_close(t, payload)?,
            _ => {}
        }
        Ok(())
    }

    fn on_peer_close<T: Transport>(&mut self, t: &mut T, payload: Bytes) -> Result<(), WsError> {
        let (code, reason) = if payload.is_empty() {
            (None, String::new())
        } else if payload.len() == 1 {
            return Err(ProtocolError::InvalidCloseFramePayload.into());
        } else {
            let mut p = payload;
            let code = p.get_u16();
            if !is_acceptable_close_code(code) {
                return Err(ProtocolError::InvalidCloseCode(code).into());
            }
            let reason = std::str::from_utf8(&p)
                .map_err(|_| ProtocolError::InvalidUtf8)?
                .to_string();
            (Some(code), reason)
        };
        debug!(id = self.id, ?code, "close frame received");
        self.peer_close_received = true;
        self.events.push_back(Event::PeerClose {
            code,
            reason: reason.clone(),
        });
        if !self.local_close_sent {
            self.close_code = Some(code.unwrap_or(1005));
            self.close_reason = reason;
            self.send_close_frame(t, code, "")?;
            self.enter_closing(t);
        }
        self.maybe_close_transport(t);
        Ok(())
    }

    fn send_close_frame<T: Transport>(
        &mut self,
        t: &mut T,
        code: Option<u16>,
        reason: &str,
    ) -> Result<(), WsError> {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        if let Some(code) = code {
            payload.put_u16(code);
            payload.extend_from_slice(reason.as_bytes());
        }
        let frame = build_frame(OpCode::Close, true, &payload, None);
        self.local_close_sent = true;
        self.enqueue_control(t, frame);
        self.flush(t)
    }

    fn enter_closing<T: Transport>(&mut self, t: &mut T) {
        if self.state == ConnState::Open {
            self.state = ConnState::Closing;
            self.stream_out = None;
            t.cancel_timer(TimerKind::Recv);
            t.schedule_timer(TimerKind::CloseGrace, self.config.close_grace);
        }
    }

    /// once both close frames are on their way and ours is flushed,
    /// the transport can go down
    fn maybe_close_transport<T: Transport>(&mut self, t: &mut T) {
        if self.state == ConnState::Closing
            && self.local_close_sent
            && self.peer_close_received
            && self.out.is_empty()
        {
            t.close();
        }
    }

    fn enqueue_data<T: Transport>(&mut self, t: &mut T, frame: OutFrame) {
        self.out.push_back(frame);
        self.arm_send_timer(t);
    }

    /// control frames go ahead of queued data frames but never into the
    /// middle of a partially written one
    fn enqueue_control<T: Transport>(&mut self, t: &mut T, frame: OutFrame) {
        let pos = if self.out_cursor > 0 && !self.out.is_empty() {
            1
        } else {
            0
        };
        self.out.insert(pos, frame);
        self.arm_send_timer(t);
    }

    fn arm_send_timer<T: Transport>(&mut self, t: &mut T) {
        if self.send_timer_armed {
            return;
        }
        if let Some(timeout) = self.config.send_timeout {
            t.schedule_timer(TimerKind::Send, timeout);
            self.send_timer_armed = true;
        }
    }

    fn arm_recv_timer<T: Transport>(&mut self, t: &mut T) {
        if let Some(timeout) = self.config.recv_timeout {
            t.schedule_timer(TimerKind::Recv, timeout);
        }
    }

    fn flush<T: Transport>(&mut self, t: &mut T) -> Result<(), WsError> {
        if self.state == ConnState::Closed {
            return Ok(());
        }
        loop {
            let (pending, open) = match self.out.front() {
                None => break,
                Some(f) => (f.data.len() - self.out_cursor, f.open),
            };
            if pending == 0 {
                if open {
                    // streaming frame fully written so far, more declared
                    // bytes will arrive
                    break;
                }
                if let Some(done) = self.out.pop_front() {
                    self.out_cursor = 0;
                    if let Some(token) = done.token {
                        self.events.push_back(Event::SendComplete { token });
                    }
                }
                continue;
            }
            let now = t.now();
            let limited = matches!(self.state, ConnState::Open | ConnState::Closing);
            let allowed = if limited {
                self.write_limiter.available(now)
            } else {
                u64::MAX
            };
            if allowed == 0 {
                let wait = self.write_limiter.deadline_for(now, pending as u64);
                t.schedule_timer(TimerKind::WriteRate, wait);
                break;
            }
            let want = pending.min(usize::try_from(allowed).unwrap_or(usize::MAX));
            let start = self.out_cursor;
            let n = match self.out.front() {
                Some(front) => t.write(&front.data[start..start + want])?,
                None => break,
            };
            if limited {
                self.write_limiter.spend(n as u64);
            }
            self.out_cursor += n;
            if n < want {
                // transport backpressure, resume on the next writable
                break;
            }
        }
        if self.out.is_empty() {
            if self.send_timer_armed {
                t.cancel_timer(TimerKind::Send);
                self.send_timer_armed = false;
            }
            self.maybe_close_transport(t);
        }
        Ok(())
    }

    fn on_timer<T: Transport>(&mut self, t: &mut T, kind: TimerKind) -> Result<(), WsError> {
        match kind {
            TimerKind::Connect => {
                if self.state == ConnState::Connecting {
                    self.events.push_back(Event::Timeout {
                        kind: TimeoutKind::Connect,
                    });
                    self.abort(t, 1006, "connect timeout");
                }
                Ok(())
            }
            TimerKind::Recv => {
                if matches!(self.state, ConnState::Handshaking | ConnState::Open) {
                    self.events.push_back(Event::Timeout {
                        kind: TimeoutKind::Recv,
                    });
                    self.abort(t, 1006, "recv timeout");
                }
                Ok(())
            }
            TimerKind::Send => {
                if !self.out.is_empty() {
                    self.events.push_back(Event::Timeout {
                        kind: TimeoutKind::Send,
                    });
                    self.abort(t, 1006, "send timeout");
                }
                Ok(())
            }
            TimerKind::Pong => {
                if !self.pending_pongs.is_empty() {
                    self.events.push_back(Event::PongTimeout);
                    self.abort(t, 1006, "pong timeout");
                }
                Ok(())
            }
            TimerKind::CloseGrace => {
                if self.state == ConnState::Closing {
                    t.close();
                    let code = self.close_code.unwrap_or(1006);
                    let reason = self.close_reason.clone();
                    self.finish(t, code, reason);
                }
                Ok(())
            }
            TimerKind::ReadRate => self.on_readable(t),
            TimerKind::WriteRate => self.flush(t),
        }
    }

    fn on_transport_closed<T: Transport>(&mut self, t: &mut T) {
        match self.state {
            ConnState::Closed => {}
            ConnState::Closing => {
                let code = self.close_code.unwrap_or(1006);
                let reason = self.close_reason.clone();
                self.finish(t, code, reason);
            }
            _ => {
                self.events.push_back(Event::Error {
                    error: WsError::Transport("connection closed unexpectedly".to_string()),
                });
                self.finish(t, 1006, "abnormal closure".to_string());
            }
        }
    }

    fn on_error<T: Transport>(&mut self, t: &mut T, error: WsError) {
        warn!(id = self.id, %error, "connection failure");
        match &error {
            WsError::Protocol { close_code, .. } => {
                let code = *close_code;
                self.events.push_back(Event::Error { error });
                self.inbound_dead = true;
                if self.state == ConnState::Open && !self.local_close_sent {
                    self.close_code = Some(code);
                    if self.send_close_frame(t, Some(code), "").is_err() {
                        self.abort(t, code, "");
                        return;
                    }
                    self.enter_closing(t);
                } else {
                    self.abort(t, code, "");
                }
            }
            WsError::HandshakeFailed(message) => {
                let reason = message.clone();
                self.events.push_back(Event::Error { error });
                self.abort(t, 1002, &reason);
            }
            _ => {
                let reason = error.to_string();
                self.events.push_back(Event::Error { error });
                self.abort(t, 1006, &reason);
            }
        }
    }

    fn abort<T: Transport>(&mut self, t: &mut T, code: u16, reason: &str) {
        t.close();
        self.finish(t, code, reason.to_string());
    }

    /// terminal transition, `Closed` fires exactly once
    fn finish<T: Transport>(&mut self, t: &mut T, code: u16, reason: String) {
        if self.state == ConnState::Closed {
            return;
        }
        debug!(id = self.id, code, "connection closed");
        self.state = ConnState::Closed;
        for kind in ALL_TIMERS {
            t.cancel_timer(kind);
        }
        self.out.clear();
        self.out_cursor = 0;
        self.stream_out = None;
        self.send_timer_armed = false;
        self.events.push_back(Event::Closed { code, reason });
    }
}
