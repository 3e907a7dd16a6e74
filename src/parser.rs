use bytes::{Buf, Bytes, BytesMut};

use crate::errors::ProtocolError;
use crate::frame::{parse_opcode, FrameHeader, OpCode};

/// inbound parser position, consumed byte by byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// FIN + RSV + opcode
    FirstByte,
    /// MASK bit + 7 bit length
    SecondByte,
    /// 16 bit extended length
    ExtLen16,
    /// 64 bit extended length
    ExtLen64,
    /// payload bytes remain
    Payload,
    /// frame fully consumed, end not yet reported
    FrameEnd,
}

impl ParseState {
    /// human name for diagnostics
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseState::FirstByte => "FIRST_BYTE",
            ParseState::SecondByte => "SECOND_BYTE",
            ParseState::ExtLen16 => "EXT_LEN_16",
            ParseState::ExtLen64 => "EXT_LEN_64",
            ParseState::Payload => "PAYLOAD",
            ParseState::FrameEnd => "FRAME_END",
        }
    }
}

impl std::fmt::Display for ParseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// signals emitted while consuming the read buffer
#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutput {
    /// header complete, payload follows
    Header(FrameHeader),
    /// payload chunk, bounded by what was buffered
    Data(Bytes),
    /// frame fully consumed
    End,
}

/// byte driven frame parser for server-to-client traffic
///
/// Server frames are never masked and no extension is negotiated, so a
/// set MASK bit or RSV bit fails the connection right away.
#[derive(Debug)]
pub struct FrameParser {
    state: ParseState,
    fin: bool,
    opcode: OpCode,
    len_buf: [u8; 8],
    len_got: usize,
    remaining: u64,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    /// parser positioned at a frame boundary
    pub fn new() -> Self {
        Self {
            state: ParseState::FirstByte,
            fin: false,
            opcode: OpCode::Continue,
            len_buf: [0; 8],
            len_got: 0,
            remaining: 0,
        }
    }

    /// current state, for diagnostics
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// consume bytes from `src` until one signal can be emitted
    ///
    /// `Ok(None)` means more bytes are needed; bytes past the current
    /// frame are left in `src` untouched
    pub fn next(&mut self, src: &mut BytesMut) -> Result<Option<ParseOutput>, ProtocolError> {
        loop {
            match self.state() {
                ParseState::FirstByte => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let b0 = src.get_u8();
                    if b0 & 0b0111_0000 != 0 {
                        return Err(ProtocolError::InvalidLeadingBits(b0 >> 4));
                    }
                    let opcode = parse_opcode(b0);
                    if opcode.is_reserved() {
                        return Err(ProtocolError::InvalidOpcode(b0 & 0b1111));
                    }
                    self.opcode = opcode;
                    self.fin = b0 & 0x80 != 0;
                    self.state = ParseState::SecondByte;
                }
                ParseState::SecondByte => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let b1 = src.get_u8();
                    if b1 & 0x80 != 0 {
                        return Err(ProtocolError::MaskedFrameFromServer);
                    }
                    self.len_got = 0;
                    match b1 & 0x7F {
                        126 => self.state = ParseState::ExtLen16,
                        127 => self.state = ParseState::ExtLen64,
                        n => {
                            self.remaining = n as u64;
                            return self.header_done().map(Some);
                        }
                    }
                }
                ParseState::ExtLen16 => {
                    while self.len_got < 2 {
                        if src.is_empty() {
                            return Ok(None);
                        }
                        self.len_buf[self.len_got] = src.get_u8();
                        self.len_got += 1;
                    }
                    let mut arr = [0u8; 2];
                    arr.copy_from_slice(&self.len_buf[..2]);
                    self.remaining = u16::from_be_bytes(arr) as u64;
                    return self.header_done().map(Some);
                }
                ParseState::ExtLen64 => {
                    while self.len_got < 8 {
                        if src.is_empty() {
                            return Ok(None);
                        }
                        self.len_buf[self.len_got] = src.get_u8();
                        self.len_got += 1;
                    }
                    let len = u64::from_be_bytes(self.len_buf);
                    if len & (1 << 63) != 0 {
                        return Err(ProtocolError::InvalidExtendedLen);
                    }
                    self.remaining = len;
                    return self.header_done().map(Some);
                }
                ParseState::Payload => {
                    if self.remaining == 0 {
                        self.state = ParseState::FrameEnd;
                        continue;
                    }
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = (src.len() as u64).min(self.remaining) as usize;
                    let chunk = src.split_to(take).freeze();
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.state = ParseState::FrameEnd;
                    }
                    return Ok(Some(ParseOutput::Data(chunk)));
                }
                ParseState::FrameEnd => {
                    self.state = ParseState::FirstByte;
                    return Ok(Some(ParseOutput::End));
                }
            }
        }
    }

    fn header_done(&mut self) -> Result<ParseOutput, ProtocolError> {
        if self.opcode.is_control() {
            if !self.fin {
                return Err(ProtocolError::FragmentedControlFrame);
            }
            if self.remaining > 125 {
                return Err(ProtocolError::ControlFrameTooBig(self.remaining));
            }
        }
        self.state = ParseState::Payload;
        Ok(ParseOutput::Header(FrameHeader::new(
            self.fin,
            self.opcode,
            None,
            self.remaining,
        )))
    }
}
