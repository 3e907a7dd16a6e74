use thiserror::Error;

use crate::connection::ConnState;

/// errors reported by connection level operations
#[derive(Debug, Error)]
pub enum WsError {
    #[error("invalid uri `{0}`")]
    InvalidUri(String),
    #[error("transport error `{0}`")]
    Transport(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("{error}")]
    Protocol {
        close_code: u16,
        error: ProtocolError,
    },
    #[error("operation invalid in connection state {0:?}")]
    InvalidState(ConnState),
    #[error("invalid utf-8 in outbound text message")]
    InvalidUtf8,
    #[error("close code {0} must not appear on the wire")]
    InvalidCloseCode(u16),
    #[error("close reason exceeds 123 bytes")]
    CloseReasonTooLong,
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooBig,
    #[error("frame data exceeds the declared frame length")]
    StreamOverrun,
    #[error("message ended with {0} declared frame bytes outstanding")]
    StreamUnderrun(u64),
    #[error("no streaming message in progress")]
    NoStreamingMessage,
    #[error("a streaming message is already in progress")]
    StreamAlreadyActive,
    #[error("unknown connection id {0}")]
    UnknownConnection(u64),
    #[error("engine context is gone")]
    ContextGone,
}

impl From<std::io::Error> for WsError {
    fn from(e: std::io::Error) -> Self {
        WsError::Transport(e.to_string())
    }
}

/// wire level violations detected while decoding frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid leading bits {0:b}")]
    InvalidLeadingBits(u8),
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    #[error("invalid extended payload length")]
    InvalidExtendedLen,
    #[error("masked frame from server")]
    MaskedFrameFromServer,
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("control frame is too big {0}")]
    ControlFrameTooBig(u64),
    #[error("missing initial fragmented frame")]
    MissInitialFragmentedFrame,
    #[error("not continue frame after initial fragmented frame")]
    NotContinueFrameAfterFragmented,
    #[error("invalid close frame payload len, expect 0 or >= 2")]
    InvalidCloseFramePayload,
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    #[error("invalid utf-8 text")]
    InvalidUtf8,
    #[error("message too big, inbound cap {0}")]
    MessageTooBig(u64),
}

impl ProtocolError {
    /// close status this violation is reported with
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::InvalidUtf8 => 1007,
            ProtocolError::MessageTooBig(_) => 1009,
            _ => 1002,
        }
    }
}

impl From<ProtocolError> for WsError {
    fn from(error: ProtocolError) -> Self {
        WsError::Protocol {
            close_code: error.close_code(),
            error,
        }
    }
}
