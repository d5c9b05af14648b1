use thiserror::Error;

/// Daemon-wide error taxonomy.
///
/// Transient transport errors are retried by the transport pump; fatal ones
/// flip the protocol state machine to `Failed` and force a re-handshake.
/// Parse and flow errors attach to the code that caused them and surface
/// through its completion channel.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad header CRC (expected {expected:#06x}, got {got:#06x})")]
    BadHeaderCrc { expected: u16, got: u16 },

    #[error("bad data CRC (expected {expected:#06x}, got {got:#06x})")]
    BadDataCrc { expected: u16, got: u16 },

    #[error("bad format code {0:#04x}")]
    BadFormat(u8),

    #[error("unsupported protocol version {got} (want {want})")]
    BadVersion { got: u16, want: u16 },

    #[error("outgoing buffer full")]
    BufferFull,

    #[error("malformed packet (request {request}, id {id}): {reason}")]
    MalformedPacket { request: u16, id: u16, reason: String },

    #[error("resend budget exhausted for sequence {0}")]
    ResendExhausted(u16),

    #[error("{file}:{line}: {message}")]
    CodeParser {
        file: String,
        line: u64,
        message: String,
    },

    #[error("invalid channel {0}")]
    InvalidChannel(u8),

    #[error("expression evaluation failed: {0}")]
    Evaluation(String),

    #[error("macro file not found: {0}")]
    MacroNotFound(String),

    #[error("file aborted")]
    Aborted,

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("model update rejected: {0}")]
    ModelUpdate(String),

    #[error("shutting down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Transient transport errors are retried; everything else escalates.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BadHeaderCrc { .. }
                | Self::BadDataCrc { .. }
                | Self::BufferFull
                | Self::MalformedPacket { .. }
        )
    }

    pub fn code_parser(file: impl Into<String>, line: u64, message: impl Into<String>) -> Self {
        Self::CodeParser {
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
