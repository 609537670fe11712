use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Stage of the slot upload protocol an error was observed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStage {
    Info,
    Clear,
    Start,
    Chunk,
    Flow,
    Frame,
}

impl fmt::Display for ProtocolStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtocolStage::Info => "info",
            ProtocolStage::Clear => "clear",
            ProtocolStage::Start => "start",
            ProtocolStage::Chunk => "chunk",
            ProtocolStage::Flow => "flow",
            ProtocolStage::Frame => "frame",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("protocol error at {stage} stage: {message}")]
    Protocol {
        stage: ProtocolStage,
        message: String,
    },

    #[error("request timed out")]
    Timeout,

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("daemon bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("all transports exhausted")]
    ConnectionFailed,

    #[error("another correlated request is already pending")]
    Busy,

    #[error("remote requested disconnect: {0}")]
    RemoteQuit(String),

    #[error("not connected")]
    NotConnected,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    pub fn protocol(stage: ProtocolStage, message: impl Into<String>) -> Self {
        HubError::Protocol {
            stage,
            message: message.into(),
        }
    }

    /// A remote-initiated quit is terminal and must not be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HubError::RemoteQuit(_))
    }
}
