//! Error types for the service dispatch core.

use crate::types::DeviceAddress;

/// Errors surfaced through a Service Future.
///
/// `Clone` because every observer of one future sees the same terminal outcome.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("No response within retry budget")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Caller wait timed out")]
    CallerTimeout,

    #[error("Request rejected by remote device (reason {reason})")]
    ProtocolReject { reason: u8 },

    #[error("Remote device returned error (class {class}, code {code})")]
    ProtocolError { class: u32, code: u32 },

    #[error("Request aborted (reason {reason}, by server: {server})")]
    ProtocolAbort { reason: u8, server: bool },

    #[error("No free invoke id for {0}")]
    ExhaustedIdSpace(DeviceAddress),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Device {0} not found")]
    NotFound(u32),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Client has shut down")]
    Shutdown,
}

impl From<CodecError> for ServiceError {
    fn from(err: CodecError) -> Self {
        ServiceError::Malformed(err.to_string())
    }
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Local send/receive failures of a transport port.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,

    #[error("Frame too large ({0} bytes)")]
    FrameTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Encoding and decoding failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("Frame truncated at offset {0}")]
    Truncated(usize),

    #[error("Unsupported protocol version {0}")]
    Version(u8),

    #[error("Unexpected tag {tag} at offset {offset}")]
    UnexpectedTag { tag: u8, offset: usize },

    #[error("Unknown PDU type {0:#04x}")]
    UnknownPdu(u8),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Failures bringing a client up.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to open transport: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}
