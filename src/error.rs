//! Error types for fcr.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Stable numeric error codes carried back to RPC clients.
///
/// Ranges: 1-12 generic, 100-103 user errors, 200-201 device errors,
/// 300-301 network errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FcrErrorCode {
    Unknown = 1,
    Runtime = 2,
    Assertion = 3,
    Lookup = 4,
    StreamReader = 5,
    CommandExecutionTimeout = 6,
    NotImplemented = 7,
    Parsing = 8,
    Value = 9,
    Type = 10,
    Attribute = 11,
    Timeout = 12,

    Validation = 100,
    Permission = 101,
    UnsupportedDevice = 102,
    UnsupportedCommand = 103,

    DeviceError = 200,
    CommandExecutionError = 201,

    ConnectionError = 300,
    ConnectionTimeout = 301,
}

impl FcrErrorCode {
    /// Numeric value as carried on the wire.
    pub fn value(self) -> u32 {
        self as u32
    }

    /// Stable name, used for counter keys.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Runtime => "RUNTIME_ERROR",
            Self::Assertion => "ASSERTION_ERROR",
            Self::Lookup => "LOOKUP_ERROR",
            Self::StreamReader => "STREAM_READER_ERROR",
            Self::CommandExecutionTimeout => "COMMAND_EXECUTION_TIMEOUT_ERROR",
            Self::NotImplemented => "NOT_IMPLEMENTED_ERROR",
            Self::Parsing => "PARSING_ERROR",
            Self::Value => "VALUE_ERROR",
            Self::Type => "TYPE_ERROR",
            Self::Attribute => "ATTRIBUTE_ERROR",
            Self::Timeout => "TIMEOUT_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::Permission => "PERMISSION_ERROR",
            Self::UnsupportedDevice => "UNSUPPORTED_DEVICE_ERROR",
            Self::UnsupportedCommand => "UNSUPPORTED_COMMAND_ERROR",
            Self::DeviceError => "DEVICE_ERROR",
            Self::CommandExecutionError => "COMMAND_EXECUTION_ERROR",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT_ERROR",
        }
    }
}

/// Main error type for fcr operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SSH transport-level errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session state machine errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Vendor profile errors
    #[error("Vendor error: {0}")]
    Vendor(#[from] VendorError),

    /// Device record / resolver errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Dispatcher errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

impl Error {
    /// Map this error to its wire-level code.
    pub fn code(&self) -> FcrErrorCode {
        match self {
            Self::Transport(e) => e.code(),
            Self::Session(e) => e.code(),
            Self::Vendor(e) => e.code(),
            Self::Device(e) => e.code(),
            Self::Dispatch(e) => e.code(),
        }
    }

    /// Output captured before the failure, when any was.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            Self::Session(e) => e.partial_output(),
            _ => None,
        }
    }
}

/// Transport layer errors (SSH connection, authentication, channels).
#[derive(Error, Debug)]
pub enum TransportError {
    /// SSH handshake or protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// Connection or setup did not complete in time
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// Connection was closed unexpectedly
    #[error("Connection disconnected")]
    Disconnected,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn code(&self) -> FcrErrorCode {
        match self {
            Self::AuthenticationFailed { .. } => FcrErrorCode::Permission,
            Self::Timeout(_) => FcrErrorCode::ConnectionTimeout,
            _ => FcrErrorCode::ConnectionError,
        }
    }
}

/// Session layer errors (state machine, command execution).
#[derive(Error, Debug)]
pub enum SessionError {
    /// Command issued while the session is not READY
    #[error("Session not ready (state: {state})")]
    NotReady { state: &'static str },

    /// No prompt seen within the command timeout
    #[error("Command response timeout; trailing output: {partial:?}")]
    CommandTimeout { partial: String },

    /// The device closed the stream mid-command
    #[error("Stream closed by peer; trailing output: {partial:?}")]
    StreamClosed { partial: String },

    /// Session id / owner pair not present in the registry
    #[error("Session not found")]
    NotFound,

    /// The device reported a remote failure
    #[error("Device error: {message}")]
    Remote { message: String },

    /// Raw session command issued without a prompt pattern
    #[error("prompt_regex not specified")]
    PromptRequired,

    /// Invalid caller-supplied prompt pattern
    #[error("Invalid prompt pattern: {0}")]
    InvalidPrompt(#[from] regex::Error),

    /// Registry is shutting down, no new sessions accepted
    #[error("Service shutting down")]
    ShuttingDown,
}

impl SessionError {
    /// Output captured before the failure, when any was.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            Self::CommandTimeout { partial } | Self::StreamClosed { partial } => Some(partial),
            _ => None,
        }
    }

    pub fn code(&self) -> FcrErrorCode {
        match self {
            Self::NotReady { .. } => FcrErrorCode::Runtime,
            Self::CommandTimeout { .. } => FcrErrorCode::CommandExecutionTimeout,
            Self::StreamClosed { .. } => FcrErrorCode::StreamReader,
            Self::NotFound => FcrErrorCode::Lookup,
            Self::Remote { .. } => FcrErrorCode::DeviceError,
            Self::PromptRequired => FcrErrorCode::Validation,
            Self::InvalidPrompt(_) => FcrErrorCode::Parsing,
            Self::ShuttingDown => FcrErrorCode::Runtime,
        }
    }
}

/// Vendor profile loading / compilation errors.
#[derive(Error, Debug)]
pub enum VendorError {
    /// Profile with no prompt patterns
    #[error("Vendor '{vendor}' has no prompt patterns")]
    MissingPrompts { vendor: String },

    /// A prompt pattern failed to compile
    #[error("Bad prompt pattern for vendor '{vendor}': {source}")]
    BadPromptPattern {
        vendor: String,
        #[source]
        source: regex::Error,
    },

    /// Vendor config document failed to parse
    #[error("Failed to parse vendor config: {0}")]
    ParseFailed(#[from] serde_json::Error),
}

impl VendorError {
    pub fn code(&self) -> FcrErrorCode {
        match self {
            Self::MissingPrompts { .. } => FcrErrorCode::Validation,
            Self::BadPromptPattern { .. } | Self::ParseFailed(_) => FcrErrorCode::Parsing,
        }
    }
}

/// Device record / resolver errors.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Device missing from the inventory snapshot
    #[error("Device not found: {hostname}")]
    UnknownDevice { hostname: String },

    /// Neither the request nor the inventory record names a vendor
    #[error("No vendor configured for device: {hostname}")]
    MissingVendor { hostname: String },

    /// NETCONF session without a subsystem or exec command
    #[error("Either subsystem or exec_command must be specified for a netconf session")]
    MissingSessionData,

    /// Inventory document failed to parse
    #[error("Failed to parse device inventory: {0}")]
    ParseFailed(#[from] serde_json::Error),
}

impl DeviceError {
    pub fn code(&self) -> FcrErrorCode {
        match self {
            Self::UnknownDevice { .. } => FcrErrorCode::Lookup,
            Self::MissingVendor { .. } => FcrErrorCode::UnsupportedDevice,
            Self::MissingSessionData => FcrErrorCode::Validation,
            Self::ParseFailed(_) => FcrErrorCode::Parsing,
        }
    }
}

/// Dispatcher errors.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Too many bulk device sessions in flight on this instance
    #[error("Too many sessions open: {active}")]
    Overloaded { active: usize },

    /// Bulk timeout too small to subtract the remote-call overhead from
    #[error("Timeout {timeout:?} too low for a forwarded bulk_run")]
    TimeoutTooLow { timeout: Duration },
}

impl DispatchError {
    pub fn code(&self) -> FcrErrorCode {
        match self {
            Self::Overloaded { .. } => FcrErrorCode::Runtime,
            Self::TimeoutTooLow { .. } => FcrErrorCode::Value,
        }
    }
}

/// Result type alias using fcr's Error.
pub type Result<T> = std::result::Result<T, Error>;
