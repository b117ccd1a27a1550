//! # Error Types
//!
//! This module defines the error types used throughout the dispatch runtime,
//! from engine operation failures to connection refusals and failures raised
//! by user handlers while an event was being dispatched.

use std::error::Error;
use std::fmt;
use std::io;

use crate::event::EventKind;

/// The error type returned by handlers registered on a [`Client`](crate::Client).
pub type HandlerError = Box<dyn Error + Send + Sync + 'static>;

/// The value returned by every handler.
pub type HandlerResult = Result<(), HandlerError>;

/// The primary error enum for the MQTT client runtime.
///
/// Engine operation failures are reported synchronously as the result of the
/// operation call and are never queued. Connection refusals and handler
/// failures originate inside the dispatch path.
#[derive(Debug)]
pub enum MqttError {
    /// The engine rejected the input parameters.
    InvalidParams,
    /// The engine could not allocate memory.
    OutOfMemory,
    /// The client is not currently connected to the broker.
    NotConnected,
    /// The connection to the broker was lost.
    ConnectionLost,
    /// A protocol-level error occurred while communicating with the broker.
    Protocol,
    /// The payload of a message exceeds the maximum allowable size.
    PayloadTooLarge,
    /// The requested feature is not supported by the engine.
    NotSupported,
    /// A system call failed; the enclosed error carries the OS error.
    Io(io::Error),
    /// The connection was refused by the broker. The enclosed code provides the reason.
    ConnectionRefused(ConnectReasonCode),
    /// A registered handler failed while processing an event.
    Handler(DispatchError),
}

impl fmt::Display for MqttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttError::InvalidParams => write!(f, "invalid input params"),
            MqttError::OutOfMemory => write!(f, "out of memory"),
            MqttError::NotConnected => write!(f, "client not connected to broker"),
            MqttError::ConnectionLost => write!(f, "connection to the broker was lost"),
            MqttError::Protocol => write!(f, "protocol error communicating with the broker"),
            MqttError::PayloadTooLarge => write!(f, "payload too large"),
            MqttError::NotSupported => write!(f, "operation not supported"),
            MqttError::Io(e) => write!(f, "system error: {e}"),
            MqttError::ConnectionRefused(code) => write!(f, "connection refused ({code})"),
            MqttError::Handler(e) => write!(f, "{e}"),
        }
    }
}

impl Error for MqttError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MqttError::Io(e) => Some(e),
            MqttError::Handler(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MqttError {
    fn from(err: io::Error) -> Self {
        MqttError::Io(err)
    }
}

impl From<DispatchError> for MqttError {
    fn from(err: DispatchError) -> Self {
        MqttError::Handler(err)
    }
}

/// Represents the reason codes for a connection refusal (`CONNACK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReasonCode {
    /// The connection was accepted.
    Success,
    /// The broker does not support the requested MQTT protocol version.
    UnacceptableProtocolVersion,
    /// The client identifier is not valid.
    IdentifierRejected,
    /// The broker is unavailable.
    ServerUnavailable,
    /// The username or password is not valid.
    BadUserNameOrPassword,
    /// The client is not authorized to connect.
    NotAuthorized,
    /// An unknown or unspecified code.
    Other(i32),
}

impl ConnectReasonCode {
    /// Returns `true` for the protocol-level refusals the runtime raises as
    /// errors instead of forwarding them to the connect handler.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Self::UnacceptableProtocolVersion | Self::IdentifierRejected | Self::ServerUnavailable
        )
    }

    /// The raw code as delivered by the engine.
    pub fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::UnacceptableProtocolVersion => 1,
            Self::IdentifierRejected => 2,
            Self::ServerUnavailable => 3,
            Self::BadUserNameOrPassword => 4,
            Self::NotAuthorized => 5,
            Self::Other(val) => *val,
        }
    }
}

impl From<i32> for ConnectReasonCode {
    fn from(val: i32) -> Self {
        match val {
            0 => Self::Success,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => Self::Other(val),
        }
    }
}

impl fmt::Display for ConnectReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "accepted"),
            Self::UnacceptableProtocolVersion => write!(f, "unacceptable protocol version"),
            Self::IdentifierRejected => write!(f, "identifier rejected"),
            Self::ServerUnavailable => write!(f, "broker unavailable"),
            Self::BadUserNameOrPassword => write!(f, "bad user name or password"),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::Other(val) => write!(f, "unknown reason {val}"),
        }
    }
}

/// The numeric result enumeration used by C-style MQTT engines such as
/// libmosquitto.
///
/// Engines that speak integer codes convert them with [`ReturnCode::try_from`]
/// and [`ReturnCode::into_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(i32)]
pub enum ReturnCode {
    Success = 0,
    NoMem = 1,
    Protocol = 2,
    Inval = 3,
    NoConn = 4,
    ConnRefused = 5,
    NotFound = 6,
    ConnLost = 7,
    Tls = 8,
    PayloadSize = 9,
    NotSupported = 10,
    Auth = 11,
    AclDenied = 12,
    Unknown = 13,
    Errno = 14,
}

impl TryFrom<i32> for ReturnCode {
    type Error = i32;

    fn try_from(val: i32) -> Result<Self, Self::Error> {
        Ok(match val {
            0 => Self::Success,
            1 => Self::NoMem,
            2 => Self::Protocol,
            3 => Self::Inval,
            4 => Self::NoConn,
            5 => Self::ConnRefused,
            6 => Self::NotFound,
            7 => Self::ConnLost,
            8 => Self::Tls,
            9 => Self::PayloadSize,
            10 => Self::NotSupported,
            11 => Self::Auth,
            12 => Self::AclDenied,
            13 => Self::Unknown,
            14 => Self::Errno,
            other => return Err(other),
        })
    }
}

impl ReturnCode {
    /// Maps the code onto the runtime's error taxonomy.
    ///
    /// `Errno` captures the calling thread's last OS error, so it must be
    /// converted right after the failing engine call returns.
    pub fn into_result(self) -> Result<(), MqttError> {
        match self {
            Self::Success => Ok(()),
            Self::NoMem => Err(MqttError::OutOfMemory),
            Self::Inval => Err(MqttError::InvalidParams),
            Self::NoConn => Err(MqttError::NotConnected),
            Self::ConnLost => Err(MqttError::ConnectionLost),
            Self::PayloadSize => Err(MqttError::PayloadTooLarge),
            Self::NotSupported => Err(MqttError::NotSupported),
            Self::Errno => Err(MqttError::Io(io::Error::last_os_error())),
            Self::Protocol
            | Self::ConnRefused
            | Self::NotFound
            | Self::Tls
            | Self::Auth
            | Self::AclDenied
            | Self::Unknown => Err(MqttError::Protocol),
        }
    }
}

/// How a handler failed.
#[derive(Debug)]
pub enum HandlerFailure {
    /// The handler returned an error.
    Returned(HandlerError),
    /// The handler panicked; the payload message is kept when it was a string.
    Panicked(String),
}

/// A failure raised by a user handler while an event was dispatched.
///
/// The event that triggered the handler has already been released when this
/// error is observed.
#[derive(Debug)]
pub struct DispatchError {
    kind: EventKind,
    failure: HandlerFailure,
}

impl DispatchError {
    pub(crate) fn new(kind: EventKind, failure: HandlerFailure) -> Self {
        Self { kind, failure }
    }

    /// The kind of event whose handler failed.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn failure(&self) -> &HandlerFailure {
        &self.failure
    }

    /// Returns `true` if the handler panicked instead of returning an error.
    pub fn is_panic(&self) -> bool {
        matches!(self.failure, HandlerFailure::Panicked(_))
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            HandlerFailure::Returned(e) => write!(f, "{} handler failed: {e}", self.kind),
            HandlerFailure::Panicked(msg) => write!(f, "{} handler panicked: {msg}", self.kind),
        }
    }
}

impl Error for DispatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.failure {
            HandlerFailure::Returned(e) => Some(e.as_ref()),
            HandlerFailure::Panicked(_) => None,
        }
    }
}
