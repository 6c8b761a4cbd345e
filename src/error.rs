//! Error types for the transport core.

use thiserror::Error;
use usb_device::UsbError;

/// Errors surfaced to consumers of a [`SerialPort`](crate::SerialPort) or
/// [`Device`](crate::Device).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The device has been disconnected. Terminal, never worth retrying.
    #[error("device disconnected")]
    Gone,

    /// A resource is temporarily unavailable (write slots exhausted, suspend refused).
    #[error("resource busy")]
    Busy,

    /// A blocking wait exceeded its bound.
    #[error("operation timed out")]
    Timeout,

    /// The waiting handle was interrupted.
    #[error("wait interrupted")]
    Interrupted,

    /// Submission to the bus failed.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// Malformed request size or arguments.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// Bus-level failure reported by a [`Transport`](crate::Transport).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("no such device")]
    NoDevice,

    #[error("endpoint stalled")]
    Stall,

    #[error("transfer timed out")]
    Timeout,

    #[error("out of transfer memory")]
    NoMemory,

    #[error("endpoint busy")]
    Busy,

    #[error("protocol error ({0})")]
    Protocol(i32),
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NoDevice => Error::Gone,
            other => Error::Transport(other),
        }
    }
}

impl From<UsbError> for TransportError {
    fn from(e: UsbError) -> Self {
        match e {
            UsbError::WouldBlock => TransportError::Busy,
            UsbError::BufferOverflow
            | UsbError::EndpointOverflow
            | UsbError::EndpointMemoryOverflow => TransportError::NoMemory,
            UsbError::InvalidEndpoint | UsbError::InvalidState => TransportError::NoDevice,
            _ => TransportError::Protocol(-1),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
