//! Unified error type for ble2uart.
//!
//! No variant allocates; each carries only fixed-size data.  None of them
//! is fatal: every failure leaves the central in a defined state and is
//! reported to the host as an `error:` line.

use core::fmt;

use crate::ble::stack::StackError;
use crate::serial::command::ParseError;
use crate::serial::frame::FrameError;

/// Top-level error type used across the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // Central
    /// No device to connect to (empty scan list or nothing selected).
    InvalidTarget,

    /// The request is not valid in the current connection or scan state.
    InvalidState,

    /// The request needs an established link.
    NotConnected,

    /// Another GATT procedure is still outstanding.
    Busy,

    /// The target characteristic has not been discovered.
    NoCharacteristic,

    /// The stack had no buffer for a write payload.
    AllocFailed,

    // Collaborators
    Stack(StackError),

    // Host link
    Frame(FrameError),
    Command(ParseError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidTarget => f.write_str("no device selected"),
            Error::InvalidState => f.write_str("not allowed now"),
            Error::NotConnected => f.write_str("not connected"),
            Error::Busy => f.write_str("procedure in progress"),
            Error::NoCharacteristic => f.write_str("characteristic unknown"),
            Error::AllocFailed => f.write_str("alloc failed"),
            Error::Stack(e) => write!(f, "stack {}", e),
            Error::Frame(e) => write!(f, "frame: {}", e),
            Error::Command(e) => fmt::Display::fmt(e, f),
        }
    }
}

// Convenience conversions

impl From<StackError> for Error {
    fn from(e: StackError) -> Self {
        Error::Stack(e)
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::Frame(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Command(e)
    }
}
