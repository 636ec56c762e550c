//! Universal Serial Bus host stack.

use core::fmt;

mod usb;
pub use usb::*;
mod pipe;
pub use pipe::*;
mod host;
pub use host::*;
mod config;
pub use config::*;
pub mod drivers;

#[cfg(test)]
pub(crate) mod testing;

/// Faults observed while waiting on the bus.
///
/// Every polling wait checks these in order (disconnect, bus error,
/// stall) and clears the faulting hardware flag before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    Disconnected,
    BusError,
    Stalled,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "device disconnected"),
            Self::BusError => write!(f, "pipe bus error"),
            Self::Stalled => write!(f, "pipe stalled"),
        }
    }
}

/// Failures of a whole control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    /// A stage did not complete within the session's tick budget.
    Timeout,
    Wait(WaitError),
}

impl From<WaitError> for ControlError {
    #[inline]
    fn from(err: WaitError) -> Self {
        Self::Wait(err)
    }
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "software timeout"),
            Self::Wait(err) => err.fmt(f),
        }
    }
}

/// Failures surfaced once during device attach.
///
/// The caller's policy is fail-stop: no new operation is attempted
/// until the device is physically reattached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationError {
    ControlError,
    DescriptorTooLarge,
    InterfaceNotFound,
    NoEndpointFound,
}

impl From<ControlError> for EnumerationError {
    #[inline]
    fn from(_: ControlError) -> Self {
        Self::ControlError
    }
}

impl fmt::Display for EnumerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlError => write!(f, "control request failed"),
            Self::DescriptorTooLarge => write!(f, "configuration descriptor too large"),
            Self::InterfaceNotFound => write!(f, "no matching interface"),
            Self::NoEndpointFound => write!(f, "no matching endpoint"),
        }
    }
}

/// Opaque block I/O failure.
///
/// Stall and disconnect are deliberately not distinguished at this
/// boundary; the device session is over either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferFailed;

impl fmt::Display for TransferFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bulk transfer failed")
    }
}
