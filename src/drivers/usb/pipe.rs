//! Host pipe capability layer.
//!
//! The hardware FIFO/register interface is consumed through [`HostBus`]
//! only; one implementation exists per target platform and the tests
//! provide a scripted mock. The contract is byte-oriented on purpose,
//! matching the banked FIFOs this stack is written for.

/// Host-side pipe index. Pipe 0 is always the control pipe.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipeNumber(pub u8);

impl PipeNumber {
    pub const CONTROL: Self = Self(0);
}

/// Token the selected pipe issues on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeToken {
    Setup,
    In,
    Out,
}

/// Named per-pipe hardware conditions.
///
/// Flags are queried and cleared for the currently selected pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeCondition {
    /// A setup packet has been acknowledged by the device.
    SetupSent,
    /// An IN bank holds received data.
    InReceived,
    /// An OUT bank has been transmitted and is free again.
    OutReady,
    /// The device answered the last transaction with a STALL handshake.
    Stalled,
    /// CRC/timeout/PID bus error on the selected pipe.
    BusError,
}

/// Capability interface over one USB host controller.
///
/// All pipe operations act on the currently selected pipe. Writes go
/// into the current bank and are transmitted by [`commit_bank`];
/// committing an IN bank releases it for the next packet instead.
///
/// [`commit_bank`]: HostBus::commit_bank
pub trait HostBus {
    /// Binds a pipe to a device endpoint address and packet size.
    fn configure_pipe(&mut self, pipe: PipeNumber, token: PipeToken, endpoint: u8, max_packet: u16);

    fn select_pipe(&mut self, pipe: PipeNumber);

    fn set_token(&mut self, token: PipeToken);

    fn freeze(&mut self);

    fn unfreeze(&mut self);

    fn read_byte(&mut self) -> u8;

    fn write_byte(&mut self, byte: u8);

    /// Number of unread bytes in the current bank.
    fn bytes_in_bank(&self) -> u16;

    /// Whether a bank is ready to be read from or written to.
    fn bank_ready(&self) -> bool;

    /// Transmits (OUT/SETUP) or releases (IN) the current bank.
    fn commit_bank(&mut self);

    fn has_occurred(&self, condition: PipeCondition) -> bool;

    fn clear(&mut self, condition: PipeCondition);

    /// Resets the pipe's banks and flags to a known state.
    fn reset_pipe(&mut self, pipe: PipeNumber);

    /// Whether a device is still attached to the port.
    fn is_connected(&self) -> bool;

    /// Blocks until the next start-of-frame, roughly one millisecond.
    fn wait_frame(&mut self);
}
