//! USB Mass Storage class driver (Bulk-Only Transport).
//!
//! Frames SCSI READ(10)/WRITE(10) commands in 31-byte command block
//! wrappers on the bulk OUT pipe, streams the payload on the bulk
//! pipes and drains the 13-byte status wrapper. A stall on either data
//! pipe or a disconnect aborts the operation; there is no automatic
//! retry, the caller abandons the device session on failure.

use super::super::*;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::{debug, warn};
use num_traits::FromPrimitive;

pub const GET_MAX_LUN: UsbControlRequest = UsbControlRequest(0xFE);
pub const MASS_STORAGE_RESET: UsbControlRequest = UsbControlRequest(0xFF);

/// Host pipe indices the data pipes are bound to.
pub const DATA_IN_PIPE: PipeNumber = PipeNumber(1);
pub const DATA_OUT_PIPE: PipeNumber = PipeNumber(2);

pub const CBW_SIGNATURE: u32 = 0x43425355; // "USBC"
pub const CSW_SIGNATURE: u32 = 0x53425355; // "USBS"

pub const SCSI_CMD_READ_10: u8 = 0x28;
pub const SCSI_CMD_WRITE_10: u8 = 0x2A;

/// One storage block as addressed over the bulk protocol.
pub const DEVICE_BLOCK_SIZE: usize = 512;

/// Direction bit of the command block wrapper flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDirection {
    DataOut = 0x00,
    DataIn = 0x80,
}

/// The 31-byte command block wrapper framing one SCSI command.
#[derive(Debug, Clone)]
pub struct CommandBlockWrapper {
    pub tag: u32,
    pub data_transfer_length: u32,
    pub direction: CommandDirection,
    pub lun: u8,
    pub command_length: u8,
    pub command: [u8; 16],
}

impl CommandBlockWrapper {
    pub const LENGTH: usize = 31;

    /// READ(10): big-endian block address and block count.
    pub fn scsi_read_10(tag: u32, block_address: u32, blocks: u16) -> Self {
        Self::scsi_10(tag, SCSI_CMD_READ_10, CommandDirection::DataIn, block_address, blocks)
    }

    /// WRITE(10): big-endian block address and block count.
    pub fn scsi_write_10(tag: u32, block_address: u32, blocks: u16) -> Self {
        Self::scsi_10(tag, SCSI_CMD_WRITE_10, CommandDirection::DataOut, block_address, blocks)
    }

    fn scsi_10(
        tag: u32,
        opcode: u8,
        direction: CommandDirection,
        block_address: u32,
        blocks: u16,
    ) -> Self {
        let mut command = [0u8; 16];
        command[0] = opcode;
        // byte 1: control bits, all off
        BigEndian::write_u32(&mut command[2..6], block_address);
        // byte 6: reserved
        BigEndian::write_u16(&mut command[7..9], blocks);
        // byte 9: control, zero
        Self {
            tag,
            data_transfer_length: blocks as u32 * DEVICE_BLOCK_SIZE as u32,
            direction,
            lun: 0,
            command_length: 10,
            command,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let mut bytes = [0u8; Self::LENGTH];
        LittleEndian::write_u32(&mut bytes[0..4], CBW_SIGNATURE);
        LittleEndian::write_u32(&mut bytes[4..8], self.tag);
        LittleEndian::write_u32(&mut bytes[8..12], self.data_transfer_length);
        bytes[12] = self.direction as u8;
        bytes[13] = self.lun;
        bytes[14] = self.command_length;
        bytes[15..31].copy_from_slice(&self.command);
        bytes
    }
}

/// Command status wrapper status byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum CswStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

/// The 13-byte command status wrapper.
///
/// The transfer engine drains the status bank without parsing it; this
/// type exists for consumers that read the wrapper themselves.
#[derive(Debug, Clone, Copy)]
pub struct CommandStatusWrapper {
    pub signature: u32,
    pub tag: u32,
    pub residue: u32,
    pub status: u8,
}

impl CommandStatusWrapper {
    pub const LENGTH: usize = 13;

    pub fn from_bytes(bytes: &[u8; Self::LENGTH]) -> Self {
        Self {
            signature: LittleEndian::read_u32(&bytes[0..4]),
            tag: LittleEndian::read_u32(&bytes[4..8]),
            residue: LittleEndian::read_u32(&bytes[8..12]),
            status: bytes[12],
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.signature == CSW_SIGNATURE
    }

    #[inline]
    pub fn status(&self) -> Option<CswStatus> {
        FromPrimitive::from_u8(self.status)
    }
}

/// The bulk pipe pair of one logical unit, discovered at enumeration
/// and cached for the lifetime of the attached device.
#[derive(Debug, Clone, Copy)]
pub struct PipePair {
    pub in_pipe: PipeNumber,
    pub in_size: u16,
    pub out_pipe: PipeNumber,
    pub out_size: u16,
}

/// Phase of one bulk-only operation, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BotPhase {
    SendCbw,
    DataIn,
    DataOut,
    DrainStatus,
}

/// One attached bulk-only mass storage device.
#[derive(Debug)]
pub struct MassStorageDevice {
    pipes: PipePair,
    if_no: UsbInterfaceNumber,
}

impl MassStorageDevice {
    /// Configures the attached device and discovers its bulk pipes.
    ///
    /// Sets configuration 1, reads the configuration descriptor, finds
    /// the first mass-storage bulk-only interface and binds its bulk
    /// endpoints to [`DATA_IN_PIPE`] and [`DATA_OUT_PIPE`].
    pub fn enumerate<B: HostBus>(
        session: &mut HostSession<B>,
        buffer: &mut ConfigBuffer,
    ) -> Result<Self, EnumerationError> {
        session.set_configuration(1)?;
        read_configuration(session, buffer)?;

        let mut walker = DescriptorWalker::new(buffer);
        let raw = walker
            .find_next(interface_with_class(UsbClass::MSD_BULK_ONLY))
            .map_err(|_| EnumerationError::InterfaceNotFound)?;
        let if_no = UsbInterfaceDescriptor::from_slice(raw)
            .ok_or(EnumerationError::InterfaceNotFound)?
            .if_no();

        let mut pipe_in: Option<(u8, u16)> = None;
        let mut pipe_out: Option<(u8, u16)> = None;
        while pipe_in.is_none() || pipe_out.is_none() {
            let raw = walker
                .find_next(data_endpoint_in_interface())
                .map_err(|_| EnumerationError::NoEndpointFound)?;
            let ep = UsbEndpointDescriptor::from_slice(raw)
                .ok_or(EnumerationError::NoEndpointFound)?;
            match classify_endpoint(ep) {
                Some(EndpointRole::DataIn) => {
                    pipe_in = Some((ep.endpoint_address(), ep.max_packet_size()));
                }
                Some(EndpointRole::DataOut) => {
                    pipe_out = Some((ep.endpoint_address(), ep.max_packet_size()));
                }
                _ => (),
            }
        }
        let (in_endpoint, in_size) = pipe_in.unwrap();
        let (out_endpoint, out_size) = pipe_out.unwrap();

        let bus = session.bus_mut();
        bus.configure_pipe(DATA_IN_PIPE, PipeToken::In, in_endpoint, in_size);
        bus.configure_pipe(DATA_OUT_PIPE, PipeToken::Out, out_endpoint, out_size);
        debug!(
            "mass storage pipes bound: IN {:02x}/{} OUT {:02x}/{}",
            in_endpoint, in_size, out_endpoint, out_size
        );

        Ok(Self {
            pipes: PipePair {
                in_pipe: DATA_IN_PIPE,
                in_size,
                out_pipe: DATA_OUT_PIPE,
                out_size,
            },
            if_no,
        })
    }

    #[inline]
    pub fn pipes(&self) -> &PipePair {
        &self.pipes
    }

    /// Class request: highest logical unit number the device supports.
    pub fn max_lun<B: HostBus>(&self, session: &mut HostSession<B>) -> Result<u8, ControlError> {
        let mut reply = [0u8; 1];
        session
            .send_control(
                UsbControlSetupData::request(
                    UsbControlRequestBitmap::GET_CLASS_INTERFACE,
                    GET_MAX_LUN,
                )
                .index_if(self.if_no)
                .length(1),
                ControlData::In(&mut reply),
            )
            .map(|_| reply[0])
    }

    /// Class request: bulk-only mass storage reset.
    pub fn reset<B: HostBus>(&self, session: &mut HostSession<B>) -> Result<(), ControlError> {
        session.send_control(
            UsbControlSetupData::request(
                UsbControlRequestBitmap::SET_CLASS_INTERFACE,
                MASS_STORAGE_RESET,
            )
            .index_if(self.if_no),
            ControlData::None,
        )
    }

    /// Reads `blocks` blocks starting at `block_address` into `buffer`.
    pub fn read_blocks<B: HostBus>(
        &self,
        session: &mut HostSession<B>,
        block_address: u32,
        blocks: u16,
        buffer: &mut [u8],
    ) -> Result<(), TransferFailed> {
        let result = self.read_blocks_inner(session, block_address, blocks, buffer);
        self.freeze_data_pipes(session.bus_mut());
        if result.is_ok() {
            session.settle_frame();
        }
        result
    }

    /// Writes `blocks` blocks starting at `block_address` from `buffer`.
    pub fn write_blocks<B: HostBus>(
        &self,
        session: &mut HostSession<B>,
        block_address: u32,
        blocks: u16,
        buffer: &[u8],
    ) -> Result<(), TransferFailed> {
        let result = self.write_blocks_inner(session, block_address, blocks, buffer);
        self.freeze_data_pipes(session.bus_mut());
        if result.is_ok() {
            session.settle_frame();
        }
        result
    }

    fn read_blocks_inner<B: HostBus>(
        &self,
        session: &mut HostSession<B>,
        block_address: u32,
        blocks: u16,
        buffer: &mut [u8],
    ) -> Result<(), TransferFailed> {
        let total = blocks as usize * DEVICE_BLOCK_SIZE;
        if buffer.len() < total {
            return Err(TransferFailed);
        }
        let cbw = CommandBlockWrapper::scsi_read_10(session.next_tag(), block_address, blocks);
        self.send_cbw(session.bus_mut(), &cbw)?;
        let bus = session.bus_mut();
        bus.freeze();

        // TRANSFER_DATA: drain the device's reply from the IN pipe
        bus.select_pipe(self.pipes.in_pipe);
        bus.unfreeze();
        while !bus.bank_ready() {
            if self.data_pipes_faulted(bus) {
                return self.fail(BotPhase::DataIn);
            }
        }
        let mut received = 0;
        while received < total {
            buffer[received] = bus.read_byte();
            received += 1;
            if !bus.is_connected() {
                return self.fail(BotPhase::DataIn);
            }
            if received < total && bus.bytes_in_bank() == 0 {
                bus.commit_bank();
                while !bus.bank_ready() {
                    if !bus.is_connected() {
                        return self.fail(BotPhase::DataIn);
                    }
                }
            }
        }
        bus.commit_bank();

        self.drain_status(bus)
    }

    fn write_blocks_inner<B: HostBus>(
        &self,
        session: &mut HostSession<B>,
        block_address: u32,
        blocks: u16,
        buffer: &[u8],
    ) -> Result<(), TransferFailed> {
        let total = blocks as usize * DEVICE_BLOCK_SIZE;
        if buffer.len() < total {
            return Err(TransferFailed);
        }
        let cbw = CommandBlockWrapper::scsi_write_10(session.next_tag(), block_address, blocks);
        self.send_cbw(session.bus_mut(), &cbw)?;
        let bus = session.bus_mut();

        // TRANSFER_DATA: stream the payload, one bank per packet
        let packet_size = self.pipes.out_size as usize;
        let mut bytes_in_bank = 0;
        for &byte in &buffer[..total] {
            bus.write_byte(byte);
            bytes_in_bank += 1;
            if !bus.is_connected() {
                return self.fail(BotPhase::DataOut);
            }
            if bytes_in_bank == packet_size {
                bus.commit_bank();
                bytes_in_bank = 0;
                if bus.has_occurred(PipeCondition::Stalled) {
                    bus.clear(PipeCondition::Stalled);
                    return self.fail(BotPhase::DataOut);
                }
            }
        }
        if bytes_in_bank > 0 {
            bus.commit_bank();
        }
        bus.freeze();

        bus.select_pipe(self.pipes.in_pipe);
        bus.unfreeze();
        self.drain_status(bus)
    }

    /// SEND_CBW: streams all 31 wrapper bytes on the OUT pipe.
    ///
    /// The OUT pipe is left unfrozen; the write path continues on it.
    fn send_cbw<B: HostBus>(
        &self,
        bus: &mut B,
        cbw: &CommandBlockWrapper,
    ) -> Result<(), TransferFailed> {
        bus.select_pipe(self.pipes.out_pipe);
        bus.unfreeze();
        for byte in cbw.to_bytes() {
            bus.write_byte(byte);
        }
        bus.commit_bank();
        if bus.has_occurred(PipeCondition::Stalled) {
            bus.clear(PipeCondition::Stalled);
            return self.fail(BotPhase::SendCbw);
        }
        if !bus.is_connected() {
            return self.fail(BotPhase::SendCbw);
        }
        Ok(())
    }

    /// DRAIN_STATUS: the 13-byte status wrapper is acknowledged and
    /// discarded without parsing. The IN pipe must be selected and
    /// unfrozen.
    fn drain_status<B: HostBus>(&self, bus: &mut B) -> Result<(), TransferFailed> {
        while !bus.bank_ready() {
            if !bus.is_connected() {
                return self.fail(BotPhase::DrainStatus);
            }
        }
        bus.commit_bank();
        bus.freeze();
        Ok(())
    }

    /// Checks both data pipes for a stall and the port for a
    /// disconnect, clearing any stall found. Leaves the IN pipe
    /// selected.
    fn data_pipes_faulted<B: HostBus>(&self, bus: &mut B) -> bool {
        bus.select_pipe(self.pipes.out_pipe);
        if bus.has_occurred(PipeCondition::Stalled) {
            bus.clear(PipeCondition::Stalled);
            return true;
        }
        bus.select_pipe(self.pipes.in_pipe);
        if bus.has_occurred(PipeCondition::Stalled) {
            bus.clear(PipeCondition::Stalled);
            return true;
        }
        !bus.is_connected()
    }

    fn freeze_data_pipes<B: HostBus>(&self, bus: &mut B) {
        bus.select_pipe(self.pipes.out_pipe);
        bus.freeze();
        bus.select_pipe(self.pipes.in_pipe);
        bus.freeze();
    }

    fn fail(&self, phase: BotPhase) -> Result<(), TransferFailed> {
        warn!("bulk-only transfer aborted in {:?} phase", phase);
        Err(TransferFailed)
    }
}
