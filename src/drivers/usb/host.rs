//! Host session context and the control-transfer engine.

use super::*;
use log::warn;

/// Default number of frame ticks a control stage may take before the
/// request fails with [`ControlError::Timeout`].
pub const DEFAULT_TICK_BUDGET: u16 = 500;

/// Payload of the data stage of a control transfer.
pub enum ControlData<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

/// Explicit per-device session state.
///
/// Owns the bus handle, the monotonic command tag and the timeout
/// budget, so nothing about an in-flight transfer lives in globals.
/// Exactly one control request is in flight at a time.
pub struct HostSession<B: HostBus> {
    bus: B,
    tag: u32,
    tick_budget: u16,
    control_max_packet: u16,
}

impl<B: HostBus> HostSession<B> {
    #[inline]
    pub fn new(bus: B, control_max_packet: u16) -> Self {
        Self {
            bus,
            tag: 1,
            tick_budget: DEFAULT_TICK_BUDGET,
            control_max_packet,
        }
    }

    #[inline]
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    #[inline]
    pub fn set_tick_budget(&mut self, ticks: u16) {
        self.tick_budget = ticks;
    }

    /// Current tag, then advance. Called exactly once per issued
    /// command so tags are strictly increasing within the session.
    #[inline]
    pub fn next_tag(&mut self) -> u32 {
        let tag = self.tag;
        self.tag = self.tag.wrapping_add(1);
        tag
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.bus.is_connected()
    }

    /// One frame of settling time between bulk commands.
    #[inline]
    pub fn settle_frame(&mut self) {
        self.bus.wait_frame();
    }

    /// Waits one frame, then checks the session faults in fixed order:
    /// disconnect, bus error, stall. The faulting flag is cleared
    /// before the error propagates; nothing is retried here.
    pub fn wait_frame_checked(&mut self) -> Result<(), WaitError> {
        self.bus.wait_frame();
        if !self.bus.is_connected() {
            return Err(WaitError::Disconnected);
        }
        if self.bus.has_occurred(PipeCondition::BusError) {
            self.bus.clear(PipeCondition::BusError);
            return Err(WaitError::BusError);
        }
        if self.bus.has_occurred(PipeCondition::Stalled) {
            self.bus.clear(PipeCondition::Stalled);
            return Err(WaitError::Stalled);
        }
        Ok(())
    }

    /// Polls `condition` on the selected pipe at frame granularity,
    /// bounded by the session tick budget.
    fn poll_condition(&mut self, condition: PipeCondition) -> Result<(), ControlError> {
        let mut ticks: u16 = 0;
        while !self.bus.has_occurred(condition) {
            self.wait_frame_checked()?;
            ticks += 1;
            if ticks >= self.tick_budget {
                return Err(ControlError::Timeout);
            }
        }
        Ok(())
    }

    /// Runs one complete control request through its setup, optional
    /// data and status stages on the control pipe.
    ///
    /// Whatever the outcome, the control pipe is frozen and reset
    /// before this returns, so the next request starts clean.
    pub fn send_control(
        &mut self,
        setup: UsbControlSetupData,
        data: ControlData,
    ) -> Result<(), ControlError> {
        let result = self.control_stages(setup, data);
        self.bus.freeze();
        self.bus.reset_pipe(PipeNumber::CONTROL);
        if let Err(err) = result {
            warn!(
                "control request {:02x}:{:02x} failed: {}",
                setup.bmRequestType.0, setup.bRequest.0, err
            );
        }
        result
    }

    fn control_stages(
        &mut self,
        setup: UsbControlSetupData,
        data: ControlData,
    ) -> Result<(), ControlError> {
        self.wait_frame_checked()?;

        // Setup stage
        self.bus.select_pipe(PipeNumber::CONTROL);
        self.bus.clear(PipeCondition::BusError);
        self.bus.set_token(PipeToken::Setup);
        self.bus.clear(PipeCondition::SetupSent);
        self.bus.unfreeze();
        for byte in setup.to_bytes() {
            self.bus.write_byte(byte);
        }
        self.bus.commit_bank();
        self.poll_condition(PipeCondition::SetupSent)?;
        self.bus.clear(PipeCondition::SetupSent);
        self.bus.freeze();
        self.wait_frame_checked()?;

        if setup.bmRequestType.is_device_to_host() {
            if let ControlData::In(buffer) = data {
                let mut remaining = (setup.wLength as usize).min(buffer.len());
                let mut offset = 0;
                self.bus.set_token(PipeToken::In);
                while remaining > 0 {
                    self.bus.unfreeze();
                    self.poll_condition(PipeCondition::InReceived)?;
                    // an empty IN bank is a short packet and ends the stage
                    if self.bus.bytes_in_bank() == 0 {
                        remaining = 0;
                    }
                    while self.bus.bytes_in_bank() > 0 && remaining > 0 {
                        buffer[offset] = self.bus.read_byte();
                        offset += 1;
                        remaining -= 1;
                    }
                    self.bus.freeze();
                    self.bus.clear(PipeCondition::InReceived);
                }
            }

            // Status stage: zero-length OUT
            self.bus.set_token(PipeToken::Out);
            self.bus.unfreeze();
            self.bus.commit_bank();
            self.poll_condition(PipeCondition::OutReady)?;
            self.bus.clear(PipeCondition::OutReady);
        } else {
            if let ControlData::Out(buffer) = data {
                let mut remaining = (setup.wLength as usize).min(buffer.len());
                let mut offset = 0;
                self.bus.set_token(PipeToken::Out);
                while remaining > 0 {
                    self.bus.unfreeze();
                    let chunk = remaining.min(self.control_max_packet as usize);
                    for _ in 0..chunk {
                        self.bus.write_byte(buffer[offset]);
                        offset += 1;
                    }
                    remaining -= chunk;
                    self.bus.commit_bank();
                    self.poll_condition(PipeCondition::OutReady)?;
                    self.bus.clear(PipeCondition::OutReady);
                }
            }

            // Status stage: zero-length IN
            self.bus.freeze();
            self.bus.set_token(PipeToken::In);
            self.bus.unfreeze();
            self.poll_condition(PipeCondition::InReceived)?;
            self.bus.freeze();
            self.bus.clear(PipeCondition::InReceived);
        }

        Ok(())
    }

    /// Standard SET_CONFIGURATION request, issued once after attach
    /// before any class traffic.
    pub fn set_configuration(&mut self, value: u8) -> Result<(), ControlError> {
        self.send_control(
            UsbControlSetupData::request(
                UsbControlRequestBitmap::SET_DEVICE,
                UsbControlRequest::SET_CONFIGURATION,
            )
            .value(value as u16),
            ControlData::None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::testing::MockBus;

    fn get_descriptor_setup(len: u16) -> UsbControlSetupData {
        UsbControlSetupData::get_descriptor(
            UsbControlRequestBitmap::GET_DEVICE,
            UsbDescriptorType::Device,
            0,
            len,
        )
    }

    #[test]
    fn zero_length_request_skips_data_stage() {
        let bus = MockBus::new();
        let mut session = HostSession::new(bus, 8);
        session.set_configuration(1).unwrap();

        let bus = session.bus_mut();
        // exactly the 8 setup bytes crossed the pipe
        assert_eq!(bus.written_byte_count(), 8);
        // token sequence is setup then status-IN, no data stage
        assert_eq!(bus.tokens_set(), &[PipeToken::Setup, PipeToken::In]);
        assert!(bus.pipe(PipeNumber::CONTROL).frozen);
    }

    #[test]
    fn in_data_stage_reads_device_reply() {
        let mut bus = MockBus::new();
        bus.pipe_mut(PipeNumber::CONTROL).queue_in_bank(&[0x42]);
        let mut session = HostSession::new(bus, 8);

        let mut reply = [0u8; 1];
        session
            .send_control(
                UsbControlSetupData::request(
                    UsbControlRequestBitmap::GET_CLASS_INTERFACE,
                    UsbControlRequest(0xFE),
                )
                .length(1),
                ControlData::In(&mut reply),
            )
            .unwrap();
        assert_eq!(reply[0], 0x42);
    }

    #[test]
    fn out_data_stage_chunks_by_packet_size() {
        let bus = MockBus::new();
        let mut session = HostSession::new(bus, 8);

        let payload = [0xAAu8; 20];
        session
            .send_control(
                UsbControlSetupData::request(
                    UsbControlRequestBitmap::SET_DEVICE,
                    UsbControlRequest::SET_DESCRIPTOR,
                )
                .length(20),
                ControlData::Out(&payload),
            )
            .unwrap();

        let banks = &session.bus_mut().pipe(PipeNumber::CONTROL).out_banks;
        // setup bank + 8/8/4 data chunks + zero-length status
        let lengths: Vec<usize> = banks.iter().map(|b| b.len()).collect();
        assert_eq!(lengths, [8, 8, 8, 4, 0]);
    }

    #[test]
    fn setup_timeout_reports_software_timeout() {
        let mut bus = MockBus::new();
        bus.ack_setup = false;
        let mut session = HostSession::new(bus, 8);
        session.set_tick_budget(10);

        let err = session.set_configuration(1).unwrap_err();
        assert_eq!(err, ControlError::Timeout);
        // frozen and reset even on failure
        let bus = session.bus_mut();
        assert!(bus.pipe(PipeNumber::CONTROL).frozen);
        assert_eq!(bus.resets, vec![PipeNumber::CONTROL]);
        // the wait really ticked host frames
        assert!(bus.frames >= 10);
    }

    #[test]
    fn stall_during_setup_is_cleared_and_propagated() {
        let mut bus = MockBus::new();
        bus.ack_setup = false;
        bus.pipe_mut(PipeNumber::CONTROL).stalled = true;
        let mut session = HostSession::new(bus, 8);

        let err = session.set_configuration(1).unwrap_err();
        assert_eq!(err, ControlError::Wait(WaitError::Stalled));
        assert!(!session.bus_mut().pipe(PipeNumber::CONTROL).stalled);
    }

    #[test]
    fn disconnect_aborts_request() {
        let mut bus = MockBus::new();
        bus.connected = false;
        let mut session = HostSession::new(bus, 8);

        let err = session
            .send_control(get_descriptor_setup(0), ControlData::None)
            .unwrap_err();
        assert_eq!(err, ControlError::Wait(WaitError::Disconnected));
        assert!(!session.is_connected());
    }

    #[test]
    fn bus_error_is_cleared_and_propagated() {
        let mut bus = MockBus::new();
        bus.ack_setup = false;
        bus.pipe_mut(PipeNumber::CONTROL).bus_error = true;
        let mut session = HostSession::new(bus, 8);

        let err = session.set_configuration(1).unwrap_err();
        assert_eq!(err, ControlError::Wait(WaitError::BusError));
        assert!(!session.bus_mut().pipe(PipeNumber::CONTROL).bus_error);
    }

    #[test]
    fn short_in_packet_terminates_data_stage() {
        let mut bus = MockBus::new();
        bus.pipe_mut(PipeNumber::CONTROL).queue_in_bank(&[1, 2]);
        bus.pipe_mut(PipeNumber::CONTROL).queue_in_bank(&[]);
        let mut session = HostSession::new(bus, 8);

        let mut reply = [0u8; 8];
        session
            .send_control(get_descriptor_setup(8), ControlData::In(&mut reply))
            .unwrap();
        assert_eq!(&reply[..2], &[1, 2]);
        assert_eq!(&reply[2..], &[0; 6]);
    }
}
