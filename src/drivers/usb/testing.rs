//! Scripted in-memory host controller used by the unit tests.

use super::pipe::*;
use std::collections::{BTreeMap, VecDeque};

/// One mock pipe: staged bytes become an OUT bank on commit, scripted
/// IN banks are consumed front to back.
#[derive(Debug, Default)]
pub struct MockPipe {
    pub frozen: bool,
    pub stalled: bool,
    pub bus_error: bool,
    pub setup_sent: bool,
    pub out_ready: bool,
    pub token: Option<PipeToken>,
    pub endpoint: u8,
    pub max_packet: u16,
    pub staged: Vec<u8>,
    pub out_banks: Vec<Vec<u8>>,
    pub in_banks: VecDeque<VecDeque<u8>>,
}

impl MockPipe {
    pub fn queue_in_bank(&mut self, bytes: &[u8]) {
        self.in_banks.push_back(bytes.iter().copied().collect());
    }
}

pub struct MockBus {
    pub connected: bool,
    /// When false the device never acknowledges a setup packet.
    pub ack_setup: bool,
    /// Drop the connection after this many data bytes have been read.
    pub disconnect_after_reads: Option<usize>,
    pub resets: Vec<PipeNumber>,
    pub configured: Vec<(PipeNumber, PipeToken, u8, u16)>,
    pub frames: u32,
    selected: u8,
    tokens: Vec<PipeToken>,
    written: usize,
    reads: usize,
    pipes: BTreeMap<u8, MockPipe>,
}

impl MockBus {
    pub fn new() -> Self {
        let mut pipes = BTreeMap::new();
        for n in 0..8 {
            pipes.insert(n, MockPipe::default());
        }
        Self {
            connected: true,
            ack_setup: true,
            disconnect_after_reads: None,
            resets: Vec::new(),
            configured: Vec::new(),
            frames: 0,
            selected: 0,
            tokens: Vec::new(),
            written: 0,
            reads: 0,
            pipes,
        }
    }

    pub fn pipe(&self, pipe: PipeNumber) -> &MockPipe {
        self.pipes.get(&pipe.0).unwrap()
    }

    pub fn pipe_mut(&mut self, pipe: PipeNumber) -> &mut MockPipe {
        self.pipes.get_mut(&pipe.0).unwrap()
    }

    pub fn tokens_set(&self) -> &[PipeToken] {
        &self.tokens
    }

    pub fn written_byte_count(&self) -> usize {
        self.written
    }

    fn current(&self) -> &MockPipe {
        self.pipes.get(&self.selected).unwrap()
    }

    fn current_mut(&mut self) -> &mut MockPipe {
        self.pipes.get_mut(&self.selected).unwrap()
    }
}

impl HostBus for MockBus {
    fn configure_pipe(
        &mut self,
        pipe: PipeNumber,
        token: PipeToken,
        endpoint: u8,
        max_packet: u16,
    ) {
        self.configured.push((pipe, token, endpoint, max_packet));
        let state = self.pipe_mut(pipe);
        state.token = Some(token);
        state.endpoint = endpoint;
        state.max_packet = max_packet;
    }

    fn select_pipe(&mut self, pipe: PipeNumber) {
        self.selected = pipe.0;
    }

    fn set_token(&mut self, token: PipeToken) {
        self.tokens.push(token);
        self.current_mut().token = Some(token);
    }

    fn freeze(&mut self) {
        self.current_mut().frozen = true;
    }

    fn unfreeze(&mut self) {
        self.current_mut().frozen = false;
    }

    fn read_byte(&mut self) -> u8 {
        self.reads += 1;
        if let Some(limit) = self.disconnect_after_reads {
            if self.reads >= limit {
                self.connected = false;
            }
        }
        self.current_mut()
            .in_banks
            .front_mut()
            .and_then(|bank| bank.pop_front())
            .unwrap_or(0)
    }

    fn write_byte(&mut self, byte: u8) {
        self.written += 1;
        self.current_mut().staged.push(byte);
    }

    fn bytes_in_bank(&self) -> u16 {
        self.current()
            .in_banks
            .front()
            .map(|bank| bank.len() as u16)
            .unwrap_or(0)
    }

    fn bank_ready(&self) -> bool {
        match self.current().token {
            Some(PipeToken::In) => !self.current().in_banks.is_empty(),
            _ => true,
        }
    }

    fn commit_bank(&mut self) {
        let ack_setup = self.ack_setup;
        let pipe = self.current_mut();
        match pipe.token {
            Some(PipeToken::In) => {
                pipe.in_banks.pop_front();
            }
            Some(PipeToken::Setup) => {
                let bank = core::mem::take(&mut pipe.staged);
                pipe.out_banks.push(bank);
                if ack_setup {
                    pipe.setup_sent = true;
                }
            }
            _ => {
                let bank = core::mem::take(&mut pipe.staged);
                pipe.out_banks.push(bank);
                pipe.out_ready = true;
            }
        }
    }

    fn has_occurred(&self, condition: PipeCondition) -> bool {
        let pipe = self.current();
        match condition {
            PipeCondition::SetupSent => pipe.setup_sent,
            // the device always answers an IN token: scripted data if
            // queued, otherwise a zero-length packet
            PipeCondition::InReceived => true,
            PipeCondition::OutReady => pipe.out_ready,
            PipeCondition::Stalled => pipe.stalled,
            PipeCondition::BusError => pipe.bus_error,
        }
    }

    fn clear(&mut self, condition: PipeCondition) {
        let pipe = self.current_mut();
        match condition {
            PipeCondition::SetupSent => pipe.setup_sent = false,
            PipeCondition::InReceived => {
                if pipe.in_banks.front().is_some_and(|bank| bank.is_empty()) {
                    pipe.in_banks.pop_front();
                }
            }
            PipeCondition::OutReady => pipe.out_ready = false,
            PipeCondition::Stalled => pipe.stalled = false,
            PipeCondition::BusError => pipe.bus_error = false,
        }
    }

    fn reset_pipe(&mut self, pipe: PipeNumber) {
        self.resets.push(pipe);
        let state = self.pipe_mut(pipe);
        state.stalled = false;
        state.bus_error = false;
        state.setup_sent = false;
        state.out_ready = false;
        state.staged.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn wait_frame(&mut self) {
        self.frames += 1;
    }
}
