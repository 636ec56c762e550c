//! Paged serial-flash block store.
//!
//! Maps a flat 512-byte logical block space onto paged, multi-chip
//! dataflash and streams block payloads between the flash and a
//! byte-oriented data endpoint, crossing page and chip boundaries
//! mid-stream. The SPI link is consumed through [`DataflashBus`].

use bitflags::bitflags;
use log::debug;

/// One logical storage block.
pub const BLOCK_SIZE: usize = 512;

const CMD_MAIN_MEMORY_TO_BUFFER: u8 = 0x53;
const CMD_BUFFER_WRITE: u8 = 0x84;
const CMD_BUFFER_TO_MAIN_MEMORY_WITH_ERASE: u8 = 0x83;
const CMD_MAIN_MEMORY_PAGE_READ: u8 = 0xD2;
const CMD_GET_STATUS: u8 = 0xD7;
const CMD_SECTOR_PROTECTION_OFF: [u8; 4] = [0x3D, 0x2A, 0x7F, 0x9A];

/// Dummy clock bytes the page-read command needs after its address.
const PAGE_READ_DUMMY_BYTES: usize = 4;

bitflags! {
    /// Dataflash status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusRegister: u8 {
        const READY = 0x80;
        const SECTOR_PROTECTION = 0x02;
    }
}

/// Physical layout of the installed dataflash array.
///
/// Pages are numbered flat across all chips; contiguous page ranges
/// are assigned to chips in order, so chip selection is a pure
/// function of the page number.
#[derive(Debug, Clone, Copy)]
pub struct DataflashGeometry {
    pub page_size: u32,
    pub pages_per_chip: u32,
    pub chips: u8,
    /// Bits reserved for the byte offset in the 24-bit address word.
    pub address_shift: u32,
}

impl DataflashGeometry {
    /// Two AT45DB642D chips, standard 1056-byte pages.
    pub const AT45DB642D_X2: Self = Self {
        page_size: 1056,
        pages_per_chip: 8192,
        chips: 2,
        address_shift: 11,
    };

    #[inline]
    pub const fn page_of(&self, block: u32) -> u32 {
        ((block as u64 * BLOCK_SIZE as u64) / self.page_size as u64) as u32
    }

    #[inline]
    pub const fn byte_of(&self, block: u32) -> u32 {
        ((block as u64 * BLOCK_SIZE as u64) % self.page_size as u64) as u32
    }

    #[inline]
    pub const fn chip_of(&self, page: u32) -> u8 {
        (page / self.pages_per_chip) as u8
    }

    #[inline]
    pub const fn page_in_chip(&self, page: u32) -> u32 {
        page % self.pages_per_chip
    }

    /// Total logical blocks the array holds.
    #[inline]
    pub const fn block_count(&self) -> u32 {
        ((self.chips as u64 * self.pages_per_chip as u64 * self.page_size as u64)
            / BLOCK_SIZE as u64) as u32
    }
}

/// Capability interface over the SPI link to the dataflash array.
///
/// `select` releases any currently selected chip first, which also
/// terminates the command running on it.
pub trait DataflashBus {
    fn select(&mut self, chip: u8);

    fn deselect(&mut self);

    /// Pulses chip select on the selected chip, terminating the
    /// running command while keeping the chip selected.
    fn restart(&mut self);

    /// Full-duplex SPI exchange of one byte.
    fn transfer(&mut self, byte: u8) -> u8;
}

/// Byte stream the block payloads are exchanged with, typically a
/// bulk endpoint. Banks hold one transport packet each.
pub trait DataEndpoint {
    fn bank_ready(&self) -> bool;

    fn read_byte(&mut self) -> u8;

    fn write_byte(&mut self, byte: u8);

    fn commit_bank(&mut self);

    fn packet_size(&self) -> u16;
}

/// Block-addressed view of the dataflash array.
pub struct BlockStore<B: DataflashBus> {
    bus: B,
    geometry: DataflashGeometry,
}

impl<B: DataflashBus> BlockStore<B> {
    #[inline]
    pub fn new(bus: B, geometry: DataflashGeometry) -> Self {
        Self { bus, geometry }
    }

    #[inline]
    pub fn geometry(&self) -> &DataflashGeometry {
        &self.geometry
    }

    #[inline]
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    fn command(&mut self, opcode: u8, page_in_chip: u32, byte: u32) {
        self.bus.transfer(opcode);
        let address = (page_in_chip << self.geometry.address_shift) | byte;
        self.bus.transfer((address >> 16) as u8);
        self.bus.transfer((address >> 8) as u8);
        self.bus.transfer(address as u8);
    }

    fn wait_while_busy(&mut self) {
        self.bus.restart();
        self.bus.transfer(CMD_GET_STATUS);
        while !StatusRegister::from_bits_truncate(self.bus.transfer(0))
            .contains(StatusRegister::READY)
        {}
        self.bus.restart();
    }

    fn page_read(&mut self, page: u32, byte: u32) {
        self.command(
            CMD_MAIN_MEMORY_PAGE_READ,
            self.geometry.page_in_chip(page),
            byte,
        );
        for _ in 0..PAGE_READ_DUMMY_BYTES {
            self.bus.transfer(0);
        }
    }

    /// Disables sector protection on every chip that reports it
    /// enabled. Idempotent; chips already unlocked are left alone.
    pub fn unprotect(&mut self) {
        for chip in 0..self.geometry.chips {
            self.bus.select(chip);
            self.bus.transfer(CMD_GET_STATUS);
            let status = StatusRegister::from_bits_truncate(self.bus.transfer(0));
            if status.contains(StatusRegister::SECTOR_PROTECTION) {
                debug!("disabling sector protection on chip {}", chip);
                self.bus.restart();
                for byte in CMD_SECTOR_PROTECTION_OFF {
                    self.bus.transfer(byte);
                }
            }
        }
        self.bus.deselect();
    }

    /// Streams `blocks` logical blocks from `endpoint` into the flash
    /// starting at `start_block`.
    ///
    /// The starting page is staged into the chip buffer first so a
    /// partial-page write preserves the untouched bytes. Crossing a
    /// page boundary mid-stream commits the buffer back with an
    /// implicit erase and restages the next page, re-selecting the
    /// chip when the page range changes.
    pub fn write_blocks<E: DataEndpoint>(&mut self, endpoint: &mut E, start_block: u32, blocks: u16) {
        let mut page = self.geometry.page_of(start_block);
        let mut byte_in_page = self.geometry.byte_of(start_block);
        self.bus.select(self.geometry.chip_of(page));

        self.command(CMD_MAIN_MEMORY_TO_BUFFER, self.geometry.page_in_chip(page), 0);
        self.wait_while_busy();
        self.bus.restart();
        self.command(CMD_BUFFER_WRITE, 0, byte_in_page);

        let packet_size = endpoint.packet_size() as u32;
        debug_assert_eq!(BLOCK_SIZE as u32 % packet_size, 0);
        let packets_per_block = BLOCK_SIZE as u32 / packet_size;
        let mut blocks_remaining = blocks;
        let mut sub_block = 0;
        while blocks_remaining > 0 {
            while !endpoint.bank_ready() {}

            for _ in 0..packet_size {
                if byte_in_page == self.geometry.page_size {
                    self.bus.restart();
                    self.command(
                        CMD_BUFFER_TO_MAIN_MEMORY_WITH_ERASE,
                        self.geometry.page_in_chip(page),
                        0,
                    );
                    byte_in_page = 0;
                    page += 1;
                    self.bus.select(self.geometry.chip_of(page));
                    self.wait_while_busy();
                    self.command(
                        CMD_MAIN_MEMORY_TO_BUFFER,
                        self.geometry.page_in_chip(page),
                        0,
                    );
                    self.wait_while_busy();
                    self.bus.restart();
                    self.command(CMD_BUFFER_WRITE, 0, 0);
                }
                let byte = endpoint.read_byte();
                self.bus.transfer(byte);
                byte_in_page += 1;
            }
            endpoint.commit_bank();

            sub_block += 1;
            if sub_block == packets_per_block {
                blocks_remaining -= 1;
                sub_block = 0;
            }
        }

        self.bus.restart();
        self.command(
            CMD_BUFFER_TO_MAIN_MEMORY_WITH_ERASE,
            self.geometry.page_in_chip(page),
            0,
        );
        self.wait_while_busy();
        self.bus.deselect();
    }

    /// Streams `blocks` logical blocks from the flash into `endpoint`
    /// starting at `start_block`.
    ///
    /// Crossing a page boundary re-issues the page-read command at the
    /// next page with offset zero.
    pub fn read_blocks<E: DataEndpoint>(&mut self, endpoint: &mut E, start_block: u32, blocks: u16) {
        let mut page = self.geometry.page_of(start_block);
        let mut byte_in_page = self.geometry.byte_of(start_block);
        self.bus.select(self.geometry.chip_of(page));
        self.page_read(page, byte_in_page);

        let packet_size = endpoint.packet_size() as u32;
        debug_assert_eq!(BLOCK_SIZE as u32 % packet_size, 0);
        let packets_per_block = BLOCK_SIZE as u32 / packet_size;
        let mut blocks_remaining = blocks;
        let mut sub_block = 0;
        while blocks_remaining > 0 {
            while !endpoint.bank_ready() {}

            for _ in 0..packet_size {
                if byte_in_page == self.geometry.page_size {
                    byte_in_page = 0;
                    page += 1;
                    self.bus.select(self.geometry.chip_of(page));
                    self.page_read(page, 0);
                }
                endpoint.write_byte(self.bus.transfer(0));
                byte_in_page += 1;
            }
            endpoint.commit_bank();

            sub_block += 1;
            if sub_block == packets_per_block {
                blocks_remaining -= 1;
                sub_block = 0;
            }
        }

        self.bus.deselect();
    }
}
