//! USB mass storage host stack and paged dataflash block store.
//!
//! The host side drives external USB mass storage devices through
//! three layers: a control-transfer engine on the control pipe, a
//! descriptor walker that discovers the bulk pipe pair, and the
//! bulk-only block protocol framing SCSI READ(10)/WRITE(10) commands.
//! The device side exposes a multi-chip dataflash array as fixed-size
//! logical blocks, streaming payloads to and from a bulk endpoint.
//!
//! Hardware access goes through three capability traits implemented
//! once per board: [`drivers::usb::HostBus`] for the pipe registers,
//! [`drivers::dataflash::DataflashBus`] for the SPI link and
//! [`drivers::dataflash::DataEndpoint`] for the endpoint byte stream.
//! Everything above those traits is portable and unit-tested against
//! scripted in-memory implementations.

#![cfg_attr(not(test), no_std)]

pub mod drivers;
