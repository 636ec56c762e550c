//! USB class driver modules.

pub mod usb_msd;
