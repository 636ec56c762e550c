//! Universal Serial Bus wire-level types.

use byteorder::{ByteOrder, LittleEndian};
use core::fmt;
use core::mem::size_of;
use num_derive::FromPrimitive;

/// 16-bit little-endian word as it appears inside USB descriptors.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UsbWord([u8; 2]);

impl UsbWord {
    #[inline]
    pub const fn from_u16(val: u16) -> Self {
        Self(val.to_le_bytes())
    }

    #[inline]
    pub const fn as_u16(&self) -> u16 {
        u16::from_le_bytes(self.0)
    }
}

impl From<UsbWord> for u16 {
    #[inline]
    fn from(v: UsbWord) -> Self {
        v.as_u16()
    }
}

impl fmt::Debug for UsbWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.as_u16())
    }
}

/// USB Class code (BaseClass - SubClass - Protocol)
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UsbClass(pub u32);

impl UsbClass {
    /// Mass Storage, SCSI transparent command set, Bulk-Only Transport
    pub const MSD_BULK_ONLY: Self = Self(0x08_06_50);

    #[inline]
    pub const fn new(
        base_class: UsbBaseClass,
        sub_class: UsbSubClass,
        protocol: UsbProtocolCode,
    ) -> Self {
        Self(((base_class.0 as u32) << 16) | ((sub_class.0 as u32) << 8) | (protocol.0 as u32))
    }

    #[inline]
    pub const fn base_class(&self) -> UsbBaseClass {
        UsbBaseClass((self.0 >> 16) as u8)
    }

    #[inline]
    pub const fn sub_class(&self) -> UsbSubClass {
        UsbSubClass((self.0 >> 8) as u8)
    }

    #[inline]
    pub const fn protocol(&self) -> UsbProtocolCode {
        UsbProtocolCode(self.0 as u8)
    }
}

impl fmt::Debug for UsbClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}", self.0)
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UsbBaseClass(pub u8);

impl UsbBaseClass {
    pub const HID: Self = Self(0x03);
    pub const STORAGE: Self = Self(0x08);
    pub const HUB: Self = Self(0x09);
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UsbSubClass(pub u8);

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UsbProtocolCode(pub u8);

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UsbInterfaceNumber(pub u8);

/// USB Descriptor type
#[repr(u8)]
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
pub enum UsbDescriptorType {
    Device = 1,
    Configuration,
    String,
    Interface,
    Endpoint,
    DeviceQualifier,
}

/// The 8-byte setup packet that starts every control transfer.
///
/// Multi-byte fields are little-endian on the wire; [`Self::to_bytes`]
/// is the only serializer.
#[repr(C)]
#[allow(non_snake_case)]
#[derive(Debug, Clone, Copy)]
pub struct UsbControlSetupData {
    pub bmRequestType: UsbControlRequestBitmap,
    pub bRequest: UsbControlRequest,
    pub wValue: u16,
    pub wIndex: u16,
    pub wLength: u16,
}

impl UsbControlSetupData {
    pub const LENGTH: usize = 8;

    #[inline]
    pub const fn request(
        request_type: UsbControlRequestBitmap,
        request: UsbControlRequest,
    ) -> Self {
        Self {
            bmRequestType: request_type,
            bRequest: request,
            wValue: 0,
            wIndex: 0,
            wLength: 0,
        }
    }

    #[inline]
    pub const fn value(mut self, value: u16) -> Self {
        self.wValue = value;
        self
    }

    #[inline]
    pub const fn index(mut self, index: u16) -> Self {
        self.wIndex = index;
        self
    }

    #[inline]
    pub const fn index_if(self, if_no: UsbInterfaceNumber) -> Self {
        self.index(if_no.0 as u16)
    }

    #[inline]
    pub const fn length(mut self, length: u16) -> Self {
        self.wLength = length;
        self
    }

    #[inline]
    pub const fn get_descriptor(
        request_type: UsbControlRequestBitmap,
        desc_type: UsbDescriptorType,
        index: u8,
        size: u16,
    ) -> Self {
        Self::request(request_type, UsbControlRequest::GET_DESCRIPTOR)
            .value((desc_type as u16) << 8 | index as u16)
            .length(size)
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let mut bytes = [0; Self::LENGTH];
        bytes[0] = self.bmRequestType.0;
        bytes[1] = self.bRequest.0;
        LittleEndian::write_u16(&mut bytes[2..4], self.wValue);
        LittleEndian::write_u16(&mut bytes[4..6], self.wIndex);
        LittleEndian::write_u16(&mut bytes[6..8], self.wLength);
        bytes
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UsbControlRequestBitmap(pub u8);

impl UsbControlRequestBitmap {
    /// Device to host standard request
    pub const GET_DEVICE: Self = Self(0x80);
    /// Host to device standard request
    pub const SET_DEVICE: Self = Self(0x00);

    /// Device to host class specific request, interface recipient
    pub const GET_CLASS_INTERFACE: Self = Self(0xA1);
    /// Host to device class specific request, interface recipient
    pub const SET_CLASS_INTERFACE: Self = Self(0x21);

    #[inline]
    pub const fn new(
        device_to_host: bool,
        request_type: UsbControlRequestType,
        target: UsbControlRequestTarget,
    ) -> Self {
        Self(((device_to_host as u8) << 7) | ((request_type as u8) << 5) | (target as u8))
    }

    #[inline]
    pub const fn is_device_to_host(&self) -> bool {
        (self.0 & 0x80) != 0
    }
}

#[repr(u8)]
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UsbControlRequestType {
    Standard = 0,
    Class,
    Vendor,
}

#[repr(u8)]
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UsbControlRequestTarget {
    Device = 0,
    Interface,
    Endpoint,
    Other,
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UsbControlRequest(pub u8);

impl UsbControlRequest {
    pub const GET_STATUS: Self = Self(0);
    pub const CLEAR_FEATURE: Self = Self(1);
    pub const SET_FEATURE: Self = Self(3);
    pub const GET_DESCRIPTOR: Self = Self(6);
    pub const SET_DESCRIPTOR: Self = Self(7);
    pub const GET_CONFIGURATION: Self = Self(8);
    pub const SET_CONFIGURATION: Self = Self(9);
}

/// A trait compatible with standard USB descriptors.
///
/// # Safety
/// Implementors must be `repr(C, packed)` with alignment 1 so that a
/// reference into a raw descriptor blob is always valid.
pub unsafe trait UsbDescriptor: Sized {
    const DESCRIPTOR_TYPE: UsbDescriptorType;

    /// Reinterprets the head of `slice` as this descriptor after
    /// checking the advertised length and type byte.
    #[inline]
    fn from_slice(slice: &[u8]) -> Option<&Self> {
        if slice.len() < size_of::<Self>() || (slice[0] as usize) < size_of::<Self>() {
            return None;
        }
        if slice[1] != Self::DESCRIPTOR_TYPE as u8 {
            return None;
        }
        Some(unsafe { &*(slice.as_ptr() as *const Self) })
    }
}

/// USB Configuration Descriptor
#[repr(C, packed)]
#[allow(non_snake_case)]
#[derive(Debug, Clone, Copy)]
pub struct UsbConfigurationDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub wTotalLength: UsbWord,
    pub bNumInterfaces: u8,
    pub bConfigurationValue: u8,
    pub iConfiguration: u8,
    pub bmAttributes: u8,
    pub bMaxPower: u8,
}

unsafe impl UsbDescriptor for UsbConfigurationDescriptor {
    const DESCRIPTOR_TYPE: UsbDescriptorType = UsbDescriptorType::Configuration;
}

impl UsbConfigurationDescriptor {
    #[inline]
    pub const fn total_length(&self) -> u16 {
        self.wTotalLength.as_u16()
    }

    #[inline]
    pub const fn configuration_value(&self) -> u8 {
        self.bConfigurationValue
    }
}

/// USB Interface Descriptor
#[repr(C, packed)]
#[allow(non_snake_case)]
#[derive(Debug, Clone, Copy)]
pub struct UsbInterfaceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bInterfaceNumber: u8,
    pub bAlternateSetting: u8,
    pub bNumEndpoints: u8,
    pub bInterfaceClass: u8,
    pub bInterfaceSubClass: u8,
    pub bInterfaceProtocol: u8,
    pub iInterface: u8,
}

unsafe impl UsbDescriptor for UsbInterfaceDescriptor {
    const DESCRIPTOR_TYPE: UsbDescriptorType = UsbDescriptorType::Interface;
}

impl UsbInterfaceDescriptor {
    #[inline]
    pub const fn if_no(&self) -> UsbInterfaceNumber {
        UsbInterfaceNumber(self.bInterfaceNumber)
    }

    #[inline]
    pub const fn class(&self) -> UsbClass {
        UsbClass::new(
            UsbBaseClass(self.bInterfaceClass),
            UsbSubClass(self.bInterfaceSubClass),
            UsbProtocolCode(self.bInterfaceProtocol),
        )
    }
}

/// USB Endpoint Descriptor
#[repr(C, packed)]
#[allow(non_snake_case)]
#[derive(Debug, Clone, Copy)]
pub struct UsbEndpointDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bEndpointAddress: u8,
    pub bmAttributes: u8,
    pub wMaxPacketSize: UsbWord,
    pub bInterval: u8,
}

unsafe impl UsbDescriptor for UsbEndpointDescriptor {
    const DESCRIPTOR_TYPE: UsbDescriptorType = UsbDescriptorType::Endpoint;
}

impl UsbEndpointDescriptor {
    #[inline]
    pub const fn endpoint_number(&self) -> u8 {
        self.bEndpointAddress & 0x0F
    }

    #[inline]
    pub const fn endpoint_address(&self) -> u8 {
        self.bEndpointAddress
    }

    #[inline]
    pub const fn is_dir_in(&self) -> bool {
        (self.bEndpointAddress & 0x80) != 0
    }

    #[inline]
    pub fn ep_type(&self) -> UsbEndpointType {
        UsbEndpointType::from_u8(self.bmAttributes)
    }

    #[inline]
    pub const fn max_packet_size(&self) -> u16 {
        self.wMaxPacketSize.as_u16() & 0x07FF
    }

    #[inline]
    pub const fn interval(&self) -> u8 {
        self.bInterval
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UsbEndpointType {
    Control = 0,
    Isochronous,
    Bulk,
    Interrupt,
}

impl UsbEndpointType {
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v & 3 {
            0b00 => Self::Control,
            0b01 => Self::Isochronous,
            0b10 => Self::Bulk,
            0b11 => Self::Interrupt,
            _ => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_layout() {
        let setup = UsbControlSetupData::get_descriptor(
            UsbControlRequestBitmap::GET_DEVICE,
            UsbDescriptorType::Configuration,
            0,
            0x1234,
        );
        assert_eq!(
            setup.to_bytes(),
            [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x34, 0x12]
        );
    }

    #[test]
    fn request_bitmap_composition() {
        let bitmap = UsbControlRequestBitmap::new(
            true,
            UsbControlRequestType::Class,
            UsbControlRequestTarget::Interface,
        );
        assert_eq!(bitmap, UsbControlRequestBitmap::GET_CLASS_INTERFACE);
        assert!(bitmap.is_device_to_host());
        assert!(!UsbControlRequestBitmap::SET_CLASS_INTERFACE.is_device_to_host());
    }

    #[test]
    fn class_triple() {
        let class = UsbClass::new(UsbBaseClass(0x08), UsbSubClass(0x06), UsbProtocolCode(0x50));
        assert_eq!(class, UsbClass::MSD_BULK_ONLY);
        assert_eq!(class.base_class(), UsbBaseClass::STORAGE);
        assert_eq!(class.sub_class(), UsbSubClass(0x06));
        assert_eq!(class.protocol(), UsbProtocolCode(0x50));
    }

    #[test]
    fn descriptor_sizes() {
        assert_eq!(size_of::<UsbConfigurationDescriptor>(), 9);
        assert_eq!(size_of::<UsbInterfaceDescriptor>(), 9);
        assert_eq!(size_of::<UsbEndpointDescriptor>(), 7);
    }

    #[test]
    fn endpoint_descriptor_fields() {
        let raw = [7u8, 5, 0x81, 0x02, 0x40, 0x00, 0];
        let ep = UsbEndpointDescriptor::from_slice(&raw).unwrap();
        assert_eq!(ep.endpoint_number(), 1);
        assert!(ep.is_dir_in());
        assert_eq!(ep.ep_type(), UsbEndpointType::Bulk);
        assert_eq!(ep.max_packet_size(), 64);
    }

    #[test]
    fn from_slice_rejects_wrong_type() {
        let raw = [7u8, 4, 0x81, 0x02, 0x40, 0x00, 0];
        assert!(UsbEndpointDescriptor::from_slice(&raw).is_none());
    }
}
