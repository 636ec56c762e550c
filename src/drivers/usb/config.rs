//! Configuration descriptor retrieval and traversal.

use super::*;
use num_traits::FromPrimitive;

/// Working-buffer budget for one whole configuration descriptor.
pub const MAX_CONFIG_DESCRIPTOR_SIZE: usize = 512;

/// Bounded buffer holding the raw configuration descriptor blob.
pub type ConfigBuffer = heapless::Vec<u8, MAX_CONFIG_DESCRIPTOR_SIZE>;

/// Verdict of a search predicate for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Search {
    Found,
    NotFound,
    /// Stop the search early; the target cannot occur past this point.
    Fail,
}

/// Why a predicate search ended without a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEnd {
    /// The blob is exhausted.
    Exhausted,
    /// A predicate returned [`Search::Fail`].
    Stopped,
}

/// Role a discovered endpoint plays for a class driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// Interrupt IN endpoint carrying unsolicited events.
    Events,
    /// Bulk IN endpoint carrying device-to-host data.
    DataIn,
    /// Bulk OUT endpoint carrying host-to-device data.
    DataOut,
}

/// Classifies an endpoint by its direction and transfer-type bits.
pub fn classify_endpoint(ep: &UsbEndpointDescriptor) -> Option<EndpointRole> {
    match (ep.ep_type(), ep.is_dir_in()) {
        (UsbEndpointType::Bulk, true) => Some(EndpointRole::DataIn),
        (UsbEndpointType::Bulk, false) => Some(EndpointRole::DataOut),
        (UsbEndpointType::Interrupt, true) => Some(EndpointRole::Events),
        _ => None,
    }
}

/// Cursor over a raw configuration-descriptor blob.
///
/// The cursor starts on the configuration header itself; each search
/// advances descriptor by descriptor using the length prefix.
pub struct DescriptorWalker<'a> {
    blob: &'a [u8],
    cursor: usize,
}

impl<'a> DescriptorWalker<'a> {
    #[inline]
    pub fn new(blob: &'a [u8]) -> Self {
        Self { blob, cursor: 0 }
    }

    /// The descriptor currently under the cursor.
    #[inline]
    pub fn current(&self) -> Option<&'a [u8]> {
        let rest = &self.blob[self.cursor.min(self.blob.len())..];
        (rest.len() >= 2 && rest[0] as usize >= 2).then_some(rest)
    }

    /// The descriptor type byte currently under the cursor.
    #[inline]
    pub fn current_type(&self) -> Option<UsbDescriptorType> {
        self.current().and_then(|d| FromPrimitive::from_u8(d[1]))
    }

    /// Skips the current descriptor, landing on the next one.
    /// Returns `None` once the blob is exhausted or malformed.
    pub fn advance(&mut self) -> Option<&'a [u8]> {
        let current = self.current()?;
        self.cursor += current[0] as usize;
        self.current()
    }

    /// Advances until `predicate` reports [`Search::Found`].
    ///
    /// The predicate may return [`Search::Fail`] to bound the search,
    /// e.g. when a new interface descriptor begins before the wanted
    /// endpoint was seen.
    pub fn find_next<F>(&mut self, mut predicate: F) -> Result<&'a [u8], SearchEnd>
    where
        F: FnMut(&[u8]) -> Search,
    {
        loop {
            let descriptor = self.advance().ok_or(SearchEnd::Exhausted)?;
            match predicate(descriptor) {
                Search::Found => return Ok(descriptor),
                Search::NotFound => continue,
                Search::Fail => return Err(SearchEnd::Stopped),
            }
        }
    }
}

/// Predicate matching the next interface descriptor with the given
/// class/subclass/protocol triple.
pub fn interface_with_class(class: UsbClass) -> impl FnMut(&[u8]) -> Search {
    move |descriptor| match UsbInterfaceDescriptor::from_slice(descriptor) {
        Some(iface) if iface.class() == class => Search::Found,
        _ => Search::NotFound,
    }
}

/// Predicate matching the next bulk or interrupt endpoint, failing the
/// search at the next interface descriptor so an endpoint hunt never
/// leaks out of the interface it started in.
pub fn data_endpoint_in_interface() -> impl FnMut(&[u8]) -> Search {
    |descriptor| {
        if let Some(ep) = UsbEndpointDescriptor::from_slice(descriptor) {
            return match ep.ep_type() {
                UsbEndpointType::Bulk | UsbEndpointType::Interrupt => Search::Found,
                _ => Search::NotFound,
            };
        }
        if descriptor[1] == UsbDescriptorType::Interface as u8 {
            return Search::Fail;
        }
        Search::NotFound
    }
}

/// Reads the whole configuration descriptor into `buffer`.
///
/// The 9-byte header is fetched first for its advertised total length;
/// a device advertising more than the working-buffer budget fails with
/// [`EnumerationError::DescriptorTooLarge`].
pub fn read_configuration<B: HostBus>(
    session: &mut HostSession<B>,
    buffer: &mut ConfigBuffer,
) -> Result<(), EnumerationError> {
    let mut header = [0u8; 9];
    session.send_control(
        UsbControlSetupData::get_descriptor(
            UsbControlRequestBitmap::GET_DEVICE,
            UsbDescriptorType::Configuration,
            0,
            header.len() as u16,
        ),
        ControlData::In(&mut header),
    )?;

    let descriptor = UsbConfigurationDescriptor::from_slice(&header)
        .ok_or(EnumerationError::ControlError)?;
    let total = descriptor.total_length() as usize;
    if total > buffer.capacity() {
        return Err(EnumerationError::DescriptorTooLarge);
    }

    buffer.clear();
    buffer
        .resize(total.max(header.len()), 0)
        .map_err(|_| EnumerationError::DescriptorTooLarge)?;
    session.send_control(
        UsbControlSetupData::get_descriptor(
            UsbControlRequestBitmap::GET_DEVICE,
            UsbDescriptorType::Configuration,
            0,
            total as u16,
        ),
        ControlData::In(&mut buffer[..]),
    )?;

    if buffer[1] != UsbDescriptorType::Configuration as u8 {
        return Err(EnumerationError::ControlError);
    }
    Ok(())
}
