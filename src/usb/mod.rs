// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! USB transport capability
//!
//! The OS-level USB stack is accessed exclusively through the [`UsbHost`]
//! and [`UsbDeviceHandle`] traits. Backends only need to enumerate, open,
//! claim/release interfaces and perform blocking bulk transfers.

use std::{borrow::Cow, time::Duration};

use derive_more::{Display, From, Into};
use thiserror::Error;

#[cfg(feature = "nusb")]
pub mod nusb;


#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device not found")]
    NotFound,

    #[error("access denied")]
    AccessDenied,

    #[error("device disconnected")]
    Disconnected,

    #[error("timed out")]
    Timeout,

    #[error("{msg}")]
    Other { msg: Cow<'static, str> },
}

impl TransportError {
    pub fn other(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Other { msg: msg.into() }
    }

    /// Transient errors might disappear when retrying the operation.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Opaque device identifier
///
/// Only valid while the device stays attached. Re-attaching a device might
/// result in a different identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
pub struct DeviceId(u64);

impl DeviceId {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Device properties as reported by the transport during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer_name: Option<String>,
    pub product_name: Option<String>,
}

impl DeviceInfo {
    /// Human-readable name
    ///
    /// Falls back to the manufacturer name if no product name is available
    /// and finally to the `VVVV:PPPP` vendor/product id pair.
    #[must_use]
    pub fn display_name(&self) -> Cow<'_, str> {
        fn non_empty(name: Option<&str>) -> Option<&str> {
            name.map(str::trim).filter(|name| !name.is_empty())
        }
        non_empty(self.product_name.as_deref())
            .or_else(|| non_empty(self.manufacturer_name.as_deref()))
            .map_or_else(
                || {
                    Cow::Owned(format!(
                        "{vid:04X}:{pid:04X}",
                        vid = self.vendor_id,
                        pid = self.product_id
                    ))
                },
                Cow::Borrowed,
            )
    }
}

/// Snapshot of a device as presented to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub has_permission: bool,
}

impl DeviceDescriptor {
    #[must_use]
    pub fn new(info: &DeviceInfo, has_permission: bool) -> Self {
        Self {
            id: info.id,
            name: info.display_name().into_owned(),
            vendor_id: info.vendor_id,
            product_id: info.product_id,
            has_permission,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of the endpoint address.
    #[must_use]
    pub const fn from_address(address: u8) -> Self {
        if address & 0x80 == 0 {
            Self::Out
        } else {
            Self::In
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    /// Transfer type encoded in bits 0..1 of `bmAttributes`.
    #[must_use]
    pub const fn from_attributes(attributes: u8) -> Self {
        match attributes & 0b11 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

/// USB interface class: Audio
pub const INTERFACE_CLASS_AUDIO: u8 = 0x01;

/// USB audio interface subclass: MIDI streaming
pub const INTERFACE_SUBCLASS_MIDI_STREAMING: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// Endpoints in enumeration order
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    /// Standard USB-MIDI streaming interface signature.
    #[must_use]
    pub const fn is_midi_streaming(&self) -> bool {
        self.class == INTERFACE_CLASS_AUDIO && self.subclass == INTERFACE_SUBCLASS_MIDI_STREAMING
    }

    /// The first endpoint for bulk transfers in the given direction.
    #[must_use]
    pub fn first_bulk_endpoint(&self, direction: Direction) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|endpoint| {
            endpoint.direction == direction && endpoint.transfer_type == TransferType::Bulk
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimMode {
    /// Claim without forcibly detaching other drivers
    Shared,
    /// Claim and detach any kernel driver bound to the interface
    Exclusive,
}

/// Entry point into the OS-level USB stack.
pub trait UsbHost {
    type Handle: UsbDeviceHandle + Send + Sync + 'static;

    /// Enumerate all currently attached devices.
    fn devices(&self) -> TransportResult<Vec<DeviceInfo>>;

    /// Check if the application has been granted access to the device.
    fn has_permission(&self, device: &DeviceInfo) -> bool;

    /// Ask for access to the device.
    ///
    /// The outcome might be delivered asynchronously, i.e. the permission
    /// is not necessarily granted when this function returns.
    fn request_permission(&self, device: &DeviceInfo) -> TransportResult<()>;

    fn open(&self, device: &DeviceInfo) -> TransportResult<Self::Handle>;
}

/// An opened device.
///
/// All operations are blocking. Implementations must allow to read from
/// one endpoint on a worker thread while the owning thread holds a shared
/// reference.
pub trait UsbDeviceHandle {
    /// Interfaces of the active configuration in enumeration order.
    fn interfaces(&self) -> TransportResult<Vec<InterfaceDescriptor>>;

    fn claim_interface(&self, interface_number: u8, mode: ClaimMode) -> TransportResult<()>;

    fn release_interface(&self, interface_number: u8) -> TransportResult<()>;

    /// Returns the number of bytes transferred.
    fn bulk_write(
        &self,
        endpoint_address: u8,
        data: &[u8],
        timeout: Duration,
    ) -> TransportResult<usize>;

    /// Returns the number of bytes received.
    ///
    /// Returns `Ok(0)` if no data has been available until the timeout expired.
    fn bulk_read(
        &self,
        endpoint_address: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> TransportResult<usize>;

    fn close(&self) -> TransportResult<()>;
}
