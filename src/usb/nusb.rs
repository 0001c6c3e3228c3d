// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! Desktop backend on top of [`nusb`]
//!
//! Access permissions are granted by the OS when opening a device, i.e.
//! [`UsbHost::has_permission()`] always returns `true`.

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash as _, Hasher as _},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use nusb::{
    Endpoint,
    transfer::{Bulk, EndpointDirection, In, Out, TransferError},
    MaybeFuture as _,
};

use super::{
    ClaimMode, DeviceId, DeviceInfo, Direction, EndpointDescriptor, InterfaceDescriptor,
    TransferType, TransportError, TransportResult, UsbDeviceHandle, UsbHost,
};

fn device_id(info: &nusb::DeviceInfo) -> DeviceId {
    let mut hasher = DefaultHasher::new();
    info.id().hash(&mut hasher);
    DeviceId::new(hasher.finish())
}

fn device_info(info: &nusb::DeviceInfo) -> DeviceInfo {
    DeviceInfo {
        id: device_id(info),
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        manufacturer_name: info.manufacturer_string().map(ToOwned::to_owned),
        product_name: info.product_string().map(ToOwned::to_owned),
    }
}

fn transport_error(err: nusb::Error) -> TransportError {
    match err.kind() {
        nusb::ErrorKind::NotFound => TransportError::NotFound,
        nusb::ErrorKind::PermissionDenied => TransportError::AccessDenied,
        nusb::ErrorKind::Disconnected => TransportError::Disconnected,
        _ => TransportError::other(err.to_string()),
    }
}

fn transfer_error(err: TransferError) -> TransportError {
    match err {
        TransferError::Disconnected => TransportError::Disconnected,
        err => TransportError::other(err.to_string()),
    }
}

fn transfer_type(transfer_type: nusb::descriptors::TransferType) -> TransferType {
    match transfer_type {
        nusb::descriptors::TransferType::Bulk => TransferType::Bulk,
        nusb::descriptors::TransferType::Interrupt => TransferType::Interrupt,
        nusb::descriptors::TransferType::Isochronous => TransferType::Isochronous,
        _ => TransferType::Control,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NusbHost;

impl NusbHost {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn find_device(device_id: DeviceId) -> TransportResult<nusb::DeviceInfo> {
        nusb::list_devices()
            .wait()
            .map_err(transport_error)?
            .find(|info| self::device_id(info) == device_id)
            .ok_or(TransportError::NotFound)
    }
}

impl UsbHost for NusbHost {
    type Handle = NusbHandle;

    fn devices(&self) -> TransportResult<Vec<DeviceInfo>> {
        let devices = nusb::list_devices().wait().map_err(transport_error)?;
        Ok(devices.map(|info| device_info(&info)).collect())
    }

    fn has_permission(&self, _device: &DeviceInfo) -> bool {
        true
    }

    fn request_permission(&self, _device: &DeviceInfo) -> TransportResult<()> {
        Ok(())
    }

    fn open(&self, device: &DeviceInfo) -> TransportResult<Self::Handle> {
        let info = Self::find_device(device.id)?;
        let device = info.open().wait().map_err(transport_error)?;
        Ok(NusbHandle {
            device,
            interfaces: Default::default(),
            bulk_in: Default::default(),
            bulk_out: Default::default(),
        })
    }
}

/// Endpoint that is kept open for subsequent transfers.
type CachedEndpoint<Dir> = Option<(u8, Endpoint<Bulk, Dir>)>;

#[expect(missing_debug_implementations)]
pub struct NusbHandle {
    device: nusb::Device,
    interfaces: Mutex<HashMap<u8, nusb::Interface>>,
    bulk_in: Mutex<CachedEndpoint<In>>,
    bulk_out: Mutex<CachedEndpoint<Out>>,
}

impl NusbHandle {
    fn open_endpoint<Dir: EndpointDirection>(
        &self,
        endpoint_address: u8,
    ) -> TransportResult<Endpoint<Bulk, Dir>> {
        let interfaces = lock(&self.interfaces);
        interfaces
            .values()
            .find_map(|interface| interface.endpoint::<Bulk, Dir>(endpoint_address).ok())
            .ok_or_else(|| {
                TransportError::other(format!(
                    "endpoint {endpoint_address:#04x} not in any claimed interface"
                ))
            })
    }

    fn with_endpoint<Dir: EndpointDirection, T>(
        &self,
        cache: &Mutex<CachedEndpoint<Dir>>,
        endpoint_address: u8,
        f: impl FnOnce(&mut Endpoint<Bulk, Dir>) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let mut cached = lock(cache);
        let endpoint = match &mut *cached {
            Some((address, endpoint)) if *address == endpoint_address => endpoint,
            cached => {
                // Close the previous endpoint before opening a new one
                *cached = None;
                let endpoint = self.open_endpoint(endpoint_address)?;
                &mut cached.insert((endpoint_address, endpoint)).1
            }
        };
        f(endpoint)
    }

    fn close_endpoints(&self) {
        *lock(&self.bulk_in) = None;
        *lock(&self.bulk_out) = None;
    }
}

impl UsbDeviceHandle for NusbHandle {
    fn interfaces(&self) -> TransportResult<Vec<InterfaceDescriptor>> {
        let configuration = self
            .device
            .active_configuration()
            .map_err(|err| TransportError::other(err.to_string()))?;
        let interfaces = configuration
            .interfaces()
            .filter_map(|interface| {
                // Only the default alternate setting is considered
                let alt_setting = interface.alt_settings().next()?;
                let endpoints = alt_setting
                    .endpoints()
                    .map(|endpoint| EndpointDescriptor {
                        address: endpoint.address(),
                        direction: Direction::from_address(endpoint.address()),
                        transfer_type: transfer_type(endpoint.transfer_type()),
                        max_packet_size: u16::try_from(endpoint.max_packet_size())
                            .unwrap_or(u16::MAX),
                    })
                    .collect();
                Some(InterfaceDescriptor {
                    number: interface.interface_number(),
                    class: alt_setting.class(),
                    subclass: alt_setting.subclass(),
                    protocol: alt_setting.protocol(),
                    endpoints,
                })
            })
            .collect();
        Ok(interfaces)
    }

    fn claim_interface(&self, interface_number: u8, mode: ClaimMode) -> TransportResult<()> {
        let claimed = match mode {
            ClaimMode::Shared => self.device.claim_interface(interface_number).wait(),
            ClaimMode::Exclusive => self
                .device
                .detach_and_claim_interface(interface_number)
                .wait(),
        }
        .map_err(transport_error)?;
        lock(&self.interfaces).insert(interface_number, claimed);
        Ok(())
    }

    fn release_interface(&self, interface_number: u8) -> TransportResult<()> {
        // Open endpoints keep their interface claimed
        self.close_endpoints();
        if lock(&self.interfaces).remove(&interface_number).is_none() {
            return Err(TransportError::other(format!(
                "interface {interface_number} has not been claimed"
            )));
        }
        Ok(())
    }

    fn bulk_write(
        &self,
        endpoint_address: u8,
        data: &[u8],
        timeout: Duration,
    ) -> TransportResult<usize> {
        self.with_endpoint(&self.bulk_out, endpoint_address, |endpoint| {
            let completion = endpoint.transfer_blocking(data.to_vec().into(), timeout);
            match completion.status {
                Ok(()) => Ok(completion.actual_len),
                Err(TransferError::Cancelled) => Err(TransportError::Timeout),
                Err(err) => Err(transfer_error(err)),
            }
        })
    }

    fn bulk_read(
        &self,
        endpoint_address: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> TransportResult<usize> {
        self.with_endpoint(&self.bulk_in, endpoint_address, |endpoint| {
            // IN transfers must request a multiple of the max. packet size
            let max_packet_size = endpoint.max_packet_size().max(1);
            let requested_len = buffer.len().div_ceil(max_packet_size) * max_packet_size;
            let completion = endpoint.transfer_blocking(endpoint.allocate(requested_len), timeout);
            match completion.status {
                Ok(()) => {
                    let received = &completion.buffer[..];
                    let len = received.len().min(buffer.len());
                    if len < received.len() {
                        log::warn!(
                            "Discarding {num_bytes} received byte(s) exceeding the read buffer",
                            num_bytes = received.len() - len
                        );
                    }
                    buffer[..len].copy_from_slice(&received[..len]);
                    Ok(len)
                }
                // Nothing received until the timeout expired
                Err(TransferError::Cancelled) => Ok(0),
                Err(err) => Err(transfer_error(err)),
            }
        })
    }

    fn close(&self) -> TransportResult<()> {
        self.close_endpoints();
        lock(&self.interfaces).clear();
        Ok(())
    }
}
