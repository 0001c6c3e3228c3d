// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! Scripted USB transport for tests

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::usb::{
    ClaimMode, DeviceId, DeviceInfo, Direction, EndpointDescriptor, InterfaceDescriptor,
    TransferType, TransportError, TransportResult, UsbDeviceHandle, UsbHost,
    INTERFACE_CLASS_AUDIO, INTERFACE_SUBCLASS_MIDI_STREAMING,
};

pub(crate) const MIDI_OUT_ENDPOINT: u8 = 0x01;
pub(crate) const MIDI_IN_ENDPOINT: u8 = 0x81;

pub(crate) fn bulk_endpoint(address: u8) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        direction: Direction::from_address(address),
        transfer_type: TransferType::Bulk,
        max_packet_size: 64,
    }
}

pub(crate) fn interface(
    number: u8,
    class: u8,
    subclass: u8,
    endpoints: impl IntoIterator<Item = EndpointDescriptor>,
) -> InterfaceDescriptor {
    InterfaceDescriptor {
        number,
        class,
        subclass,
        protocol: 0,
        endpoints: endpoints.into_iter().collect(),
    }
}

pub(crate) fn midi_streaming_interface(
    number: u8,
    endpoints: impl IntoIterator<Item = EndpointDescriptor>,
) -> InterfaceDescriptor {
    interface(
        number,
        INTERFACE_CLASS_AUDIO,
        INTERFACE_SUBCLASS_MIDI_STREAMING,
        endpoints,
    )
}

pub(crate) fn vendor_interface(
    number: u8,
    endpoints: impl IntoIterator<Item = EndpointDescriptor>,
) -> InterfaceDescriptor {
    interface(number, 0xff, 0x00, endpoints)
}

/// Audio control interface followed by a MIDI streaming interface
/// with a single pair of bulk endpoints.
pub(crate) fn usb_midi_interfaces() -> Vec<InterfaceDescriptor> {
    vec![
        interface(0, INTERFACE_CLASS_AUDIO, 0x01, []),
        midi_streaming_interface(
            1,
            [
                bulk_endpoint(MIDI_OUT_ENDPOINT),
                bulk_endpoint(MIDI_IN_ENDPOINT),
            ],
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    RequestPermission(DeviceId),
    Open(DeviceId),
    Claim(u8, ClaimMode),
    Release(u8),
    Write(u8, Vec<u8>),
    Close,
}

#[derive(Debug)]
pub(crate) struct MockDevice {
    pub(crate) info: DeviceInfo,
    pub(crate) interfaces: Vec<InterfaceDescriptor>,
    pub(crate) has_permission: bool,
    pub(crate) grant_on_request: bool,
    pub(crate) fail_open: bool,
    pub(crate) rejected_claims: HashSet<(u8, ClaimMode)>,
}

impl MockDevice {
    pub(crate) fn new(id: u64, interfaces: Vec<InterfaceDescriptor>) -> Self {
        Self {
            info: DeviceInfo {
                id: DeviceId::new(id),
                vendor_id: 0x1234,
                product_id: 0x5678,
                manufacturer_name: Some("Acme".to_owned()),
                product_name: Some(format!("MIDI Device {id}")),
            },
            interfaces,
            has_permission: true,
            grant_on_request: false,
            fail_open: false,
            rejected_claims: HashSet::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub(crate) devices: Vec<MockDevice>,
    pub(crate) calls: Vec<Call>,
    /// Scripted results of subsequent bulk reads
    pub(crate) reads: VecDeque<TransportResult<Vec<u8>>>,
    /// Overrides the number of bytes reported by bulk writes
    pub(crate) write_len: Option<usize>,
    pub(crate) fail_write: bool,
    pub(crate) fail_release: bool,
    pub(crate) fail_close: bool,
}

impl MockState {
    pub(crate) fn count_calls(&self, filter: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|call| filter(call)).count()
    }

    fn device(&self, id: DeviceId) -> TransportResult<&MockDevice> {
        self.devices
            .iter()
            .find(|device| device.info.id == id)
            .ok_or(TransportError::NotFound)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockHost {
    state: Arc<Mutex<MockState>>,
}

impl MockHost {
    pub(crate) fn new(devices: impl IntoIterator<Item = MockDevice>) -> Self {
        let host = Self::default();
        host.state().devices = devices.into_iter().collect();
        host
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn push_read(&self, data: &[u8]) {
        self.state().reads.push_back(Ok(data.to_vec()));
    }

    pub(crate) fn push_read_error(&self, err: TransportError) {
        self.state().reads.push_back(Err(err));
    }

    pub(crate) fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.state().calls)
    }
}

impl UsbHost for MockHost {
    type Handle = MockHandle;

    fn devices(&self) -> TransportResult<Vec<DeviceInfo>> {
        Ok(self
            .state()
            .devices
            .iter()
            .map(|device| device.info.clone())
            .collect())
    }

    fn has_permission(&self, device: &DeviceInfo) -> bool {
        self.state()
            .device(device.id)
            .is_ok_and(|device| device.has_permission)
    }

    fn request_permission(&self, device: &DeviceInfo) -> TransportResult<()> {
        let mut state = self.state();
        state.calls.push(Call::RequestPermission(device.id));
        let device = state
            .devices
            .iter_mut()
            .find(|mock| mock.info.id == device.id)
            .ok_or(TransportError::NotFound)?;
        if device.grant_on_request {
            device.has_permission = true;
        }
        Ok(())
    }

    fn open(&self, device: &DeviceInfo) -> TransportResult<Self::Handle> {
        let mut state = self.state();
        state.calls.push(Call::Open(device.id));
        let mock = state.device(device.id)?;
        if mock.fail_open {
            return Err(TransportError::AccessDenied);
        }
        Ok(MockHandle {
            device_id: device.id,
            state: Arc::clone(&self.state),
        })
    }
}

#[derive(Debug)]
pub(crate) struct MockHandle {
    device_id: DeviceId,
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl UsbDeviceHandle for MockHandle {
    fn interfaces(&self) -> TransportResult<Vec<InterfaceDescriptor>> {
        Ok(self.state().device(self.device_id)?.interfaces.clone())
    }

    fn claim_interface(&self, interface_number: u8, mode: ClaimMode) -> TransportResult<()> {
        let mut state = self.state();
        state.calls.push(Call::Claim(interface_number, mode));
        if state
            .device(self.device_id)?
            .rejected_claims
            .contains(&(interface_number, mode))
        {
            return Err(TransportError::other("interface busy"));
        }
        Ok(())
    }

    fn release_interface(&self, interface_number: u8) -> TransportResult<()> {
        let mut state = self.state();
        state.calls.push(Call::Release(interface_number));
        if state.fail_release {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    fn bulk_write(
        &self,
        endpoint_address: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> TransportResult<usize> {
        let mut state = self.state();
        state.calls.push(Call::Write(endpoint_address, data.to_vec()));
        if state.fail_write {
            return Err(TransportError::Disconnected);
        }
        Ok(state.write_len.unwrap_or(data.len()))
    }

    fn bulk_read(
        &self,
        _endpoint_address: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> TransportResult<usize> {
        let next = self.state().reads.pop_front();
        let Some(next) = next else {
            // Nothing available until the timeout expires
            std::thread::sleep(timeout);
            return Ok(0);
        };
        let data = next?;
        let len = data.len().min(buffer.len());
        buffer[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    fn close(&self) -> TransportResult<()> {
        let mut state = self.state();
        state.calls.push(Call::Close);
        if state.fail_close {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

/// Collect all events in a channel.
pub(crate) fn event_channel() -> (
    Arc<dyn crate::event::EventHandler>,
    std::sync::mpsc::Receiver<crate::event::Event>,
) {
    let (tx, rx) = std::sync::mpsc::channel();
    let handler = move |event: crate::event::Event| {
        // The receiver might already have been dropped at the end of a test
        tx.send(event).ok();
    };
    (Arc::new(handler), rx)
}
