// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! Command surface for clients
//!
//! [`UsbMidiBridge`] translates client commands into operations of the
//! [`ConnectionManager`]. Sending while listening temporarily tears down
//! the connection and resumes listening afterwards.

use std::{collections::HashSet, sync::Arc};

use strum::{EnumIter, IntoStaticStr};
use thiserror::Error;

use crate::{
    config::Config,
    connection::{ConnectError, ConnectionManager, WriteError},
    event::{Event, EventHandler},
    message::{MidiMessage, ParseMessageError},
    packet::{self, UsbMidiPacket, PACKET_SIZE},
    resolver::ResolveError,
    usb::{DeviceDescriptor, DeviceId, TransportError, UsbHost},
};


/// Client-visible error reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, IntoStaticStr, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    PermissionDenied,
    InterfaceNotFound,
    EndpointNotFound,
    ClaimFailed,
    InvalidMessage,
    TransferFailed,
    ConnectionFailed,
    NotConnected,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    #[must_use]
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::NotFound | Self::InterfaceNotFound | Self::EndpointNotFound => {
                ErrorKind::NotFound
            }
            Self::PermissionDenied => ErrorKind::Permission,
            Self::ClaimFailed | Self::TransferFailed | Self::ConnectionFailed => {
                ErrorKind::Resource
            }
            Self::InvalidMessage => ErrorKind::Format,
            Self::NotConnected => ErrorKind::State,
        }
    }
}

/// Error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Device, interface or endpoint absent.
    NotFound,

    /// Access not granted.
    Permission,

    /// Open, claim or transfer failed.
    Resource,

    /// Malformed message.
    Format,

    /// No active connection.
    State,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("device {device_id} not found")]
    NotFound { device_id: DeviceId },

    #[error("failed to enumerate devices: {0}")]
    Enumerate(#[source] TransportError),

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] ParseMessageError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("incomplete transfer: {bytes_written} of {} bytes written", PACKET_SIZE)]
    IncompleteTransfer { bytes_written: usize },
}

impl BridgeError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. }
            | Self::Connect(ConnectError::NotFound { .. }) => ErrorCode::NotFound,
            Self::Connect(ConnectError::PermissionDenied { .. }) => ErrorCode::PermissionDenied,
            Self::Connect(ConnectError::Resolve(ResolveError::InterfaceNotFound)) => {
                ErrorCode::InterfaceNotFound
            }
            Self::Connect(ConnectError::Resolve(ResolveError::EndpointNotFound { .. })) => {
                ErrorCode::EndpointNotFound
            }
            Self::Connect(ConnectError::Claim { .. }) => ErrorCode::ClaimFailed,
            Self::Enumerate(_)
            | Self::Connect(
                ConnectError::Enumerate(_) | ConnectError::Open { .. } | ConnectError::Interfaces(_),
            ) => ErrorCode::ConnectionFailed,
            Self::InvalidMessage(_) => ErrorCode::InvalidMessage,
            Self::Write(WriteError::Transport(_)) | Self::IncompleteTransfer { .. } => {
                ErrorCode::TransferFailed
            }
            Self::Write(WriteError::NotConnected) => ErrorCode::NotConnected,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.code().kind()
    }
}

#[expect(missing_debug_implementations)]
pub struct UsbMidiBridge<H: UsbHost> {
    connection: ConnectionManager<H>,
    event_handler: Arc<dyn EventHandler>,
    /// Devices that have been seen during previous enumerations.
    seen_devices: HashSet<DeviceId>,
}

impl<H: UsbHost> UsbMidiBridge<H> {
    #[must_use]
    pub fn new(host: H, config: Config, event_handler: Arc<dyn EventHandler>) -> Self {
        Self {
            connection: ConnectionManager::new(host, config),
            event_handler,
            seen_devices: HashSet::new(),
        }
    }

    #[must_use]
    pub const fn connection(&self) -> &ConnectionManager<H> {
        &self.connection
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        self.connection.config()
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.connection.is_listening()
    }

    #[must_use]
    pub fn listening_device_id(&self) -> Option<DeviceId> {
        self.connection.listening_device_id()
    }

    /// Snapshot of all attached devices.
    ///
    /// Requests permission for devices that have not been seen before.
    pub fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>, BridgeError> {
        let host = self.connection.host();
        let devices = host.devices().map_err(BridgeError::Enumerate)?;
        // Forget detached devices to ask again when they are re-attached
        self.seen_devices
            .retain(|device_id| devices.iter().any(|info| info.id == *device_id));
        let mut descriptors = Vec::with_capacity(devices.len());
        for info in &devices {
            let newly_seen = self.seen_devices.insert(info.id);
            let mut has_permission = host.has_permission(info);
            if newly_seen && !has_permission {
                log::debug!("Requesting permission for new device {}", info.id);
                match host.request_permission(info) {
                    Ok(()) => {
                        has_permission = host.has_permission(info);
                    }
                    Err(err) => {
                        log::warn!("Failed to request permission for device {}: {err}", info.id);
                    }
                }
            }
            descriptors.push(DeviceDescriptor::new(info, has_permission));
        }
        log::debug!("Enumerated {num_devices} device(s)", num_devices = descriptors.len());
        Ok(descriptors)
    }

    /// Request permission to access a device.
    ///
    /// Returns `true` if the permission is already granted. Otherwise the
    /// outcome will be delivered through [`Self::handle_permission_result()`].
    pub fn request_permission(&mut self, device_id: DeviceId) -> Result<bool, BridgeError> {
        let host = self.connection.host();
        let info = host
            .devices()
            .map_err(BridgeError::Enumerate)?
            .into_iter()
            .find(|info| info.id == device_id)
            .ok_or(BridgeError::NotFound { device_id })?;
        if host.has_permission(&info) {
            return Ok(true);
        }
        if let Err(err) = host.request_permission(&info) {
            log::warn!("Failed to request permission for device {device_id}: {err}");
        }
        Ok(host.has_permission(&info))
    }

    /// Send a single MIDI message given as hex pairs, e.g. `"90 3C 64"`.
    ///
    /// Listening is paused during the transfer and resumed afterwards,
    /// independent of the outcome.
    pub fn send(&mut self, device_id: DeviceId, message: &str) -> Result<(), BridgeError> {
        let message = message.parse::<MidiMessage>()?;
        let packet = packet::encode(message.as_bytes(), self.config().output_cable)
            .ok_or(ParseMessageError::Empty)?;
        let resume_listening_device_id = self.connection.listening_device_id();
        if let Some(listening_device_id) = resume_listening_device_id {
            log::debug!("Pausing listening on device {listening_device_id} for sending");
            self.connection.disconnect();
        }
        let result = self.send_packet(device_id, packet);
        if let Some(listening_device_id) = resume_listening_device_id {
            // Replaces the transient connection if needed
            if self.start_listening(listening_device_id) {
                log::debug!("Resumed listening on device {listening_device_id}");
            } else {
                log::warn!("Failed to resume listening on device {listening_device_id}");
            }
        }
        result
    }

    fn send_packet(
        &mut self,
        device_id: DeviceId,
        packet: UsbMidiPacket,
    ) -> Result<(), BridgeError> {
        self.connection.ensure_connected(device_id)?;
        let bytes_written = match self.connection.write(packet.as_bytes()) {
            Ok(bytes_written) => bytes_written,
            Err(err) => {
                if let WriteError::Transport(transport_err) = &err {
                    if !transport_err.is_transient() {
                        log::warn!("Closing connection to device {device_id}: {transport_err}");
                        self.connection.disconnect();
                    }
                }
                return Err(err.into());
            }
        };
        if bytes_written != PACKET_SIZE {
            return Err(BridgeError::IncompleteTransfer { bytes_written });
        }
        Ok(())
    }

    /// Connect to the device and start listening.
    ///
    /// Returns `false` if the device could not be connected or if it
    /// doesn't support listening.
    pub fn start_listening(&mut self, device_id: DeviceId) -> bool {
        if self.connection.listening_device_id() == Some(device_id) {
            return true;
        }
        if let Err(err) = self.connection.ensure_connected(device_id) {
            log::warn!("Failed to connect to device {device_id} for listening: {err}");
            return false;
        }
        match self
            .connection
            .start_listening(Arc::clone(&self.event_handler))
        {
            Ok(()) => {
                log::info!("Listening on device {device_id}");
                true
            }
            Err(err) => {
                log::warn!("Failed to start listening on device {device_id}: {err}");
                false
            }
        }
    }

    /// Stop listening and close the connection.
    ///
    /// The connection is also closed if the listener has already
    /// terminated after the connection was lost.
    ///
    /// Returns `false` if not listening.
    pub fn stop_listening(&mut self) -> bool {
        if !self.connection.has_listener() {
            return false;
        }
        let was_listening = self.connection.is_listening();
        if let Some(device_id) = self.connection.connected_device_id() {
            log::info!("Stop listening on device {device_id}");
        }
        self.connection.disconnect();
        was_listening
    }

    /// Re-enumerate devices after a device has been attached or detached.
    ///
    /// Emits [`Event::DeviceListChanged`]. The active connection is not
    /// affected.
    ///
    /// Attaching and detaching of devices is not observed by the bridge
    /// or by the backends. The caller must invoke this function whenever
    /// the OS reports a change, e.g. from a hotplug watcher.
    pub fn handle_device_list_change(&mut self) {
        match self.enumerate() {
            Ok(devices) => {
                self.event_handler
                    .handle_event(Event::DeviceListChanged(devices));
            }
            Err(err) => {
                log::warn!("Failed to enumerate devices: {err}");
            }
        }
    }

    /// Outcome of a permission request that has been delivered
    /// asynchronously by the host.
    pub fn handle_permission_result(&mut self, device_id: DeviceId, granted: bool) {
        if granted {
            log::info!("Permission granted for device {device_id}");
        } else {
            log::warn!("Permission denied for device {device_id}");
        }
        self.handle_device_list_change();
    }
}
