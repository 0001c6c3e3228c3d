// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! Lifecycle of the single active USB connection
//!
//! The [`ConnectionManager`] exclusively owns the opened device handle,
//! the claimed interfaces and the listener thread. All other components
//! only interact with the connection through its operations.

use std::sync::Arc;

use thiserror::Error;

use crate::{
    config::Config,
    event::EventHandler,
    listener::{Environment, Listener, ListenerError},
    resolver::{resolve_endpoints, ResolveError, ResolvedEndpoint, ResolvedEndpoints},
    usb::{ClaimMode, DeviceId, DeviceInfo, TransportError, UsbDeviceHandle, UsbHost},
};

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("device {device_id} not found")]
    NotFound { device_id: DeviceId },

    #[error("no permission to access device {device_id}")]
    PermissionDenied { device_id: DeviceId },

    #[error("failed to enumerate devices: {0}")]
    Enumerate(#[source] TransportError),

    #[error("failed to open device {device_id}: {source}")]
    Open {
        device_id: DeviceId,
        #[source]
        source: TransportError,
    },

    #[error("failed to query interfaces: {0}")]
    Interfaces(#[source] TransportError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to claim interface {interface_number}: {source}")]
    Claim {
        interface_number: u8,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Error)]
pub enum StartListeningError {
    #[error("not connected")]
    NotConnected,

    /// Listening is not supported by the connected device.
    #[error("no input endpoint available")]
    InputUnavailable,

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The single active connection.
///
/// The output interface is always claimed. The input endpoint is absent
/// if the device doesn't have one or if its interface could not be claimed.
#[derive(Debug)]
struct ActiveConnection<T> {
    device_id: DeviceId,
    handle: Arc<T>,
    endpoints: ResolvedEndpoints,
    /// Only set if distinct from the output interface.
    claimed_input_interface: Option<u8>,
    listener: Option<Listener>,
}

impl<T> ActiveConnection<T> {
    fn is_listening(&self) -> bool {
        self.listener.as_ref().is_some_and(Listener::is_running)
    }

    /// The listener has terminated on its own after the connection was lost.
    fn is_stale(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.is_running())
    }
}

#[derive(Debug)]
enum ConnectionState<T> {
    Disconnected,
    Connected(ActiveConnection<T>),
}

#[expect(missing_debug_implementations)]
pub struct ConnectionManager<H: UsbHost> {
    host: H,
    config: Config,
    state: ConnectionState<H::Handle>,
}

impl<H: UsbHost> ConnectionManager<H> {
    #[must_use]
    pub fn new(host: H, config: Config) -> Self {
        Self {
            host,
            config,
            state: ConnectionState::Disconnected,
        }
    }

    #[must_use]
    pub const fn host(&self) -> &H {
        &self.host
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected(_))
    }

    #[must_use]
    pub const fn connected_device_id(&self) -> Option<DeviceId> {
        match &self.state {
            ConnectionState::Disconnected => None,
            ConnectionState::Connected(connection) => Some(connection.device_id),
        }
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.active_connection()
            .is_some_and(ActiveConnection::is_listening)
    }

    /// Check if a listener has been started on the active connection.
    ///
    /// Also returns `true` if the listener has terminated on its own
    /// after the connection was lost.
    #[must_use]
    pub fn has_listener(&self) -> bool {
        self.active_connection()
            .is_some_and(|connection| connection.listener.is_some())
    }

    /// The device that is currently listened to.
    #[must_use]
    pub fn listening_device_id(&self) -> Option<DeviceId> {
        self.active_connection()
            .filter(|connection| connection.is_listening())
            .map(|connection| connection.device_id)
    }

    /// Check if listening is possible with the current connection.
    #[must_use]
    pub fn is_input_available(&self) -> bool {
        self.active_connection()
            .is_some_and(|connection| connection.endpoints.is_input_available())
    }

    #[must_use]
    pub fn endpoints(&self) -> Option<&ResolvedEndpoints> {
        self.active_connection()
            .map(|connection| &connection.endpoints)
    }

    const fn active_connection(&self) -> Option<&ActiveConnection<H::Handle>> {
        match &self.state {
            ConnectionState::Disconnected => None,
            ConnectionState::Connected(connection) => Some(connection),
        }
    }

    fn find_device(&self, device_id: DeviceId) -> Result<DeviceInfo, ConnectError> {
        self.host
            .devices()
            .map_err(ConnectError::Enumerate)?
            .into_iter()
            .find(|info| info.id == device_id)
            .ok_or(ConnectError::NotFound { device_id })
    }

    /// Connect to the given device.
    ///
    /// Does nothing if already connected to the same device. Otherwise any
    /// existing connection is closed first. On failure the manager stays
    /// disconnected and all partially acquired resources are released.
    pub fn ensure_connected(&mut self, device_id: DeviceId) -> Result<(), ConnectError> {
        if let ConnectionState::Connected(connection) = &self.state {
            if connection.device_id == device_id {
                if !connection.is_stale() {
                    return Ok(());
                }
                log::info!("Reconnecting to device {device_id} after connection loss");
            }
        }
        self.disconnect();
        debug_assert!(!self.is_connected());
        let info = self.find_device(device_id)?;
        if !self.host.has_permission(&info) {
            return Err(ConnectError::PermissionDenied { device_id });
        }
        log::info!(
            "Connecting to device {device_id} \"{name}\"",
            name = info.display_name()
        );
        let handle = self
            .host
            .open(&info)
            .map_err(|source| ConnectError::Open { device_id, source })?;
        let (endpoints, claimed_input_interface) = match claim_interfaces(&handle) {
            Ok(claimed) => claimed,
            Err(err) => {
                close_handle(device_id, &handle);
                return Err(err);
            }
        };
        log::info!("Connected to device {device_id}: {endpoints:?}");
        self.state = ConnectionState::Connected(ActiveConnection {
            device_id,
            handle: Arc::new(handle),
            endpoints,
            claimed_input_interface,
            listener: None,
        });
        Ok(())
    }

    /// Close the active connection.
    ///
    /// Stops listening, releases all claimed interfaces and closes the
    /// device handle. Failures are logged and otherwise ignored.
    ///
    /// Returns `false` if already disconnected.
    pub fn disconnect(&mut self) -> bool {
        let ConnectionState::Connected(connection) =
            std::mem::replace(&mut self.state, ConnectionState::Disconnected)
        else {
            return false;
        };
        let ActiveConnection {
            device_id,
            handle,
            endpoints,
            claimed_input_interface,
            listener,
        } = connection;
        log::info!("Disconnecting from device {device_id}");
        if let Some(listener) = listener {
            if let Err(err) = listener.stop_and_join() {
                log::warn!("Failed to stop listening on device {device_id}: {err}");
            }
        }
        if let Some(interface_number) = claimed_input_interface {
            release_interface(device_id, &*handle, interface_number);
        }
        release_interface(device_id, &*handle, endpoints.output.interface_number);
        close_handle(device_id, &*handle);
        true
    }

    /// Start listening on the input endpoint of the active connection.
    ///
    /// Does nothing if already listening.
    pub fn start_listening(
        &mut self,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<(), StartListeningError> {
        let ConnectionState::Connected(connection) = &mut self.state else {
            return Err(StartListeningError::NotConnected);
        };
        let Some(ResolvedEndpoint {
            endpoint_address,
            max_packet_size,
            ..
        }) = connection.endpoints.input
        else {
            return Err(StartListeningError::InputUnavailable);
        };
        if connection.is_listening() {
            log::debug!("Already listening on device {}", connection.device_id);
            return Ok(());
        }
        if let Some(terminated) = connection.listener.take() {
            // Collect the thread that has terminated on its own
            if let Err(err) = terminated.stop_and_join() {
                log::warn!("Failed to join terminated listener: {err}");
            }
        }
        let listener = Listener::spawn(Environment {
            handle: Arc::clone(&connection.handle),
            device_id: connection.device_id,
            endpoint_address,
            cable: self.config.input_cable,
            read_timeout: self.config.read_timeout,
            read_buffer_size: self.config.endpoint_read_buffer_size(max_packet_size),
            event_handler,
        })?;
        connection.listener = Some(listener);
        Ok(())
    }

    /// Stop listening while keeping the connection.
    ///
    /// Returns `false` if not listening.
    pub fn stop_listening(&mut self) -> bool {
        let ConnectionState::Connected(connection) = &mut self.state else {
            return false;
        };
        let Some(listener) = connection.listener.take() else {
            return false;
        };
        let was_running = listener.is_running();
        if let Err(err) = listener.stop_and_join() {
            log::warn!(
                "Failed to stop listening on device {device_id}: {err}",
                device_id = connection.device_id
            );
        }
        was_running
    }

    /// Bulk transfer to the output endpoint.
    ///
    /// Returns the number of bytes transferred.
    pub fn write(&self, data: &[u8]) -> Result<usize, WriteError> {
        let connection = self.active_connection().ok_or(WriteError::NotConnected)?;
        let bytes_written = connection.handle.bulk_write(
            connection.endpoints.output.endpoint_address,
            data,
            self.config.write_timeout,
        )?;
        log::trace!(
            "Sent {data:02x?} to device {device_id} ({bytes_written} bytes written)",
            device_id = connection.device_id
        );
        Ok(bytes_written)
    }
}

impl<H: UsbHost> Drop for ConnectionManager<H> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn claim_interfaces<T>(handle: &T) -> Result<(ResolvedEndpoints, Option<u8>), ConnectError>
where
    T: UsbDeviceHandle,
{
    let interfaces = handle.interfaces().map_err(ConnectError::Interfaces)?;
    let mut endpoints = resolve_endpoints(&interfaces)?;
    let output_interface = endpoints.output.interface_number;
    handle
        .claim_interface(output_interface, ClaimMode::Exclusive)
        .map_err(|source| ConnectError::Claim {
            interface_number: output_interface,
            source,
        })?;
    log::debug!("Claimed output interface {output_interface}");
    let Some(input) = endpoints.input else {
        return Ok((endpoints, None));
    };
    if input.interface_number == output_interface {
        return Ok((endpoints, None));
    }
    if claim_input_interface(handle, input.interface_number) {
        Ok((endpoints, Some(input.interface_number)))
    } else {
        log::warn!(
            "Listening disabled: input interface {interface_number} could not be claimed",
            interface_number = input.interface_number
        );
        endpoints.input = None;
        Ok((endpoints, None))
    }
}

fn claim_input_interface<T>(handle: &T, interface_number: u8) -> bool
where
    T: UsbDeviceHandle,
{
    for mode in [ClaimMode::Shared, ClaimMode::Exclusive] {
        match handle.claim_interface(interface_number, mode) {
            Ok(()) => {
                log::debug!("Claimed input interface {interface_number} ({mode:?})");
                return true;
            }
            Err(err) => {
                log::debug!("Failed to claim input interface {interface_number} ({mode:?}): {err}");
            }
        }
    }
    false
}

fn release_interface<T>(device_id: DeviceId, handle: &T, interface_number: u8)
where
    T: UsbDeviceHandle + ?Sized,
{
    if let Err(err) = handle.release_interface(interface_number) {
        log::warn!("Failed to release interface {interface_number} of device {device_id}: {err}");
    }
}

fn close_handle<T>(device_id: DeviceId, handle: &T)
where
    T: UsbDeviceHandle + ?Sized,
{
    if let Err(err) = handle.close() {
        log::warn!("Failed to close device {device_id}: {err}");
    }
}
