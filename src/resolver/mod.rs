// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! Endpoint discovery
//!
//! Selects the bulk endpoints for sending and receiving USB-MIDI packets.
//! Standard USB-MIDI streaming interfaces take precedence. Otherwise the
//! first interface that exposes a bulk endpoint in the requested direction
//! is used as a fallback, which covers vendor-specific devices.

use thiserror::Error;

use crate::usb::{Direction, InterfaceDescriptor};


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no interface with an output endpoint")]
    InterfaceNotFound,

    #[error("no output endpoint in MIDI streaming interface {interface_number}")]
    EndpointNotFound { interface_number: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub interface_number: u8,
    pub endpoint_address: u8,
    pub max_packet_size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedEndpoints {
    /// Mandatory endpoint for sending.
    pub output: ResolvedEndpoint,

    /// Optional endpoint for listening.
    pub input: Option<ResolvedEndpoint>,
}

impl ResolvedEndpoints {
    #[must_use]
    pub const fn is_input_available(&self) -> bool {
        self.input.is_some()
    }
}

/// Find the endpoint for the given direction.
///
/// Directions are resolved independently and could end up on
/// different interfaces.
#[must_use]
pub fn resolve_endpoint(
    interfaces: &[InterfaceDescriptor],
    direction: Direction,
) -> Option<ResolvedEndpoint> {
    let mut fallback = None;
    for interface in interfaces {
        let Some(endpoint) = interface.first_bulk_endpoint(direction) else {
            continue;
        };
        let resolved = ResolvedEndpoint {
            interface_number: interface.number,
            endpoint_address: endpoint.address,
            max_packet_size: endpoint.max_packet_size,
        };
        if interface.is_midi_streaming() {
            log::debug!("Found {direction:?} endpoint in MIDI streaming interface: {resolved:?}");
            return Some(resolved);
        }
        if fallback.is_none() {
            fallback = Some(resolved);
        }
    }
    if let Some(resolved) = &fallback {
        log::debug!("Using fallback {direction:?} endpoint: {resolved:?}");
    }
    fallback
}

pub fn resolve_endpoints(
    interfaces: &[InterfaceDescriptor],
) -> Result<ResolvedEndpoints, ResolveError> {
    let Some(output) = resolve_endpoint(interfaces, Direction::Out) else {
        return Err(interfaces
            .iter()
            .find(|interface| interface.is_midi_streaming())
            .map_or(ResolveError::InterfaceNotFound, |interface| {
                ResolveError::EndpointNotFound {
                    interface_number: interface.number,
                }
            }));
    };
    let input = resolve_endpoint(interfaces, Direction::In);
    if input.is_none() {
        log::info!("No input endpoint available");
    }
    Ok(ResolvedEndpoints { output, input })
}
