// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use super::*;
use crate::{
    event::{Event, TerminationCause},
    testing::{
        bulk_endpoint, event_channel, midi_streaming_interface, usb_midi_interfaces,
        vendor_interface, Call, MockDevice, MockHost, MIDI_OUT_ENDPOINT,
    },
    usb::{Direction, EndpointDescriptor, InterfaceDescriptor, TransferType},
};

const DEVICE_ID: DeviceId = DeviceId::new(1);

const OTHER_DEVICE_ID: DeviceId = DeviceId::new(2);

fn test_config() -> Config {
    Config {
        read_timeout: Duration::from_millis(10),
        ..Default::default()
    }
}

fn connection_manager(
    devices: impl IntoIterator<Item = MockDevice>,
) -> ConnectionManager<MockHost> {
    ConnectionManager::new(MockHost::new(devices), test_config())
}

/// Output on a MIDI streaming interface, input on a separate vendor interface.
fn split_interfaces() -> Vec<InterfaceDescriptor> {
    vec![
        midi_streaming_interface(1, [bulk_endpoint(0x01)]),
        vendor_interface(2, [bulk_endpoint(0x82)]),
    ]
}

#[test]
fn ensure_connected_is_idempotent() {
    let mut manager = connection_manager([MockDevice::new(1, usb_midi_interfaces())]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    manager.ensure_connected(DEVICE_ID).unwrap();
    assert!(manager.is_connected());
    assert_eq!(Some(DEVICE_ID), manager.connected_device_id());
    assert_eq!(
        vec![Call::Open(DEVICE_ID), Call::Claim(1, ClaimMode::Exclusive)],
        manager.host().take_calls()
    );
}

#[test]
fn shared_interface_is_claimed_once() {
    let mut manager = connection_manager([MockDevice::new(1, usb_midi_interfaces())]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    assert!(manager.is_input_available());
    assert_eq!(
        MIDI_OUT_ENDPOINT,
        manager.endpoints().unwrap().output.endpoint_address
    );
    assert_eq!(
        1,
        manager
            .host()
            .state()
            .count_calls(|call| matches!(call, Call::Claim(..)))
    );
}

#[test]
fn device_not_found() {
    let mut manager = connection_manager([MockDevice::new(1, usb_midi_interfaces())]);
    assert!(matches!(
        manager.ensure_connected(OTHER_DEVICE_ID),
        Err(ConnectError::NotFound { device_id }) if device_id == OTHER_DEVICE_ID
    ));
    assert!(!manager.is_connected());
}

#[test]
fn permission_denied() {
    let mut device = MockDevice::new(1, usb_midi_interfaces());
    device.has_permission = false;
    let mut manager = connection_manager([device]);
    assert!(matches!(
        manager.ensure_connected(DEVICE_ID),
        Err(ConnectError::PermissionDenied { .. })
    ));
    assert!(!manager.is_connected());
    assert!(manager.host().take_calls().is_empty());
}

#[test]
fn open_failed() {
    let mut device = MockDevice::new(1, usb_midi_interfaces());
    device.fail_open = true;
    let mut manager = connection_manager([device]);
    assert!(matches!(
        manager.ensure_connected(DEVICE_ID),
        Err(ConnectError::Open { .. })
    ));
    assert!(!manager.is_connected());
}

#[test]
fn resolve_failure_closes_handle() {
    let mut manager = connection_manager([MockDevice::new(
        1,
        vec![midi_streaming_interface(1, [bulk_endpoint(0x81)])],
    )]);
    assert!(matches!(
        manager.ensure_connected(DEVICE_ID),
        Err(ConnectError::Resolve(ResolveError::EndpointNotFound { .. }))
    ));
    assert!(!manager.is_connected());
    assert_eq!(
        vec![Call::Open(DEVICE_ID), Call::Close],
        manager.host().take_calls()
    );
}

#[test]
fn output_claim_failure_closes_handle() {
    let mut device = MockDevice::new(1, usb_midi_interfaces());
    device.rejected_claims.insert((1, ClaimMode::Exclusive));
    let mut manager = connection_manager([device]);
    assert!(matches!(
        manager.ensure_connected(DEVICE_ID),
        Err(ConnectError::Claim {
            interface_number: 1,
            ..
        })
    ));
    assert!(!manager.is_connected());
    assert_eq!(
        vec![
            Call::Open(DEVICE_ID),
            Call::Claim(1, ClaimMode::Exclusive),
            Call::Close
        ],
        manager.host().take_calls()
    );
}

#[test]
fn claim_separate_input_interface_shared() {
    let mut manager = connection_manager([MockDevice::new(1, split_interfaces())]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    assert!(manager.is_input_available());
    assert_eq!(
        vec![
            Call::Open(DEVICE_ID),
            Call::Claim(1, ClaimMode::Exclusive),
            Call::Claim(2, ClaimMode::Shared),
        ],
        manager.host().take_calls()
    );
}

#[test]
fn claim_separate_input_interface_exclusive_fallback() {
    let mut device = MockDevice::new(1, split_interfaces());
    device.rejected_claims.insert((2, ClaimMode::Shared));
    let mut manager = connection_manager([device]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    assert!(manager.is_input_available());
    assert_eq!(
        vec![
            Call::Open(DEVICE_ID),
            Call::Claim(1, ClaimMode::Exclusive),
            Call::Claim(2, ClaimMode::Shared),
            Call::Claim(2, ClaimMode::Exclusive),
        ],
        manager.host().take_calls()
    );
}

#[test]
fn input_claim_failure_disables_listening() {
    let mut device = MockDevice::new(1, split_interfaces());
    device.rejected_claims.insert((2, ClaimMode::Shared));
    device.rejected_claims.insert((2, ClaimMode::Exclusive));
    let mut manager = connection_manager([device]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    assert!(manager.is_connected());
    assert!(!manager.is_input_available());
    let (event_handler, _events) = event_channel();
    assert!(matches!(
        manager.start_listening(event_handler),
        Err(StartListeningError::InputUnavailable)
    ));
    assert!(!manager.is_listening());
    manager.host().take_calls();
    // Only the output interface needs to be released
    assert!(manager.disconnect());
    assert_eq!(
        vec![Call::Release(1), Call::Close],
        manager.host().take_calls()
    );
}

#[test]
fn disconnect_releases_input_before_output() {
    let mut manager = connection_manager([MockDevice::new(1, split_interfaces())]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    manager.host().take_calls();
    assert!(manager.disconnect());
    assert!(!manager.is_connected());
    assert_eq!(
        vec![Call::Release(2), Call::Release(1), Call::Close],
        manager.host().take_calls()
    );
}

#[test]
fn disconnect_is_idempotent() {
    let mut manager = connection_manager([MockDevice::new(1, usb_midi_interfaces())]);
    assert!(!manager.disconnect());
    manager.ensure_connected(DEVICE_ID).unwrap();
    assert!(manager.disconnect());
    manager.host().take_calls();
    assert!(!manager.disconnect());
    assert!(manager.host().take_calls().is_empty());
}

#[test]
fn disconnect_suppresses_teardown_failures() {
    let mut manager = connection_manager([MockDevice::new(1, split_interfaces())]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    {
        let mut state = manager.host().state();
        state.fail_release = true;
        state.fail_close = true;
    }
    manager.host().take_calls();
    assert!(manager.disconnect());
    assert!(!manager.is_connected());
    assert_eq!(
        vec![Call::Release(2), Call::Release(1), Call::Close],
        manager.host().take_calls()
    );
}

#[test]
fn connecting_another_device_disconnects_first() {
    let mut manager = connection_manager([
        MockDevice::new(1, usb_midi_interfaces()),
        MockDevice::new(2, usb_midi_interfaces()),
    ]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    manager.host().take_calls();
    manager.ensure_connected(OTHER_DEVICE_ID).unwrap();
    assert_eq!(Some(OTHER_DEVICE_ID), manager.connected_device_id());
    assert_eq!(
        vec![
            Call::Release(1),
            Call::Close,
            Call::Open(OTHER_DEVICE_ID),
            Call::Claim(1, ClaimMode::Exclusive),
        ],
        manager.host().take_calls()
    );
}

#[test]
fn failed_connect_to_another_device_stays_disconnected() {
    let mut manager = connection_manager([MockDevice::new(1, usb_midi_interfaces())]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    assert!(manager.ensure_connected(OTHER_DEVICE_ID).is_err());
    assert!(!manager.is_connected());
}

#[test]
fn start_listening_requires_connection() {
    let mut manager = connection_manager([MockDevice::new(1, usb_midi_interfaces())]);
    let (event_handler, _events) = event_channel();
    assert!(matches!(
        manager.start_listening(event_handler),
        Err(StartListeningError::NotConnected)
    ));
}

#[test]
fn disconnect_stops_listening() {
    let mut manager = connection_manager([MockDevice::new(1, usb_midi_interfaces())]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    let (event_handler, events) = event_channel();
    manager.start_listening(Arc::clone(&event_handler)).unwrap();
    assert!(manager.is_listening());
    assert_eq!(Some(DEVICE_ID), manager.listening_device_id());
    // Starting again is a no-op
    manager.start_listening(event_handler).unwrap();
    assert!(manager.disconnect());
    assert!(!manager.is_listening());
    assert_eq!(None, manager.listening_device_id());
    assert_eq!(
        Event::ListeningTerminated {
            device_id: DEVICE_ID,
            cause: TerminationCause::Stopped,
        },
        events.recv_timeout(Duration::from_secs(5)).unwrap()
    );
}

#[test]
fn stop_listening_keeps_connection() {
    let mut manager = connection_manager([MockDevice::new(1, usb_midi_interfaces())]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    assert!(!manager.stop_listening());
    let (event_handler, _events) = event_channel();
    manager.start_listening(event_handler).unwrap();
    assert!(manager.stop_listening());
    assert!(!manager.is_listening());
    assert!(manager.is_connected());
}

#[test]
fn reconnect_after_connection_loss() {
    let mut manager = connection_manager([MockDevice::new(1, usb_midi_interfaces())]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    manager.host().push_read_error(TransportError::Disconnected);
    let (event_handler, events) = event_channel();
    manager.start_listening(event_handler).unwrap();
    assert_eq!(
        Event::ListeningTerminated {
            device_id: DEVICE_ID,
            cause: TerminationCause::ConnectionLost,
        },
        events.recv_timeout(Duration::from_secs(5)).unwrap()
    );
    // The thread might still be exiting after emitting the event
    while manager.is_listening() {
        std::thread::sleep(Duration::from_millis(1));
    }
    manager.host().take_calls();
    manager.ensure_connected(DEVICE_ID).unwrap();
    assert_eq!(
        vec![
            Call::Release(1),
            Call::Close,
            Call::Open(DEVICE_ID),
            Call::Claim(1, ClaimMode::Exclusive),
        ],
        manager.host().take_calls()
    );
}

#[test]
fn write_to_output_endpoint() {
    let mut manager = connection_manager([MockDevice::new(1, usb_midi_interfaces())]);
    assert!(matches!(
        manager.write(&[0x09, 0x90, 0x3c, 0x64]),
        Err(WriteError::NotConnected)
    ));
    manager.ensure_connected(DEVICE_ID).unwrap();
    manager.host().take_calls();
    assert_eq!(4, manager.write(&[0x09, 0x90, 0x3c, 0x64]).unwrap());
    assert_eq!(
        vec![Call::Write(MIDI_OUT_ENDPOINT, vec![0x09, 0x90, 0x3c, 0x64])],
        manager.host().take_calls()
    );
}

#[test]
fn read_buffer_fits_max_packet_size_of_input_endpoint() {
    let high_speed_interfaces = vec![midi_streaming_interface(
        1,
        [
            bulk_endpoint(0x01),
            EndpointDescriptor {
                address: 0x81,
                direction: Direction::In,
                transfer_type: TransferType::Bulk,
                max_packet_size: 512,
            },
        ],
    )];
    let mut manager = connection_manager([MockDevice::new(1, high_speed_interfaces)]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    // 20 packets exceed the default read buffer size of 64 bytes
    let note_on = [0x09, 0x90, 0x3c, 0x64];
    manager.host().push_read(&note_on.repeat(20));
    let (event_handler, events) = event_channel();
    manager.start_listening(event_handler).unwrap();
    for _ in 0..20 {
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::MessageReceived { message, .. } => {
                assert_eq!("90 3C 64", message.to_string());
            }
            event => panic!("unexpected event: {event:?}"),
        }
    }
    assert!(manager.stop_listening());
}

#[test]
fn has_listener_after_connection_loss() {
    let mut manager = connection_manager([MockDevice::new(1, usb_midi_interfaces())]);
    manager.ensure_connected(DEVICE_ID).unwrap();
    assert!(!manager.has_listener());
    manager.host().push_read_error(TransportError::Disconnected);
    let (event_handler, events) = event_channel();
    manager.start_listening(event_handler).unwrap();
    assert!(manager.has_listener());
    events.recv_timeout(Duration::from_secs(5)).unwrap();
    while manager.is_listening() {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(manager.has_listener());
    assert!(!manager.stop_listening());
    assert!(!manager.has_listener());
}
