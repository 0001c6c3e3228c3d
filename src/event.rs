// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

use crate::{
    message::MidiMessage,
    usb::{DeviceDescriptor, DeviceId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// Stopped on request.
    Stopped,

    /// Reading from the device failed.
    ///
    /// Listening is not resumed automatically.
    ConnectionLost,
}

/// Emitted event
///
/// Supposed to be consumed by a single receiver that could then
/// selectively dispatch them as needed to a broader audience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DeviceListChanged(Vec<DeviceDescriptor>),

    /// A MIDI message has been received while listening.
    ///
    /// The [`Display`](std::fmt::Display) representation of the message
    /// is the hex pair string, e.g. `"90 3C 64"`.
    MessageReceived {
        device_id: DeviceId,
        message: MidiMessage,
    },

    ListeningTerminated {
        device_id: DeviceId,
        cause: TerminationCause,
    },
}

pub trait EventHandler: Send + Sync {
    /// Handle an event.
    ///
    /// Might be invoked from the listener thread and should not block
    /// it for longer than needed!
    fn handle_event(&self, event: Event);
}

impl<F> EventHandler for F
where
    F: Fn(Event) + Send + Sync,
{
    fn handle_event(&self, event: Event) {
        self(event);
    }
}
