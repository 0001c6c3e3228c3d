// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

#![allow(rustdoc::invalid_rust_codeblocks)]
#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod bridge;
pub use self::bridge::{BridgeError, ErrorCode, ErrorKind, UsbMidiBridge};

pub mod config;
pub use self::config::Config;

pub mod connection;
pub use self::connection::{ConnectError, ConnectionManager};

pub mod event;
pub use self::event::{Event, EventHandler, TerminationCause};

pub mod listener;

pub mod message;
pub use self::message::{MidiMessage, ParseMessageError};

pub mod packet;
pub use self::packet::{CableNumber, CodeIndexNumber, UsbMidiPacket};

pub mod resolver;

pub mod usb;
pub use self::usb::{
    DeviceDescriptor, DeviceId, DeviceInfo, TransportError, UsbDeviceHandle, UsbHost,
};

#[cfg(test)]
mod testing;
