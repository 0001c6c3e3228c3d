// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use crate::packet::{CableNumber, PACKET_SIZE};

/// Minimum size of the listener's read buffer.
///
/// Large enough for a full-speed bulk packet, i.e. 16 USB-MIDI packets.
pub const MIN_READ_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Cable number of outgoing packets.
    pub output_cable: CableNumber,

    /// The single cable that is accepted when listening.
    ///
    /// Packets on all other cables are dropped.
    pub input_cable: CableNumber,

    /// Timeout of each blocking read while listening.
    ///
    /// Bounds the latency for stopping the listener.
    pub read_timeout: Duration,

    /// Timeout for sending a single packet.
    pub write_timeout: Duration,

    /// Size of the listener's read buffer in bytes.
    pub read_buffer_size: usize,
}

impl Config {
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);
    pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

    /// The effective read buffer size
    ///
    /// At least [`MIN_READ_BUFFER_SIZE`] and rounded up to a multiple
    /// of the packet size.
    #[must_use]
    pub const fn effective_read_buffer_size(&self) -> usize {
        let size = if self.read_buffer_size < MIN_READ_BUFFER_SIZE {
            MIN_READ_BUFFER_SIZE
        } else {
            self.read_buffer_size
        };
        size.div_ceil(PACKET_SIZE) * PACKET_SIZE
    }

    /// Read buffer size for an input endpoint
    ///
    /// A single transfer might fill a whole packet of the endpoint,
    /// e.g. 512 bytes for high-speed bulk endpoints. The buffer must
    /// be large enough to not lose any USB-MIDI packets.
    #[must_use]
    pub fn endpoint_read_buffer_size(&self, max_packet_size: u16) -> usize {
        let size = self.effective_read_buffer_size();
        let max_packet_size = usize::from(max_packet_size);
        if size < max_packet_size {
            max_packet_size.div_ceil(PACKET_SIZE) * PACKET_SIZE
        } else {
            size
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_cable: CableNumber::MIN,
            input_cable: CableNumber::MIN,
            read_timeout: Self::DEFAULT_READ_TIMEOUT,
            write_timeout: Self::DEFAULT_WRITE_TIMEOUT,
            read_buffer_size: MIN_READ_BUFFER_SIZE,
        }
    }
}
