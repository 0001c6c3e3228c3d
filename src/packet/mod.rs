// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! USB-MIDI packet codec
//!
//! Stateless transforms between logical MIDI messages (1 to 3 bytes) and
//! the fixed 4-byte USB-MIDI event packets that travel over bulk endpoints.
//!
//! <https://www.usb.org/sites/default/files/midi10.pdf>, section 4

use derive_more::{Display, From, Into};
use strum::{EnumCount, EnumIter, FromRepr};


/// Size of a single USB-MIDI event packet in bytes.
pub const PACKET_SIZE: usize = 4;

/// Maximum number of logical MIDI bytes carried by a single packet.
pub const MAX_PAYLOAD_SIZE: usize = PACKET_SIZE - 1;

/// Virtual cable number
///
/// Multiplexes up to 16 logical MIDI ports onto a single endpoint.
/// Always restricted to the lower 4 bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, Into)]
pub struct CableNumber(u8);

impl CableNumber {
    pub const MIN: Self = Self(0);
    pub const MAX: Self = Self(0x0f);

    /// Create a cable number, silently discarding all but the lower 4 bits.
    #[must_use]
    pub const fn new(number: u8) -> Self {
        Self(number & 0x0f)
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl From<u8> for CableNumber {
    fn from(number: u8) -> Self {
        Self::new(number)
    }
}

/// Code Index Number (CIN)
///
/// Classifies the MIDI message carried in a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter, FromRepr)]
#[repr(u8)]
pub enum CodeIndexNumber {
    /// Reserved for future extensions
    Miscellaneous = 0x0,
    /// Reserved for future expansion
    CableEvent = 0x1,
    /// 2-byte system common message, e.g. MTC quarter frame or song select
    SystemCommon2 = 0x2,
    /// 3-byte system common message, e.g. song position pointer
    SystemCommon3 = 0x3,
    /// SysEx starts or continues
    SysExStart = 0x4,
    /// Single-byte system common message or SysEx ends with 1 byte
    SystemCommon1 = 0x5,
    /// SysEx ends with 2 bytes
    SysExEnd2 = 0x6,
    /// SysEx ends with 3 bytes
    SysExEnd3 = 0x7,
    NoteOff = 0x8,
    NoteOn = 0x9,
    PolyKeyPressure = 0xa,
    ControlChange = 0xb,
    ProgramChange = 0xc,
    ChannelPressure = 0xd,
    PitchBendChange = 0xe,
    /// Single byte, e.g. real-time messages
    SingleByte = 0xf,
}

impl CodeIndexNumber {
    /// Derive the code index number from the leading (status) byte
    /// of a logical MIDI message.
    ///
    /// Unrecognized leading bytes, including data bytes, map to
    /// [`CodeIndexNumber::Miscellaneous`].
    #[must_use]
    pub const fn from_status(status: u8) -> Self {
        match status {
            0x80..=0xef => match Self::from_repr(status >> 4) {
                Some(cin) => cin,
                None => Self::Miscellaneous,
            },
            // SysEx start
            0xf0 => Self::SysExStart,
            // MTC quarter frame, song select
            0xf1 | 0xf3 => Self::SystemCommon2,
            // Song position pointer
            0xf2 => Self::SystemCommon3,
            // Tune request, SysEx end
            0xf6 | 0xf7 => Self::SystemCommon1,
            // Timing clock, start, continue, stop, active sensing, reset
            0xf8 | 0xfa | 0xfb | 0xfc | 0xfe | 0xff => Self::SingleByte,
            _ => Self::Miscellaneous,
        }
    }

    /// Bottom nibble of the packet header.
    #[must_use]
    pub const fn nibble(self) -> u8 {
        self as u8
    }
}

/// A single USB-MIDI event packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, From, Into)]
pub struct UsbMidiPacket([u8; PACKET_SIZE]);

impl UsbMidiPacket {
    #[must_use]
    pub const fn new(
        cable: CableNumber,
        cin: CodeIndexNumber,
        payload: [u8; MAX_PAYLOAD_SIZE],
    ) -> Self {
        let [b1, b2, b3] = payload;
        Self([(cable.value() << 4) | cin.nibble(), b1, b2, b3])
    }

    #[must_use]
    pub const fn cable(&self) -> CableNumber {
        CableNumber::new(self.0[0] >> 4)
    }

    #[must_use]
    pub const fn code_index_number(&self) -> CodeIndexNumber {
        match CodeIndexNumber::from_repr(self.0[0] & 0x0f) {
            Some(cin) => cin,
            None => CodeIndexNumber::Miscellaneous,
        }
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.0
    }

    #[must_use]
    pub const fn to_bytes(self) -> [u8; PACKET_SIZE] {
        self.0
    }
}

/// Encode a logical MIDI message into a packet.
///
/// Returns `None` for an empty message, which is not an error but
/// signals that there is nothing to send. Only the first 3 bytes of
/// longer input are considered.
#[must_use]
pub fn encode(message: &[u8], cable: CableNumber) -> Option<UsbMidiPacket> {
    let status = *message.first()?;
    let cin = CodeIndexNumber::from_status(status);
    let mut payload = [0; MAX_PAYLOAD_SIZE];
    let len = message.len().min(MAX_PAYLOAD_SIZE);
    payload[..len].copy_from_slice(&message[..len]);
    Some(UsbMidiPacket::new(cable, cin, payload))
}

/// Number of logical MIDI bytes carried by a packet.
///
/// The table deliberately covers more code index numbers than [`encode`]
/// ever produces. It has been extended for traffic observed from third-party
/// devices and is not a textbook CIN table. Unsupported code index numbers
/// map to 0, i.e. the packet is dropped.
#[must_use]
pub const fn decode_length(cin: CodeIndexNumber, first_byte: u8) -> usize {
    match cin {
        CodeIndexNumber::NoteOff
        | CodeIndexNumber::NoteOn
        | CodeIndexNumber::PolyKeyPressure
        | CodeIndexNumber::ControlChange
        | CodeIndexNumber::PitchBendChange
        | CodeIndexNumber::SystemCommon2
        | CodeIndexNumber::SystemCommon3
        | CodeIndexNumber::SysExStart
        | CodeIndexNumber::SystemCommon1
        | CodeIndexNumber::SysExEnd2
        | CodeIndexNumber::SysExEnd3 => 3,
        CodeIndexNumber::ProgramChange | CodeIndexNumber::ChannelPressure => 2,
        CodeIndexNumber::SingleByte => match first_byte {
            0xf0 => 3,
            0xf1 | 0xf3 => 2,
            _ => 1,
        },
        CodeIndexNumber::Miscellaneous | CodeIndexNumber::CableEvent => 0,
    }
}

/// Decode the logical MIDI bytes from a packet.
///
/// Returns an empty slice if the input is shorter than a packet, if the
/// packet was sent on a different cable than `listening_cable`, or if
/// its code index number is not supported. None of these cases is an
/// error, the packet is simply dropped.
#[must_use]
pub fn decode(packet: &[u8], listening_cable: CableNumber) -> &[u8] {
    let Some(bytes) = packet.first_chunk::<PACKET_SIZE>() else {
        return &[];
    };
    let header = UsbMidiPacket::from(*bytes);
    if header.cable() != listening_cable {
        log::trace!(
            "Dropping packet {bytes:02x?} from cable {cable}",
            cable = header.cable()
        );
        return &[];
    }
    let len = decode_length(header.code_index_number(), bytes[1]);
    debug_assert!(len <= MAX_PAYLOAD_SIZE);
    &bytes[1..=len]
}
