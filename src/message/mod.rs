// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::packet::MAX_PAYLOAD_SIZE;


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseMessageError {
    #[error("empty message")]
    Empty,

    #[error("too many bytes: {len} (max. {})", MAX_PAYLOAD_SIZE)]
    TooLong { len: usize },

    #[error("invalid hex pair \"{token}\"")]
    InvalidHexPair { token: String },
}

/// A single logical MIDI message
///
/// A status byte followed by up to 2 data bytes. Exchanged with clients
/// as whitespace-separated hex pairs, e.g. `"90 3C 64"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MidiMessage {
    bytes: [u8; MAX_PAYLOAD_SIZE],
    len: u8,
}

impl MidiMessage {
    /// Create a message from raw bytes.
    ///
    /// Returns `None` if the input is empty or exceeds 3 bytes.
    #[must_use]
    pub fn from_bytes(input: &[u8]) -> Option<Self> {
        if input.is_empty() || input.len() > MAX_PAYLOAD_SIZE {
            return None;
        }
        let mut bytes = [0; MAX_PAYLOAD_SIZE];
        bytes[..input.len()].copy_from_slice(input);
        #[allow(clippy::cast_possible_truncation)]
        let len = input.len() as u8;
        Some(Self { bytes, len })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    #[must_use]
    pub const fn status(&self) -> u8 {
        self.bytes[0]
    }
}

impl AsRef<[u8]> for MidiMessage {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl FromStr for MidiMessage {
    type Err = ParseMessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; MAX_PAYLOAD_SIZE];
        let mut len = 0;
        for token in s.split_whitespace() {
            if len >= MAX_PAYLOAD_SIZE {
                return Err(ParseMessageError::TooLong {
                    len: s.split_whitespace().count(),
                });
            }
            bytes[len] = parse_hex_pair(token)?;
            len += 1;
        }
        Self::from_bytes(&bytes[..len]).ok_or(ParseMessageError::Empty)
    }
}

fn parse_hex_pair(token: &str) -> Result<u8, ParseMessageError> {
    // `from_str_radix` would also accept a leading sign
    if token.is_empty() || token.len() > 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ParseMessageError::InvalidHexPair {
            token: token.to_owned(),
        });
    }
    u8::from_str_radix(token, 16).map_err(|_| ParseMessageError::InvalidHexPair {
        token: token.to_owned(),
    })
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_hex_pairs(self.as_bytes(), f)
    }
}

/// Format bytes as space-separated, upper-case hex pairs.
fn fmt_hex_pairs(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut bytes = bytes.iter();
    if let Some(first) = bytes.next() {
        write!(f, "{first:02X}")?;
    }
    for byte in bytes {
        write!(f, " {byte:02X}")?;
    }
    Ok(())
}
