//! Compact MAC address type for Bluetooth devices.
//!
//! Addresses identify BTHome devices in the registry, in MQTT topics and in
//! the AES-CCM nonce, so a single 6-byte representation is shared by all of
//! them and is decoupled from any specific Bluetooth library.

use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use thiserror::Error;

/// Characters accepted (and ignored) between the hex digits of an address.
const SEPARATORS: [char; 5] = [':', '-', '_', '.', ' '];

/// A Bluetooth MAC address stored as a compact 6-byte array.
///
/// The byte order is the human-readable one (`AA` is the first byte of
/// `AA:BB:CC:DD:EE:FF`), which is also the order used in the BTHome nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Normalized form: uppercase hex without separators (`AABBCCDDEEFF`).
    ///
    /// This is the registry key and the suffix appended to promiscuous topics.
    pub fn compact(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Errors returned when parsing a MAC address string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseMacError {
    #[error("invalid MAC address: expected 12 hex digits, got {0}")]
    InvalidLength(usize),
    #[error("invalid MAC address: '{0}' is not valid hex")]
    InvalidHex(String),
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    /// Parse an address, ignoring any of `: - _ .` and spaces.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| !SEPARATORS.contains(c)).collect();
        if digits.len() != 12 {
            return Err(ParseMacError::InvalidLength(digits.len()));
        }

        let mut bytes = [0u8; 6];
        hex::decode_to_slice(&digits, &mut bytes)
            .map_err(|_| ParseMacError::InvalidHex(s.to_string()))?;

        Ok(MacAddress(bytes))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

#[cfg(feature = "bluer")]
impl From<MacAddress> for bluer::Address {
    fn from(addr: MacAddress) -> Self {
        bluer::Address(addr.0)
    }
}
