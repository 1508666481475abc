//! Input validation for operator-entered provisioning fields.
//!
//! Every `is_valid_*` function is total: it never panics and never does I/O,
//! it only answers yes or no. Callers trim user input before validating.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of hexadecimal characters in a full serial number (head + MAC).
pub const SERIAL_LEN: usize = 32;

/// Number of decimal digits in a PPPoE account.
pub const ACCOUNT_LEN: usize = 11;

const MAC_PLAIN_LEN: usize = 12;
const MAC_SEPARATED_LEN: usize = 17;

/// Check a dotted-quad IPv4 address.
///
/// Exactly four octets, each 0-255 written without a leading zero
/// (`"0"` itself is fine, `"010"` is not).
pub fn is_valid_ipv4(s: &str) -> bool {
    let mut octets = 0;
    for part in s.split('.') {
        octets += 1;
        if octets > 4 || !is_octet(part) {
            return false;
        }
    }
    octets == 4
}

fn is_octet(part: &str) -> bool {
    if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    if part.len() > 1 && part.starts_with('0') {
        return false;
    }
    part.parse::<u16>().map(|v| v <= 255).unwrap_or(false)
}

/// Check a MAC address.
///
/// Accepts 12 bare hex digits, or six hex pairs joined by a single
/// consistent separator (`:` or `-`).
pub fn is_valid_mac(s: &str) -> bool {
    s.parse::<MacAddress>().is_ok()
}

/// Check that `head` followed by the normalised MAC forms a 32 hex digit serial.
pub fn is_valid_serial(head: &str, mac: &str) -> bool {
    let Ok(mac) = mac.parse::<MacAddress>() else {
        return false;
    };
    let serial = format!("{}{}", head, mac.plain());
    serial.len() == SERIAL_LEN && serial.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Check a PPPoE account: exactly 11 decimal digits.
pub fn is_valid_account(s: &str) -> bool {
    s.len() == ACCOUNT_LEN && s.bytes().all(|b| b.is_ascii_digit())
}

/// Reasons a string is not a MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacParseError {
    #[error("MAC address must be 12 or 17 characters, got {0}")]
    Length(usize),

    #[error("MAC address contains a non-hex character")]
    NotHex,

    #[error("MAC address separators must all be ':' or all be '-'")]
    Separator,
}

/// A hardware address, normalised from any accepted spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// `AABBCCDDEEFF`, the form embedded in serial numbers.
    pub fn plain(&self) -> String {
        self.0.iter().map(|b| format!("{:02X}", b)).collect()
    }

    /// `AA:BB:CC:DD:EE:FF`, the form written to the box.
    pub fn colon(&self) -> String {
        self.join(':', true)
    }

    /// `aa-bb-cc-dd-ee-ff`, the form the Windows ARP table prints.
    pub fn dash(&self) -> String {
        self.join('-', false)
    }

    fn join(&self, sep: char, upper: bool) -> String {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|b| {
                if upper {
                    format!("{:02X}", b)
                } else {
                    format!("{:02x}", b)
                }
            })
            .collect();
        parts.join(&sep.to_string())
    }

    /// Lenient parse for addresses read from system tools, where octets
    /// may be unpadded (`0:1a:2b:3:4:5` on macOS).
    pub(crate) fn parse_loose(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return None;
        }
        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.is_empty() || part.len() > 2 {
                return None;
            }
            *slot = u8::from_str_radix(part, 16).ok()?;
        }
        Some(Self(octets))
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        let digits: Vec<u8> = match bytes.len() {
            MAC_PLAIN_LEN => bytes.to_vec(),
            MAC_SEPARATED_LEN => {
                let sep = bytes[2];
                if sep != b':' && sep != b'-' {
                    return Err(MacParseError::Separator);
                }
                let mut digits = Vec::with_capacity(MAC_PLAIN_LEN);
                for (i, &b) in bytes.iter().enumerate() {
                    if i % 3 == 2 {
                        if b != sep {
                            return Err(MacParseError::Separator);
                        }
                    } else {
                        digits.push(b);
                    }
                }
                digits
            }
            n => return Err(MacParseError::Length(n)),
        };

        let mut octets = [0u8; 6];
        for (slot, pair) in octets.iter_mut().zip(digits.chunks(2)) {
            *slot = (hex_value(pair[0])? << 4) | hex_value(pair[1])?;
        }
        Ok(Self(octets))
    }
}

fn hex_value(b: u8) -> Result<u8, MacParseError> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(MacParseError::NotHex),
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.colon())
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.colon())
    }
}
