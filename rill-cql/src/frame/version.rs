//! Protocol version handling and negotiation helpers.

use std::fmt::Display;

/// A negotiable version of the CQL native protocol.
///
/// Versions 3 and 4 share the envelope-only wire layout; version 5 wraps
/// envelopes in CRC-protected outer segments after the handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V3,
    V4,
    V5,
}

impl ProtocolVersion {
    /// The newest version the driver will offer when asked to auto-negotiate.
    pub const LATEST: ProtocolVersion = ProtocolVersion::V5;

    pub fn as_request_byte(self) -> u8 {
        match self {
            ProtocolVersion::V3 => 0x03,
            ProtocolVersion::V4 => 0x04,
            ProtocolVersion::V5 => 0x05,
        }
    }

    pub fn try_from_byte(byte: u8) -> Option<ProtocolVersion> {
        match byte {
            0x03 => Some(ProtocolVersion::V3),
            0x04 => Some(ProtocolVersion::V4),
            0x05 => Some(ProtocolVersion::V5),
            _ => None,
        }
    }

    /// Next version to offer after the server refused this one.
    pub fn next_lower(self) -> Option<ProtocolVersion> {
        match self {
            ProtocolVersion::V5 => Some(ProtocolVersion::V4),
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::V3 => None,
        }
    }

    /// Whether the outer segment framing is in effect once the connection
    /// finished its STARTUP negotiation.
    pub fn uses_outer_framing(self) -> bool {
        matches!(self, ProtocolVersion::V5)
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::V3 => f.write_str("v3"),
            ProtocolVersion::V4 => f.write_str("v4"),
            ProtocolVersion::V5 => f.write_str("v5"),
        }
    }
}

/// Extracts the highest protocol version a server claims to support out of a
/// protocol-error reason string.
///
/// Servers that refuse the offered version answer with messages like
/// "Invalid or unsupported protocol version (5); the lowest supported version
/// is 3 and the highest is 4". The numbers and their order are the only
/// stable part across server implementations, so the last version-shaped
/// integer in the message is taken as the downgrade hint.
pub fn downgrade_hint(reason: &str) -> Option<ProtocolVersion> {
    reason
        .split(|c: char| !c.is_ascii_digit())
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| chunk.parse::<u8>().ok())
        .filter_map(ProtocolVersion::try_from_byte)
        .next_back()
}
