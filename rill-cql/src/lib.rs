//! Wire-level part of the rill driver: the CQL binary protocol codec.
//!
//! This crate knows how to turn requests into bytes and bytes into responses
//! for protocol versions 3, 4 and 5, including the v5 outer framing with its
//! CRC-protected segments. It deliberately does not interpret CQL values
//! inside result bodies; those are surfaced as raw cells for the layer above.

pub mod frame;

pub use crate::frame::types::Consistency;
pub use crate::frame::version::ProtocolVersion;
pub use crate::frame::Compression;
