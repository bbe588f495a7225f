//! CQL protocol-level representation of a `STARTUP` request.

use std::{borrow::Cow, collections::HashMap};

use crate::frame::frame_errors::FrameError;
use crate::frame::version::ProtocolVersion;
use crate::frame::{
    request::{RequestOpcode, SerializableRequest},
    types,
};

/// Option key under which the accepted CQL version is sent.
pub const CQL_VERSION: &str = "CQL_VERSION";
/// Option key under which the negotiated compression algorithm is sent.
pub const COMPRESSION: &str = "COMPRESSION";
pub const DRIVER_NAME: &str = "DRIVER_NAME";
pub const DRIVER_VERSION: &str = "DRIVER_VERSION";

pub const DEFAULT_CQL_VERSION: &str = "3.0.0";
pub const DEFAULT_DRIVER_NAME: &str = "rill";
pub const DEFAULT_DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The request that finalises the negotiation phase and establishes the CQL
/// connection.
pub struct Startup<'a> {
    /// The protocol options that were suggested by the server and accepted by
    /// the client.
    pub options: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl SerializableRequest for Startup<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, _version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }
}
