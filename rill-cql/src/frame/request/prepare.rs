use crate::frame::frame_errors::FrameError;
use crate::frame::version::ProtocolVersion;
use crate::frame::{
    request::{RequestOpcode, SerializableRequest},
    types,
};

/// Asks the server to parse a statement once so it can later be executed by
/// id. The response is a RESULT::Prepared.
pub struct Prepare<'a> {
    pub query: &'a str,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(&self, _version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        types::write_long_string(self.query, buf)?;
        Ok(())
    }
}
