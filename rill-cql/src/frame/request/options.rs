use crate::frame::frame_errors::FrameError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::version::ProtocolVersion;

/// An empty-bodied request asking the server which STARTUP options it
/// supports. Also doubles as the driver's keepalive probe.
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(&self, _version: ProtocolVersion, _buf: &mut Vec<u8>) -> Result<(), FrameError> {
        Ok(())
    }
}
