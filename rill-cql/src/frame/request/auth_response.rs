use crate::frame::frame_errors::FrameError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::write_bytes_opt;
use crate::frame::version::ProtocolVersion;

/// One client step of the SASL exchange. The token layout is authenticator
/// specific and produced by the authentication seam above this crate.
pub struct AuthResponse {
    pub response: Option<Vec<u8>>,
}

impl SerializableRequest for AuthResponse {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;

    fn serialize(&self, _version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        write_bytes_opt(self.response.as_ref(), buf)?;
        Ok(())
    }
}
