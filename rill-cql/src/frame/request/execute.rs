use crate::frame::frame_errors::FrameError;
use crate::frame::request::query::QueryParameters;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;
use crate::frame::version::ProtocolVersion;
use bytes::Bytes;

/// Executes a previously prepared statement by its id.
pub struct Execute<'a> {
    pub id: Bytes,
    /// Id of the result metadata cached alongside the prepared statement.
    /// Only present on the wire in protocol v5.
    pub result_metadata_id: Option<Bytes>,
    pub parameters: QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        types::write_short_bytes(&self.id[..], buf)?;

        if version == ProtocolVersion::V5 {
            // The field is mandatory in v5; a statement prepared before the
            // extension was negotiated carries an empty id.
            let result_metadata_id = self.result_metadata_id.as_deref().unwrap_or(&[]);
            types::write_short_bytes(result_metadata_id, buf)?;
        }

        self.parameters.serialize(version, buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_metadata_id_only_in_v5() {
        let execute = Execute {
            id: Bytes::from_static(&[0xDE, 0xAD]),
            result_metadata_id: Some(Bytes::from_static(&[0xBE, 0xEF])),
            parameters: QueryParameters::default(),
        };

        let mut v4_buf = Vec::new();
        execute.serialize(ProtocolVersion::V4, &mut v4_buf).unwrap();
        let mut v5_buf = Vec::new();
        execute.serialize(ProtocolVersion::V5, &mut v5_buf).unwrap();

        let mut slice = &v4_buf[..];
        assert_eq!(types::read_short_bytes(&mut slice).unwrap(), &[0xDE, 0xAD]);
        // Next up in v4 is the consistency of the parameters block.
        types::read_consistency(&mut slice).unwrap();

        let mut slice = &v5_buf[..];
        assert_eq!(types::read_short_bytes(&mut slice).unwrap(), &[0xDE, 0xAD]);
        assert_eq!(types::read_short_bytes(&mut slice).unwrap(), &[0xBE, 0xEF]);
    }
}
