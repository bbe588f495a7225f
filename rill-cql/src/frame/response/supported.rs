use crate::frame::frame_errors::CqlSupportedParseError;
use crate::frame::request::startup;
use crate::frame::types;
use std::collections::HashMap;

/// The server's answer to OPTIONS: a multimap of supported startup options.
#[derive(Debug, Default)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlSupportedParseError> {
        let options = types::read_string_multimap(buf)
            .map_err(CqlSupportedParseError::OptionsMapDeserialization)?;

        Ok(Supported { options })
    }

    /// CQL versions the server accepts, in server-preferred order.
    pub fn cql_versions(&self) -> &[String] {
        self.options
            .get(startup::CQL_VERSION)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Compression algorithms the server accepts.
    pub fn compression_algorithms(&self) -> &[String] {
        self.options
            .get(startup::COMPRESSION)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
