use std::borrow::Cow;
use std::sync::Arc;

use crate::frame::frame_errors::FrameError;
use crate::frame::types::SerialConsistency;
use crate::frame::value::SerializedValues;
use crate::frame::version::ProtocolVersion;
use crate::frame::{
    request::{RequestOpcode, SerializableRequest},
    types,
};
use bytes::{BufMut, Bytes};

// Query flags
const FLAG_VALUES: u32 = 0x01;
const FLAG_SKIP_METADATA: u32 = 0x02;
const FLAG_PAGE_SIZE: u32 = 0x04;
const FLAG_WITH_PAGING_STATE: u32 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u32 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u32 = 0x20;

/// Executes a single unprepared statement.
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub parameters: QueryParameters<'q>,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        types::write_long_string(&self.contents, buf)?;
        self.parameters.serialize(version, buf)?;
        Ok(())
    }
}

/// The `<query_parameters>` block shared by QUERY and EXECUTE bodies.
pub struct QueryParameters<'a> {
    pub consistency: types::Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
    pub page_size: Option<i32>,
    pub paging_state: PagingState,
    pub skip_metadata: bool,
    pub values: Cow<'a, SerializedValues>,
}

impl Default for QueryParameters<'_> {
    fn default() -> Self {
        Self {
            consistency: Default::default(),
            serial_consistency: None,
            timestamp: None,
            page_size: None,
            paging_state: PagingState::start(),
            skip_metadata: false,
            values: Cow::Borrowed(SerializedValues::EMPTY),
        }
    }
}

impl QueryParameters<'_> {
    pub fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut impl BufMut,
    ) -> Result<(), FrameError> {
        types::write_consistency(self.consistency, buf);

        let paging_state_bytes = self.paging_state.as_bytes_slice();

        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }

        if self.skip_metadata {
            flags |= FLAG_SKIP_METADATA;
        }

        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }

        if paging_state_bytes.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }

        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }

        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        // v5 widened the flags field from a byte to an int.
        if version == ProtocolVersion::V5 {
            buf.put_u32(flags);
        } else {
            buf.put_u8(flags as u8);
        }

        if !self.values.is_empty() {
            self.values.write_to_request(buf);
        }

        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }

        if let Some(paging_state_bytes) = paging_state_bytes {
            types::write_bytes(paging_state_bytes, buf)?;
        }

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }

        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}

/// The position of a paged query, i.e. where to resume fetching result rows
/// upon next request.
///
/// Cheaply clonable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingState(Option<Arc<[u8]>>);

impl PagingState {
    /// The state of a not-yet-started paged query.
    #[inline]
    pub fn start() -> Self {
        Self(None)
    }

    pub fn new_from_raw_bytes(raw_bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(Some(raw_bytes.into()))
    }

    pub fn as_bytes_slice(&self) -> Option<&[u8]> {
        self.0.as_deref()
    }
}

impl Default for PagingState {
    fn default() -> Self {
        Self::start()
    }
}

/// Whether the server signalled more pages after a Rows result.
#[derive(Debug, Clone)]
pub enum PagingStateResponse {
    HasMorePages { state: PagingState },
    NoMorePages,
}

impl PagingStateResponse {
    pub(crate) fn new_from_raw_bytes(raw_paging_state: Option<&Bytes>) -> Self {
        match raw_paging_state {
            Some(raw_bytes) => Self::HasMorePages {
                state: PagingState::new_from_raw_bytes(&raw_bytes[..]),
            },
            None => Self::NoMorePages,
        }
    }

    #[inline]
    pub fn finished(&self) -> bool {
        matches!(*self, Self::NoMorePages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_widen_to_int_in_v5() {
        let mut params = QueryParameters::default();
        params.page_size = Some(1024);
        params.timestamp = Some(2137);

        let mut v4_buf = Vec::new();
        params.serialize(ProtocolVersion::V4, &mut v4_buf).unwrap();
        let mut v5_buf = Vec::new();
        params.serialize(ProtocolVersion::V5, &mut v5_buf).unwrap();

        // consistency (2) + flags (1 vs 4) + page size (4) + timestamp (8)
        assert_eq!(v4_buf.len(), 15);
        assert_eq!(v5_buf.len(), 18);
        assert_eq!(v4_buf[2] as u32, FLAG_PAGE_SIZE | FLAG_WITH_DEFAULT_TIMESTAMP);
        assert_eq!(
            u32::from_be_bytes(v5_buf[2..6].try_into().unwrap()),
            FLAG_PAGE_SIZE | FLAG_WITH_DEFAULT_TIMESTAMP
        );
    }

    #[test]
    fn values_are_embedded_with_count() {
        let mut values = SerializedValues::new();
        values.add_bytes(&[0x01]).unwrap();

        let query = Query {
            contents: Cow::Borrowed("INSERT INTO t (p) VALUES (?)"),
            parameters: QueryParameters {
                values: Cow::Owned(values),
                ..Default::default()
            },
        };

        let mut buf = Vec::new();
        query.serialize(ProtocolVersion::V4, &mut buf).unwrap();

        let mut slice = &buf[..];
        assert_eq!(
            types::read_long_string(&mut slice).unwrap(),
            "INSERT INTO t (p) VALUES (?)"
        );
        types::read_consistency(&mut slice).unwrap();
        assert_eq!(slice[0] as u32, FLAG_VALUES);
        // flags, then element count
        assert_eq!(types::read_short(&mut &slice[1..]).unwrap(), 1);
    }
}
