use crate::frame::frame_errors::FrameError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::{self, SerialConsistency};
use crate::frame::value::SerializedValues;
use crate::frame::version::ProtocolVersion;
use bytes::{BufMut, Bytes};
use std::borrow::Cow;

// Batch flags
const FLAG_WITH_SERIAL_CONSISTENCY: u32 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u32 = 0x20;

/// Executes a list of statements (prepared or not) as a single unit.
pub struct Batch<'b> {
    pub statements: Cow<'b, [BatchStatement<'b>]>,
    pub batch_type: BatchType,
    pub consistency: types::Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
    /// One value set per statement, positionally matched.
    pub values: Vec<SerializedValues>,
}

/// The semantics of a batch.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

#[derive(Debug, Clone)]
pub enum BatchStatement<'s> {
    Query { text: Cow<'s, str> },
    Prepared { id: Bytes },
}

impl BatchStatement<'_> {
    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), FrameError> {
        match self {
            BatchStatement::Query { text } => {
                buf.put_u8(0);
                types::write_long_string(text, buf)?;
            }
            BatchStatement::Prepared { id } => {
                buf.put_u8(1);
                types::write_short_bytes(id, buf)?;
            }
        }
        Ok(())
    }
}

impl SerializableRequest for Batch<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(&self, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        buf.put_u8(self.batch_type as u8);

        types::write_short(self.statements.len().try_into()?, buf);

        let mut value_sets = self.values.iter();
        for statement in self.statements.iter() {
            statement.serialize(buf)?;
            match value_sets.next() {
                Some(values) => values.write_to_request(buf),
                None => SerializedValues::EMPTY.write_to_request(buf),
            }
        }

        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        if version == ProtocolVersion::V5 {
            buf.put_u32(flags);
        } else {
            buf.put_u8(flags as u8);
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
