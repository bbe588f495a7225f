//! Pre-serialized statement values.
//!
//! The codec does not know how to turn Rust types into CQL values; that is
//! the job of a value serializer living above it. What it does accept is a
//! flat buffer of already-encoded `[value]` cells plus their count, which is
//! exactly what QUERY, EXECUTE and BATCH bodies embed.

use bytes::BufMut;

use super::types;

/// A contiguous buffer of encoded `[value]` cells, ready to be embedded in a
/// request body.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    element_count: u16,
}

impl SerializedValues {
    pub const EMPTY: &'static SerializedValues = &SerializedValues {
        serialized_values: Vec::new(),
        element_count: 0,
    };

    pub const fn new() -> Self {
        SerializedValues {
            serialized_values: Vec::new(),
            element_count: 0,
        }
    }

    /// Appends one already-encoded cell.
    pub fn add_bytes(&mut self, cell: &[u8]) -> Result<(), std::num::TryFromIntError> {
        types::write_bytes(cell, &mut self.serialized_values)?;
        self.element_count += 1;
        Ok(())
    }

    /// Appends a null cell.
    pub fn add_null(&mut self) {
        types::write_int(-1, &mut self.serialized_values);
        self.element_count += 1;
    }

    /// Appends an unset cell (protocol v4+).
    pub fn add_unset(&mut self) {
        types::write_int(-2, &mut self.serialized_values);
        self.element_count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn element_count(&self) -> u16 {
        self.element_count
    }

    pub fn buffer_size(&self) -> usize {
        self.serialized_values.len()
    }

    pub(crate) fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.element_count);
        buf.put_slice(&self.serialized_values);
    }
}
