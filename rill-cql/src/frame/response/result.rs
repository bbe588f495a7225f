//! RESULT response bodies.
//!
//! Row cells are surfaced as raw byte slices; interpreting them as typed CQL
//! values is the job of a deserializer living above this crate. Column types
//! are still parsed structurally, because their encoding is variable-length
//! and must be consumed to find where each column spec ends.

use crate::frame::frame_errors::{CqlResultParseError, LowLevelDeserializationError};
use crate::frame::request::query::PagingStateResponse;
use crate::frame::types;
use crate::frame::version::ProtocolVersion;
use bytes::Bytes;

use super::event::SchemaChangeEvent;

// Result metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;
const FLAG_METADATA_CHANGED: i32 = 0x0008;

#[derive(Debug)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug)]
pub struct Prepared {
    pub id: Bytes,
    /// Id of the result metadata; protocol v5 only.
    pub result_metadata_id: Option<Bytes>,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

/// Structural description of a column's CQL type.
///
/// Kept only as far as the wire format requires; values of these types are
/// not interpreted here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Timestamp,
    Uuid,
    Text,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    SmallInt,
    TinyInt,
    Duration,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        field_types: Vec<(String, ColumnType)>,
    },
    Tuple(Vec<ColumnType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Default)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub paging_state: Option<Bytes>,
    /// Fresh metadata id sent when a v5 server notices the client's cached
    /// result metadata went stale.
    pub new_metadata_id: Option<Bytes>,
    /// Empty when the NO_METADATA flag was set.
    pub col_specs: Vec<ColumnSpec>,
}

impl ResultMetadata {
    pub fn paging_state_response(&self) -> PagingStateResponse {
        PagingStateResponse::new_from_raw_bytes(self.paging_state.as_ref())
    }
}

#[derive(Debug, Copy, Clone)]
pub struct PartitionKeyIndex {
    /// Index in the serialized values.
    pub index: u16,
    /// Sequence number in the partition key.
    pub sequence: u16,
}

#[derive(Debug, Default)]
pub struct PreparedMetadata {
    pub flags: i32,
    pub col_count: usize,
    /// Sorted by `index`; reorderable into partition key order via `sequence`.
    pub pk_indexes: Vec<PartitionKeyIndex>,
    pub col_specs: Vec<ColumnSpec>,
}

/// One result row: raw, possibly-null cells in column order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<Option<Bytes>>,
}

#[derive(Debug)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows_count: usize,
    pub rows: Vec<Row>,
}

#[derive(Debug)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_table_spec(buf: &mut &[u8]) -> std::result::Result<TableSpec, LowLevelDeserializationError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_type(buf: &mut &[u8]) -> std::result::Result<ColumnType, CqlResultParseError> {
    use ColumnType::*;
    let id = types::read_short(buf).map_err(|err| {
        CqlResultParseError::RowsParseError(LowLevelDeserializationError::IoError(err))
    })?;
    Ok(match id {
        0x0000 => Custom(
            types::read_string(buf)
                .map_err(CqlResultParseError::RowsParseError)?
                .to_owned(),
        ),
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Text,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0015 => Duration,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        0x0030 => {
            let keyspace = types::read_string(buf)
                .map_err(CqlResultParseError::RowsParseError)?
                .to_owned();
            let type_name = types::read_string(buf)
                .map_err(CqlResultParseError::RowsParseError)?
                .to_owned();
            let fields_count = types::read_short(buf).map_err(|err| {
                CqlResultParseError::RowsParseError(LowLevelDeserializationError::IoError(err))
            })?;
            let mut field_types = Vec::with_capacity(fields_count as usize);
            for _ in 0..fields_count {
                let field_name = types::read_string(buf)
                    .map_err(CqlResultParseError::RowsParseError)?
                    .to_owned();
                let field_type = deser_type(buf)?;
                field_types.push((field_name, field_type));
            }
            UserDefinedType {
                keyspace,
                type_name,
                field_types,
            }
        }
        0x0031 => {
            let types_count = types::read_short(buf).map_err(|err| {
                CqlResultParseError::RowsParseError(LowLevelDeserializationError::IoError(err))
            })?;
            let mut inner_types = Vec::with_capacity(types_count as usize);
            for _ in 0..types_count {
                inner_types.push(deser_type(buf)?);
            }
            Tuple(inner_types)
        }
        id => return Err(CqlResultParseError::UnknownColumnType(id)),
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: Option<&TableSpec>,
    col_count: usize,
) -> std::result::Result<Vec<ColumnSpec>, CqlResultParseError> {
    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let table_spec = match global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf).map_err(CqlResultParseError::RowsParseError)?,
        };
        let name = types::read_string(buf)
            .map_err(CqlResultParseError::RowsParseError)?
            .to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> std::result::Result<ResultMetadata, CqlResultParseError> {
    let err = CqlResultParseError::RowsParseError;

    let flags = types::read_int(buf)
        .map_err(|e| err(LowLevelDeserializationError::IoError(e)))?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;
    let metadata_changed = flags & FLAG_METADATA_CHANGED != 0;

    let col_count = types::read_int_length(buf).map_err(err)?;

    let paging_state = if has_more_pages {
        Some(Bytes::copy_from_slice(
            types::read_bytes(buf).map_err(err)?,
        ))
    } else {
        None
    };

    let new_metadata_id = if version == ProtocolVersion::V5 && metadata_changed {
        Some(Bytes::copy_from_slice(
            types::read_short_bytes(buf).map_err(err)?,
        ))
    } else {
        None
    };

    let col_specs = if no_metadata {
        Vec::new()
    } else {
        let global_table_spec = global_tables_spec
            .then(|| deser_table_spec(buf))
            .transpose()
            .map_err(err)?;
        deser_col_specs(buf, global_table_spec.as_ref(), col_count)?
    };

    Ok(ResultMetadata {
        col_count,
        paging_state,
        new_metadata_id,
        col_specs,
    })
}

fn deser_prepared_metadata(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> std::result::Result<PreparedMetadata, CqlResultParseError> {
    let err = CqlResultParseError::PreparedParseError;

    let flags = types::read_int(buf)
        .map_err(|e| err(LowLevelDeserializationError::IoError(e)))?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;

    let col_count = types::read_int_length(buf).map_err(err)?;

    // Partition key indexes joined the prepared metadata in v4.
    let pk_indexes = if version >= ProtocolVersion::V4 {
        let pk_count = types::read_int_length(buf).map_err(err)?;
        let mut pk_indexes = Vec::with_capacity(pk_count);
        for sequence in 0..pk_count {
            pk_indexes.push(PartitionKeyIndex {
                index: types::read_short(buf)
                    .map_err(|e| err(LowLevelDeserializationError::IoError(e)))?,
                sequence: sequence as u16,
            });
        }
        pk_indexes.sort_unstable_by_key(|pki| pki.index);
        pk_indexes
    } else {
        Vec::new()
    };

    let global_table_spec = global_tables_spec
        .then(|| deser_table_spec(buf))
        .transpose()
        .map_err(err)?;
    let col_specs = deser_col_specs(buf, global_table_spec.as_ref(), col_count)?;

    Ok(PreparedMetadata {
        flags,
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn deser_rows(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> std::result::Result<Rows, CqlResultParseError> {
    let err = CqlResultParseError::RowsParseError;

    let metadata = deser_result_metadata(version, buf)?;
    let rows_count = types::read_int_length(buf).map_err(err)?;

    let mut rows = Vec::with_capacity(rows_count);
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for _ in 0..metadata.col_count {
            let cell = types::read_bytes_opt(buf)
                .map_err(err)?
                .map(Bytes::copy_from_slice);
            columns.push(cell);
        }
        rows.push(Row { columns });
    }

    Ok(Rows {
        metadata,
        rows_count,
        rows,
    })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> std::result::Result<SetKeyspace, CqlResultParseError> {
    let keyspace_name = types::read_string(buf)
        .map_err(CqlResultParseError::SetKeyspaceParseError)?
        .to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_prepared(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> std::result::Result<Prepared, CqlResultParseError> {
    let id = Bytes::copy_from_slice(
        types::read_short_bytes(buf).map_err(CqlResultParseError::PreparedParseError)?,
    );
    let result_metadata_id = if version == ProtocolVersion::V5 {
        Some(Bytes::copy_from_slice(
            types::read_short_bytes(buf).map_err(CqlResultParseError::PreparedParseError)?,
        ))
    } else {
        None
    };
    let prepared_metadata = deser_prepared_metadata(version, buf)?;
    let result_metadata = deser_result_metadata(version, buf)?;
    Ok(Prepared {
        id,
        result_metadata_id,
        prepared_metadata,
        result_metadata,
    })
}

pub fn deserialize(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> std::result::Result<Result, CqlResultParseError> {
    use self::Result::*;
    Ok(
        match types::read_int(buf)
            .map_err(|err| CqlResultParseError::ResultIdParseError(err.into()))?
        {
            0x0001 => Void,
            0x0002 => Rows(deser_rows(version, buf)?),
            0x0003 => SetKeyspace(deser_set_keyspace(buf)?),
            0x0004 => Prepared(deser_prepared(version, buf)?),
            0x0005 => SchemaChange(self::SchemaChange {
                event: SchemaChangeEvent::deserialize(buf)?,
            }),
            id => return Err(CqlResultParseError::UnknownResultId(id)),
        },
    )
}
