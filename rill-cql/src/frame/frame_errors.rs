use super::TryFromPrimitiveError;
use thiserror::Error;

/// An error that occurred while turning bytes into envelopes or back.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received a frame from version {0}, but only versions 3 through 5 are supported")]
    VersionNotSupported(u8),
    #[error("Unknown response opcode: {0:#04x}")]
    UnknownOpcode(u8),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
    #[error("Frame decompression failed.")]
    FrameDecompression,
    #[error("Frame compression failed.")]
    FrameCompression,
    #[error("Custom payload map too large to serialize")]
    CustomPayloadTooLarge,
    #[error("Request body field exceeds its wire-format range: {0}")]
    BodySerialize(#[from] std::num::TryFromIntError),
    #[error("Segment header checksum mismatch: computed {computed:#08x}, read {read:#08x}")]
    CrcHeaderMismatch { computed: u32, read: u32 },
    #[error("Segment payload checksum mismatch: computed {computed:#010x}, read {read:#010x}")]
    CrcPayloadMismatch { computed: u32, read: u32 },
    #[error("Segment payload length {0} exceeds the protocol maximum")]
    SegmentTooLarge(usize),
    #[error(transparent)]
    StdIoError(#[from] std::io::Error),
    #[error("Error compressing lz4 data {0}")]
    Lz4CompressError(#[from] lz4_flex::block::CompressError),
    #[error("Error decompressing lz4 data {0}")]
    Lz4DecompressError(#[from] lz4_flex::block::DecompressError),
}

/// An error that occurred while parsing the body of a response.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error(transparent)]
    CqlErrorParseError(#[from] CqlErrorParseError),
    #[error(transparent)]
    CqlSupportedParseError(#[from] CqlSupportedParseError),
    #[error(transparent)]
    CqlAuthenticateParseError(#[from] CqlAuthenticateParseError),
    #[error(transparent)]
    CqlEventParseError(#[from] CqlEventParseError),
    #[error(transparent)]
    CqlResultParseError(#[from] CqlResultParseError),
    #[error("Low-level deserialization failed: {0}")]
    LowLevelDeserializationError(#[from] LowLevelDeserializationError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// An error type returned when deserialization of ERROR response fails.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CqlErrorParseError {
    #[error("Malformed error code: {0}")]
    ErrorCodeParseError(LowLevelDeserializationError),
    #[error("Malformed error reason: {0}")]
    ReasonParseError(LowLevelDeserializationError),
    #[error("Malformed {db_error} error field {field}: {err}")]
    MalformedErrorField {
        db_error: &'static str,
        field: &'static str,
        err: LowLevelDeserializationError,
    },
}

/// An error type returned when deserialization of SUPPORTED response fails.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CqlSupportedParseError {
    #[error("Malformed options map: {0}")]
    OptionsMapDeserialization(LowLevelDeserializationError),
}

/// An error type returned when deserialization of AUTHENTICATE,
/// AUTH_CHALLENGE or AUTH_SUCCESS response fails.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CqlAuthenticateParseError {
    #[error("Malformed authenticator name: {0}")]
    AuthNameParseError(LowLevelDeserializationError),
    #[error("Malformed authenticate message: {0}")]
    AuthMessageParseError(LowLevelDeserializationError),
}

/// An error type returned when deserialization of EVENT response fails.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CqlEventParseError {
    #[error("Malformed event type string: {0}")]
    EventTypeParseError(LowLevelDeserializationError),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Malformed type of cluster change: {0}")]
    TypeOfChangeParseError(LowLevelDeserializationError),
    #[error("Unknown type of cluster change: {0}")]
    UnknownTypeOfChange(String),
    #[error("Malformed node address in event: {0}")]
    NodeAddressParseError(LowLevelDeserializationError),
    #[error("Malformed schema change event: {0}")]
    SchemaChangeEventParseError(LowLevelDeserializationError),
    #[error("Unknown target of schema change: {0}")]
    UnknownTargetOfSchemaChange(String),
}

/// An error type returned when deserialization of RESULT response fails.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CqlResultParseError {
    #[error("Malformed RESULT response id: {0}")]
    ResultIdParseError(LowLevelDeserializationError),
    #[error("Unknown RESULT response id: {0}")]
    UnknownResultId(i32),
    #[error("'Set_keyspace' response deserialization failed: {0}")]
    SetKeyspaceParseError(LowLevelDeserializationError),
    #[error("'Prepared' response deserialization failed: {0}")]
    PreparedParseError(LowLevelDeserializationError),
    #[error("'Rows' response deserialization failed: {0}")]
    RowsParseError(LowLevelDeserializationError),
    #[error("Unknown column type id: {0:#06x}")]
    UnknownColumnType(u16),
    #[error("'Schema_change' response deserialization failed: {0}")]
    SchemaChangeParseError(#[from] CqlEventParseError),
}

/// A low-level deserialization error shared by all body parsers.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
    #[error("Expected {expected} bytes, but only {received} are available")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("UTF-8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
    #[error("Invalid inet address length: {0}")]
    InvalidInetLength(u8),
    #[error("UUID deserialization failed: {0}")]
    UuidDeserializationError(#[from] uuid::Error),
    #[error(transparent)]
    TryFromPrimitiveError(#[from] TryFromPrimitiveError<u16>),
}
