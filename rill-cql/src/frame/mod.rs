pub mod frame_errors;
pub mod request;
pub mod response;
pub mod segment;
pub mod server_event_type;
pub mod types;
pub mod value;
pub mod version;

use crate::frame::frame_errors::FrameError;
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::fmt::Display;
use std::{collections::HashMap, convert::TryFrom};

use request::{RequestOpcode, SerializableRequest};
use response::ResponseOpcode;
use version::ProtocolVersion;

/// Size of the envelope header: version, flags, stream id, opcode, body length.
pub const HEADER_SIZE: usize = 9;

// Envelope flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub const FLAG_WARNING: u8 = 0x08;
pub const FLAG_USE_BETA: u8 = 0x10;

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm. Not available in protocol v5,
    /// where compression moved to the outer framing layer.
    Snappy,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request serialized down to a complete envelope, with a hole for the
/// stream id which is assigned at dispatch time.
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, FrameError> {
        Self::make_with_custom_payload(req, version, compression, tracing, None)
    }

    pub fn make_with_custom_payload<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
        custom_payload: Option<&HashMap<String, Vec<u8>>>,
    ) -> Result<SerializedRequest, FrameError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        // STARTUP and OPTIONS may never be compressed: the peer has not yet
        // learned which algorithm was negotiated. In v5 the envelope is always
        // written plain; the outer segment layer compresses instead.
        let compressible = !matches!(
            R::OPCODE,
            RequestOpcode::Startup | RequestOpcode::Options
        ) && version != ProtocolVersion::V5;

        // The custom payload map is part of the body and compresses with it.
        let mut body = Vec::new();
        if let Some(payload) = custom_payload {
            flags |= FLAG_CUSTOM_PAYLOAD;
            types::write_bytes_map(payload, &mut body)
                .map_err(|_| FrameError::CustomPayloadTooLarge)?;
        }
        req.serialize(version, &mut body)?;

        match compression {
            Some(compression) if compressible && !body.is_empty() => {
                flags |= FLAG_COMPRESSION;
                compress_append(&body, compression, &mut data)?;
            }
            _ => data.extend_from_slice(&body),
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = version.as_request_byte();
        data[1] = flags;
        // Bytes 2..4 are left zeroed for the stream id.
        data[4] = R::OPCODE as u8;

        let req_size = (data.len() - HEADER_SIZE) as u32;
        data[5..9].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Parts of the envelope header which are not determined by the
/// request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: 0x04,
            flags: 0x00,
            stream: 0,
        }
    }
}

/// Reads one response envelope (header + body) from the reader.
///
/// Used directly for v3/v4 connections and during the pre-framing part of a
/// v5 handshake. Once a v5 connection switches to the outer framing,
/// [segment::read_response_frame_v5] applies this logic to the deframed bytes.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let mut buf = &raw_header[..];
    let (frame_params, opcode, length) = parse_response_header(&mut buf)?;

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF before the whole body arrived.
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

/// Splits a raw header into its parts, validating the direction bit and the
/// protocol version.
pub fn parse_response_header(
    buf: &mut &[u8],
) -> Result<(FrameParams, ResponseOpcode, usize), FrameError> {
    let version = buf.get_u8();
    if version & 0x80 != 0x80 {
        return Err(FrameError::FrameFromClient);
    }
    ProtocolVersion::try_from_byte(version & 0x7F)
        .ok_or(FrameError::VersionNotSupported(version & 0x7F))?;

    let flags = buf.get_u8();
    let stream = buf.get_i16();

    let frame_params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = ResponseOpcode::try_from(buf.get_u8())
        .map_err(|e| FrameError::UnknownOpcode(e.number))?;
    let length = buf.get_u32() as usize;

    Ok((frame_params, opcode, length))
}

/// Parses a complete envelope out of an already-deframed byte buffer
/// (the reassembly product of v5 segments).
pub fn parse_response_envelope(
    mut buf: &[u8],
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    if buf.len() < HEADER_SIZE {
        return Err(FrameError::ConnectionClosed(HEADER_SIZE - buf.len(), HEADER_SIZE));
    }
    let (params, opcode, length) = parse_response_header(&mut buf)?;
    if buf.len() < length {
        return Err(FrameError::ConnectionClosed(length - buf.len(), length));
    }
    Ok((params, opcode, Bytes::copy_from_slice(&buf[..length])))
}

pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf).map_err(frame_errors::ParseError::from)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf).map_err(frame_errors::ParseError::from)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf).map_err(frame_errors::ParseError::from)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|_| FrameError::FrameCompression)?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

fn decompress(mut comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameError::FrameDecompression);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            let uncomp_body = lz4_flex::decompress(comp_body, uncomp_len)?;
            Ok(uncomp_body)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameError::FrameDecompression),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discriminant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    pub enum_name: &'static str,
    pub primitive: T,
}

#[cfg(test)]
mod test {
    use super::request::options::Options;
    use super::request::query::{Query, QueryParameters};
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn lz4_round_trip() {
        let mut comp_body = Vec::new();
        let uncomp_body = "Hello, World!".repeat(100);
        let compression = Compression::Lz4;
        compress_append(uncomp_body.as_bytes(), compression, &mut comp_body).unwrap();
        assert!(comp_body.len() < uncomp_body.len());
        let result = decompress(&comp_body[..], compression).unwrap();
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[test]
    fn snappy_round_trip() {
        let mut comp_body = Vec::new();
        let uncomp_body = "wide column store".repeat(64);
        let compression = Compression::Snappy;
        compress_append(uncomp_body.as_bytes(), compression, &mut comp_body).unwrap();
        let result = decompress(&comp_body[..], compression).unwrap();
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[tokio::test]
    async fn envelope_round_trip() {
        for version in [
            ProtocolVersion::V3,
            ProtocolVersion::V4,
            ProtocolVersion::V5,
        ] {
            let query = Query {
                contents: Cow::Borrowed("SELECT key FROM system.local"),
                parameters: QueryParameters::default(),
            };
            let mut serialized = SerializedRequest::make(&query, version, None, false).unwrap();
            serialized.set_stream(517);
            let data = serialized.get_data();

            assert_eq!(data[0], version.as_request_byte());
            assert_eq!(i16::from_be_bytes([data[2], data[3]]), 517);
            assert_eq!(data[4], RequestOpcode::Query as u8);
            let body_len = u32::from_be_bytes(data[5..9].try_into().unwrap()) as usize;
            assert_eq!(body_len, data.len() - HEADER_SIZE);
        }
    }

    #[tokio::test]
    async fn response_envelope_is_parsed_back() {
        // Forge a server-side READY response and read it through the client path.
        let frame = [0x84u8, 0x00, 0x01, 0x2A, 0x02, 0, 0, 0, 0];
        let (params, opcode, body) = read_response_frame(&mut &frame[..]).await.unwrap();
        assert_eq!(params.version, 0x84);
        assert_eq!(params.stream, 0x012A);
        assert_eq!(opcode, ResponseOpcode::Ready);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn request_envelope_is_rejected_on_read() {
        let mut serialized =
            SerializedRequest::make(&Options {}, ProtocolVersion::V4, None, false).unwrap();
        serialized.set_stream(1);
        let err = read_response_frame(&mut serialized.get_data())
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::FrameFromClient));
    }

    #[test]
    fn startup_is_never_compressed() {
        use super::request::startup::Startup;
        let startup = Startup {
            options: [(Cow::Borrowed("CQL_VERSION"), Cow::Borrowed("3.0.0"))]
                .into_iter()
                .collect(),
        };
        let serialized = SerializedRequest::make(
            &startup,
            ProtocolVersion::V4,
            Some(Compression::Lz4),
            false,
        )
        .unwrap();
        assert_eq!(serialized.get_data()[1] & FLAG_COMPRESSION, 0);
    }

    #[test]
    fn v5_envelope_carries_no_compression_flag() {
        let query = Query {
            contents: Cow::Borrowed("SELECT peer FROM system.peers"),
            parameters: QueryParameters::default(),
        };
        let serialized = SerializedRequest::make(
            &query,
            ProtocolVersion::V5,
            Some(Compression::Lz4),
            false,
        )
        .unwrap();
        assert_eq!(serialized.get_data()[1] & FLAG_COMPRESSION, 0);
    }
}
