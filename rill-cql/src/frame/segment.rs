//! The protocol v5 outer framing.
//!
//! Once a v5 connection finishes its STARTUP negotiation, every envelope is
//! carried inside one or more segments. A segment consists of:
//!
//! * header data: a little-endian integer of 3 bytes (plain) or 5 bytes
//!   (compressed), packing the payload length (17 bits), the uncompressed
//!   length (17 bits, compressed mode only) and the self-contained flag,
//! * a CRC24 of the header data, serialized as 3 little-endian bytes,
//! * up to 131,071 payload bytes,
//! * a CRC32 of the payload, serialized as 4 little-endian bytes.
//!
//! Envelopes larger than the payload limit are split across consecutive
//! non-self-contained segments; the receiver concatenates payloads until it
//! sees a self-contained segment or one shorter than the limit.
//!
//! Compression at this layer is LZ4 without the length prefix used by the
//! v3/v4 body mode; the uncompressed length travels in the segment header
//! instead. A segment that does not shrink under compression is sent raw
//! with the uncompressed-length field set to zero.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::frame_errors::FrameError;
use super::response::ResponseOpcode;
use super::{parse_response_envelope, Compression, FrameParams};

/// Maximum number of payload bytes in a single segment.
pub const MAX_PAYLOAD_SIZE: usize = 131_071;

const UNCOMPRESSED_HEADER_SIZE: usize = 6;
const COMPRESSED_HEADER_SIZE: usize = 8;
const CRC24_SIZE: usize = 3;
const CRC32_SIZE: usize = 4;

const CRC24_POLY: u32 = 0x1974F0B;
const CRC24_INIT: u32 = 0x875060;

// The protocol prepends these bytes to every payload checksum so that
// zero-length payloads do not checksum to zero.
const CRC32_INITIAL_BYTES: [u8; 4] = [0xFA, 0x2D, 0x55, 0xCA];

fn crc24(data: &[u8]) -> u32 {
    let mut crc = CRC24_INIT;
    for byte in data {
        crc ^= (*byte as u32) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x1000000 != 0 {
                crc ^= CRC24_POLY;
            }
        }
    }
    crc & 0xFFFFFF
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&CRC32_INITIAL_BYTES);
    hasher.update(data);
    hasher.finalize()
}

fn push_segment(
    out: &mut Vec<u8>,
    payload: &[u8],
    uncompressed_len: Option<usize>,
    self_contained: bool,
    compressed_mode: bool,
) {
    let mut header_data = payload.len() as u64;
    let mut flag_shift = 17;
    if compressed_mode {
        header_data |= (uncompressed_len.unwrap_or(0) as u64) << 17;
        flag_shift = 34;
    }
    if self_contained {
        header_data |= 1 << flag_shift;
    }

    let header_size = if compressed_mode {
        COMPRESSED_HEADER_SIZE
    } else {
        UNCOMPRESSED_HEADER_SIZE
    };
    let header_data_bytes = &header_data.to_le_bytes()[..header_size - CRC24_SIZE];
    out.extend_from_slice(header_data_bytes);
    out.extend_from_slice(&crc24(header_data_bytes).to_le_bytes()[..CRC24_SIZE]);

    out.extend_from_slice(payload);
    out.extend_from_slice(&crc32(payload).to_le_bytes());
}

/// Splits `inner` (one complete envelope) into segments, returning the bytes
/// to put on the wire.
pub fn encode_segments(
    inner: &[u8],
    compression: Option<Compression>,
) -> Result<Vec<u8>, FrameError> {
    let compressed_mode = match compression {
        None => false,
        Some(Compression::Lz4) => true,
        // Snappy never made it into the outer framing; negotiation rejects it
        // for v5 connections before we get here.
        Some(Compression::Snappy) => return Err(FrameError::FrameCompression),
    };

    let self_contained = inner.len() <= MAX_PAYLOAD_SIZE;
    let mut out = Vec::new();

    let mut chunks_written = 0;
    for chunk in inner.chunks(MAX_PAYLOAD_SIZE) {
        chunks_written += 1;
        if compressed_mode {
            let compressed = lz4_flex::compress(chunk);
            if compressed.len() < chunk.len() {
                push_segment(&mut out, &compressed, Some(chunk.len()), self_contained, true);
            } else {
                // Compression did not help; send raw and mark it by zeroing
                // the uncompressed-length field.
                push_segment(&mut out, chunk, Some(0), self_contained, true);
            }
        } else {
            push_segment(&mut out, chunk, None, self_contained, false);
        }
    }

    // An empty inner frame still produces one (empty, self-contained) segment.
    if chunks_written == 0 {
        if compressed_mode {
            push_segment(&mut out, &[], Some(0), true, true);
        } else {
            push_segment(&mut out, &[], None, true, false);
        }
    }

    Ok(out)
}

struct Segment {
    payload: Vec<u8>,
    self_contained: bool,
}

async fn read_segment(
    reader: &mut (impl AsyncRead + Unpin),
    compressed_mode: bool,
) -> Result<Segment, FrameError> {
    let header_size = if compressed_mode {
        COMPRESSED_HEADER_SIZE
    } else {
        UNCOMPRESSED_HEADER_SIZE
    };

    let mut header = [0u8; COMPRESSED_HEADER_SIZE];
    reader.read_exact(&mut header[..header_size]).await?;

    let (header_data_bytes, crc_bytes) = header[..header_size].split_at(header_size - CRC24_SIZE);
    let read_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], 0]);
    let computed_crc = crc24(header_data_bytes);
    if read_crc != computed_crc {
        return Err(FrameError::CrcHeaderMismatch {
            computed: computed_crc,
            read: read_crc,
        });
    }

    let mut header_data = [0u8; 8];
    header_data[..header_data_bytes.len()].copy_from_slice(header_data_bytes);
    let header_data = u64::from_le_bytes(header_data);

    let payload_len = (header_data & 0x1FFFF) as usize;
    let (uncompressed_len, self_contained) = if compressed_mode {
        (
            ((header_data >> 17) & 0x1FFFF) as usize,
            header_data & (1 << 34) != 0,
        )
    } else {
        (0, header_data & (1 << 17) != 0)
    };

    let mut payload_and_crc = vec![0u8; payload_len + CRC32_SIZE];
    reader.read_exact(&mut payload_and_crc).await?;
    let (payload, crc_bytes) = payload_and_crc.split_at(payload_len);
    let read_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    let computed_crc = crc32(payload);
    if read_crc != computed_crc {
        return Err(FrameError::CrcPayloadMismatch {
            computed: computed_crc,
            read: read_crc,
        });
    }

    let payload = if compressed_mode && uncompressed_len > 0 {
        if uncompressed_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::SegmentTooLarge(uncompressed_len));
        }
        lz4_flex::decompress(payload, uncompressed_len)?
    } else {
        payload.to_vec()
    };

    Ok(Segment {
        payload,
        self_contained,
    })
}

/// Reads segments until a complete inner frame is accumulated and returns its
/// bytes.
pub async fn read_segments(
    reader: &mut (impl AsyncRead + Unpin),
    compression: Option<Compression>,
) -> Result<Vec<u8>, FrameError> {
    let compressed_mode = match compression {
        None => false,
        Some(Compression::Lz4) => true,
        Some(Compression::Snappy) => return Err(FrameError::FrameDecompression),
    };

    let mut inner = Vec::new();
    loop {
        let segment = read_segment(reader, compressed_mode).await?;
        let segment_len = segment.payload.len();
        inner.extend_from_slice(&segment.payload);

        // A short segment terminates the sequence just like the
        // self-contained flag does.
        if segment.self_contained || segment_len < MAX_PAYLOAD_SIZE {
            return Ok(inner);
        }
    }
}

/// Reads one response envelope carried by v5 segments.
pub async fn read_response_frame_v5(
    reader: &mut (impl AsyncRead + Unpin),
    compression: Option<Compression>,
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let inner = read_segments(reader, compression).await?;
    parse_response_envelope(&inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn sample_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn round_trip(len: usize, compression: Option<Compression>) {
        let inner = sample_bytes(len);
        let framed = encode_segments(&inner, compression).unwrap();
        let read = read_segments(&mut &framed[..], compression).await.unwrap();
        assert_eq!(read, inner, "length {len} did not survive framing");
    }

    #[tokio::test]
    async fn segmentation_round_trip() {
        for len in [0, 1, 131_070, 131_071, 131_072, 500_000] {
            round_trip(len, None).await;
            round_trip(len, Some(Compression::Lz4)).await;
        }
    }

    #[tokio::test]
    async fn short_segment_terminates_sequence() {
        // 131_072 bytes produce a full segment and a 1-byte trailer; both are
        // marked non-self-contained, so termination relies on the short
        // segment rule.
        let inner = sample_bytes(131_072);
        let framed = encode_segments(&inner, None).unwrap();
        // Header data of the first segment: max payload length, flag unset.
        let header_data = u32::from_le_bytes([framed[0], framed[1], framed[2], 0]);
        assert_eq!(header_data & 0x1FFFF, MAX_PAYLOAD_SIZE as u32);
        assert_eq!(header_data & (1 << 17), 0);

        let read = read_segments(&mut &framed[..], None).await.unwrap();
        assert_eq!(read, inner);
    }

    #[tokio::test]
    async fn small_frame_is_self_contained() {
        let framed = encode_segments(&sample_bytes(100), None).unwrap();
        let header_data = u32::from_le_bytes([framed[0], framed[1], framed[2], 0]);
        assert_eq!(header_data & 0x1FFFF, 100);
        assert_ne!(header_data & (1 << 17), 0);
    }

    #[tokio::test]
    async fn incompressible_payload_is_sent_raw() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let inner: Vec<u8> = (0..64).map(|_| rng.random()).collect();
        let framed = encode_segments(&inner, Some(Compression::Lz4)).unwrap();

        // Random bytes do not compress; the uncompressed-length field must be
        // zero and the payload must appear verbatim.
        let mut header_data = [0u8; 8];
        header_data[..5].copy_from_slice(&framed[..5]);
        let header_data = u64::from_le_bytes(header_data);
        assert_eq!((header_data >> 17) & 0x1FFFF, 0);
        assert_eq!(&framed[COMPRESSED_HEADER_SIZE..COMPRESSED_HEADER_SIZE + 64], &inner[..]);

        let read = read_segments(&mut &framed[..], Some(Compression::Lz4))
            .await
            .unwrap();
        assert_eq!(read, inner);
    }

    #[tokio::test]
    async fn bit_flips_are_detected() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);

        for len in [1usize, 100, 131_071] {
            let inner = sample_bytes(len);
            let framed = encode_segments(&inner, None).unwrap();

            for _ in 0..100 {
                let mut corrupted = framed.clone();
                let byte_idx = rng.random_range(0..corrupted.len());
                let bit_idx = rng.random_range(0..8);
                corrupted[byte_idx] ^= 1 << bit_idx;

                let err = read_segments(&mut &corrupted[..], None)
                    .await
                    .expect_err("corruption went unnoticed");
                if byte_idx < UNCOMPRESSED_HEADER_SIZE {
                    assert!(
                        matches!(err, FrameError::CrcHeaderMismatch { .. }),
                        "flip at {byte_idx} gave {err:?}"
                    );
                } else {
                    assert!(
                        matches!(err, FrameError::CrcPayloadMismatch { .. }),
                        "flip at {byte_idx} gave {err:?}"
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn bit_flips_in_multi_segment_frames_are_detected() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0xC0FFEE);
        let inner = sample_bytes(500_000);
        let framed = encode_segments(&inner, None).unwrap();

        for _ in 0..100 {
            let mut corrupted = framed.clone();
            let byte_idx = rng.random_range(0..corrupted.len());
            corrupted[byte_idx] ^= 1 << rng.random_range(0..8);

            let err = read_segments(&mut &corrupted[..], None)
                .await
                .expect_err("corruption went unnoticed");
            assert!(matches!(
                err,
                FrameError::CrcHeaderMismatch { .. } | FrameError::CrcPayloadMismatch { .. }
            ));
        }
    }

    #[test]
    fn crc24_matches_reference_vector() {
        // Computed with the polynomial and init value from the protocol
        // specification; guards against accidental bit-order changes.
        assert_eq!(crc24(&[0, 0, 0]), 0x7DE777);
        assert_eq!(crc24(&[1, 0, 0]), 0x15876F);
        // Header data for a self-contained segment of 100 payload bytes.
        assert_eq!(crc24(&[100, 0, 2]), 0x91A5F4);
        assert_ne!(crc24(&[0, 0, 1]), crc24(&[0, 1, 0]));
    }
}
