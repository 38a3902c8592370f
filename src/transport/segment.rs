//! Topic segment format.
//!
//! Segments are immutable objects holding a run of consecutive records of
//! one partition.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (32 bytes)                │
//! │ - magic: "CDCS"                  │
//! │ - version: u8, flags: u8, pad: 2 │
//! │ - record_count: u32              │
//! │ - first_position: u64            │
//! │ - last_position: u64             │
//! │ - header_checksum: u32           │
//! ├──────────────────────────────────┤
//! │ Body: bincode(Vec<record>),      │
//! │ zstd-compressed if flag bit 0    │
//! ├──────────────────────────────────┤
//! │ Footer (16 bytes)                │
//! │ - data_checksum: u32 (raw body)  │
//! │ - body_len: u64                  │
//! │ - magic: "SCDC"                  │
//! └──────────────────────────────────┘
//! ```
//!
//! All integers are little-endian.

use crate::event::{Position, RawChangeRecord};

pub const SEGMENT_MAGIC: [u8; 4] = *b"CDCS";
pub const FOOTER_MAGIC: [u8; 4] = *b"SCDC";
pub const SEGMENT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 32;
const FOOTER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    #[cfg(feature = "compression")]
    Zstd { level: i32 },
}

impl Compression {
    /// Compression for the `compression` setting. Without the
    /// `compression` feature segments are always written uncompressed.
    pub fn from_setting(enabled: bool) -> Self {
        if !enabled {
            return Compression::None;
        }
        #[cfg(feature = "compression")]
        {
            Compression::Zstd { level: 3 }
        }
        #[cfg(not(feature = "compression"))]
        {
            tracing::warn!("Segment compression requested but the compression feature is off");
            Compression::None
        }
    }

    fn flag(&self) -> u8 {
        match self {
            Compression::None => 0,
            #[cfg(feature = "compression")]
            Compression::Zstd { .. } => 1,
        }
    }
}

#[derive(Debug)]
pub enum SegmentError {
    InvalidMagic,
    UnsupportedVersion(u8),
    /// Compressed segment read by a build without zstd support.
    UnsupportedCompression(u8),
    Truncated { len: usize },
    ChecksumMismatch { expected: u32, actual: u32 },
    Serialization(String),
    Io(std::io::Error),
    Empty,
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentError::InvalidMagic => write!(f, "invalid segment magic"),
            SegmentError::UnsupportedVersion(v) => write!(f, "unsupported segment version {}", v),
            SegmentError::UnsupportedCompression(c) => {
                write!(f, "unsupported segment compression flag {}", c)
            }
            SegmentError::Truncated { len } => write!(f, "segment truncated at {} bytes", len),
            SegmentError::ChecksumMismatch { expected, actual } => write!(
                f,
                "segment checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            ),
            SegmentError::Serialization(msg) => write!(f, "segment serialization error: {}", msg),
            SegmentError::Io(e) => write!(f, "segment I/O error: {}", e),
            SegmentError::Empty => write!(f, "segment has no records"),
        }
    }
}

impl std::error::Error for SegmentError {}

impl From<std::io::Error> for SegmentError {
    fn from(e: std::io::Error) -> Self {
        SegmentError::Io(e)
    }
}

impl From<bincode::Error> for SegmentError {
    fn from(e: bincode::Error) -> Self {
        SegmentError::Serialization(e.to_string())
    }
}

/// Fixed header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version: u8,
    pub flags: u8,
    pub record_count: u32,
    pub first_position: Position,
    pub last_position: Position,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4] = self.version;
        buf[5] = self.flags;
        buf[8..12].copy_from_slice(&self.record_count.to_le_bytes());
        buf[12..20].copy_from_slice(&self.first_position.0.to_le_bytes());
        buf[20..28].copy_from_slice(&self.last_position.0.to_le_bytes());
        let checksum = crc32fast::hash(&buf[0..28]);
        buf[28..32].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, SegmentError> {
        if buf.len() < HEADER_SIZE {
            return Err(SegmentError::Truncated { len: buf.len() });
        }
        if buf[0..4] != SEGMENT_MAGIC {
            return Err(SegmentError::InvalidMagic);
        }
        let expected = read_u32(&buf[28..32]);
        let actual = crc32fast::hash(&buf[0..28]);
        if expected != actual {
            return Err(SegmentError::ChecksumMismatch { expected, actual });
        }
        let version = buf[4];
        if version != SEGMENT_VERSION {
            return Err(SegmentError::UnsupportedVersion(version));
        }
        Ok(SegmentHeader {
            version,
            flags: buf[5],
            record_count: read_u32(&buf[8..12]),
            first_position: Position(read_u64(&buf[12..20])),
            last_position: Position(read_u64(&buf[20..28])),
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Encode `records`, which must be non-empty and in position order.
pub fn encode_segment(
    records: &[RawChangeRecord],
    compression: Compression,
) -> Result<Vec<u8>, SegmentError> {
    let (Some(first), Some(last)) = (records.first(), records.last()) else {
        return Err(SegmentError::Empty);
    };
    debug_assert!(
        records.windows(2).all(|w| w[0].position < w[1].position),
        "segment records must be strictly ordered"
    );

    let raw = bincode::serialize(records)?;
    let data_checksum = crc32fast::hash(&raw);
    let body = match compression {
        Compression::None => raw,
        #[cfg(feature = "compression")]
        Compression::Zstd { level } => zstd::encode_all(raw.as_slice(), level)?,
    };

    let header = SegmentHeader {
        version: SEGMENT_VERSION,
        flags: compression.flag(),
        record_count: records.len() as u32,
        first_position: first.position,
        last_position: last.position,
    };

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len() + FOOTER_SIZE);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&body);
    out.extend_from_slice(&data_checksum.to_le_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&FOOTER_MAGIC);
    Ok(out)
}

/// Decode and verify a segment.
pub fn decode_segment(data: &[u8]) -> Result<(SegmentHeader, Vec<RawChangeRecord>), SegmentError> {
    let header = SegmentHeader::decode(data)?;
    if data.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(SegmentError::Truncated { len: data.len() });
    }
    let footer = &data[data.len() - FOOTER_SIZE..];
    if footer[12..16] != FOOTER_MAGIC {
        return Err(SegmentError::InvalidMagic);
    }
    let expected = read_u32(&footer[0..4]);
    let body_len = read_u64(&footer[4..12]) as usize;
    if HEADER_SIZE + body_len + FOOTER_SIZE != data.len() {
        return Err(SegmentError::Truncated { len: data.len() });
    }
    let body = &data[HEADER_SIZE..HEADER_SIZE + body_len];

    let raw = match header.flags {
        0 => body.to_vec(),
        #[cfg(feature = "compression")]
        1 => zstd::decode_all(body)?,
        other => return Err(SegmentError::UnsupportedCompression(other)),
    };
    let actual = crc32fast::hash(&raw);
    if actual != expected {
        return Err(SegmentError::ChecksumMismatch { expected, actual });
    }

    let records: Vec<RawChangeRecord> = bincode::deserialize(&raw)?;
    if records.len() != header.record_count as usize {
        return Err(SegmentError::Serialization(format!(
            "header says {} records, body holds {}",
            header.record_count,
            records.len()
        )));
    }
    Ok((header, records))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(range: std::ops::RangeInclusive<u64>) -> Vec<RawChangeRecord> {
        range
            .map(|p| RawChangeRecord::new(Position(p), p * 10, format!("payload-{}", p).into_bytes()))
            .collect()
    }

    #[test]
    fn test_segment_roundtrip() {
        let input = records(3..=9);
        let data = encode_segment(&input, Compression::None).unwrap();
        let (header, output) = decode_segment(&data).unwrap();
        assert_eq!(output, input);
        assert_eq!(header.record_count, 7);
        assert_eq!(header.first_position, Position(3));
        assert_eq!(header.last_position, Position(9));
    }

    #[test]
    fn test_empty_segment_rejected() {
        assert!(matches!(
            encode_segment(&[], Compression::None),
            Err(SegmentError::Empty)
        ));
    }

    #[test]
    fn test_corruption_detected() {
        let data = encode_segment(&records(1..=4), Compression::None).unwrap();

        let mut body_flip = data.clone();
        body_flip[HEADER_SIZE + 3] ^= 0xff;
        assert!(matches!(
            decode_segment(&body_flip),
            Err(SegmentError::ChecksumMismatch { .. }) | Err(SegmentError::Serialization(_))
        ));

        let mut header_flip = data.clone();
        header_flip[14] ^= 0x01;
        assert!(matches!(
            decode_segment(&header_flip),
            Err(SegmentError::ChecksumMismatch { .. })
        ));

        assert!(matches!(
            decode_segment(&data[..data.len() - 5]),
            Err(SegmentError::InvalidMagic) | Err(SegmentError::Truncated { .. })
        ));
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_compressed_roundtrip() {
        let input = records(1..=50);
        let data = encode_segment(&input, Compression::Zstd { level: 3 }).unwrap();
        let (header, output) = decode_segment(&data).unwrap();
        assert_eq!(header.flags, 1);
        assert_eq!(output, input);
    }
}
