//! Chunk container format
//!
//! Each chunk folder holds one container file:
//! - Magic bytes (8 bytes) - plain or zstd-compressed body
//! - CRC32 of the stored body (4 bytes, little endian)
//! - Body: segment count (u32 LE), then per segment
//!   length (u32 LE), signature (32 bytes), data
//!
//! Complete verification decodes the container, which checks both the CRC
//! and the SHA-256 of every segment against its recorded signature.

use bytes::Bytes;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::signature::Signature;

/// File name of the container inside a `CHUNK_<id>` folder
pub const CONTAINER_FILE_NAME: &str = "SFILE_CONTAINER_001";

/// Maximum decoded container size (64 MiB)
pub const CONTAINER_MAX_SIZE: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 12;
const SEGMENT_HEADER_LEN: usize = 4 + 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerType {
    Plain,
    Compressed,
}

impl ContainerType {
    pub fn magic(&self) -> [u8; 8] {
        match self {
            ContainerType::Plain => [0x53, 0x49, 0x44, 0x42, 0x43, 0x48, 0x4b, 0x50],
            ContainerType::Compressed => [0x53, 0x49, 0x44, 0x42, 0x43, 0x48, 0x4b, 0x5a],
        }
    }

    pub fn from_magic(magic: &[u8; 8]) -> Option<Self> {
        if *magic == Self::Plain.magic() {
            Some(ContainerType::Plain)
        } else if *magic == Self::Compressed.magic() {
            Some(ContainerType::Compressed)
        } else {
            None
        }
    }
}

/// One deduplicated segment stored in a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub signature: Signature,
    pub data: Bytes,
}

impl Segment {
    pub fn new(data: Bytes) -> Self {
        Self {
            signature: Signature::from_data(&data),
            data,
        }
    }
}

/// Decoded chunk container
#[derive(Debug, Clone)]
pub struct ChunkContainer {
    container_type: ContainerType,
    segments: Vec<Segment>,
}

impl ChunkContainer {
    pub fn new(segments: Vec<Segment>, compress: bool) -> Self {
        let container_type = if compress {
            ContainerType::Compressed
        } else {
            ContainerType::Plain
        };
        Self {
            container_type,
            segments,
        }
    }

    pub fn container_type(&self) -> ContainerType {
        self.container_type
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn signatures(&self) -> Vec<Signature> {
        self.segments.iter().map(|s| s.signature).collect()
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let size: usize = self
            .segments
            .iter()
            .map(|s| SEGMENT_HEADER_LEN + s.data.len())
            .sum::<usize>()
            + 4;
        if size > CONTAINER_MAX_SIZE {
            return Err(Error::ContainerTooLarge {
                size,
                max: CONTAINER_MAX_SIZE,
            });
        }

        let mut body = Vec::with_capacity(size);
        body.extend_from_slice(&(self.segments.len() as u32).to_le_bytes());
        for segment in &self.segments {
            body.extend_from_slice(&(segment.data.len() as u32).to_le_bytes());
            body.extend_from_slice(segment.signature.as_bytes());
            body.extend_from_slice(&segment.data);
        }
        Ok(body)
    }

    /// Serialize to on-disk format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = self.encode_body()?;
        let stored = match self.container_type {
            ContainerType::Plain => body,
            ContainerType::Compressed => zstd::stream::encode_all(body.as_slice(), 3)
                .map_err(|e| Error::Compression(e.to_string()))?,
        };

        let mut hasher = Hasher::new();
        hasher.update(&stored);
        let crc = hasher.finalize();

        let mut result = Vec::with_capacity(HEADER_LEN + stored.len());
        result.extend_from_slice(&self.container_type.magic());
        result.extend_from_slice(&crc.to_le_bytes());
        result.extend_from_slice(&stored);
        Ok(result)
    }

    /// Parse from on-disk format, verifying CRC and segment signatures
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::ContainerCorrupted("Container too short".into()));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[..8]);
        let container_type =
            ContainerType::from_magic(&magic).ok_or_else(|| Error::InvalidMagic {
                expected: ContainerType::Plain.magic(),
                got: magic,
            })?;

        let crc_expected = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let mut hasher = Hasher::new();
        hasher.update(&bytes[HEADER_LEN..]);
        let crc_actual = hasher.finalize();
        if crc_expected != crc_actual {
            return Err(Error::CrcMismatch {
                expected: crc_expected,
                got: crc_actual,
            });
        }

        let body = match container_type {
            ContainerType::Plain => bytes[HEADER_LEN..].to_vec(),
            ContainerType::Compressed => zstd::stream::decode_all(&bytes[HEADER_LEN..])
                .map_err(|e| Error::Decompression(e.to_string()))?,
        };

        let segments = parse_segments(&body)?;
        Ok(Self {
            container_type,
            segments,
        })
    }
}

fn parse_segments(body: &[u8]) -> Result<Vec<Segment>> {
    if body.len() < 4 {
        return Err(Error::ContainerCorrupted("Missing segment count".into()));
    }
    let count = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let mut segments = Vec::with_capacity(count.min(1024));
    let mut pos = 4;

    for index in 0..count {
        if body.len() < pos + SEGMENT_HEADER_LEN {
            return Err(Error::ContainerCorrupted(format!(
                "Segment {} header truncated",
                index
            )));
        }
        let len = u32::from_le_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]])
            as usize;
        let mut sig = [0u8; 32];
        sig.copy_from_slice(&body[pos + 4..pos + SEGMENT_HEADER_LEN]);
        pos += SEGMENT_HEADER_LEN;

        if body.len() < pos + len {
            return Err(Error::ContainerCorrupted(format!(
                "Segment {} data truncated",
                index
            )));
        }
        let data = Bytes::copy_from_slice(&body[pos..pos + len]);
        pos += len;

        let expected = Signature::from_bytes(sig);
        let actual = Signature::from_data(&data);
        if expected != actual {
            return Err(Error::SignatureMismatch {
                index,
                expected: expected.to_hex(),
                got: actual.to_hex(),
            });
        }
        segments.push(Segment {
            signature: expected,
            data,
        });
    }

    if pos != body.len() {
        return Err(Error::ContainerCorrupted("Trailing bytes after segments".into()));
    }
    Ok(segments)
}
