//! Android sparse image decoding.
//!
//! Sparse images compress long runs of identical or absent blocks; loaders
//! expect the expanded byte stream on the wire. `SparseReader` expands
//! lazily in a single forward pass so multi-gigabyte `super` images never
//! need to be materialized in memory.

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use tracing::trace;

pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;

pub const CHUNK_TYPE_RAW: u16 = 0xCAC1;
pub const CHUNK_TYPE_FILL: u16 = 0xCAC2;
pub const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;
pub const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

pub const FILE_HEADER_LEN: usize = 28;
pub const CHUNK_HEADER_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum SparseError {
    #[error("Not a sparse image: magic {found:#010X}")]
    InvalidMagic { found: u32 },

    #[error("Truncated sparse header: got {got} bytes, need {need}")]
    TruncatedHeader { got: usize, need: usize },

    #[error("Unsupported chunk type {chunk_type:#06X} at chunk {index}")]
    UnsupportedChunkType { chunk_type: u16, index: u32 },

    #[error("Chunk {index} size mismatch: header says {declared} payload bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: u32,
        declared: u64,
        expected: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Fixed 28-byte sparse file header.
#[derive(Debug, Clone, Copy)]
pub struct SparseHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub file_header_size: u16,
    pub chunk_header_size: u16,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

impl SparseHeader {
    pub fn parse(data: &[u8]) -> Result<Self, SparseError> {
        if data.len() < FILE_HEADER_LEN {
            return Err(SparseError::TruncatedHeader {
                got: data.len(),
                need: FILE_HEADER_LEN,
            });
        }
        let magic = LittleEndian::read_u32(&data[0..4]);
        if magic != SPARSE_MAGIC {
            return Err(SparseError::InvalidMagic { found: magic });
        }
        Ok(Self {
            major_version: LittleEndian::read_u16(&data[4..6]),
            minor_version: LittleEndian::read_u16(&data[6..8]),
            file_header_size: LittleEndian::read_u16(&data[8..10]),
            chunk_header_size: LittleEndian::read_u16(&data[10..12]),
            block_size: LittleEndian::read_u32(&data[12..16]),
            total_blocks: LittleEndian::read_u32(&data[16..20]),
            total_chunks: LittleEndian::read_u32(&data[20..24]),
            image_checksum: LittleEndian::read_u32(&data[24..28]),
        })
    }

    /// Size of the image once expanded.
    pub fn expanded_size(&self) -> u64 {
        u64::from(self.total_blocks) * u64::from(self.block_size)
    }
}

/// Check the leading magic without consuming meaning from the buffer.
pub fn is_sparse(data: &[u8]) -> bool {
    data.len() >= 4 && LittleEndian::read_u32(&data[0..4]) == SPARSE_MAGIC
}

enum ChunkState {
    NeedHeader,
    /// RAW payload copied from the underlying reader.
    Raw { remaining: u64 },
    /// Four-byte pattern repeated; `consumed` keeps the pattern phase across
    /// read calls.
    Fill {
        pattern: [u8; 4],
        remaining: u64,
        consumed: u64,
    },
    /// Zero-filled without touching the underlying reader.
    Zeros { remaining: u64 },
    Done,
}

/// Expands a sparse image into its raw byte stream via `io::Read`.
///
/// `DONT_CARE` regions decode as zeros: the flashing path writes whole
/// partitions, so skipped blocks must still land as something deterministic
/// on the device. CRC32 chunks are consumed and dropped; verification is the
/// storage digest's job, not the decoder's.
pub struct SparseReader<R: Read> {
    inner: R,
    header: SparseHeader,
    chunks_seen: u32,
    state: ChunkState,
}

impl<R: Read> SparseReader<R> {
    pub fn new(mut inner: R) -> Result<Self, SparseError> {
        let mut raw = [0u8; FILE_HEADER_LEN];
        inner.read_exact(&mut raw).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                SparseError::TruncatedHeader {
                    got: 0,
                    need: FILE_HEADER_LEN,
                }
            } else {
                SparseError::Io(e)
            }
        })?;
        let header = SparseHeader::parse(&raw)?;
        // Tolerate extended headers from newer tools.
        let extra = usize::from(header.file_header_size).saturating_sub(FILE_HEADER_LEN);
        skip(&mut inner, extra as u64)?;
        trace!(
            block_size = header.block_size,
            total_blocks = header.total_blocks,
            total_chunks = header.total_chunks,
            "Opened sparse image"
        );
        Ok(Self {
            inner,
            header,
            chunks_seen: 0,
            state: ChunkState::NeedHeader,
        })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    /// Total bytes this reader will yield.
    pub fn expanded_size(&self) -> u64 {
        self.header.expanded_size()
    }

    fn next_chunk(&mut self) -> Result<(), SparseError> {
        if self.chunks_seen >= self.header.total_chunks {
            self.state = ChunkState::Done;
            return Ok(());
        }
        let index = self.chunks_seen;
        self.chunks_seen += 1;

        let mut raw = [0u8; CHUNK_HEADER_LEN];
        self.inner.read_exact(&mut raw)?;
        let extra = usize::from(self.header.chunk_header_size).saturating_sub(CHUNK_HEADER_LEN);
        skip(&mut self.inner, extra as u64)?;

        let chunk_type = LittleEndian::read_u16(&raw[0..2]);
        let chunk_blocks = LittleEndian::read_u32(&raw[4..8]);
        let total_size = LittleEndian::read_u32(&raw[8..12]);
        let payload = u64::from(total_size)
            .saturating_sub(u64::from(self.header.chunk_header_size));
        let expanded = u64::from(chunk_blocks) * u64::from(self.header.block_size);

        self.state = match chunk_type {
            CHUNK_TYPE_RAW => {
                if payload != expanded {
                    return Err(SparseError::ChunkSizeMismatch {
                        index,
                        declared: payload,
                        expected: expanded,
                    });
                }
                ChunkState::Raw { remaining: payload }
            }
            CHUNK_TYPE_FILL => {
                if payload != 4 {
                    return Err(SparseError::ChunkSizeMismatch {
                        index,
                        declared: payload,
                        expected: 4,
                    });
                }
                let mut pattern = [0u8; 4];
                self.inner.read_exact(&mut pattern)?;
                ChunkState::Fill {
                    pattern,
                    remaining: expanded,
                    consumed: 0,
                }
            }
            CHUNK_TYPE_DONT_CARE => ChunkState::Zeros {
                remaining: expanded,
            },
            CHUNK_TYPE_CRC32 => {
                skip(&mut self.inner, payload)?;
                ChunkState::NeedHeader
            }
            other => {
                return Err(SparseError::UnsupportedChunkType {
                    chunk_type: other,
                    index,
                });
            }
        };
        Ok(())
    }
}

impl<R: Read> Read for SparseReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match &mut self.state {
                ChunkState::Done => return Ok(0),
                ChunkState::NeedHeader => {
                    self.next_chunk().map_err(into_io)?;
                }
                ChunkState::Raw { remaining } => {
                    if *remaining == 0 {
                        self.state = ChunkState::NeedHeader;
                        continue;
                    }
                    let want = buf.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                    let n = self.inner.read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "sparse image truncated inside RAW chunk",
                        ));
                    }
                    *remaining -= n as u64;
                    return Ok(n);
                }
                ChunkState::Fill {
                    pattern,
                    remaining,
                    consumed,
                } => {
                    if *remaining == 0 {
                        self.state = ChunkState::NeedHeader;
                        continue;
                    }
                    let want = buf.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                    for (i, b) in buf[..want].iter_mut().enumerate() {
                        *b = pattern[((*consumed + i as u64) % 4) as usize];
                    }
                    *consumed += want as u64;
                    *remaining -= want as u64;
                    return Ok(want);
                }
                ChunkState::Zeros { remaining } => {
                    if *remaining == 0 {
                        self.state = ChunkState::NeedHeader;
                        continue;
                    }
                    let want = buf.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                    buf[..want].fill(0);
                    *remaining -= want as u64;
                    return Ok(want);
                }
            }
        }
    }
}

fn into_io(e: SparseError) -> io::Error {
    match e {
        SparseError::Io(io) => io,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

fn skip<R: Read>(reader: &mut R, mut n: u64) -> io::Result<()> {
    let mut scratch = [0u8; 64];
    while n > 0 {
        let want = scratch.len().min(usize::try_from(n).unwrap_or(usize::MAX));
        let got = reader.read(&mut scratch[..want])?;
        if got == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "sparse image truncated in header padding",
            ));
        }
        n -= got as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    const BLOCK: u32 = 16;

    fn file_header(total_blocks: u32, total_chunks: u32) -> Vec<u8> {
        let mut h = Vec::new();
        h.write_u32::<LittleEndian>(SPARSE_MAGIC).unwrap();
        h.write_u16::<LittleEndian>(1).unwrap();
        h.write_u16::<LittleEndian>(0).unwrap();
        h.write_u16::<LittleEndian>(FILE_HEADER_LEN as u16).unwrap();
        h.write_u16::<LittleEndian>(CHUNK_HEADER_LEN as u16).unwrap();
        h.write_u32::<LittleEndian>(BLOCK).unwrap();
        h.write_u32::<LittleEndian>(total_blocks).unwrap();
        h.write_u32::<LittleEndian>(total_chunks).unwrap();
        h.write_u32::<LittleEndian>(0).unwrap();
        h
    }

    fn chunk_header(chunk_type: u16, blocks: u32, payload: u32) -> Vec<u8> {
        let mut h = Vec::new();
        h.write_u16::<LittleEndian>(chunk_type).unwrap();
        h.write_u16::<LittleEndian>(0).unwrap();
        h.write_u32::<LittleEndian>(blocks).unwrap();
        h.write_u32::<LittleEndian>(CHUNK_HEADER_LEN as u32 + payload)
            .unwrap();
        h
    }

    /// RAW + FILL + DONT_CARE + CRC32 image expanding to a known byte stream.
    fn sample_image() -> (Vec<u8>, Vec<u8>) {
        // 1 RAW block + 2 FILL blocks + 1 DONT_CARE block = 4 blocks.
        let mut img = file_header(4, 4);
        let raw_data: Vec<u8> = (0..BLOCK as u8).collect();
        img.extend(chunk_header(CHUNK_TYPE_RAW, 1, BLOCK));
        img.extend(&raw_data);
        img.extend(chunk_header(CHUNK_TYPE_FILL, 2, 4));
        img.extend([0xDD, 0xCC, 0xBB, 0xAA]);
        img.extend(chunk_header(CHUNK_TYPE_DONT_CARE, 1, 0));
        img.extend(chunk_header(CHUNK_TYPE_CRC32, 0, 4));
        img.extend([0x12, 0x34, 0x56, 0x78]);

        let mut expected = raw_data;
        for _ in 0..(2 * BLOCK / 4) {
            expected.extend([0xDD, 0xCC, 0xBB, 0xAA]);
        }
        expected.extend(std::iter::repeat_n(0u8, BLOCK as usize));
        (img, expected)
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut img = file_header(1, 1);
        img[0] = 0;
        assert!(matches!(
            SparseHeader::parse(&img),
            Err(SparseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_is_sparse_detection() {
        let (img, expected) = sample_image();
        assert!(is_sparse(&img));
        assert!(!is_sparse(&expected));
        assert!(!is_sparse(&[0xED]));
    }

    #[test]
    fn test_expanded_size() {
        let (img, expected) = sample_image();
        let reader = SparseReader::new(Cursor::new(img)).unwrap();
        assert_eq!(reader.expanded_size(), expected.len() as u64);
    }

    #[test]
    fn test_expansion_matches_expected_stream() {
        let (img, expected) = sample_image();
        let mut reader = SparseReader::new(Cursor::new(img)).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_expansion_stable_across_read_sizes() {
        let (img, expected) = sample_image();
        for chunk in [1usize, 3, 7, 16, 64] {
            let mut reader = SparseReader::new(Cursor::new(img.clone())).unwrap();
            let mut out = Vec::new();
            let mut buf = vec![0u8; chunk];
            loop {
                let n = reader.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            assert_eq!(out, expected, "read size {chunk}");
        }
    }

    #[test]
    fn test_truncated_raw_chunk_errors() {
        let (img, _) = sample_image();
        // Cut the image inside the RAW payload.
        let mut reader =
            SparseReader::new(Cursor::new(img[..FILE_HEADER_LEN + CHUNK_HEADER_LEN + 4].to_vec()))
                .unwrap();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_unsupported_chunk_type_errors() {
        let mut img = file_header(1, 1);
        img.extend(chunk_header(0xBEEF, 1, 0));
        let mut reader = SparseReader::new(Cursor::new(img)).unwrap();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
