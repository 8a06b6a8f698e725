#![forbid(unsafe_code)]
//! Byte-source layer: positioned reads against an image, virtual inputs
//! assembled from device ranges, and allocation-block addressing.
//!
//! Provides the `ByteSource` trait (pread-style bulk reads), file- and
//! memory-backed implementations, the `SegmentedSource` virtual input that
//! represents one discovered file as an ordered list of device byte ranges,
//! and the `BlockDevice` math that turns allocation block numbers into
//! device byte offsets.

use hfsmap_error::{HpsError, Result};
use hfsmap_types::BLOCK_ADDRESS_BIAS;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Random-access byte source with pread semantics.
///
/// `read_at` returns the number of bytes actually read; `0` signals end of
/// input. Implementations are position-free and safe to share between
/// in-flight decodes of different volumes.
pub trait ByteSource: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read up to `buf.len()` bytes from `offset` into `buf`, returning the
    /// count actually read.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Read exactly `buf.len()` bytes from `offset`.
    ///
    /// A short read becomes [`HpsError::ShortRead`] carrying the requested
    /// offset and the byte counts involved.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0_usize;
        while filled < buf.len() {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                return Err(HpsError::ShortRead {
                    offset,
                    needed: buf.len(),
                    actual: filled,
                });
            }
            filled += n;
        }
        Ok(())
    }
}

/// File-backed source using `pread`-style I/O.
///
/// Opened read-only; `std::os::unix::fs::FileExt` needs no shared seek
/// position.
#[derive(Debug)]
pub struct FileByteSource {
    file: File,
    len: u64,
}

impl FileByteSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl ByteSource for FileByteSource {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        Ok(self.file.read_at(buf, offset)?)
    }
}

/// Memory-backed source over an owned image buffer.
#[derive(Debug, Clone)]
pub struct MemoryByteSource {
    bytes: Vec<u8>,
}

impl MemoryByteSource {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl ByteSource for MemoryByteSource {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= self.bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.bytes.len() - offset);
        buf[..n].copy_from_slice(&self.bytes[offset..offset + n]);
        Ok(n)
    }
}

/// One contiguous byte range of an underlying source.
#[derive(Clone)]
pub struct SourceRange {
    pub source: Arc<dyn ByteSource>,
    pub offset: u64,
    pub len: u64,
}

impl std::fmt::Debug for SourceRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRange")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// A named virtual input assembled from ordered byte ranges of one or more
/// underlying sources.
///
/// Produced once per discovered catalog file (and optionally once more for
/// its resource fork). Implements [`ByteSource`] itself so the surrounding
/// engine can scan it recursively.
#[derive(Debug, Clone)]
pub struct SegmentedSource {
    name: String,
    ranges: Vec<SourceRange>,
    len: u64,
}

impl SegmentedSource {
    #[must_use]
    pub fn new(name: impl Into<String>, ranges: Vec<SourceRange>) -> Self {
        let len = ranges.iter().map(|r| r.len).sum();
        Self {
            name: name.into(),
            ranges,
            len,
        }
    }

    /// Full `/`-joined catalog path of the file this input represents.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ranges(&self) -> &[SourceRange] {
        &self.ranges
    }
}

impl ByteSource for SegmentedSource {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.len || buf.is_empty() {
            return Ok(0);
        }

        let mut filled = 0_usize;
        let mut range_start = 0_u64;
        for range in &self.ranges {
            let range_end = range_start + range.len;
            let logical = offset + filled as u64;
            if logical >= self.len || filled == buf.len() {
                break;
            }
            if logical < range_end {
                let within = logical - range_start;
                let avail = usize::try_from(range.len - within).unwrap_or(usize::MAX);
                let n = avail.min(buf.len() - filled);
                range
                    .source
                    .read_exact_at(range.offset + within, &mut buf[filled..filled + n])?;
                filled += n;
            }
            range_start = range_end;
        }
        Ok(filled)
    }
}

/// Allocation-block addressing for one volume.
///
/// Pure math over the volume's block size; block-relative addressing is
/// anchored `0xa00` bytes into the first physical block, so
/// `offset(block) = max((block + 1) * block_size - 0xa00, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDevice {
    block_size: u32,
}

impl BlockDevice {
    #[must_use]
    pub fn new(block_size: u32) -> Self {
        Self { block_size }
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Allocation block containing the given device byte offset.
    #[must_use]
    pub fn block(&self, offset: u64) -> u64 {
        offset / u64::from(self.block_size)
    }

    /// Device byte offset of the start of an allocation block.
    #[must_use]
    pub fn offset(&self, block: u32) -> u64 {
        ((u64::from(block) + 1) * u64::from(self.block_size)).saturating_sub(BLOCK_ADDRESS_BIAS)
    }

    /// Byte length of a run of allocation blocks.
    #[must_use]
    pub fn size(&self, block_count: u32) -> u64 {
        u64::from(block_count) * u64::from(self.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn block_offset_is_monotone() {
        let dev = BlockDevice::new(4096);
        let mut prev = dev.offset(0);
        for block in 1..64 {
            let cur = dev.offset(block);
            assert!(cur >= prev);
            prev = cur;
        }
    }

    #[test]
    fn block_offset_origin_depends_on_block_size() {
        // Block sizes at or below the address bias clamp block 0 to the
        // image origin.
        for bs in [512_u32, 1024, 2048, 2560] {
            assert_eq!(BlockDevice::new(bs).offset(0), 0, "bs={bs}");
        }
        // Larger block sizes leave a partial first block before block 0.
        assert_eq!(BlockDevice::new(4096).offset(0), 4096 - 0xa00);
        assert_eq!(BlockDevice::new(8192).offset(0), 8192 - 0xa00);
    }

    #[test]
    fn block_offset_round_trips_above_bias() {
        let dev = BlockDevice::new(4096);
        for block in 1..128_u32 {
            assert_eq!(dev.block(dev.offset(block)), u64::from(block));
        }
    }

    #[test]
    fn block_run_size() {
        let dev = BlockDevice::new(4096);
        assert_eq!(dev.size(0), 0);
        assert_eq!(dev.size(3), 3 * 4096);
    }

    #[test]
    fn memory_source_reads_and_clamps() {
        let src = MemoryByteSource::new((0_u8..16).collect());
        let mut buf = [0_u8; 4];
        assert_eq!(src.read_at(4, &mut buf).expect("read"), 4);
        assert_eq!(buf, [4, 5, 6, 7]);
        assert_eq!(src.read_at(14, &mut buf).expect("tail"), 2);
        assert_eq!(src.read_at(16, &mut buf).expect("eof"), 0);
    }

    #[test]
    fn read_exact_at_flags_short_reads() {
        let src = MemoryByteSource::new(vec![0_u8; 8]);
        let mut buf = [0_u8; 16];
        let err = src.read_exact_at(4, &mut buf).expect_err("short");
        match err {
            HpsError::ShortRead {
                offset,
                needed,
                actual,
            } => {
                assert_eq!(offset, 4);
                assert_eq!(needed, 16);
                assert_eq!(actual, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn segmented_source_stitches_ranges() {
        let backing: Arc<dyn ByteSource> = Arc::new(MemoryByteSource::new((0_u8..64).collect()));
        let input = SegmentedSource::new(
            "a/b",
            vec![
                SourceRange {
                    source: Arc::clone(&backing),
                    offset: 10,
                    len: 4,
                },
                SourceRange {
                    source: Arc::clone(&backing),
                    offset: 40,
                    len: 3,
                },
            ],
        );
        assert_eq!(input.name(), "a/b");
        assert_eq!(input.len_bytes(), 7);

        let mut buf = [0_u8; 7];
        input.read_exact_at(0, &mut buf).expect("stitched read");
        assert_eq!(buf, [10, 11, 12, 13, 40, 41, 42]);

        // A read starting inside the second range.
        let mut tail = [0_u8; 2];
        input.read_exact_at(5, &mut tail).expect("tail read");
        assert_eq!(tail, [41, 42]);

        // Reads past the end return 0.
        assert_eq!(input.read_at(7, &mut tail).expect("eof"), 0);
    }

    #[test]
    fn file_source_round_trips() {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        tmp.write_all(&[7_u8; 32]).expect("write");
        tmp.flush().expect("flush");

        let src = FileByteSource::open(tmp.path()).expect("open");
        assert_eq!(src.len_bytes(), 32);
        let mut buf = [0_u8; 8];
        src.read_exact_at(8, &mut buf).expect("read");
        assert_eq!(buf, [7_u8; 8]);
        assert_eq!(src.read_at(32, &mut buf).expect("eof"), 0);
    }
}
