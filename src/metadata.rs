//! Metadata block framing
//!
//! Inode records, directory records and the lookup tables are packed into
//! "metadata blocks": at most 8 KiB of payload behind a 2-byte little-endian
//! header. Bit 15 of the header marks an uncompressed payload, the low 15
//! bits carry the on-disk payload length.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use deku::bitvec::BitVec;
use deku::ctx::Endian;
use deku::prelude::*;
use tracing::{instrument, trace};

use crate::compressor::FilesystemCompressor;
use crate::error::SqfsError;

pub const METADATA_MAXSIZE: usize = 0x2000;

const METADATA_UNCOMPRESSED: u16 = 1 << 15;

/// Check is_compressed bit within raw `len`
pub fn is_compressed(len: u16) -> bool {
    len & METADATA_UNCOMPRESSED == 0
}

/// Get actual length of `data` following `len` from unedited `len`
pub fn len(len: u16) -> u16 {
    len & !(METADATA_UNCOMPRESSED)
}

pub fn set_if_uncompressed(len: u16) -> u16 {
    len | METADATA_UNCOMPRESSED
}

/// Reference to a byte position inside a metadata stream: the offset of the
/// containing block's header relative to the stream start, shifted left by
/// 16, or'ed with the offset into the uncompressed block payload
pub fn inode_ref(block_start: u32, offset: u16) -> u64 {
    (u64::from(block_start) << 16) | u64::from(offset)
}

pub fn ref_block_start(inode_ref: u64) -> u32 {
    (inode_ref >> 16) as u32
}

pub fn ref_offset(inode_ref: u64) -> u16 {
    (inode_ref & 0xffff) as u16
}

/// Buffers bytes and packs them into metadata blocks
///
/// Blocks are compressed (or kept raw when the codec cannot shrink them) as
/// soon as 8 KiB of payload accumulates, so [`Self::position`] is always
/// accurate at write time. Nothing hits the output file before
/// [`Self::finalize`].
pub(crate) struct MetadataWriter {
    compressor: FilesystemCompressor,
    /// Offset of the next metadata block, relative to the start of this stream
    pub(crate) metadata_start: u32,
    /// Bytes not yet part of a finished block
    pub(crate) uncompressed_bytes: VecDeque<u8>,
    /// Finished blocks as (is_compressed, payload)
    final_bytes: Vec<(bool, Vec<u8>)>,
}

impl MetadataWriter {
    pub fn new(compressor: FilesystemCompressor) -> Self {
        Self {
            compressor,
            metadata_start: 0,
            uncompressed_bytes: VecDeque::new(),
            final_bytes: vec![],
        }
    }

    /// Locator for the next byte written: (block start, offset in block)
    pub fn position(&self) -> (u32, u16) {
        (self.metadata_start, self.uncompressed_bytes.len() as u16)
    }

    #[instrument(skip_all)]
    fn add_block(&mut self) -> Result<(), SqfsError> {
        let uncompressed_len = self.uncompressed_bytes.len().min(METADATA_MAXSIZE);
        if uncompressed_len == 0 {
            return Ok(());
        }

        if self.uncompressed_bytes.as_slices().0.len() < uncompressed_len {
            self.uncompressed_bytes.make_contiguous();
        }
        let uncompressed = &self.uncompressed_bytes.as_slices().0[0..uncompressed_len];

        let (compressed, payload) = match self.compressor.compress(uncompressed)? {
            Some(cb) => (true, cb),
            None => (false, uncompressed.to_vec()),
        };
        self.uncompressed_bytes.drain(0..uncompressed_len);

        // header + payload move the next block start
        self.metadata_start += 2 + payload.len() as u32;
        trace!("new metadata start: {:#02x?}", self.metadata_start);
        self.final_bytes.push((compressed, payload));

        Ok(())
    }

    /// Flush the remaining partial block and write every block to `out`
    #[instrument(skip_all)]
    pub fn finalize<W: Write>(&mut self, out: &mut W) -> Result<(), SqfsError> {
        while !self.uncompressed_bytes.is_empty() {
            self.add_block()?;
        }

        for (compressed, payload) in &self.final_bytes {
            let header = if *compressed {
                payload.len() as u16
            } else {
                set_if_uncompressed(payload.len() as u16)
            };
            let mut bv = BitVec::new();
            header.write(&mut bv, Endian::Little)?;
            out.write_all(bv.as_raw_slice())?;
            out.write_all(payload)?;
        }

        Ok(())
    }
}

impl Write for MetadataWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.uncompressed_bytes.write_all(buf)?;

        while self.uncompressed_bytes.len() >= METADATA_MAXSIZE {
            self.add_block().map_err(io::Error::from)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read one metadata block at the reader's position, returning the
/// decompressed payload
#[instrument(skip_all)]
pub fn read_block<R: Read + ?Sized>(
    reader: &mut R,
    compressor: &FilesystemCompressor,
) -> Result<Vec<u8>, SqfsError> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    let header = u16::from_le_bytes(buf);

    let payload_len = len(header);
    if payload_len as usize > METADATA_MAXSIZE {
        return Err(SqfsError::CorruptedSquashfs);
    }
    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload)?;

    let bytes = if is_compressed(header) {
        let mut out = Vec::with_capacity(METADATA_MAXSIZE);
        compressor.decompress(&payload, &mut out)?;
        out
    } else {
        payload
    };

    if bytes.len() > METADATA_MAXSIZE {
        return Err(SqfsError::CorruptedSquashfs);
    }
    Ok(bytes)
}
