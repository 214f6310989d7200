//! Generic lookup table writer and reader
//!
//! The id, fragment and export tables are dense little-endian arrays. On
//! disk they are chopped into 8 KiB slices, each slice framed as a metadata
//! block, followed by a plain array of 64 bit absolute locations of those
//! blocks. The superblock stores the offset of the location array.

use std::io::{Read, Seek, SeekFrom, Write};

use deku::bitvec::BitVec;
use deku::ctx::Endian;
use deku::prelude::*;

use crate::compressor::FilesystemCompressor;
use crate::error::SqfsError;
use crate::metadata::{self, METADATA_MAXSIZE};

/// Write `table` (already serialized as its little-endian byte layout) and
/// return the offset of the location array, for the superblock
pub(crate) fn write_table<W: Write + Seek>(
    w: &mut W,
    table: &[u8],
    compressor: &FilesystemCompressor,
) -> Result<u64, SqfsError> {
    let mut locations = vec![];

    for chunk in table.chunks(METADATA_MAXSIZE) {
        locations.push(w.stream_position()?);

        let (header, payload) = match compressor.compress(chunk)? {
            Some(cb) => (cb.len() as u16, cb),
            None => (
                metadata::set_if_uncompressed(chunk.len() as u16),
                chunk.to_vec(),
            ),
        };

        let mut bv = BitVec::new();
        header.write(&mut bv, Endian::Little)?;
        w.write_all(bv.as_raw_slice())?;
        w.write_all(&payload)?;
    }

    let table_start = w.stream_position()?;
    for location in locations {
        let mut bv = BitVec::new();
        location.write(&mut bv, Endian::Little)?;
        w.write_all(bv.as_raw_slice())?;
    }

    Ok(table_start)
}

/// Read back a table of `count` records of `entry_size` bytes via its
/// location array at `table_start`
pub(crate) fn read_table<R: Read + Seek>(
    r: &mut R,
    compressor: &FilesystemCompressor,
    table_start: u64,
    entry_size: usize,
    count: usize,
) -> Result<Vec<u8>, SqfsError> {
    let byte_len = entry_size
        .checked_mul(count)
        .ok_or(SqfsError::CorruptedSquashfs)?;
    let block_count = (byte_len + METADATA_MAXSIZE - 1) / METADATA_MAXSIZE;

    r.seek(SeekFrom::Start(table_start))?;
    let mut locations = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf)?;
        locations.push(u64::from_le_bytes(buf));
    }

    let mut bytes = Vec::with_capacity(byte_len);
    for location in locations {
        r.seek(SeekFrom::Start(location))?;
        let block = metadata::read_block(r, compressor)?;
        bytes.extend_from_slice(&block);
    }

    if bytes.len() < byte_len {
        return Err(SqfsError::CorruptedSquashfs);
    }
    bytes.truncate(byte_len);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::compressor::Compressor;

    fn gzip_compressor() -> FilesystemCompressor {
        FilesystemCompressor::new(Compressor::Gzip, None, 0x20000).unwrap()
    }

    #[test]
    fn test_roundtrip_paginated() {
        // 3000 u32 records span two metadata blocks
        let mut table = vec![];
        for i in 0..3000u32 {
            table.extend_from_slice(&i.to_le_bytes());
        }

        let compressor = gzip_compressor();
        let mut image = Cursor::new(vec![]);
        let table_start = write_table(&mut image, &table, &compressor).unwrap();

        let read = read_table(&mut image, &compressor, table_start, 4, 3000).unwrap();
        assert_eq!(table, read);

        // two locators directly at table_start
        image.seek(SeekFrom::Start(table_start)).unwrap();
        let mut buf = [0u8; 8];
        image.read_exact(&mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0);
        image.read_exact(&mut buf).unwrap();
        assert!(u64::from_le_bytes(buf) > 0);
    }

    #[test]
    fn test_empty_table() {
        let compressor = gzip_compressor();
        let mut image = Cursor::new(vec![]);
        let table_start = write_table(&mut image, &[], &compressor).unwrap();
        assert_eq!(table_start, 0);

        let read = read_table(&mut image, &compressor, table_start, 4, 0).unwrap();
        assert!(read.is_empty());
    }
}
