//! The 96-byte superblock at the start of every image

use deku::prelude::*;

use crate::compressor::Compressor;
use crate::error::SqfsError;

pub const NOT_SET: u64 = 0xffff_ffff_ffff_ffff;

/// Must be a power of two between 4 KiB and 1 MiB
pub const MIN_BLOCK_SIZE: u32 = 0x1000;
pub const MAX_BLOCK_SIZE: u32 = 0x10_0000;
pub const DEFAULT_BLOCK_SIZE: u32 = 0x2_0000;

#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct SuperBlock {
    #[deku(assert_eq = "0x73717368")]
    pub magic: u32,
    pub inode_count: u32,
    pub mod_time: u32,
    pub block_size: u32,
    pub frag_count: u32,
    pub compressor: Compressor,
    pub block_log: u16,
    pub flags: u16,
    pub id_count: u16,
    #[deku(assert_eq = "4")]
    pub version_major: u16,
    #[deku(assert_eq = "0")]
    pub version_minor: u16,
    pub root_inode: u64,
    pub bytes_used: u64,
    pub id_table: u64,
    pub xattr_table: u64,
    pub inode_table: u64,
    pub dir_table: u64,
    pub frag_table: u64,
    pub export_table: u64,
}

impl SuperBlock {
    pub const SIZE: usize = 96;

    pub fn new(
        block_size: u32,
        mod_time: u32,
        compressor: Compressor,
    ) -> Result<Self, SqfsError> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
            || !block_size.is_power_of_two()
        {
            return Err(SqfsError::ArgInvalid("block size"));
        }

        Ok(Self {
            magic: 0x73717368,
            inode_count: 0,
            mod_time,
            block_size,
            frag_count: 0,
            compressor,
            block_log: block_size.trailing_zeros() as u16,
            flags: Flags::NoXattrsInArchive as u16,
            id_count: 0,
            version_major: 4,
            version_minor: 0,
            root_inode: 0,
            bytes_used: 0,
            id_table: 0,
            xattr_table: NOT_SET,
            inode_table: 0,
            dir_table: 0,
            frag_table: NOT_SET,
            export_table: NOT_SET,
        })
    }

    pub(crate) fn set_flag(&mut self, flag: Flags) {
        self.flags |= flag as u16;
    }

    /// Size of the optional compressor option record including its metadata
    /// header, as implied by the flags
    pub fn compression_options_size(&self) -> Option<usize> {
        if self.compressor_options_are_present() {
            Some(self.compressor.options_size() + 2)
        } else {
            None
        }
    }

    pub fn fragments_are_present(&self) -> bool {
        self.frag_table != NOT_SET && self.frag_count != 0
    }

    pub fn no_fragments(&self) -> bool {
        self.flags & Flags::FragmentsAreNotUsed as u16 != 0
    }

    pub fn data_has_been_deduplicated(&self) -> bool {
        self.flags & Flags::DataHasBeenDeduplicated as u16 != 0
    }

    pub fn nfs_export_table_exists(&self) -> bool {
        self.flags & Flags::NfsExportTableExists as u16 != 0
    }

    pub fn no_xattrs_in_archive(&self) -> bool {
        self.flags & Flags::NoXattrsInArchive as u16 != 0
    }

    pub fn compressor_options_are_present(&self) -> bool {
        self.flags & Flags::CompressorOptionsArePresent as u16 != 0
    }
}

#[rustfmt::skip]
#[derive(Debug, Copy, Clone)]
pub enum Flags {
    InodesStoredUncompressed    = 0b0000_0000_0000_0001,
    DataBlockStoredUncompressed = 0b0000_0000_0000_0010,
    Unused                      = 0b0000_0000_0000_0100,
    FragmentsStoredUncompressed = 0b0000_0000_0000_1000,
    FragmentsAreNotUsed         = 0b0000_0000_0001_0000,
    FragmentsAreAlwaysGenerated = 0b0000_0000_0010_0000,
    DataHasBeenDeduplicated     = 0b0000_0000_0100_0000,
    NfsExportTableExists        = 0b0000_0000_1000_0000,
    XattrsAreStoredUncompressed = 0b0000_0001_0000_0000,
    NoXattrsInArchive           = 0b0000_0010_0000_0000,
    CompressorOptionsArePresent = 0b0000_0100_0000_0000,
}

#[cfg(test)]
mod tests {
    use deku::prelude::*;

    use super::*;

    #[test]
    fn test_superblock_size() {
        let sb = SuperBlock::new(DEFAULT_BLOCK_SIZE, 0, Compressor::Gzip).unwrap();
        let bytes = sb.to_bytes().unwrap();
        assert_eq!(bytes.len(), SuperBlock::SIZE);

        let (_, parsed) = SuperBlock::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(sb, parsed);
    }

    #[test]
    fn test_block_log() {
        let sb = SuperBlock::new(0x1000, 0, Compressor::Gzip).unwrap();
        assert_eq!(sb.block_log, 12);

        assert!(SuperBlock::new(0x1001, 0, Compressor::Gzip).is_err());
        assert!(SuperBlock::new(0x800, 0, Compressor::Gzip).is_err());
        assert!(SuperBlock::new(0x20_0000, 0, Compressor::Gzip).is_err());
    }
}
