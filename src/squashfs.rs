//! Reading images back
//!
//! [`Squashfs::from_reader`] parses the superblock, the compressor option
//! record and the lookup tables, and slurps the inode and directory table
//! metadata streams. [`Squashfs::read_tree`] then walks the directory
//! records from the root inode down and rebuilds the tree;
//! [`Squashfs::read_file`] pulls file contents out of the data area.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use deku::bitvec::{BitVec, Msb0};
use deku::ctx::Endian;
use deku::prelude::*;
use tracing::{instrument, trace};

use crate::compressor::{CompressionOptions, FilesystemCompressor};
use crate::dir::Dir;
use crate::error::SqfsError;
use crate::fragment::{self, Fragment};
use crate::id::Id;
use crate::inode::{Inode, InodeInner, NO_FRAGMENT};
use crate::metadata;
use crate::superblock::{SuperBlock, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, NOT_SET};
use crate::table;

/// One fully loaded metadata stream (inode table or directory table)
struct MetaStream {
    bits: BitVec<u8, Msb0>,
    /// Length of the uncompressed stream in bytes
    len: usize,
    /// Block start offset (relative to the table start) to byte offset in
    /// the uncompressed stream
    block_map: HashMap<u32, usize>,
}

impl MetaStream {
    fn load<R: Read + Seek>(
        reader: &mut R,
        compressor: &FilesystemCompressor,
        start: u64,
        limit: u64,
    ) -> Result<Self, SqfsError> {
        let mut bytes = vec![];
        let mut block_map = HashMap::new();

        reader.seek(SeekFrom::Start(start))?;
        let mut pos = start;
        while pos < limit {
            block_map.insert((pos - start) as u32, bytes.len());
            let block = metadata::read_block(reader, compressor)?;
            bytes.extend_from_slice(&block);
            pos = reader.stream_position()?;
        }

        Ok(Self {
            len: bytes.len(),
            bits: BitVec::from_slice(&bytes),
            block_map,
        })
    }

    fn offset_of(&self, block_start: u32, offset: u16) -> Result<usize, SqfsError> {
        let base = self
            .block_map
            .get(&block_start)
            .ok_or(SqfsError::CorruptedSquashfs)?;
        let offset = base + usize::from(offset);
        if offset >= self.len {
            return Err(SqfsError::CorruptedSquashfs);
        }
        Ok(offset)
    }
}

/// A node of the reconstructed tree
#[derive(Debug)]
pub struct SqfsNode {
    /// Empty for the root
    pub name: Vec<u8>,
    pub inode: Inode,
    pub children: Vec<SqfsNode>,
}

impl SqfsNode {
    pub fn is_dir(&self) -> bool {
        matches!(
            self.inode.inner,
            InodeInner::BasicDirectory(_) | InodeInner::ExtendedDirectory(_)
        )
    }
}

/// A parsed SquashFS image
pub struct Squashfs {
    pub superblock: SuperBlock,
    pub compression_options: Option<CompressionOptions>,
    compressor: FilesystemCompressor,
    inode_stream: MetaStream,
    dir_stream: MetaStream,
    pub fragments: Vec<Fragment>,
    pub ids: Vec<Id>,
    pub export: Option<Vec<u64>>,
}

impl Squashfs {
    /// Parse the superblock and every lookup table of the image in `reader`
    #[instrument(skip_all)]
    pub fn from_reader<R: Read + Seek>(reader: &mut R) -> Result<Self, SqfsError> {
        reader.rewind()?;
        let mut buf = [0u8; SuperBlock::SIZE];
        reader.read_exact(&mut buf)?;
        let (_, superblock) = SuperBlock::from_bytes((&buf, 0))?;
        trace!("{superblock:#x?}");

        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&superblock.block_size)
            || superblock.block_log > 20
            || superblock.block_size != 1u32 << superblock.block_log
        {
            return Err(SqfsError::CorruptedSquashfs);
        }

        // a bare compressor to read the option block itself
        let compressor =
            FilesystemCompressor::new(superblock.compressor, None, superblock.block_size)?;
        let compression_options = if superblock.compressor_options_are_present() {
            let block = metadata::read_block(reader, &compressor)?;
            Some(FilesystemCompressor::read_options(
                superblock.compressor,
                &block,
            )?)
        } else {
            None
        };
        let compressor = FilesystemCompressor::new(
            superblock.compressor,
            compression_options,
            superblock.block_size,
        )?;

        let inode_stream = MetaStream::load(
            reader,
            &compressor,
            superblock.inode_table,
            superblock.dir_table,
        )?;

        // the directory metadata blocks end where the next on-disk table
        // begins; fragment or export metadata read along the way is benign
        let mut dir_limit = superblock.id_table;
        for table in [
            superblock.frag_table,
            superblock.export_table,
            superblock.xattr_table,
        ] {
            if table != NOT_SET && table < dir_limit {
                dir_limit = table;
            }
        }
        let dir_stream =
            MetaStream::load(reader, &compressor, superblock.dir_table, dir_limit)?;

        let fragments = if superblock.fragments_are_present() {
            let count = superblock.frag_count as usize;
            let bytes = table::read_table(
                reader,
                &compressor,
                superblock.frag_table,
                fragment::SIZE,
                count,
            )?;
            let bv = BitVec::<u8, Msb0>::from_slice(&bytes);
            let mut rest = bv.as_bitslice();
            let mut fragments = Vec::with_capacity(count);
            for _ in 0..count {
                let (next, fragment) = Fragment::read(rest, Endian::Little)?;
                rest = next;
                fragments.push(fragment);
            }
            fragments
        } else {
            vec![]
        };

        let ids = {
            let count = usize::from(superblock.id_count);
            let bytes =
                table::read_table(reader, &compressor, superblock.id_table, Id::SIZE, count)?;
            bytes
                .chunks_exact(Id::SIZE)
                .map(|c| Id::new(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect()
        };

        let export = if superblock.nfs_export_table_exists()
            && superblock.export_table != NOT_SET
        {
            let count = superblock.inode_count as usize;
            let bytes = table::read_table(
                reader,
                &compressor,
                superblock.export_table,
                std::mem::size_of::<u64>(),
                count,
            )?;
            Some(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                    })
                    .collect(),
            )
        } else {
            None
        };

        Ok(Self {
            superblock,
            compression_options,
            compressor,
            inode_stream,
            dir_stream,
            fragments,
            ids,
            export,
        })
    }

    /// Resolve an id table index from an inode header
    pub fn id(&self, index: u16) -> Result<u32, SqfsError> {
        self.ids
            .get(usize::from(index))
            .map(|id| id.num)
            .ok_or(SqfsError::CorruptedSquashfs)
    }

    fn read_inode(&self, inode_ref: u64) -> Result<Inode, SqfsError> {
        let offset = self.inode_stream.offset_of(
            metadata::ref_block_start(inode_ref),
            metadata::ref_offset(inode_ref),
        )?;
        let (_, inode) = Inode::read(
            &self.inode_stream.bits[offset * 8..],
            (self.superblock.block_size, self.superblock.block_log),
        )?;
        Ok(inode)
    }

    /// Walk the directory table from the root inode and rebuild the tree.
    /// Children come back in the on-disk order, which is sorted by name.
    #[instrument(skip_all)]
    pub fn read_tree(&self) -> Result<SqfsNode, SqfsError> {
        self.read_node(vec![], self.superblock.root_inode, 0)
    }

    fn read_node(
        &self,
        name: Vec<u8>,
        inode_ref: u64,
        depth: usize,
    ) -> Result<SqfsNode, SqfsError> {
        // an image cannot nest deeper than its path limit, anything beyond
        // means a reference loop
        if depth > 4096 {
            return Err(SqfsError::CorruptedSquashfs);
        }

        let inode = self.read_inode(inode_ref)?;
        let (block_index, block_offset, listing_size) = match &inode.inner {
            InodeInner::BasicDirectory(dir) => {
                (dir.block_index, dir.block_offset, usize::from(dir.file_size))
            },
            InodeInner::ExtendedDirectory(dir) => {
                (dir.block_index, dir.block_offset, dir.file_size as usize)
            },
            _ => {
                return Ok(SqfsNode {
                    name,
                    inode,
                    children: vec![],
                })
            },
        };

        let mut children = vec![];
        if listing_size > 3 {
            let len = listing_size - 3;
            let start = self.dir_stream.offset_of(block_index, block_offset)?;
            if start + len > self.dir_stream.len {
                return Err(SqfsError::CorruptedSquashfs);
            }

            let listing = &self.dir_stream.bits[start * 8..(start + len) * 8];
            let mut rest = listing;
            while !rest.is_empty() {
                let (next, dir) = Dir::read(rest, Endian::Little)?;
                rest = next;
                for entry in &dir.dir_entries {
                    let child_ref = metadata::inode_ref(dir.start, entry.offset);
                    children.push(self.read_node(
                        entry.name().to_vec(),
                        child_ref,
                        depth + 1,
                    )?);
                }
            }
        }

        Ok(SqfsNode {
            name,
            inode,
            children,
        })
    }

    /// Read the complete contents of a regular file inode
    #[instrument(skip_all)]
    pub fn read_file<R: Read + Seek>(
        &self,
        reader: &mut R,
        inode: &Inode,
    ) -> Result<Vec<u8>, SqfsError> {
        let (blocks_start, file_size, frag_index, block_offset, block_sizes) =
            match &inode.inner {
                InodeInner::BasicFile(file) => (
                    u64::from(file.blocks_start),
                    u64::from(file.file_size),
                    file.frag_index,
                    file.block_offset,
                    &file.block_sizes,
                ),
                InodeInner::ExtendedFile(file) => (
                    file.blocks_start,
                    file.file_size,
                    file.frag_index,
                    file.block_offset,
                    &file.block_sizes,
                ),
                _ => return Err(SqfsError::NotFile("inode".to_string())),
            };

        let block_size = u64::from(self.superblock.block_size);
        let mut out = Vec::with_capacity(file_size as usize);

        reader.seek(SeekFrom::Start(blocks_start))?;
        for data_size in block_sizes {
            let remaining = (file_size - out.len() as u64).min(block_size) as usize;
            if data_size.size() == 0 {
                // sparse block
                out.resize(out.len() + remaining, 0);
                continue;
            }

            let mut data = vec![0u8; data_size.size() as usize];
            reader.read_exact(&mut data)?;
            if data_size.uncompressed() {
                out.extend_from_slice(&data);
            } else {
                self.compressor.decompress(&data, &mut out)?;
            }
        }

        if frag_index != NO_FRAGMENT {
            let fragment = self
                .fragments
                .get(frag_index as usize)
                .ok_or(SqfsError::CorruptedSquashfs)?;

            reader.seek(SeekFrom::Start(fragment.start))?;
            let mut data = vec![0u8; fragment.size.size() as usize];
            reader.read_exact(&mut data)?;
            let block = if fragment.size.uncompressed() {
                data
            } else {
                let mut block = vec![];
                self.compressor.decompress(&data, &mut block)?;
                block
            };

            let tail = (file_size - out.len() as u64) as usize;
            let start = block_offset as usize;
            if start + tail > block.len() {
                return Err(SqfsError::CorruptedSquashfs);
            }
            out.extend_from_slice(&block[start..start + tail]);
        }

        if out.len() as u64 != file_size {
            return Err(SqfsError::CorruptedSquashfs);
        }
        Ok(out)
    }
}
