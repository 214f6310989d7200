//! Image assembly
//!
//! [`ImageWriter`] drives the whole write path: superblock placeholder,
//! compressor options, the data pipeline over the tree's file queue, inode
//! and directory tables in inode order, the lookup tables, and the final
//! superblock rewrite.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use deku::bitvec::BitVec;
use deku::ctx::Endian;
use deku::prelude::*;
use tracing::{info, instrument, trace};

use crate::compressor::{CompressionOptions, Compressor, FilesystemCompressor};
use crate::data::{DataWriter, PackStats, PackedFile, SqfsFile, BLK_USER_SETTABLE};
use crate::dir::{group_entries, DirEntrySource};
use crate::error::SqfsError;
use crate::export::Export;
use crate::fstree::{FileSource, Fstree, NodeData};
use crate::id::IdTable;
use crate::inode::{
    BasicDeviceSpecialFile, BasicDirectory, BasicFile, BasicIpc, BasicSymlink,
    ExtendedDirectory, ExtendedFile, Inode, InodeHeader, InodeId, InodeInner, NO_FRAGMENT,
};
use crate::metadata::{self, MetadataWriter};
use crate::superblock::{Flags, SuperBlock, DEFAULT_BLOCK_SIZE};
use crate::table;

pub const DEFAULT_MAX_BACKLOG: usize = 64;

/// Configuration for writing one image
#[derive(Debug, Clone)]
pub struct ImageWriter {
    block_size: u32,
    compressor: Compressor,
    options: Option<CompressionOptions>,
    num_workers: usize,
    max_backlog: usize,
    /// Pad the finished image to a multiple of this; 0 disables
    devblksz: u64,
    exportable: bool,
    /// Base directory for relative file sources
    pack_dir: Option<PathBuf>,
    /// Extra `BLK_*` flags applied to every packed file
    file_flags: u32,
}

impl Default for ImageWriter {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compressor: Compressor::default(),
            options: None,
            num_workers: 1,
            max_backlog: DEFAULT_MAX_BACKLOG,
            devblksz: 0,
            exportable: false,
            pack_dir: None,
            file_flags: 0,
        }
    }
}

impl ImageWriter {
    pub fn set_block_size(&mut self, block_size: u32) {
        self.block_size = block_size;
    }

    pub fn set_compressor(&mut self, compressor: Compressor, options: Option<CompressionOptions>) {
        self.compressor = compressor;
        self.options = options;
    }

    pub fn set_num_workers(&mut self, num_workers: usize) {
        self.num_workers = num_workers;
    }

    pub fn set_max_backlog(&mut self, max_backlog: usize) {
        self.max_backlog = max_backlog;
    }

    pub fn set_devblksz(&mut self, devblksz: u64) {
        self.devblksz = devblksz;
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    pub fn set_pack_dir(&mut self, pack_dir: PathBuf) {
        self.pack_dir = Some(pack_dir);
    }

    pub fn set_file_flags(&mut self, flags: u32) {
        self.file_flags = flags & BLK_USER_SETTABLE;
    }

    /// Sort and number `fs`, then write the complete image to `w`.
    ///
    /// Returns the finished superblock and the pack statistics along with
    /// the output file.
    #[instrument(skip_all)]
    pub fn write<W: SqfsFile>(
        &self,
        fs: &mut Fstree,
        mut w: W,
    ) -> Result<(SuperBlock, PackStats, W), SqfsError> {
        fs.sort_recursive();
        fs.generate_inode_numbers()?;
        fs.generate_file_queue();

        let mut superblock =
            SuperBlock::new(self.block_size, fs.defaults.mtime, self.compressor)?;
        superblock.inode_count = fs.len() as u32;
        // this writer always runs the dedup scan
        superblock.set_flag(Flags::DataHasBeenDeduplicated);

        let compressor =
            FilesystemCompressor::new(self.compressor, self.options, self.block_size)?;

        w.rewind()?;
        w.write_all(&[0x00; SuperBlock::SIZE])?;

        if compressor.write_options(&mut w)? {
            superblock.set_flag(Flags::CompressorOptionsArePresent);
        }

        info!("writing data blocks");
        let mut data_writer = DataWriter::new(
            w,
            compressor,
            self.block_size,
            self.num_workers,
            self.max_backlog,
            self.devblksz,
        )?;
        let pack_result = self.pack_files(fs, &mut data_writer);
        let finish_result = data_writer.finish();
        pack_result?;
        finish_result?;
        let (mut w, packed, fragments, stats) = data_writer.into_parts();

        info!("writing inode and directory tables");
        let mut id_table = IdTable::new();
        let mut inode_writer = MetadataWriter::new(compressor);
        let mut dir_writer = MetadataWriter::new(compressor);
        self.write_inodes(fs, &packed, &mut id_table, &mut inode_writer, &mut dir_writer)?;

        superblock.root_inode = fs.root().inode_ref();

        superblock.inode_table = w.stream_position()?;
        inode_writer.finalize(&mut w)?;

        superblock.dir_table = w.stream_position()?;
        dir_writer.finalize(&mut w)?;

        if fragments.is_empty() {
            superblock.set_flag(Flags::FragmentsAreNotUsed);
        } else {
            info!("writing fragment table");
            let mut bytes = vec![];
            for fragment in &fragments {
                let mut bv = BitVec::new();
                fragment.write(&mut bv, Endian::Little)?;
                bytes.write_all(bv.as_raw_slice())?;
            }
            superblock.frag_count = fragments.len() as u32;
            superblock.frag_table = table::write_table(&mut w, &bytes, &compressor)?;
        }

        if self.exportable {
            info!("writing export table");
            let mut bytes = vec![];
            for &node_id in fs.inode_table() {
                let export = Export {
                    num: fs.node(node_id).inode_ref(),
                };
                let mut bv = BitVec::new();
                export.write(&mut bv, Endian::Little)?;
                bytes.write_all(bv.as_raw_slice())?;
            }
            superblock.export_table = table::write_table(&mut w, &bytes, &compressor)?;
            superblock.set_flag(Flags::NfsExportTableExists);
        }

        info!("writing id table");
        let mut bytes = vec![];
        for id in id_table.ids() {
            bytes.write_all(&id.to_le_bytes())?;
        }
        superblock.id_count = id_table.len() as u16;
        superblock.id_table = table::write_table(&mut w, &bytes, &compressor)?;

        superblock.bytes_used = w.stream_position()?;

        trace!("{superblock:#x?}");
        w.rewind()?;
        let bytes = superblock.to_bytes()?;
        w.write_all(&bytes)?;

        // trailing padding is not part of bytes_used
        if self.devblksz != 0 {
            w.seek(SeekFrom::Start(superblock.bytes_used))?;
            let diff = superblock.bytes_used % self.devblksz;
            if diff != 0 {
                let padding = vec![0u8; (self.devblksz - diff) as usize];
                w.write_all(&padding)?;
            }
        }

        info!("done, {} bytes used", superblock.bytes_used);
        Ok((superblock, stats, w))
    }

    fn pack_files<W: SqfsFile>(
        &self,
        fs: &Fstree,
        data_writer: &mut DataWriter<W>,
    ) -> Result<(), SqfsError> {
        for &node_id in fs.files() {
            let NodeData::File { source } = &fs.node(node_id).data else {
                unreachable!();
            };
            match source {
                FileSource::Path(path) => {
                    let path = match &self.pack_dir {
                        Some(base) if path.is_relative() => base.join(path),
                        _ => path.clone(),
                    };
                    trace!("packing {}", path.display());
                    let mut file = File::open(&path)?;
                    let size = file.metadata()?.len();
                    data_writer.write_file(&mut file, size, self.file_flags)?;
                },
                FileSource::Bytes(bytes) => {
                    let mut reader = bytes.as_slice();
                    data_writer.write_file(&mut reader, bytes.len() as u64, self.file_flags)?;
                },
            }
        }
        Ok(())
    }

    /// Emit one inode record per node in inode order; directory listings go
    /// to the directory stream right before their inode.
    ///
    /// Children always carry smaller inode numbers, so every child's
    /// locator is known by the time its directory is serialized.
    fn write_inodes(
        &self,
        fs: &mut Fstree,
        packed: &[PackedFile],
        id_table: &mut IdTable,
        inode_writer: &mut MetadataWriter,
        dir_writer: &mut MetadataWriter,
    ) -> Result<(), SqfsError> {
        let block_log = self.block_size.trailing_zeros() as u16;
        let inode_count = fs.len() as u32;
        let file_ids: HashMap<usize, usize> =
            fs.files().iter().copied().zip(0..).collect();

        for table_index in 0..fs.inode_table().len() {
            let node_id = fs.inode_table()[table_index];
            let node = fs.node(node_id);

            let header = InodeHeader {
                permissions: node.mode & 0o7777,
                uid: id_table.id_to_index(node.uid)?,
                gid: id_table.id_to_index(node.gid)?,
                mtime: node.mtime,
                inode_number: node.inode_num,
            };

            let (id, inner) = match &node.data {
                NodeData::File { .. } => {
                    let result = &packed[file_ids[&node_id]];
                    self.file_inode(result)
                },
                NodeData::Dir { children, .. } => {
                    let parent_inode = match node.parent {
                        Some(parent) => fs.node(parent).inode_num,
                        None => inode_count + 1,
                    };
                    let link_count = 2 + children
                        .iter()
                        .filter(|&&c| fs.node(c).is_dir())
                        .count() as u32;

                    let entries: Vec<DirEntrySource> = children
                        .iter()
                        .map(|&child_id| {
                            let child = fs.node(child_id);
                            DirEntrySource {
                                start: metadata::ref_block_start(child.inode_ref()),
                                offset: metadata::ref_offset(child.inode_ref()),
                                inode_num: child.inode_num,
                                t: node_data_type(&child.data),
                                name: child.name.clone(),
                            }
                        })
                        .collect();

                    self.dir_inode(dir_writer, &entries, link_count, parent_inode)?
                },
                NodeData::Symlink { target } => (
                    InodeId::BasicSymlink,
                    InodeInner::BasicSymlink(BasicSymlink {
                        link_count: 1,
                        target_size: target.len() as u32,
                        target_path: target.clone(),
                    }),
                ),
                NodeData::BlockDev { devno } => (
                    InodeId::BasicBlockDevice,
                    InodeInner::BasicBlockDevice(BasicDeviceSpecialFile {
                        link_count: 1,
                        device_number: *devno,
                    }),
                ),
                NodeData::CharDev { devno } => (
                    InodeId::BasicCharacterDevice,
                    InodeInner::BasicCharacterDevice(BasicDeviceSpecialFile {
                        link_count: 1,
                        device_number: *devno,
                    }),
                ),
                NodeData::Fifo => (
                    InodeId::BasicNamedPipe,
                    InodeInner::BasicNamedPipe(BasicIpc { link_count: 1 }),
                ),
                NodeData::Socket => (
                    InodeId::BasicSocket,
                    InodeInner::BasicSocket(BasicIpc { link_count: 1 }),
                ),
            };

            let inode = Inode { id, header, inner };
            let (start, offset) =
                inode.to_writer(inode_writer, self.block_size, block_log)?;
            fs.node_mut(node_id).inode_ref = metadata::inode_ref(start, offset);
        }
        Ok(())
    }

    fn file_inode(&self, result: &PackedFile) -> (InodeId, InodeInner) {
        let (frag_index, block_offset) = match result.fragment {
            Some((index, offset)) => (index, offset),
            None => (NO_FRAGMENT, 0),
        };

        if result.start_block > u64::from(u32::MAX) || result.file_len > u64::from(u32::MAX)
        {
            (
                InodeId::ExtendedFile,
                InodeInner::ExtendedFile(ExtendedFile {
                    blocks_start: result.start_block,
                    file_size: result.file_len,
                    sparse: 0,
                    link_count: 1,
                    frag_index,
                    block_offset,
                    xattr_index: crate::fstree::XATTR_NONE,
                    block_sizes: result.block_sizes.clone(),
                }),
            )
        } else {
            (
                InodeId::BasicFile,
                InodeInner::BasicFile(BasicFile {
                    blocks_start: result.start_block as u32,
                    frag_index,
                    block_offset,
                    file_size: result.file_len as u32,
                    block_sizes: result.block_sizes.clone(),
                }),
            )
        }
    }

    fn dir_inode(
        &self,
        dir_writer: &mut MetadataWriter,
        entries: &[DirEntrySource],
        link_count: u32,
        parent_inode: u32,
    ) -> Result<(InodeId, InodeInner), SqfsError> {
        let (block_index, block_offset) = dir_writer.position();

        let mut listing_size = 0usize;
        for dir in group_entries(entries) {
            let mut bv = BitVec::new();
            dir.write(&mut bv, Endian::Little)?;
            let bytes = bv.as_raw_slice();
            dir_writer.write_all(bytes)?;
            listing_size += bytes.len();
        }

        // the historic 3 byte offset is included in the stored size
        let file_size = listing_size + 3;

        if file_size > usize::from(u16::MAX) {
            Ok((
                InodeId::ExtendedDirectory,
                InodeInner::ExtendedDirectory(ExtendedDirectory {
                    link_count,
                    file_size: file_size as u32,
                    block_index,
                    parent_inode,
                    index_count: 0,
                    block_offset,
                    xattr_index: crate::fstree::XATTR_NONE,
                    dir_index: vec![],
                }),
            ))
        } else {
            Ok((
                InodeId::BasicDirectory,
                InodeInner::BasicDirectory(BasicDirectory {
                    block_index,
                    link_count,
                    file_size: file_size as u16,
                    block_offset,
                    parent_inode,
                }),
            ))
        }
    }
}

fn node_data_type(data: &NodeData) -> InodeId {
    match data {
        NodeData::Dir { .. } => InodeId::BasicDirectory,
        NodeData::File { .. } => InodeId::BasicFile,
        NodeData::Symlink { .. } => InodeId::BasicSymlink,
        NodeData::BlockDev { .. } => InodeId::BasicBlockDevice,
        NodeData::CharDev { .. } => InodeId::BasicCharacterDevice,
        NodeData::Fifo => InodeId::BasicNamedPipe,
        NodeData::Socket => InodeId::BasicSocket,
    }
}
