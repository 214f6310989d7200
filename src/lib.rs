//! Library for building and reading SquashFS 4.0 images
//!
//! The write path is the interesting half: an in-memory [`Fstree`] is built
//! from a manifest or a directory scan, sorted and numbered, then
//! [`ImageWriter`] pushes file contents through a parallel block compressor
//! that preserves submission order on disk, deduplicates whole block runs
//! and packs sub-block tails into shared fragment blocks, and finally lays
//! out the inode, directory and lookup tables behind the data area.
//!
//! [`Squashfs`] is the matching reader: it parses the superblock and
//! tables, rebuilds the tree by walking directory records and extracts file
//! contents, which is also how the round-trip tests pin down the writer.

pub mod compressor;
mod data;
mod dir;
pub mod error;
mod export;
mod fragment;
pub mod fstree;
mod id;
pub mod inode;
mod metadata;
mod serialize;
mod squashfs;
mod superblock;
mod table;

pub use crate::data::{
    DataSize, PackStats, SqfsFile, BLK_ALIGN, BLK_DONT_COMPRESS, BLK_DONT_FRAGMENT,
    BLK_DONT_HASH,
};
pub use crate::error::SqfsError;
pub use crate::fragment::Fragment;
pub use crate::fstree::Fstree;
pub use crate::id::{Id, IdTable};
pub use crate::serialize::{ImageWriter, DEFAULT_MAX_BACKLOG};
pub use crate::squashfs::{SqfsNode, Squashfs};
pub use crate::superblock::{
    Flags, SuperBlock, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
