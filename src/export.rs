//! NFS export support
//!
//! The export table maps `inode number - 1` to the inode reference, so NFS
//! file handles survive a remount.

use deku::prelude::*;

#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Export {
    pub num: u64,
}
