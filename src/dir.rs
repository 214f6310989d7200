//! Storage of directories with references to inodes
//!
//! For each directory inode, the directory table stores a linear list of all
//! entries, with references back to the inodes that describe those entries.
//! Runs of entries share a header carrying the inode metadata block start and
//! an inode number base, so each entry only needs a 16 bit offset and delta.

use core::fmt;

use deku::prelude::*;

use crate::inode::InodeId;

/// A header must be followed by at most 256 entries
pub(crate) const DIR_HEADER_MAX_ENTRIES: usize = 256;

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Dir {
    /// One less than the number of entries following the header
    #[deku(assert = "*count < 256")]
    pub(crate) count: u32,
    /// Location of the metadata block holding the referenced inodes,
    /// relative to the inode table start
    pub(crate) start: u32,
    /// Base inode number; entries store their number as a difference to this
    pub(crate) inode_num: u32,
    #[deku(count = "*count + 1")]
    pub(crate) dir_entries: Vec<DirEntry>,
}

impl Dir {
    fn new(start: u32, inode_num: u32) -> Self {
        Self {
            count: 0,
            start,
            inode_num,
            dir_entries: vec![],
        }
    }

    fn push(&mut self, entry: DirEntry) {
        self.dir_entries.push(entry);
        self.count = (self.dir_entries.len() - 1) as u32;
    }
}

#[derive(DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct DirEntry {
    /// Offset into the uncompressed inode metadata block
    pub(crate) offset: u16,
    /// Difference of this inode's number to the base stored in the header
    pub(crate) inode_offset: i16,
    /// The basic inode type, even when the inode record is extended
    pub(crate) t: InodeId,
    /// One less than the length of the entry name
    pub(crate) name_size: u16,
    #[deku(count = "*name_size + 1")]
    pub(crate) name: Vec<u8>,
}

impl fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirEntry")
            .field("offset", &self.offset)
            .field("inode_offset", &self.inode_offset)
            .field("t", &self.t)
            .field("name", &String::from_utf8_lossy(&self.name))
            .finish()
    }
}

impl DirEntry {
    pub fn name(&self) -> &[u8] {
        &self.name
    }
}

/// One child entry as the serializer sees it, before header grouping
#[derive(Debug, Clone)]
pub(crate) struct DirEntrySource {
    /// Metadata block start of the child's inode record
    pub start: u32,
    /// Offset of the record inside that block
    pub offset: u16,
    pub inode_num: u32,
    pub t: InodeId,
    pub name: Vec<u8>,
}

/// Group sorted child entries under headers.
///
/// A new header starts when the previous one is full, when the inode
/// metadata block of the referenced inode changes, or when the inode number
/// delta no longer fits the 16 bit entry field.
pub(crate) fn group_entries(entries: &[DirEntrySource]) -> Vec<Dir> {
    let mut dirs: Vec<Dir> = vec![];
    let mut current: Option<Dir> = None;

    for entry in entries {
        let delta = current
            .as_ref()
            .map(|d| i64::from(entry.inode_num) - i64::from(d.inode_num));

        let split = match (&current, delta) {
            (Some(dir), Some(delta)) => {
                dir.dir_entries.len() >= DIR_HEADER_MAX_ENTRIES
                    || dir.start != entry.start
                    || i16::try_from(delta).is_err()
            },
            _ => true,
        };
        if split {
            if let Some(dir) = current.take() {
                dirs.push(dir);
            }
            current = Some(Dir::new(entry.start, entry.inode_num));
        }

        let dir = current.as_mut().unwrap();
        dir.push(DirEntry {
            offset: entry.offset,
            inode_offset: (i64::from(entry.inode_num) - i64::from(dir.inode_num)) as i16,
            t: entry.t,
            name_size: entry.name.len() as u16 - 1,
            name: entry.name.clone(),
        });
    }

    if let Some(dir) = current.take() {
        dirs.push(dir);
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: u32, inode_num: u32, name: &str) -> DirEntrySource {
        DirEntrySource {
            start,
            offset: 0,
            inode_num,
            t: InodeId::BasicFile,
            name: name.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_group_single_header() {
        let entries = vec![entry(0, 1, "a"), entry(0, 2, "b"), entry(0, 3, "c")];
        let dirs = group_entries(&entries);
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].count, 2);
        assert_eq!(dirs[0].inode_num, 1);
        assert_eq!(dirs[0].dir_entries[2].inode_offset, 2);
    }

    #[test]
    fn test_group_splits_on_block_change() {
        let entries = vec![entry(0, 1, "a"), entry(0x2000, 2, "b")];
        let dirs = group_entries(&entries);
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[1].start, 0x2000);
        assert_eq!(dirs[1].dir_entries[0].inode_offset, 0);
    }

    #[test]
    fn test_group_splits_on_entry_count() {
        let entries: Vec<_> = (0..300)
            .map(|i| entry(0, i + 1, &format!("n{i:03}")))
            .collect();
        let dirs = group_entries(&entries);
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[0].dir_entries.len(), 256);
        assert_eq!(dirs[1].dir_entries.len(), 44);
        assert_eq!(dirs[1].inode_num, 257);
    }

    #[test]
    fn test_group_splits_on_large_delta() {
        let entries = vec![entry(0, 1, "a"), entry(0, 0x10000, "b")];
        let dirs = group_entries(&entries);
        assert_eq!(dirs.len(), 2);
    }
}
