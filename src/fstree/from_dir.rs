//! Build a tree by scanning a directory on disk

use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use tracing::instrument;

use super::{FileSource, Fstree, NodeAttrs, NodeData};
use crate::error::SqfsError;

impl Fstree {
    /// Populate the tree with the contents of `dir`.
    ///
    /// Entries are lstat'ed; symlinks are stored with their targets, device
    /// nodes with their device number. Child order is whatever the OS
    /// returns, the sort pass runs later anyway.
    #[instrument(skip_all)]
    pub fn from_dir<P: AsRef<Path>>(&mut self, dir: P) -> Result<(), SqfsError> {
        self.scan_dir(dir.as_ref(), 0)
    }

    fn scan_dir(&mut self, dir: &Path, parent: usize) -> Result<(), SqfsError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let meta = fs::symlink_metadata(&path)?;

            let attrs = NodeAttrs {
                mode: meta.mode() as u16,
                uid: meta.uid(),
                gid: meta.gid(),
                mtime: meta.mtime().clamp(0, i64::from(u32::MAX)) as u32,
            };

            let file_type = meta.file_type();
            let data = if file_type.is_dir() {
                NodeData::new_dir()
            } else if file_type.is_file() {
                NodeData::File {
                    source: FileSource::Path(path.clone()),
                }
            } else if file_type.is_symlink() {
                let target = fs::read_link(&path)?;
                NodeData::Symlink {
                    target: target.as_os_str().as_bytes().to_vec(),
                }
            } else if file_type.is_block_device() {
                NodeData::BlockDev {
                    devno: meta.rdev() as u32,
                }
            } else if file_type.is_char_device() {
                NodeData::CharDev {
                    devno: meta.rdev() as u32,
                }
            } else if file_type.is_fifo() {
                NodeData::Fifo
            } else if file_type.is_socket() {
                NodeData::Socket
            } else {
                continue;
            };

            let is_dir = matches!(data, NodeData::Dir { .. });
            let id = self.make_node(parent, entry.file_name().as_bytes(), attrs, data)?;
            if is_dir {
                self.scan_dir(&path, id)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::symlink;

    use super::*;

    #[test]
    fn test_scan_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/data.bin"), b"hello").unwrap();
        symlink("sub/data.bin", dir.path().join("link")).unwrap();

        let mut fs_tree = Fstree::new(None).unwrap();
        fs_tree.from_dir(dir.path()).unwrap();
        fs_tree.sort_recursive();
        fs_tree.generate_inode_numbers().unwrap();

        assert_eq!(fs_tree.len(), 4);

        let link = fs_tree.root().children()[0];
        assert_eq!(fs_tree.node(link).name, b"link");
        assert_eq!(
            fs_tree.node(link).data,
            NodeData::Symlink {
                target: b"sub/data.bin".to_vec(),
            }
        );

        let sub = fs_tree.root().children()[1];
        let data = fs_tree.node(sub).children()[0];
        assert!(matches!(
            &fs_tree.node(data).data,
            NodeData::File {
                source: FileSource::Path(_),
            }
        ));
        assert!(fs_tree.node(data).inode_num < fs_tree.node(sub).inode_num);
    }
}
