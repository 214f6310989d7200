//! Manifest parsing
//!
//! Line oriented: `# ` starts a comment, blank lines are skipped, everything
//! else is `<path> <type> <mode> <uid> <gid> [extra]`. The extra field is a
//! symlink target, a file input path, or a `major:minor` device number
//! depending on the type.

use std::io::BufRead;
use std::path::PathBuf;

use tracing::instrument;

use super::{Fstree, NodeAttrs, NodeData};
use crate::error::SqfsError;
use crate::fstree::FileSource;

impl Fstree {
    /// Populate the tree from a manifest
    #[instrument(skip_all)]
    pub fn from_file<R: BufRead>(&mut self, reader: R) -> Result<(), SqfsError> {
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.parse_line(line, index + 1)?;
        }
        Ok(())
    }

    fn parse_line(&mut self, line: &str, lineno: usize) -> Result<(), SqfsError> {
        let fail = |msg| SqfsError::Manifest { line: lineno, msg };

        let (path, rest) = next_field(line).ok_or_else(|| fail("missing path"))?;
        let (kind, rest) = next_field(rest).ok_or_else(|| fail("missing type"))?;
        let (mode, rest) = next_field(rest).ok_or_else(|| fail("missing mode"))?;
        let (uid, rest) = next_field(rest).ok_or_else(|| fail("missing uid"))?;
        let (gid, rest) = next_field(rest).ok_or_else(|| fail("missing gid"))?;
        let extra = rest.trim();
        let extra = (!extra.is_empty()).then_some(extra);

        let mode = u32::from_str_radix(mode, 8).map_err(|_| fail("bad mode"))?;
        if mode > 0o7777 {
            return Err(fail("bad mode"));
        }
        let attrs = NodeAttrs {
            mode: mode as u16,
            uid: uid.parse().map_err(|_| fail("bad uid"))?,
            gid: gid.parse().map_err(|_| fail("bad gid"))?,
            mtime: self.defaults.mtime,
        };

        let data = match kind {
            "dir" => {
                if extra.is_some() {
                    return Err(fail("dir takes no extra field"));
                }
                NodeData::new_dir()
            },
            "file" => {
                // default input location is the target path, relative to
                // the pack directory
                let source = match extra {
                    Some(extra) => PathBuf::from(extra),
                    None => PathBuf::from(path.trim_start_matches('/')),
                };
                NodeData::File {
                    source: FileSource::Path(source),
                }
            },
            "slink" => {
                let target = extra.ok_or_else(|| fail("slink needs a target"))?;
                NodeData::Symlink {
                    target: target.as_bytes().to_vec(),
                }
            },
            "pipe" => {
                if extra.is_some() {
                    return Err(fail("pipe takes no extra field"));
                }
                NodeData::Fifo
            },
            "sock" => {
                if extra.is_some() {
                    return Err(fail("sock takes no extra field"));
                }
                NodeData::Socket
            },
            "chr" => NodeData::CharDev {
                devno: parse_devno(extra.ok_or_else(|| fail("chr needs major:minor"))?)
                    .ok_or_else(|| fail("bad device number"))?,
            },
            "blk" => NodeData::BlockDev {
                devno: parse_devno(extra.ok_or_else(|| fail("blk needs major:minor"))?)
                    .ok_or_else(|| fail("bad device number"))?,
            },
            _ => return Err(fail("unknown entry type")),
        };

        self.add_node(path, attrs, data)?;
        Ok(())
    }
}

fn next_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some((&s[..end], &s[end..]))
}

/// Linux device number encoding
fn parse_devno(s: &str) -> Option<u32> {
    let (major, minor) = s.split_once(':')?;
    let major: u32 = major.parse().ok()?;
    let minor: u32 = minor.parse().ok()?;
    if major > 0xfff || minor > 0xf_ffff {
        return None;
    }
    Some((major << 8) | (minor & 0xff) | ((minor & !0xff) << 12))
}
