//! In-memory filesystem tree
//!
//! The tree is built from a manifest file or by scanning a directory, then
//! sorted and numbered before the serializer walks it. Numbering is what the
//! rest of the image format hangs off: every child receives a smaller inode
//! number than its parent, siblings are contiguous, and the root inode
//! number is the largest.

use std::env;

pub use node::{FileSource, NodeAttrs, NodeData, TreeNode, XATTR_NONE};
pub use node::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK};

use crate::error::SqfsError;

mod from_dir;
mod from_file;
mod node;

/// Encapsulates a file system tree
#[derive(Debug)]
pub struct Fstree {
    /// Attributes used for implicitly created directories. `mode` carries
    /// `S_IFDIR`.
    pub defaults: NodeAttrs,
    /// Node arena; index 0 is the root
    nodes: Vec<TreeNode>,
    /// Nodes in inode order, filled by [`Self::generate_inode_numbers`]
    pub(crate) inode_table: Vec<usize>,
    /// Regular files in inode order, the pack queue
    pub(crate) files: Vec<usize>,
}

impl Fstree {
    /// Create a tree holding only a root directory.
    ///
    /// `defaults` is a `key=value[,key=value...]` list over `mode`, `uid`,
    /// `gid` and `mtime`. Without it the root is `0755`, owned by root, and
    /// `mtime` is taken from `SOURCE_DATE_EPOCH` when that parses as a 32
    /// bit number.
    pub fn new(defaults: Option<&str>) -> Result<Self, SqfsError> {
        let defaults = parse_defaults(defaults)?;
        let root = TreeNode::new(None, vec![], defaults, NodeData::new_dir())?;
        Ok(Self {
            defaults,
            nodes: vec![root],
            inode_table: vec![],
            files: vec![],
        })
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: usize) -> &TreeNode {
        &self.nodes[id]
    }

    pub(crate) fn node_mut(&mut self, id: usize) -> &mut TreeNode {
        &mut self.nodes[id]
    }

    /// Number of nodes in the tree
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes in inode order, valid after [`Self::generate_inode_numbers`]
    pub fn inode_table(&self) -> &[usize] {
        &self.inode_table
    }

    /// Regular files in inode order, valid after [`Self::generate_file_queue`]
    pub fn files(&self) -> &[usize] {
        &self.files
    }

    fn child_by_name(&self, dir: usize, name: &[u8]) -> Option<usize> {
        self.nodes[dir]
            .children()
            .iter()
            .copied()
            .find(|&c| self.nodes[c].name == name)
    }

    /// Create a node under `parent` and link it into the child list
    pub(crate) fn make_node(
        &mut self,
        parent: usize,
        name: &[u8],
        attrs: NodeAttrs,
        data: NodeData,
    ) -> Result<usize, SqfsError> {
        if !self.nodes[parent].is_dir() {
            return Err(SqfsError::NotDir(self.get_path(parent)));
        }

        let node = TreeNode::new(Some(parent), name.to_vec(), attrs, data)?;
        let id = self.nodes.len();
        self.nodes.push(node);

        match &mut self.nodes[parent].data {
            NodeData::Dir { children, .. } => children.push(id),
            _ => unreachable!(),
        }
        Ok(id)
    }

    /// Add a node at an absolute `path`, creating missing parents as
    /// implicit directories with the tree defaults.
    ///
    /// Re-declaring an implicitly created directory as a directory
    /// overwrites its attributes once and clears the flag; every other
    /// collision fails.
    pub fn add_node(
        &mut self,
        path: &str,
        attrs: NodeAttrs,
        data: NodeData,
    ) -> Result<usize, SqfsError> {
        let path = path
            .strip_prefix('/')
            .ok_or(SqfsError::ArgInvalid("path must be absolute"))?;
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        if components.peek().is_none() {
            return Err(SqfsError::ArgInvalid("empty path"));
        }

        let mut current = 0;
        while let Some(component) = components.next() {
            let is_last = components.peek().is_none();
            let name = component.as_bytes();

            if !is_last {
                current = match self.child_by_name(current, name) {
                    Some(child) if self.nodes[child].is_dir() => child,
                    Some(child) => return Err(SqfsError::NotDir(self.get_path(child))),
                    None => {
                        let defaults = self.defaults;
                        let id =
                            self.make_node(current, name, defaults, NodeData::new_dir())?;
                        self.set_implicit(id, true);
                        id
                    },
                };
                continue;
            }

            if let Some(existing) = self.child_by_name(current, name) {
                let explicit_dir = matches!(data, NodeData::Dir { .. });
                let implicit = matches!(
                    self.nodes[existing].data,
                    NodeData::Dir {
                        created_implicitly: true,
                        ..
                    }
                );
                if !(implicit && explicit_dir) {
                    return Err(SqfsError::Exists(self.get_path(existing)));
                }

                self.set_implicit(existing, false);
                let node = &mut self.nodes[existing];
                node.mode = (attrs.mode & !S_IFMT) | S_IFDIR;
                node.uid = attrs.uid;
                node.gid = attrs.gid;
                node.mtime = attrs.mtime;
                return Ok(existing);
            }

            return self.make_node(current, name, attrs, data);
        }
        unreachable!()
    }

    fn set_implicit(&mut self, id: usize, value: bool) {
        if let NodeData::Dir {
            created_implicitly, ..
        } = &mut self.nodes[id].data
        {
            *created_implicitly = value;
        }
    }

    /// ASCIIbetically sort all child lists, recursively
    pub fn sort_recursive(&mut self) {
        let mut order: Vec<usize> = vec![];
        for id in 0..self.nodes.len() {
            if !self.nodes[id].is_dir() {
                continue;
            }
            order.clear();
            order.extend_from_slice(self.nodes[id].children());
            order.sort_by(|&a, &b| self.nodes[a].name.cmp(&self.nodes[b].name));
            if let NodeData::Dir { children, .. } = &mut self.nodes[id].data {
                children.copy_from_slice(&order);
            }
        }
    }

    /// Assign inode numbers and build the inode-ordered node table.
    ///
    /// Children of a directory get contiguous numbers, all of them smaller
    /// than the parent's; the root is numbered last.
    pub fn generate_inode_numbers(&mut self) -> Result<(), SqfsError> {
        if u32::try_from(self.nodes.len()).is_err() {
            return Err(SqfsError::Overflow("too many inodes"));
        }

        self.inode_table = Vec::with_capacity(self.nodes.len());
        let mut counter = 1u32;
        self.map_child_nodes(0, &mut counter);
        self.nodes[0].inode_num = counter;
        self.inode_table.push(0);

        debug_assert_eq!(self.inode_table.len(), self.nodes.len());
        Ok(())
    }

    fn map_child_nodes(&mut self, dir: usize, counter: &mut u32) {
        let children: Vec<usize> = self.nodes[dir].children().to_vec();

        // descend into subdirectories first so deeper nodes get the
        // smallest numbers, then number this directory's children as one
        // contiguous run
        for &child in &children {
            if self.nodes[child].is_dir() {
                self.map_child_nodes(child, counter);
            }
        }
        for &child in &children {
            self.nodes[child].inode_num = *counter;
            *counter += 1;
            self.inode_table.push(child);
        }
    }

    /// Collect regular files in inode order, the pack work queue
    pub fn generate_file_queue(&mut self) {
        self.files = self
            .inode_table
            .iter()
            .copied()
            .filter(|&id| matches!(self.nodes[id].data, NodeData::File { .. }))
            .collect();
    }

    /// The `/`-separated absolute path of a node
    pub fn get_path(&self, id: usize) -> String {
        if self.nodes[id].parent.is_none() {
            return "/".to_string();
        }

        let mut parts = vec![];
        let mut current = Some(id);
        while let Some(id) = current {
            let node = &self.nodes[id];
            if node.parent.is_some() {
                parts.push(String::from_utf8_lossy(&node.name).into_owned());
            }
            current = node.parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }
}

fn parse_defaults(defaults: Option<&str>) -> Result<NodeAttrs, SqfsError> {
    let mut attrs = NodeAttrs {
        mode: S_IFDIR | 0o755,
        uid: 0,
        gid: 0,
        mtime: get_source_date_epoch(),
    };

    let Some(defaults) = defaults else {
        return Ok(attrs);
    };

    for part in defaults.split(',') {
        if part.is_empty() {
            continue;
        }
        let (key, value) = part
            .split_once('=')
            .ok_or(SqfsError::ArgInvalid("defaults expect key=value"))?;
        match key {
            "mode" => {
                let mode = u32::from_str_radix(value, 8)
                    .map_err(|_| SqfsError::ArgInvalid("defaults mode"))?;
                if mode > 0o7777 {
                    return Err(SqfsError::ArgInvalid("defaults mode"));
                }
                attrs.mode = S_IFDIR | mode as u16;
            },
            "uid" => {
                attrs.uid = value
                    .parse()
                    .map_err(|_| SqfsError::ArgInvalid("defaults uid"))?;
            },
            "gid" => {
                attrs.gid = value
                    .parse()
                    .map_err(|_| SqfsError::ArgInvalid("defaults gid"))?;
            },
            "mtime" => {
                attrs.mtime = value
                    .parse()
                    .map_err(|_| SqfsError::ArgInvalid("defaults mtime"))?;
            },
            _ => return Err(SqfsError::ArgInvalid("unknown defaults key")),
        }
    }

    Ok(attrs)
}

/// `SOURCE_DATE_EPOCH` when it parses as a 32 bit number, otherwise 0
pub fn get_source_date_epoch() -> u32 {
    env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_attrs() -> NodeAttrs {
        NodeAttrs {
            mode: S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
            mtime: 0,
        }
    }

    #[test]
    fn test_defaults_parsing() {
        let fs = Fstree::new(Some("mtime=1337,uid=1000,gid=100,mode=0321")).unwrap();
        assert_eq!(fs.defaults.mtime, 1337);
        assert_eq!(fs.defaults.uid, 1000);
        assert_eq!(fs.defaults.gid, 100);
        assert_eq!(fs.defaults.mode, S_IFDIR | 0o321);

        let fs = Fstree::new(None).unwrap();
        assert!(fs.defaults.mtime == 0 || fs.defaults.mtime == get_source_date_epoch());
        assert_eq!(fs.defaults.uid, 0);
        assert_eq!(fs.defaults.gid, 0);
        assert_eq!(fs.defaults.mode, S_IFDIR | 0o755);

        assert!(Fstree::new(Some("mode=07777")).is_ok());
        assert!(Fstree::new(Some("mode=017777")).is_err());
        assert!(Fstree::new(Some("foo=1")).is_err());
    }

    #[test]
    fn test_empty_tree_inode_table() {
        let mut fs = Fstree::new(None).unwrap();
        fs.generate_inode_numbers().unwrap();
        assert_eq!(fs.inode_table.len(), 1);
        assert_eq!(fs.root().inode_num, 1);
        assert_eq!(fs.inode_table[0], 0);
    }

    fn check_children_before_parent(fs: &Fstree, dir: usize) {
        for &child in fs.node(dir).children() {
            assert!(fs.node(child).inode_num < fs.node(dir).inode_num);
            check_children_before_parent(fs, child);
        }
    }

    fn check_children_contiguous(fs: &Fstree, dir: usize) {
        let children = fs.node(dir).children();
        for pair in children.windows(2) {
            assert_eq!(
                fs.node(pair[1]).inode_num,
                fs.node(pair[0]).inode_num + 1
            );
        }
        for &child in children {
            check_children_contiguous(fs, child);
        }
    }

    #[test]
    fn test_inode_table_two_levels() {
        let mut fs = Fstree::new(None).unwrap();
        for top in ["a", "b", "c"] {
            fs.add_node(&format!("/{top}"), dir_attrs(), NodeData::new_dir())
                .unwrap();
            for sub in ["a", "b", "c"] {
                fs.add_node(
                    &format!("/{top}/{top}_{sub}"),
                    dir_attrs(),
                    NodeData::new_dir(),
                )
                .unwrap();
            }
        }

        fs.generate_inode_numbers().unwrap();
        assert_eq!(fs.inode_table.len(), 13);
        assert_eq!(fs.root().inode_num, 13);

        for (i, &id) in fs.inode_table.iter().enumerate() {
            assert_eq!(fs.node(id).inode_num, i as u32 + 1);
        }

        check_children_before_parent(&fs, 0);
        check_children_contiguous(&fs, 0);
    }

    #[test]
    fn test_implicit_dir_overwrite_once() {
        let mut fs = Fstree::new(None).unwrap();
        fs.add_node(
            "/a/b/c",
            dir_attrs(),
            NodeData::File {
                source: FileSource::Bytes(vec![]),
            },
        )
        .unwrap();

        // "/a" was created implicitly, an explicit declaration overwrites
        let attrs = NodeAttrs {
            mode: S_IFDIR | 0o700,
            uid: 5,
            gid: 6,
            mtime: 7,
        };
        let a = fs.add_node("/a", attrs, NodeData::new_dir()).unwrap();
        assert_eq!(fs.node(a).mode, S_IFDIR | 0o700);
        assert_eq!(fs.node(a).uid, 5);

        // a second declaration fails
        assert!(matches!(
            fs.add_node("/a", attrs, NodeData::new_dir()),
            Err(SqfsError::Exists(_))
        ));

        // non-directory collisions always fail
        assert!(matches!(
            fs.add_node(
                "/a/b/c",
                attrs,
                NodeData::File {
                    source: FileSource::Bytes(vec![]),
                }
            ),
            Err(SqfsError::Exists(_))
        ));

        // a path component that is not a directory fails
        assert!(matches!(
            fs.add_node("/a/b/c/d", attrs, NodeData::new_dir()),
            Err(SqfsError::NotDir(_))
        ));
    }

    #[test]
    fn test_sort_recursive() {
        let mut fs = Fstree::new(None).unwrap();
        for name in ["zeta", "alpha", "omega"] {
            fs.add_node(&format!("/{name}"), dir_attrs(), NodeData::new_dir())
                .unwrap();
            for sub in ["3", "1", "2"] {
                fs.add_node(
                    &format!("/{name}/{sub}"),
                    dir_attrs(),
                    NodeData::new_dir(),
                )
                .unwrap();
            }
        }
        fs.sort_recursive();

        let names: Vec<_> = fs
            .root()
            .children()
            .iter()
            .map(|&c| fs.node(c).name.clone())
            .collect();
        assert_eq!(names, [b"alpha".to_vec(), b"omega".to_vec(), b"zeta".to_vec()]);

        let alpha = fs.root().children()[0];
        let subs: Vec<_> = fs
            .node(alpha)
            .children()
            .iter()
            .map(|&c| fs.node(c).name.clone())
            .collect();
        assert_eq!(subs, [b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn test_get_path() {
        let mut fs = Fstree::new(None).unwrap();
        let c = fs.add_node("/a/b/c", dir_attrs(), NodeData::new_dir()).unwrap();
        assert_eq!(fs.get_path(0), "/");
        assert_eq!(fs.get_path(c), "/a/b/c");
    }

    #[test]
    fn test_file_queue_in_inode_order() {
        let mut fs = Fstree::new(None).unwrap();
        let file = |bytes: &[u8]| NodeData::File {
            source: FileSource::Bytes(bytes.to_vec()),
        };
        fs.add_node("/dir/inner", dir_attrs(), file(b"inner")).unwrap();
        fs.add_node("/top", dir_attrs(), file(b"top")).unwrap();
        fs.sort_recursive();
        fs.generate_inode_numbers().unwrap();
        fs.generate_file_queue();

        let paths: Vec<_> = fs.files.iter().map(|&id| fs.get_path(id)).collect();
        assert_eq!(paths, ["/dir/inner", "/top"]);

        let mut last = 0;
        for &id in &fs.files {
            assert!(fs.node(id).inode_num > last);
            last = fs.node(id).inode_num;
        }
    }
}
