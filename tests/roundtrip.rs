//! Write images and read them back through the independent reader

use std::io::Cursor;

use sqfs_ng::compressor::{CompressionOptions, Compressor, Gzip};
use sqfs_ng::fstree::{FileSource, Fstree, NodeAttrs, NodeData};
use sqfs_ng::inode::{InodeId, InodeInner};
use sqfs_ng::{ImageWriter, SqfsError, SqfsNode, Squashfs, SuperBlock};

fn attrs(mode: u16, uid: u32, gid: u32, mtime: u32) -> NodeAttrs {
    NodeAttrs {
        mode,
        uid,
        gid,
        mtime,
    }
}

fn file(bytes: &[u8]) -> NodeData {
    NodeData::File {
        source: FileSource::Bytes(bytes.to_vec()),
    }
}

fn write_image(fs: &mut Fstree, configure: impl FnOnce(&mut ImageWriter)) -> (SuperBlock, Vec<u8>) {
    let mut writer = ImageWriter::default();
    configure(&mut writer);
    let (superblock, _stats, image) = writer.write(fs, Cursor::new(vec![])).unwrap();
    (superblock, image.into_inner())
}

fn parse(image: Vec<u8>) -> (Squashfs, SqfsNode, Cursor<Vec<u8>>) {
    let mut cursor = Cursor::new(image);
    let sqfs = Squashfs::from_reader(&mut cursor).unwrap();
    let root = sqfs.read_tree().unwrap();
    (sqfs, root, cursor)
}

#[test]
fn test_empty_tree() {
    let mut fs = Fstree::new(Some("mtime=0")).unwrap();
    let (superblock, image) = write_image(&mut fs, |_| {});

    assert_eq!(superblock.inode_count, 1);
    assert_eq!(superblock.frag_count, 0);
    // gzip with default settings writes no option record, data starts right
    // after the superblock and is empty
    assert!(!superblock.compressor_options_are_present());
    assert_eq!(superblock.inode_table, 96);

    let (sqfs, root, _) = parse(image);
    assert_eq!(sqfs.superblock.inode_count, 1);
    assert!(sqfs.fragments.is_empty());
    assert_eq!(root.inode.header.inode_number, 1);
    assert!(root.children.is_empty());
    assert!(root.is_dir());
}

#[test]
fn test_roundtrip_tree_attributes_and_contents() {
    let mut fs = Fstree::new(Some("mtime=1234")).unwrap();
    let big = vec![0xa5u8; 4096 * 2 + 100];

    fs.add_node("/bin", attrs(0o755, 0, 0, 1000), NodeData::new_dir())
        .unwrap();
    fs.add_node("/bin/sh", attrs(0o755, 10, 20, 1001), file(b"#!shell"))
        .unwrap();
    fs.add_node("/bin/big", attrs(0o644, 10, 20, 1002), file(&big))
        .unwrap();
    fs.add_node("/empty", attrs(0o600, 0, 0, 1003), file(b""))
        .unwrap();
    fs.add_node(
        "/link",
        attrs(0o777, 0, 0, 1004),
        NodeData::Symlink {
            target: b"bin/sh".to_vec(),
        },
    )
    .unwrap();
    fs.add_node(
        "/dev/console",
        attrs(0o600, 0, 5, 1005),
        NodeData::CharDev { devno: 0x0501 },
    )
    .unwrap();
    fs.add_node(
        "/dev/loop0",
        attrs(0o660, 0, 6, 1006),
        NodeData::BlockDev { devno: 0x0700 },
    )
    .unwrap();
    fs.add_node("/run/fifo", attrs(0o622, 0, 0, 1007), NodeData::Fifo)
        .unwrap();
    fs.add_node("/run/sock", attrs(0o600, 0, 0, 1008), NodeData::Socket)
        .unwrap();

    let (superblock, image) = write_image(&mut fs, |w| w.set_block_size(4096));
    assert_eq!(superblock.inode_count, 12);
    assert_eq!(superblock.mod_time, 1234);

    let (sqfs, root, mut cursor) = parse(image);

    // children sorted by name
    let names: Vec<&[u8]> = root.children.iter().map(|c| c.name.as_slice()).collect();
    assert_eq!(
        names,
        [
            b"bin".as_slice(),
            b"dev".as_slice(),
            b"empty".as_slice(),
            b"link".as_slice(),
            b"run".as_slice()
        ]
    );

    let bin = &root.children[0];
    assert!(bin.is_dir());
    assert_eq!(bin.inode.header.permissions, 0o755);

    let big_node = &bin.children[0];
    assert_eq!(big_node.name, b"big");
    assert_eq!(big_node.inode.header.permissions, 0o644);
    assert_eq!(sqfs.id(big_node.inode.header.uid).unwrap(), 10);
    assert_eq!(sqfs.id(big_node.inode.header.gid).unwrap(), 20);
    assert_eq!(big_node.inode.header.mtime, 1002);
    assert_eq!(sqfs.read_file(&mut cursor, &big_node.inode).unwrap(), big);

    let sh = &bin.children[1];
    assert_eq!(sh.name, b"sh");
    assert_eq!(
        sqfs.read_file(&mut cursor, &sh.inode).unwrap(),
        b"#!shell"
    );

    let dev = &root.children[1];
    let console = &dev.children[0];
    assert_eq!(console.inode.id, InodeId::BasicCharacterDevice);
    let InodeInner::BasicCharacterDevice(console_dev) = &console.inode.inner else {
        panic!("expected char device");
    };
    assert_eq!(console_dev.device_number, 0x0501);
    assert_eq!(sqfs.id(console.inode.header.gid).unwrap(), 5);

    let loop0 = &dev.children[1];
    assert_eq!(loop0.inode.id, InodeId::BasicBlockDevice);
    let InodeInner::BasicBlockDevice(loop_dev) = &loop0.inode.inner else {
        panic!("expected block device");
    };
    assert_eq!(loop_dev.device_number, 0x0700);

    let empty = &root.children[2];
    assert_eq!(sqfs.read_file(&mut cursor, &empty.inode).unwrap(), b"");

    let link = &root.children[3];
    let InodeInner::BasicSymlink(symlink) = &link.inode.inner else {
        panic!("expected symlink");
    };
    assert_eq!(symlink.target_path, b"bin/sh");

    let run = &root.children[4];
    assert_eq!(run.children[0].inode.id, InodeId::BasicNamedPipe);
    assert_eq!(run.children[1].inode.id, InodeId::BasicSocket);

    // implicit directories got the tree defaults
    assert_eq!(dev.inode.header.permissions, 0o755);
    assert_eq!(dev.inode.header.mtime, 1234);
}

#[test]
fn test_identical_files_share_blocks_and_fragment() {
    let contents = vec![0x41u8; 4097];

    let mut fs = Fstree::new(Some("mtime=0")).unwrap();
    fs.add_node("/x", attrs(0o644, 0, 0, 0), file(&contents))
        .unwrap();
    fs.add_node("/y", attrs(0o644, 0, 0, 0), file(&contents))
        .unwrap();

    let mut writer = ImageWriter::default();
    writer.set_block_size(4096);
    let (superblock, stats, image) = writer.write(&mut fs, Cursor::new(vec![])).unwrap();

    assert_eq!(stats.duplicate_blocks, 1);
    assert_eq!(stats.duplicate_frags, 1);
    assert_eq!(superblock.frag_count, 1);
    // one compressed 4 KiB block and one tiny fragment block, nowhere near
    // two raw copies
    assert!(superblock.inode_table - 96 < 4096);

    let (sqfs, root, mut cursor) = parse(image.into_inner());
    assert_eq!(sqfs.fragments.len(), 1);

    let x = &root.children[0];
    let y = &root.children[1];
    let InodeInner::BasicFile(x_file) = &x.inode.inner else {
        panic!("expected file");
    };
    let InodeInner::BasicFile(y_file) = &y.inode.inner else {
        panic!("expected file");
    };

    assert_eq!(x_file.blocks_start, y_file.blocks_start);
    assert_eq!(x_file.block_sizes, y_file.block_sizes);
    assert_eq!(x_file.frag_index, y_file.frag_index);
    assert_eq!(x_file.block_offset, y_file.block_offset);

    assert_eq!(sqfs.read_file(&mut cursor, &x.inode).unwrap(), contents);
    assert_eq!(sqfs.read_file(&mut cursor, &y.inode).unwrap(), contents);
}

#[test]
fn test_directory_with_300_children() {
    let mut fs = Fstree::new(Some("mtime=0")).unwrap();
    for i in 0..300 {
        fs.add_node(
            &format!("/dir/n{i:03}"),
            attrs(0o644, 0, 0, 0),
            file(format!("contents {i}").as_bytes()),
        )
        .unwrap();
    }

    let (_, image) = write_image(&mut fs, |w| w.set_block_size(4096));
    let (sqfs, root, mut cursor) = parse(image);

    let dir = &root.children[0];
    assert_eq!(dir.children.len(), 300);
    for (i, child) in dir.children.iter().enumerate() {
        assert_eq!(child.name, format!("n{i:03}").as_bytes());
        assert_eq!(
            sqfs.read_file(&mut cursor, &child.inode).unwrap(),
            format!("contents {i}").as_bytes()
        );
    }
}

#[test]
fn test_exportable_image() {
    let mut fs = Fstree::new(Some("mtime=0")).unwrap();
    fs.add_node("/a/b", attrs(0o644, 0, 0, 0), file(b"payload"))
        .unwrap();

    let (superblock, image) = write_image(&mut fs, |w| w.set_exportable(true));
    assert!(superblock.nfs_export_table_exists());

    let (sqfs, _, _) = parse(image);
    let export = sqfs.export.as_ref().unwrap();
    assert_eq!(export.len(), sqfs.superblock.inode_count as usize);
    // the root inode is numbered last, its export entry is the root ref
    assert_eq!(
        export[sqfs.superblock.inode_count as usize - 1],
        sqfs.superblock.root_inode
    );
}

#[test]
fn test_compressor_options_record_roundtrip() {
    let mut fs = Fstree::new(Some("mtime=0")).unwrap();
    fs.add_node("/f", attrs(0o644, 0, 0, 0), file(b"hello world"))
        .unwrap();

    let gzip = Gzip {
        compression_level: 3,
        ..Gzip::default()
    };
    let (superblock, image) = write_image(&mut fs, |w| {
        w.set_compressor(Compressor::Gzip, Some(CompressionOptions::Gzip(gzip)))
    });
    assert!(superblock.compressor_options_are_present());

    let (sqfs, _, _) = parse(image);
    assert_eq!(
        sqfs.compression_options,
        Some(CompressionOptions::Gzip(gzip))
    );
}

#[test]
fn test_devblksz_padding() {
    let mut fs = Fstree::new(Some("mtime=0")).unwrap();
    fs.add_node("/f", attrs(0o644, 0, 0, 0), file(b"pad me"))
        .unwrap();

    let (superblock, image) = write_image(&mut fs, |w| w.set_devblksz(4096));
    assert_eq!(image.len() % 4096, 0);
    assert!(superblock.bytes_used <= image.len() as u64);
    assert!(image[superblock.bytes_used as usize..].iter().all(|&b| b == 0));

    // parses fine with the padding in place
    parse(image);
}

#[test]
fn test_id_table_overflow() {
    let mut fs = Fstree::new(Some("mtime=0")).unwrap();

    // 257 directories of 256 fifos, every node with a unique uid: one more
    // than the 65536 the id table can hold
    let mut uid = 1_000_000;
    'outer: for d in 0..258 {
        fs.add_node(
            &format!("/d{d:03}"),
            attrs(0o755, 0, 0, 0),
            NodeData::new_dir(),
        )
        .unwrap();
        for f in 0..256 {
            fs.add_node(
                &format!("/d{d:03}/f{f:03}"),
                attrs(0o644, uid, 0, 0),
                NodeData::Fifo,
            )
            .unwrap();
            uid += 1;
            if uid - 1_000_000 > 0x10000 {
                break 'outer;
            }
        }
    }

    let mut writer = ImageWriter::default();
    let result = writer.write(&mut fs, Cursor::new(vec![]));
    assert!(matches!(result, Err(SqfsError::Overflow(_))));
}

#[cfg(feature = "zstd")]
#[test]
fn test_roundtrip_zstd() {
    let mut fs = Fstree::new(Some("mtime=0")).unwrap();
    let contents = vec![0x5au8; 10_000];
    fs.add_node("/blob", attrs(0o644, 0, 0, 0), file(&contents))
        .unwrap();

    let (_, image) = write_image(&mut fs, |w| {
        w.set_block_size(4096);
        w.set_compressor(Compressor::Zstd, None);
    });
    let (sqfs, root, mut cursor) = parse(image);
    assert_eq!(sqfs.superblock.compressor, Compressor::Zstd);
    assert_eq!(
        sqfs.read_file(&mut cursor, &root.children[0].inode).unwrap(),
        contents
    );
}

#[cfg(feature = "xz")]
#[test]
fn test_roundtrip_xz() {
    let mut fs = Fstree::new(Some("mtime=0")).unwrap();
    let contents: Vec<u8> = (0..9000u32).map(|i| (i % 251) as u8).collect();
    fs.add_node("/blob", attrs(0o644, 0, 0, 0), file(&contents))
        .unwrap();

    let (_, image) = write_image(&mut fs, |w| {
        w.set_block_size(4096);
        w.set_compressor(Compressor::Xz, None);
    });
    let (sqfs, root, mut cursor) = parse(image);
    assert_eq!(sqfs.superblock.compressor, Compressor::Xz);
    assert_eq!(
        sqfs.read_file(&mut cursor, &root.children[0].inode).unwrap(),
        contents
    );
}
