//! End to end through the command line tools

use std::fs;

use assert_cmd::Command;

#[test]
fn test_gensquashfs_and_rdsquashfs_listing() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("out.squashfs");

    fs::create_dir(dir.path().join("input")).unwrap();
    fs::write(dir.path().join("input/hello.bin"), b"hello from disk").unwrap();

    let manifest = "\
# demo image
/etc dir 0755 0 0
/etc/motd file 0644 0 0 input/hello.bin
/etc/issue slink 0777 0 0 motd
/var dir 0755 1000 100
";
    let manifest_path = dir.path().join("layout.txt");
    fs::write(&manifest_path, manifest).unwrap();

    Command::cargo_bin("gensquashfs")
        .unwrap()
        .arg(&image)
        .arg("--pack-file")
        .arg(&manifest_path)
        .arg("--pack-dir")
        .arg(dir.path())
        .arg("--block-size")
        .arg("4K")
        .arg("--quiet")
        .assert()
        .success();

    let listing = Command::cargo_bin("rdsquashfs")
        .unwrap()
        .arg(&image)
        .assert()
        .success();
    let stdout = String::from_utf8(listing.get_output().stdout.clone()).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, ["/", "/etc", "/etc/issue", "/etc/motd", "/var"]);

    // unpack and compare the file contents
    let out_dir = dir.path().join("unpacked");
    Command::cargo_bin("rdsquashfs")
        .unwrap()
        .arg(&image)
        .arg("--unpack")
        .arg(&out_dir)
        .assert()
        .success();
    assert_eq!(
        fs::read(out_dir.join("etc/motd")).unwrap(),
        b"hello from disk"
    );
    assert_eq!(
        fs::read_link(out_dir.join("etc/issue")).unwrap().as_os_str(),
        "motd"
    );
}

#[test]
fn test_gensquashfs_rejects_manifest_collision() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("out.squashfs");

    let manifest = "/a dir 0755 0 0\n/a dir 0755 0 0\n";
    let manifest_path = dir.path().join("layout.txt");
    fs::write(&manifest_path, manifest).unwrap();

    Command::cargo_bin("gensquashfs")
        .unwrap()
        .arg(&image)
        .arg("--pack-file")
        .arg(&manifest_path)
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_gensquashfs_packs_directory() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("out.squashfs");

    let tree = dir.path().join("tree");
    fs::create_dir_all(tree.join("nested")).unwrap();
    fs::write(tree.join("nested/data"), vec![7u8; 10_000]).unwrap();

    Command::cargo_bin("gensquashfs")
        .unwrap()
        .arg(&image)
        .arg("--pack-dir")
        .arg(&tree)
        .arg("--quiet")
        .assert()
        .success();

    let out_dir = dir.path().join("unpacked");
    Command::cargo_bin("rdsquashfs")
        .unwrap()
        .arg(&image)
        .arg("--unpack")
        .arg(&out_dir)
        .assert()
        .success();
    assert_eq!(fs::read(out_dir.join("nested/data")).unwrap(), vec![7u8; 10_000]);
}
