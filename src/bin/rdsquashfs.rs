use std::fs::{self, File, Permissions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sqfs_ng::inode::InodeInner;
use sqfs_ng::{SqfsError, SqfsNode, Squashfs};

/// List or unpack the contents of a squashfs image
#[derive(Parser)]
#[command(author, version, name = "rdsquashfs", max_term_width = 98)]
struct Args {
    /// Image to read
    image: PathBuf,

    /// Describe every entry instead of only printing paths
    #[arg(short, long)]
    long: bool,

    /// Extract the filesystem into this directory
    #[arg(short, long)]
    unpack: Option<PathBuf>,
}

fn mode_string(id_char: char, permissions: u16) -> String {
    let mut out = String::with_capacity(10);
    out.push(id_char);
    for shift in [6, 3, 0] {
        let bits = (permissions >> shift) & 0o7;
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        out.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    out
}

fn type_char(inner: &InodeInner) -> char {
    match inner {
        InodeInner::BasicDirectory(_) | InodeInner::ExtendedDirectory(_) => 'd',
        InodeInner::BasicFile(_) | InodeInner::ExtendedFile(_) => '-',
        InodeInner::BasicSymlink(_) => 'l',
        InodeInner::BasicBlockDevice(_) => 'b',
        InodeInner::BasicCharacterDevice(_) => 'c',
        InodeInner::BasicNamedPipe(_) => 'p',
        InodeInner::BasicSocket(_) => 's',
    }
}

fn list_tree(sqfs: &Squashfs, node: &SqfsNode, path: &str, long: bool) -> Result<(), SqfsError> {
    let full = if node.name.is_empty() {
        "/".to_string()
    } else {
        format!(
            "{}/{}",
            path.trim_end_matches('/'),
            String::from_utf8_lossy(&node.name)
        )
    };

    if long {
        let header = &node.inode.header;
        println!(
            "{} {:>5} {:>5} {}",
            mode_string(type_char(&node.inode.inner), header.permissions),
            sqfs.id(header.uid)?,
            sqfs.id(header.gid)?,
            full,
        );
    } else {
        println!("{full}");
    }

    for child in &node.children {
        list_tree(sqfs, child, &full, long)?;
    }
    Ok(())
}

fn unpack_tree(
    sqfs: &Squashfs,
    reader: &mut File,
    node: &SqfsNode,
    target: &Path,
) -> Result<(), SqfsError> {
    let target = if node.name.is_empty() {
        target.to_path_buf()
    } else {
        target.join(String::from_utf8_lossy(&node.name).as_ref())
    };
    let permissions = Permissions::from_mode(u32::from(node.inode.header.permissions));

    match &node.inode.inner {
        InodeInner::BasicDirectory(_) | InodeInner::ExtendedDirectory(_) => {
            fs::create_dir_all(&target)?;
            for child in &node.children {
                unpack_tree(sqfs, reader, child, &target)?;
            }
            fs::set_permissions(&target, permissions)?;
        },
        InodeInner::BasicFile(_) | InodeInner::ExtendedFile(_) => {
            let contents = sqfs.read_file(reader, &node.inode)?;
            let mut out = File::create(&target)?;
            out.write_all(&contents)?;
            out.set_permissions(permissions)?;
        },
        InodeInner::BasicSymlink(link) => {
            let link_target = Path::new(std::ffi::OsStr::from_bytes(&link.target_path));
            symlink(link_target, &target)?;
        },
        // recreating device nodes needs privileges we usually don't have
        _ => eprintln!("skipping special file {}", target.display()),
    }
    Ok(())
}

fn run(args: &Args) -> Result<(), SqfsError> {
    let mut file = File::open(&args.image)?;
    let sqfs = Squashfs::from_reader(&mut file)?;
    let root = sqfs.read_tree()?;

    match &args.unpack {
        Some(target) => unpack_tree(&sqfs, &mut file, &root, target),
        None => list_tree(&sqfs, &root, "", args.long),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("rdsquashfs: {error}");
            ExitCode::FAILURE
        },
    }
}
