use std::fs::OpenOptions;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sqfs_ng::compressor::{parse_comp_extra, Compressor};
use sqfs_ng::fstree::Fstree;
use sqfs_ng::{ImageWriter, SqfsError, DEFAULT_MAX_BACKLOG};

/// Create a squashfs image from a manifest file or a directory
#[derive(Parser)]
#[command(author, version, name = "gensquashfs", max_term_width = 98)]
struct Args {
    /// Output image
    image: PathBuf,

    /// Read the filesystem layout from a manifest file
    #[arg(short = 'F', long = "pack-file")]
    pack_file: Option<PathBuf>,

    /// Pack the given directory; with --pack-file it only anchors relative
    /// input paths
    #[arg(short = 'D', long = "pack-dir")]
    pack_dir: Option<PathBuf>,

    /// Default attributes (mode=...,uid=...,gid=...,mtime=...) for the root
    /// and implicitly created directories
    #[arg(long)]
    defaults: Option<String>,

    /// Compressor: gzip, xz, lzo, lz4 or zstd
    #[arg(short = 'c', long = "comp", default_value = "gzip", value_parser = parse_compressor)]
    comp: Compressor,

    /// Extra compressor options, e.g. level=9,window=15 or dictsize=50%
    #[arg(short = 'X', long = "comp-extra")]
    comp_extra: Option<String>,

    /// Block size, optionally with a K or M suffix
    #[arg(short = 'b', long = "block-size", default_value = "128K", value_parser = parse_size)]
    block_size: u32,

    /// Number of compressor worker threads
    #[arg(short = 'j', long = "num-workers", default_value_t = 1)]
    num_workers: usize,

    /// Maximum number of blocks in flight in the compressor pipeline
    #[arg(long = "backlog", default_value_t = DEFAULT_MAX_BACKLOG)]
    backlog: usize,

    /// Pad the image to a multiple of this device block size
    #[arg(long = "devblksz", default_value = "4K", value_parser = parse_size)]
    devblksz: u32,

    /// Generate an NFS export table
    #[arg(long)]
    exportable: bool,

    /// Do not print packing statistics
    #[arg(short, long)]
    quiet: bool,
}

fn parse_compressor(s: &str) -> Result<Compressor, String> {
    match s {
        "gzip" => Ok(Compressor::Gzip),
        "xz" => Ok(Compressor::Xz),
        "lzo" => Ok(Compressor::Lzo),
        "lz4" => Ok(Compressor::Lz4),
        "zstd" => Ok(Compressor::Zstd),
        _ => Err(format!("unknown compressor {s:?}")),
    }
}

fn parse_size(s: &str) -> Result<u32, String> {
    let (digits, multiplier) = match s.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&s[..s.len() - 1], 1024),
        Some(b'm') | Some(b'M') => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    let value: u32 = digits.parse().map_err(|_| format!("bad size {s:?}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size {s:?} too large"))
}

fn build_tree(args: &Args) -> Result<Fstree, SqfsError> {
    let mut fs = Fstree::new(args.defaults.as_deref())?;

    match (&args.pack_file, &args.pack_dir) {
        (Some(pack_file), _) => {
            let reader = BufReader::new(std::fs::File::open(pack_file)?);
            fs.from_file(reader)?;
        },
        (None, Some(pack_dir)) => fs.from_dir(pack_dir)?,
        (None, None) => {
            return Err(SqfsError::ArgInvalid(
                "need --pack-file or --pack-dir",
            ))
        },
    }
    Ok(fs)
}

fn run(args: &Args) -> Result<(), SqfsError> {
    let mut fs = build_tree(args)?;

    let mut writer = ImageWriter::default();
    writer.set_block_size(args.block_size);
    writer.set_num_workers(args.num_workers);
    writer.set_max_backlog(args.backlog);
    writer.set_devblksz(u64::from(args.devblksz));
    writer.set_exportable(args.exportable);

    let options = match &args.comp_extra {
        Some(extra) => parse_comp_extra(args.comp, extra, args.block_size)?,
        None => None,
    };
    writer.set_compressor(args.comp, options);

    // input paths in a manifest are relative to the pack directory, or to
    // the manifest's location when none is given
    if let Some(pack_dir) = &args.pack_dir {
        writer.set_pack_dir(pack_dir.clone());
    } else if let Some(parent) = args.pack_file.as_deref().and_then(Path::parent) {
        if !parent.as_os_str().is_empty() {
            writer.set_pack_dir(parent.to_path_buf());
        }
    }

    let out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.image)?;
    let (superblock, stats, _) = writer.write(&mut fs, out)?;

    if !args.quiet {
        println!("files packed:      {}", stats.file_count);
        println!("bytes read:        {}", stats.bytes_read);
        println!("data blocks:       {}", stats.blocks_written);
        println!("fragments:         {}", stats.frag_count);
        println!("fragment blocks:   {}", stats.frag_blocks_written);
        println!("duplicate blocks:  {}", stats.duplicate_blocks);
        println!("duplicate frags:   {}", stats.duplicate_frags);
        println!("inodes:            {}", superblock.inode_count);
        println!("image size:        {}", superblock.bytes_used);
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("gensquashfs: {error}");
            ExitCode::FAILURE
        },
    }
}
