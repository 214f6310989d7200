//! Types of supported compression algorithms
//!
//! Every algorithm carries an optional on-disk option record. The record is
//! written right after the superblock as a single uncompressed metadata block,
//! but only when the configuration differs from the algorithm's defaults; the
//! `COMPRESSOR_OPTIONS` superblock flag mirrors whether that happened.

use std::io::{Cursor, Read, Write};

use deku::bitvec::BitVec;
use deku::ctx::Endian;
use deku::prelude::*;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use tracing::instrument;
#[cfg(feature = "xz")]
use xz2::read::{XzDecoder, XzEncoder};
#[cfg(feature = "xz")]
use xz2::stream::{Check, Filters, LzmaOptions, Stream};

use crate::error::SqfsError;
use crate::metadata;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite, Default)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[deku(type = "u16")]
#[rustfmt::skip]
pub enum Compressor {
    None = 0,
    #[default]
    Gzip = 1,
    Lzma = 2,
    Lzo =  3,
    Xz =   4,
    Lz4 =  5,
    Zstd = 6,
}

impl Compressor {
    /// Size of the option record, without the metadata header
    pub(crate) fn options_size(self) -> usize {
        match self {
            Compressor::Gzip => 8,
            Compressor::Lzo => 8,
            Compressor::Xz => 8,
            Compressor::Lz4 => 8,
            Compressor::Zstd => 4,
            Compressor::Lzma | Compressor::None => 0,
        }
    }
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(
    endian = "endian",
    ctx = "endian: deku::ctx::Endian, compressor: Compressor"
)]
#[deku(id = "compressor")]
pub enum CompressionOptions {
    #[deku(id = "Compressor::Gzip")]
    Gzip(Gzip),

    #[deku(id = "Compressor::Lzo")]
    Lzo(Lzo),

    #[deku(id = "Compressor::Xz")]
    Xz(Xz),

    #[deku(id = "Compressor::Lz4")]
    Lz4(Lz4),

    #[deku(id = "Compressor::Zstd")]
    Zstd(Zstd),

    #[deku(id = "Compressor::Lzma")]
    Lzma,
}

impl CompressionOptions {
    fn validate(&self) -> Result<(), SqfsError> {
        match self {
            CompressionOptions::Gzip(gzip) => {
                if !(Gzip::MIN_LEVEL..=Gzip::MAX_LEVEL).contains(&gzip.compression_level)
                    || !(Gzip::MIN_WINDOW..=Gzip::MAX_WINDOW).contains(&gzip.window_size)
                    || gzip.strategies & !Gzip::ALL_STRATEGIES != 0
                {
                    return Err(SqfsError::InvalidCompressionOption);
                }
            },
            CompressionOptions::Lzo(lzo) => {
                if lzo.algorithm > Lzo::ALG_LZO1X_999
                    || !(Lzo::MIN_LEVEL..=Lzo::MAX_LEVEL).contains(&lzo.compression_level)
                {
                    return Err(SqfsError::InvalidCompressionOption);
                }
            },
            CompressionOptions::Xz(xz) => {
                if xz.dictionary_size < 8192 || xz.filters & !Xz::ALL_FILTERS != 0 {
                    return Err(SqfsError::InvalidCompressionOption);
                }
            },
            CompressionOptions::Lz4(lz4) => {
                if lz4.version != Lz4::VERSION || lz4.flags & !Lz4::FLAG_HC != 0 {
                    return Err(SqfsError::InvalidCompressionOption);
                }
            },
            CompressionOptions::Zstd(zstd) => {
                if !(Zstd::MIN_LEVEL..=Zstd::MAX_LEVEL).contains(&zstd.compression_level) {
                    return Err(SqfsError::InvalidCompressionOption);
                }
            },
            CompressionOptions::Lzma => {},
        }
        Ok(())
    }
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Gzip {
    pub compression_level: u32,
    pub window_size: u16,
    pub strategies: u16,
}

impl Gzip {
    pub const MIN_LEVEL: u32 = 1;
    pub const MAX_LEVEL: u32 = 9;
    pub const DEFAULT_LEVEL: u32 = 9;
    pub const MIN_WINDOW: u16 = 8;
    pub const MAX_WINDOW: u16 = 15;
    pub const DEFAULT_WINDOW: u16 = 15;

    pub const STRATEGY_DEFAULT: u16 = 0x01;
    pub const STRATEGY_FILTERED: u16 = 0x02;
    pub const STRATEGY_HUFFMAN: u16 = 0x04;
    pub const STRATEGY_RLE: u16 = 0x08;
    pub const STRATEGY_FIXED: u16 = 0x10;
    pub const ALL_STRATEGIES: u16 = 0x1f;
}

impl Default for Gzip {
    fn default() -> Self {
        Self {
            compression_level: Self::DEFAULT_LEVEL,
            window_size: Self::DEFAULT_WINDOW,
            strategies: 0,
        }
    }
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Lzo {
    pub algorithm: u32,
    pub compression_level: u32,
}

impl Lzo {
    pub const ALG_LZO1X_1: u32 = 0;
    pub const ALG_LZO1X_1_11: u32 = 1;
    pub const ALG_LZO1X_1_12: u32 = 2;
    pub const ALG_LZO1X_1_15: u32 = 3;
    pub const ALG_LZO1X_999: u32 = 4;

    pub const MIN_LEVEL: u32 = 1;
    pub const MAX_LEVEL: u32 = 9;
    pub const DEFAULT_LEVEL: u32 = 8;
}

impl Default for Lzo {
    fn default() -> Self {
        Self {
            algorithm: Self::ALG_LZO1X_999,
            compression_level: Self::DEFAULT_LEVEL,
        }
    }
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Xz {
    pub dictionary_size: u32,
    /// Bitmask of the `FILTER_*` branch/call/jump filters to try
    pub filters: u32,
}

impl Xz {
    pub const FILTER_X86: u32 = 0x01;
    pub const FILTER_POWERPC: u32 = 0x02;
    pub const FILTER_IA64: u32 = 0x04;
    pub const FILTER_ARM: u32 = 0x08;
    pub const FILTER_ARMTHUMB: u32 = 0x10;
    pub const FILTER_SPARC: u32 = 0x20;
    pub const ALL_FILTERS: u32 = 0x3f;
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Lz4 {
    pub version: u32,
    pub flags: u32,
}

impl Lz4 {
    pub const VERSION: u32 = 1;
    pub const FLAG_HC: u32 = 0x01;
}

impl Default for Lz4 {
    fn default() -> Self {
        Self {
            version: Self::VERSION,
            flags: 0,
        }
    }
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Zstd {
    pub compression_level: u32,
}

impl Zstd {
    pub const MIN_LEVEL: u32 = 1;
    pub const MAX_LEVEL: u32 = 22;
    pub const DEFAULT_LEVEL: u32 = 15;
}

impl Default for Zstd {
    fn default() -> Self {
        Self {
            compression_level: Self::DEFAULT_LEVEL,
        }
    }
}

/// A configured codec for one image
///
/// [`Clone`] deep-copies the configuration, which is how every worker thread
/// of the data writer gets its own compressor state.
#[derive(Debug, Clone, Copy)]
pub struct FilesystemCompressor {
    pub id: Compressor,
    pub options: Option<CompressionOptions>,
    block_size: u32,
}

impl FilesystemCompressor {
    pub fn new(
        id: Compressor,
        options: Option<CompressionOptions>,
        block_size: u32,
    ) -> Result<Self, SqfsError> {
        let supported = match id {
            Compressor::Gzip => true,
            Compressor::Xz => cfg!(feature = "xz"),
            Compressor::Lzo => cfg!(feature = "lzo"),
            Compressor::Zstd => cfg!(feature = "zstd"),
            Compressor::Lz4 => cfg!(feature = "lz4"),
            Compressor::Lzma | Compressor::None => false,
        };
        if !supported {
            return Err(SqfsError::UnsupportedCompression(id));
        }

        if let Some(options) = &options {
            let matches = matches!(
                (id, options),
                (Compressor::Gzip, CompressionOptions::Gzip(_))
                    | (Compressor::Lzo, CompressionOptions::Lzo(_))
                    | (Compressor::Xz, CompressionOptions::Xz(_))
                    | (Compressor::Lz4, CompressionOptions::Lz4(_))
                    | (Compressor::Zstd, CompressionOptions::Zstd(_))
            );
            if !matches {
                return Err(SqfsError::InvalidCompressionOption);
            }
            options.validate()?;
        }

        Ok(Self {
            id,
            options,
            block_size,
        })
    }

    /// Compress `bytes`, returning `None` when the result would not be
    /// smaller than the input (the caller then stores the block raw).
    #[instrument(skip_all)]
    pub fn compress(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>, SqfsError> {
        let buf = match self.id {
            Compressor::Gzip => {
                let compression_level = match self.options {
                    Some(CompressionOptions::Gzip(gzip)) => gzip.compression_level,
                    _ => Gzip::DEFAULT_LEVEL,
                };

                // window_size and strategies are recorded in the option
                // blob but zlib is driven with its defaults here
                let mut encoder =
                    ZlibEncoder::new(Cursor::new(bytes), Compression::new(compression_level));
                let mut buf = vec![];
                encoder.read_to_end(&mut buf)?;
                buf
            },
            #[cfg(feature = "xz")]
            Compressor::Xz => self.compress_xz(bytes)?,
            #[cfg(feature = "lzo")]
            Compressor::Lzo => {
                let mut lzo = rust_lzo::LZOContext::new();
                let mut buf = vec![0; rust_lzo::worst_compress(bytes.len())];
                let err = lzo.compress(bytes, &mut buf);
                if err != rust_lzo::LZOError::OK {
                    return Err(SqfsError::Compressor);
                }
                buf
            },
            #[cfg(feature = "zstd")]
            Compressor::Zstd => {
                let compression_level = match self.options {
                    Some(CompressionOptions::Zstd(zstd)) => zstd.compression_level,
                    _ => Zstd::DEFAULT_LEVEL,
                };
                zstd::bulk::compress(bytes, compression_level as i32)?
            },
            #[cfg(feature = "lz4")]
            Compressor::Lz4 => lz4_flex::block::compress(bytes),
            _ => return Err(SqfsError::UnsupportedCompression(self.id)),
        };

        if buf.is_empty() || buf.len() >= bytes.len() {
            return Ok(None);
        }
        Ok(Some(buf))
    }

    /// Try the plain lzma2 chain plus every filter enabled in the option
    /// record, keeping the smallest output
    #[cfg(feature = "xz")]
    fn compress_xz(&self, bytes: &[u8]) -> Result<Vec<u8>, SqfsError> {
        let (dict_size, filter_mask) = match self.options {
            Some(CompressionOptions::Xz(xz)) => (xz.dictionary_size, xz.filters),
            _ => (self.block_size, 0),
        };

        let mut opts = LzmaOptions::new_preset(6).map_err(|_| SqfsError::Compressor)?;
        opts.dict_size(dict_size);

        let mut best: Option<Vec<u8>> = None;
        for bcj in [
            0,
            Xz::FILTER_X86,
            Xz::FILTER_POWERPC,
            Xz::FILTER_IA64,
            Xz::FILTER_ARM,
            Xz::FILTER_ARMTHUMB,
            Xz::FILTER_SPARC,
        ] {
            if bcj != 0 && filter_mask & bcj == 0 {
                continue;
            }

            let mut filters = Filters::new();
            match bcj {
                Xz::FILTER_X86 => {
                    filters.x86();
                },
                Xz::FILTER_POWERPC => {
                    filters.powerpc();
                },
                Xz::FILTER_IA64 => {
                    filters.ia64();
                },
                Xz::FILTER_ARM => {
                    filters.arm();
                },
                Xz::FILTER_ARMTHUMB => {
                    filters.arm_thumb();
                },
                Xz::FILTER_SPARC => {
                    filters.sparc();
                },
                _ => {},
            }
            filters.lzma2(&opts);

            let stream = Stream::new_stream_encoder(&filters, Check::Crc32)
                .map_err(|_| SqfsError::Compressor)?;
            let mut encoder = XzEncoder::new_stream(Cursor::new(bytes), stream);
            let mut buf = vec![];
            encoder.read_to_end(&mut buf)?;

            if best.as_ref().map(|b| buf.len() < b.len()).unwrap_or(true) {
                best = Some(buf);
            }
        }

        best.ok_or(SqfsError::Compressor)
    }

    /// Decompress `bytes` into `out`, returning the uncompressed size
    #[instrument(skip_all)]
    pub fn decompress(&self, bytes: &[u8], out: &mut Vec<u8>) -> Result<usize, SqfsError> {
        let limit = (self.block_size as usize).max(metadata::METADATA_MAXSIZE);
        match self.id {
            Compressor::Gzip => {
                let mut decoder = ZlibDecoder::new(bytes);
                decoder.read_to_end(out)?;
            },
            #[cfg(feature = "xz")]
            Compressor::Xz => {
                let mut decoder = XzDecoder::new(bytes);
                decoder.read_to_end(out)?;
            },
            #[cfg(feature = "lzo")]
            Compressor::Lzo => {
                // decompress appends to `out` like the other codecs
                let mut buf = vec![0u8; limit];
                let (decomp, err) = rust_lzo::LZOContext::decompress_to_slice(bytes, &mut buf);
                let out_size = decomp.len();
                if err != rust_lzo::LZOError::OK {
                    return Err(SqfsError::CorruptedSquashfs);
                }
                buf.truncate(out_size);
                out.extend_from_slice(&buf);
            },
            #[cfg(feature = "zstd")]
            Compressor::Zstd => {
                let buf = zstd::bulk::decompress(bytes, limit)?;
                out.extend_from_slice(&buf);
            },
            #[cfg(feature = "lz4")]
            Compressor::Lz4 => {
                let buf = lz4_flex::block::decompress(bytes, limit)
                    .map_err(|_| SqfsError::CorruptedSquashfs)?;
                out.extend_from_slice(&buf);
            },
            _ => return Err(SqfsError::UnsupportedCompression(self.id)),
        }
        Ok(out.len())
    }

    /// Serialize the option record as a single uncompressed metadata block.
    ///
    /// Nothing is written when the configuration matches the algorithm
    /// defaults; returns whether bytes were produced so the caller can set
    /// the `COMPRESSOR_OPTIONS` superblock flag to match.
    pub fn write_options<W: Write>(&self, w: &mut W) -> Result<bool, SqfsError> {
        let options = match self.options {
            Some(options) if !self.options_are_default(&options) => options,
            _ => return Ok(false),
        };

        let mut bv = BitVec::new();
        options.write(&mut bv, (Endian::Little, self.id))?;
        let bytes = bv.as_raw_slice();

        let mut header = BitVec::new();
        metadata::set_if_uncompressed(bytes.len() as u16).write(&mut header, Endian::Little)?;
        w.write_all(header.as_raw_slice())?;
        w.write_all(bytes)?;
        Ok(true)
    }

    fn options_are_default(&self, options: &CompressionOptions) -> bool {
        match options {
            CompressionOptions::Gzip(gzip) => *gzip == Gzip::default(),
            CompressionOptions::Lzo(lzo) => *lzo == Lzo::default(),
            // the xz dictionary size defaults to the block size
            CompressionOptions::Xz(xz) => {
                xz.filters == 0 && xz.dictionary_size == self.block_size
            },
            CompressionOptions::Lz4(lz4) => *lz4 == Lz4::default(),
            CompressionOptions::Zstd(zstd) => *zstd == Zstd::default(),
            CompressionOptions::Lzma => true,
        }
    }

    /// Parse an option record read back from an image
    pub fn read_options(id: Compressor, bytes: &[u8]) -> Result<CompressionOptions, SqfsError> {
        let bv = BitVec::from_slice(bytes);
        let (_, options) = CompressionOptions::read(&bv, (Endian::Little, id))?;
        options.validate()?;
        Ok(options)
    }
}

/// Parse a `--comp-extra` style `key=value[,key=value...]` string into an
/// option record. Bare words select gzip strategies, xz bcj filters or the
/// lz4 `hc` mode. Returns `None` for an empty string.
pub fn parse_comp_extra(
    id: Compressor,
    extra: &str,
    block_size: u32,
) -> Result<Option<CompressionOptions>, SqfsError> {
    if extra.is_empty() {
        return Ok(None);
    }

    let mut gzip = Gzip::default();
    let mut lzo = Lzo::default();
    let mut xz = Xz {
        dictionary_size: block_size,
        filters: 0,
    };
    let mut lz4 = Lz4::default();
    let mut zstd = Zstd::default();

    for part in extra.split(',') {
        let (key, value) = match part.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (part, None),
        };

        match (id, key) {
            (Compressor::Gzip | Compressor::Lzo | Compressor::Zstd, "level") => {
                let level: u32 = value
                    .and_then(|v| v.parse().ok())
                    .ok_or(SqfsError::ArgInvalid("level"))?;
                match id {
                    Compressor::Gzip => gzip.compression_level = level,
                    Compressor::Lzo => lzo.compression_level = level,
                    Compressor::Zstd => zstd.compression_level = level,
                    _ => unreachable!(),
                }
            },
            (Compressor::Gzip, "window") => {
                gzip.window_size = value
                    .and_then(|v| v.parse().ok())
                    .ok_or(SqfsError::ArgInvalid("window"))?;
            },
            (Compressor::Gzip, "default") => gzip.strategies |= Gzip::STRATEGY_DEFAULT,
            (Compressor::Gzip, "filtered") => gzip.strategies |= Gzip::STRATEGY_FILTERED,
            (Compressor::Gzip, "huffman") => gzip.strategies |= Gzip::STRATEGY_HUFFMAN,
            (Compressor::Gzip, "rle") => gzip.strategies |= Gzip::STRATEGY_RLE,
            (Compressor::Gzip, "fixed") => gzip.strategies |= Gzip::STRATEGY_FIXED,
            (Compressor::Lzo, "algorithm") => {
                lzo.algorithm = match value {
                    Some("lzo1x_1") => Lzo::ALG_LZO1X_1,
                    Some("lzo1x_1_11") => Lzo::ALG_LZO1X_1_11,
                    Some("lzo1x_1_12") => Lzo::ALG_LZO1X_1_12,
                    Some("lzo1x_1_15") => Lzo::ALG_LZO1X_1_15,
                    Some("lzo1x_999") => Lzo::ALG_LZO1X_999,
                    _ => return Err(SqfsError::ArgInvalid("algorithm")),
                };
            },
            (Compressor::Xz, "dictsize") => {
                xz.dictionary_size = parse_size_value(
                    value.ok_or(SqfsError::ArgInvalid("dictsize"))?,
                    block_size,
                )?;
            },
            (Compressor::Xz, "x86") => xz.filters |= Xz::FILTER_X86,
            (Compressor::Xz, "powerpc") => xz.filters |= Xz::FILTER_POWERPC,
            (Compressor::Xz, "ia64") => xz.filters |= Xz::FILTER_IA64,
            (Compressor::Xz, "arm") => xz.filters |= Xz::FILTER_ARM,
            (Compressor::Xz, "armthumb") => xz.filters |= Xz::FILTER_ARMTHUMB,
            (Compressor::Xz, "sparc") => xz.filters |= Xz::FILTER_SPARC,
            (Compressor::Lz4, "hc") => lz4.flags |= Lz4::FLAG_HC,
            _ => return Err(SqfsError::ArgInvalid("unknown compressor option")),
        }
    }

    let options = match id {
        Compressor::Gzip => CompressionOptions::Gzip(gzip),
        Compressor::Lzo => CompressionOptions::Lzo(lzo),
        Compressor::Xz => CompressionOptions::Xz(xz),
        Compressor::Lz4 => CompressionOptions::Lz4(lz4),
        Compressor::Zstd => CompressionOptions::Zstd(zstd),
        _ => return Err(SqfsError::UnsupportedCompression(id)),
    };
    options.validate()?;
    Ok(Some(options))
}

/// Number with an optional `K`/`M` suffix, or `%` of the block size
fn parse_size_value(value: &str, block_size: u32) -> Result<u32, SqfsError> {
    let (digits, suffix) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => value.split_at(pos),
        None => (value, ""),
    };
    let num: u32 = digits.parse().map_err(|_| SqfsError::ArgInvalid("size"))?;

    match suffix {
        "" => Ok(num),
        "k" | "K" => Ok(num << 10),
        "m" | "M" => Ok(num << 20),
        "%" => Ok((num * block_size) / 100),
        _ => Err(SqfsError::ArgInvalid("size suffix")),
    }
}
