//! Errors

use std::{io, string};

use thiserror::Error;

use crate::compressor::Compressor;

/// Errors generated from library
#[derive(Error, Debug)]
pub enum SqfsError {
    #[error("std io error: {0}")]
    StdIo(#[from] io::Error),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("string error: {0:?}")]
    StringUtf8(#[from] string::FromUtf8Error),

    #[error("string error: {0:?}")]
    StrUtf8(#[from] std::str::Utf8Error),

    #[error("unsupported compressor: {0:?}")]
    UnsupportedCompression(Compressor),

    #[error("invalid compression option")]
    InvalidCompressionOption,

    #[error("compressor failure")]
    Compressor,

    #[error("corrupted or invalid squashfs image")]
    CorruptedSquashfs,

    #[error("invalid argument: {0}")]
    ArgInvalid(&'static str),

    #[error("entry already exists: {0}")]
    Exists(String),

    #[error("not a directory: {0}")]
    NotDir(String),

    #[error("not a regular file: {0}")]
    NotFile(String),

    #[error("no such entry: {0}")]
    NoEntry(String),

    #[error("overflow: {0}")]
    Overflow(&'static str),

    #[error("manifest line {line}: {msg}")]
    Manifest { line: usize, msg: &'static str },

    #[error("data writer cancelled by previous error")]
    Cancelled,
}

impl From<SqfsError> for io::Error {
    fn from(value: SqfsError) -> Self {
        use SqfsError::*;
        match value {
            StdIo(io) => io,
            Deku(e) => Self::new(io::ErrorKind::InvalidData, e),
            StringUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            StrUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            e @ (UnsupportedCompression(_) | InvalidCompressionOption) => {
                Self::new(io::ErrorKind::Unsupported, e)
            },
            e @ NoEntry(_) => Self::new(io::ErrorKind::NotFound, e),
            e @ (Compressor
            | CorruptedSquashfs
            | ArgInvalid(_)
            | Exists(_)
            | NotDir(_)
            | NotFile(_)
            | Overflow(_)
            | Manifest { .. }
            | Cancelled) => Self::new(io::ErrorKind::InvalidData, e),
        }
    }
}
