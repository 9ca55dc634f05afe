//! Error types for the image library.
//!
//! Every fallible operation on an [`Image`](crate::image::Image) reports one
//! of these variants. Whether a failure should end the process is decided by
//! the caller; the library never aborts.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::address::{Address, AddressKind};

/// Errors raised while loading, translating, editing or writing an image.
#[derive(Debug, Error)]
pub enum ImageError {
    /// A header or field is structurally invalid.
    #[error("malformed image: {0}")]
    MalformedImage(String),

    /// The value lies outside the image bounds for its address space.
    #[error("{kind:?} address {value:#x} is outside the image")]
    AddressOutOfRange { kind: AddressKind, value: u64 },

    /// No section contains the address.
    #[error("{0} is not mapped by any section")]
    AddressNotMapped(Address),

    /// A record crosses a section or file boundary that cannot be followed.
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    #[error("section index {index} out of range ({count} sections)")]
    SectionIndexOutOfRange { index: usize, count: usize },

    /// The image has no export data directory.
    #[error("image has no export table")]
    NoExportTable,

    #[error("I/O failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ImageError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedImage(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedLayout(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = ImageError> = std::result::Result<T, E>;
