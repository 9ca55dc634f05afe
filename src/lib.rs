//! PE32 DLL Rewriting Library.
//!
//! This library provides the core components for the `dllrw` tool.
//! It is organized into several modules:
//! - `image`: In-memory image model and section editing.
//! - `loader`: Parsing a PE32 file into an `Image`.
//! - `address`: Translation between RVA, VA, file offset and section pointer.
//! - `writer`: Layout finalization, serialization and checksum stamping.
//! - `checksum`: The PE header checksum.
//! - `exports`: Export table access and patching.
//! - `symbol`: Assembler symbol map parsing.
//! - `assembler`: External assembler backends.
//! - `rewriter`: The export-redirection workflow.
//! - `config`: CLI configuration.

pub mod address;
pub mod assembler;
pub mod checksum;
pub mod config;
pub mod error;
pub mod exports;
pub mod image;
pub mod loader;
pub mod rewriter;
pub mod symbol;
pub mod utils;
pub mod writer;

pub use address::{Address, AddressKind};
pub use error::{ImageError, Result};
pub use image::{Image, Section};
