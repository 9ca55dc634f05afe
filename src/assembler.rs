//! Assembler abstraction.
//!
//! The rewriter turns generated assembly into machine code through the
//! `Assembler` trait, so the external tool can be swapped (or faked in
//! tests) without touching the image-editing logic.

use anyhow::Result;
use std::path::Path;

pub mod nasm;

/// An external assembler producing a flat binary.
pub trait Assembler {
    /// Assembles `source` into a flat binary at `output`.
    ///
    /// Any side outputs requested by directives in the source (such as a
    /// symbol map) are written by the assembler itself. Returns an error if
    /// the tool fails or `output` was not produced.
    fn assemble(&self, source: &Path, output: &Path) -> Result<()>;
}
