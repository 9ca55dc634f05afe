//! Configuration module.
//!
//! This module defines the command-line interface (CLI) of the rewriter using `clap`.
//! It handles the input DLL, the user's assembly source and the output path.

use clap::Parser;
use std::path::PathBuf;

use crate::rewriter::DEFAULT_SECTION_NAME;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Redirects the exports of a 32-bit DLL through injected assembly.
///
/// The user's source must define a `redirect` macro taking the original
/// function address and the export index, and an `entry_<index>` label for
/// every export it wraps.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// DLL to rewrite
    pub dll: PathBuf,

    /// Assembly source with the `redirect` macro
    pub source: PathBuf,

    /// Output file
    #[arg(short, long, help = "Path to the output DLL (default: <dll>.rebuilt.dll)")]
    pub output: Option<PathBuf>,

    /// Assembler executable
    #[arg(long, default_value = "nasm")]
    pub nasm: PathBuf,

    /// Seconds to wait for the assembler
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,

    /// Directory for the generated .asm/.bin/.map files
    #[arg(long, default_value = ".")]
    pub work_dir: PathBuf,

    /// Name of the injected section
    #[arg(long, default_value = DEFAULT_SECTION_NAME)]
    pub section_name: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, help = "Set the logging level (default: $RUST_LOG, then info)")]
    pub log_level: Option<String>,
}

impl Config {
    /// Filter directive for the subscriber: `--log-level` when given, then
    /// `env` (the value of `RUST_LOG`), then [`DEFAULT_LOG_LEVEL`].
    pub fn log_directive(&self, env: Option<String>) -> String {
        self.log_level
            .clone()
            .or(env)
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
    }
}
