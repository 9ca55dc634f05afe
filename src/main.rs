//! Entry point for the dllrw rewriter.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap` and set up `tracing`.
//! 2. Load the DLL and the user's assembly source.
//! 3. Execute the rewrite steps: analyse, assemble, inject, patch, write.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use dllrw::assembler::nasm::Nasm;
use dllrw::config::Config;
use dllrw::image::Image;
use dllrw::rewriter::{default_output_path, Rewriter};

fn main() -> Result<()> {
    let config = Config::parse();

    let directive = config.log_directive(std::env::var(EnvFilter::DEFAULT_ENV).ok());
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("invalid log filter {:?}", directive))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let output = config
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&config.dll));

    let image = Image::load(&config.dll)
        .with_context(|| format!("failed to load {}", config.dll.display()))?;
    let user_source = std::fs::read_to_string(&config.source)
        .with_context(|| format!("failed to read {}", config.source.display()))?;

    let nasm = Nasm::new(&config.nasm, Duration::from_secs(config.timeout));
    let mut rewriter = Rewriter::new(nasm, image)?.with_section_name(&config.section_name);

    // 1. Assemble wrappers, 2. inject them, 3. patch the export table
    rewriter.run(&user_source, &config.work_dir)?;

    // 4. Write final image
    rewriter.write(&output)?;

    println!("Rewrote {} to {}", config.dll.display(), output.display());
    Ok(())
}
