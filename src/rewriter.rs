//! DLL rewrite orchestration.
//!
//! The `Rewriter` drives the whole workflow on a loaded image:
//! 1. Analysis: find the next free RVA and the exports that point at code.
//! 2. Generation: emit an assembly file wrapping the user's source with one
//!    `redirect` macro call per export.
//! 3. Assembly: run the external assembler to get machine code and a map.
//! 4. Injection: append the code as a new executable section.
//! 5. Patching: point each redirected export at its `entry_<index>` label.
//! 6. Output: finalize and write the image.

use anyhow::{anyhow, Context, Result};
use object::pe;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::assembler::Assembler;
use crate::exports::{ExportEntry, ExportTable};
use crate::image::Image;
use crate::symbol::SymbolMap;
use crate::utils::align_up;

/// Base name of the generated `.asm`, `.bin` and `.map` files.
pub const GENERATED_PREFIX: &str = "__tmp_generated";
/// Appended to the input path when no output path is given.
pub const OUTPUT_SUFFIX: &str = ".rebuilt.dll";
pub const DEFAULT_SECTION_NAME: &str = "wrappers";

/// Deletes a leftover file from an earlier run.
fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(e).with_context(|| format!("failed to remove {}", path.display()))
        }
        _ => Ok(()),
    }
}

/// Output path used when none is given: the input path plus [`OUTPUT_SUFFIX`].
pub fn default_output_path(input: &Path) -> PathBuf {
    let mut path = input.as_os_str().to_os_string();
    path.push(OUTPUT_SUFFIX);
    PathBuf::from(path)
}

/// Machine code produced by the assembler, with its symbol map.
#[derive(Debug)]
pub struct Assembled {
    pub code: Vec<u8>,
    pub symbols: SymbolMap,
}

pub struct Rewriter<A: Assembler> {
    assembler: A,
    image: Image,
    exports: ExportTable,
    redirects: Vec<ExportEntry>,
    free_rva: u32,
    section_name: String,
}

impl<A: Assembler> Rewriter<A> {
    pub fn new(assembler: A, image: Image) -> Result<Self> {
        let free_rva = image.next_free_rva()?;
        let exports = ExportTable::locate(&image).context("failed to read export table")?;
        let redirects = exports.redirectable(&image)?;
        info!(
            "{} of {} exports will be redirected; new code at RVA 0x{:08x}",
            redirects.len(),
            exports.number_of_functions(),
            free_rva
        );
        if redirects.is_empty() {
            warn!("no exported function points at code");
        }
        Ok(Self {
            assembler,
            image,
            exports,
            redirects,
            free_rva,
            section_name: DEFAULT_SECTION_NAME.to_string(),
        })
    }

    pub fn with_section_name(mut self, name: impl Into<String>) -> Self {
        self.section_name = name.into();
        self
    }

    pub fn free_rva(&self) -> u32 {
        self.free_rva
    }

    pub fn redirects(&self) -> &[ExportEntry] {
        &self.redirects
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn into_image(self) -> Image {
        self.image
    }

    /// Builds the assembly source handed to the assembler.
    pub fn render_source(&self, user_source: &str, map_path: &Path) -> String {
        let mut out = String::new();
        out.push_str("[bits 32]\n");
        out.push_str(&format!("[org 0{:08x}h]\n", self.free_rva));
        out.push_str(&format!("[map symbols {}]\n", map_path.display()));
        out.push_str(user_source);
        out.push('\n');
        for entry in &self.redirects {
            out.push_str(&format!("redirect 0{:08x}h, {}\n", entry.rva, entry.index));
        }
        out
    }

    /// Writes the generated source into `work_dir`, assembles it and reads
    /// back the code and symbol map.
    pub fn assemble(&self, user_source: &str, work_dir: &Path) -> Result<Assembled> {
        let source_path = work_dir.join(format!("{}.asm", GENERATED_PREFIX));
        let binary_path = work_dir.join(format!("{}.bin", GENERATED_PREFIX));
        let map_path = work_dir.join(format!("{}.map", GENERATED_PREFIX));

        // The assembler only rewrites the map when it succeeds.
        remove_stale(&map_path)?;

        let source = self.render_source(user_source, &map_path);
        std::fs::write(&source_path, source)
            .with_context(|| format!("failed to write {}", source_path.display()))?;

        self.assembler
            .assemble(&source_path, &binary_path)
            .with_context(|| format!("failed to assemble {}", source_path.display()))?;

        let code = std::fs::read(&binary_path)
            .with_context(|| format!("failed to read {}", binary_path.display()))?;
        let symbols = SymbolMap::from_file(&map_path)?;
        info!("assembled 0x{:x} bytes, {} symbols", code.len(), symbols.len());
        Ok(Assembled { code, symbols })
    }

    /// Appends `code` as a new readable, executable section at the free RVA.
    pub fn inject(&mut self, code: &[u8]) -> Result<usize> {
        let virtual_size = align_up(
            code.len() as u64,
            u64::from(self.image.section_alignment()),
        );
        let virtual_size = u32::try_from(virtual_size)
            .map_err(|_| anyhow!("injected code of 0x{:x} bytes is too large", code.len()))?;
        let index = self.image.add_section(
            &self.section_name,
            self.free_rva,
            virtual_size,
            code,
            pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_EXECUTE,
        )?;
        Ok(index)
    }

    /// Redirects every export to its `entry_<index>` label.
    ///
    /// All labels are resolved before the first write, so a missing label
    /// leaves the export table untouched.
    pub fn patch_exports(&mut self, symbols: &SymbolMap) -> Result<usize> {
        let mut patches = Vec::with_capacity(self.redirects.len());
        for entry in &self.redirects {
            let label = format!("entry_{}", entry.index);
            let rva = symbols
                .get(&label)
                .ok_or_else(|| anyhow!("label {} missing from symbol map", label))?;
            patches.push((entry.index, rva));
        }

        for &(index, rva) in &patches {
            tracing::debug!("export #{} -> 0x{:08x}", index, rva);
            self.exports.set_function(&mut self.image, index, rva)?;
        }
        Ok(patches.len())
    }

    pub fn write(&mut self, output: &Path) -> Result<()> {
        self.image
            .save(output)
            .with_context(|| format!("failed to write {}", output.display()))
    }

    /// Runs assembly, injection and patching in order.
    pub fn run(&mut self, user_source: &str, work_dir: &Path) -> Result<()> {
        let assembled = self.assemble(user_source, work_dir)?;
        self.inject(&assembled.code)?;
        let patched = self.patch_exports(&assembled.symbols)?;
        info!("redirected {} exports", patched);
        Ok(())
    }
}
