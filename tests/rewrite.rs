//! End-to-end export redirection with a scripted assembler.

use anyhow::{anyhow, Context, Result};
use dllrw::assembler::Assembler;
use dllrw::exports::ExportTable;
use dllrw::rewriter::{default_output_path, Rewriter, GENERATED_PREFIX};
use dllrw::Image;
use object::pe;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const WRAPPER_SIZE: u32 = 0x10;

/// Stands in for NASM: reads `[org]`, `[map symbols]` and the `redirect`
/// lines, emits `WRAPPER_SIZE` bytes per redirect and a matching map file.
struct ScriptedAssembler;

fn hex_operand(token: &str) -> Result<u32> {
    let digits = token.trim_end_matches(']').trim_end_matches(',').trim_end_matches('h');
    u32::from_str_radix(digits, 16).with_context(|| format!("bad operand {:?}", token))
}

impl Assembler for ScriptedAssembler {
    fn assemble(&self, source: &Path, output: &Path) -> Result<()> {
        let text = std::fs::read_to_string(source)?;
        let mut org = None;
        let mut map_path = None;
        let mut indices = Vec::new();
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("[org ") {
                org = Some(hex_operand(rest)?);
            } else if let Some(rest) = line.strip_prefix("[map symbols ") {
                map_path = Some(PathBuf::from(rest.trim_end_matches(']')));
            } else if let Some(rest) = line.strip_prefix("redirect ") {
                let index: u32 = rest.split(',').nth(1).context("no index")?.trim().parse()?;
                indices.push(index);
            }
        }
        let org = org.ok_or_else(|| anyhow!("no org directive"))?;
        let map_path = map_path.ok_or_else(|| anyhow!("no map directive"))?;

        let mut map = String::from("Real              Virtual           Name\n");
        writeln!(map, "{:16X}  {:16X}  __begin_marker", org, org)?;
        for (slot, index) in indices.iter().enumerate() {
            let rva = org + slot as u32 * WRAPPER_SIZE;
            writeln!(map, "{:16X}  {:16X}  entry_{}", rva, rva, index)?;
        }
        std::fs::write(map_path, map)?;
        std::fs::write(output, vec![0xcc; indices.len() * WRAPPER_SIZE as usize])?;
        Ok(())
    }
}

fn put32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

/// Four exports: two functions in `.text`, one forwarder, one pointing at
/// writable data.
fn sample_dll() -> Vec<u8> {
    let mut image = Image::new();
    image
        .add_section(".text", 0x1000, 0x200, &[0x90; 0x200], pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_EXECUTE)
        .unwrap();

    let mut rdata = vec![0u8; 0x100];
    put32(&mut rdata, 16, 1);
    put32(&mut rdata, 20, 4);
    put32(&mut rdata, 28, 0x2040);
    put32(&mut rdata, 0x40, 0x1000);
    put32(&mut rdata, 0x44, 0x2070);
    put32(&mut rdata, 0x48, 0x1100);
    put32(&mut rdata, 0x4c, 0x3000);
    rdata[0x70..0x7b].copy_from_slice(b"KERNEL.Exit");
    image
        .add_section(".rdata", 0x2000, 0x100, &rdata, pe::IMAGE_SCN_MEM_READ)
        .unwrap();
    image
        .add_section(".data", 0x3000, 0x10, &[0; 0x10], pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_WRITE)
        .unwrap();
    image.set_data_directory(pe::IMAGE_DIRECTORY_ENTRY_EXPORT, 0x2000, 0x80);
    image.to_bytes().unwrap()
}

fn work_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("dllrw-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn redirects_code_exports_into_new_section() {
    let dir = work_dir("rewrite");
    let input = dir.join("sample.dll");
    std::fs::write(&input, sample_dll()).unwrap();

    let image = Image::load(&input).unwrap();
    let mut rewriter = Rewriter::new(ScriptedAssembler, image).unwrap();
    assert_eq!(rewriter.free_rva(), 0x4000);
    assert_eq!(rewriter.redirects().len(), 2);

    rewriter.run("%macro redirect 2\n%endmacro", &dir).unwrap();
    let output = default_output_path(&input);
    rewriter.write(&output).unwrap();

    assert!(dir.join(format!("{}.asm", GENERATED_PREFIX)).is_file());

    let rebuilt = Image::load(&output).unwrap();
    assert_eq!(rebuilt.sections().len(), 4);
    let wrappers = &rebuilt.sections()[3];
    assert_eq!(wrappers.name(), "wrappers");
    assert_eq!(wrappers.virtual_address(), 0x4000);
    assert_eq!(wrappers.virtual_size(), 0x1000);
    assert_eq!(wrappers.size_of_raw_data(), 2 * WRAPPER_SIZE);
    assert!(rebuilt.is_executable(0x4010).unwrap());
    assert!(!rebuilt.is_writable(0x4010).unwrap());

    let exports = ExportTable::locate(&rebuilt).unwrap();
    assert_eq!(
        exports.functions(&rebuilt).unwrap(),
        vec![0x4000, 0x2070, 0x4010, 0x3000]
    );

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn dll_without_exports_is_rejected() {
    let mut image = Image::new();
    image
        .add_section(".text", 0x1000, 0x10, &[0xc3; 0x10], pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_EXECUTE)
        .unwrap();
    let err = Rewriter::new(ScriptedAssembler, image).err().unwrap();
    assert!(format!("{:#}", err).contains("no export table"));
}
