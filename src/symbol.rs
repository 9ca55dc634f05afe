//! Assembler symbol map.
//!
//! Reads the `[map symbols]` output of the assembler and resolves labels to
//! relative addresses.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

/// Label that starts the symbol listing; everything before it is ignored.
pub const MAP_MARKER: &str = "__begin_marker";

/// Label to address mapping taken from a map file.
#[derive(Debug, Default, Clone)]
pub struct SymbolMap {
    symbols: HashMap<String, u32>,
}

fn parse_hex(token: &str) -> Option<u32> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u32::from_str_radix(digits, 16).ok()
}

impl SymbolMap {
    /// Parses map text.
    ///
    /// From the marker line on, each line is read as
    /// `<real address> <relative address> <label>`. Lines that do not fit
    /// that shape are skipped.
    pub fn parse(text: &str) -> Self {
        let mut symbols = HashMap::new();
        let mut after_marker = false;
        for line in text.lines() {
            if line.contains(MAP_MARKER) {
                after_marker = true;
            }
            if !after_marker {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(_), Some(rva), Some(label)) = (
                fields.next().and_then(parse_hex),
                fields.next().and_then(parse_hex),
                fields.next(),
            ) else {
                continue;
            };
            symbols.insert(label.to_string(), rva);
        }
        tracing::debug!("parsed {} symbols", symbols.len());
        Self { symbols }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read map file {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn get(&self, label: &str) -> Option<u32> {
        self.symbols.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
