//! Export table access.
//!
//! Reads the export directory of an image and patches its function-address
//! array. Only the address array is touched; names and ordinals stay as they
//! are.

use std::mem::size_of;

use object::endian::LittleEndian as LE;
use object::pe::{self, ImageExportDirectory};
use object::ReadRef;
use tracing::debug;

use crate::address::AddressKind;
use crate::error::{ImageError, Result};
use crate::image::Image;

const EXPORT_DIRECTORY_SIZE: usize = size_of::<ImageExportDirectory>();

/// An exported function whose address points at code in this image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportEntry {
    /// Index into the function-address array (ordinal minus `Base`).
    pub index: u32,
    pub rva: u32,
}

/// The export directory of an image, as located by [`ExportTable::locate`].
#[derive(Debug, Clone)]
pub struct ExportTable {
    directory_rva: u32,
    directory_size: u32,
    directory: ImageExportDirectory,
}

impl ExportTable {
    pub fn locate(image: &Image) -> Result<Self> {
        let entry = image
            .data_directory(pe::IMAGE_DIRECTORY_ENTRY_EXPORT)
            .ok_or(ImageError::NoExportTable)?;
        let directory_rva = entry.virtual_address.get(LE);
        let directory_size = entry.size.get(LE);
        if directory_rva == 0 || directory_size == 0 {
            return Err(ImageError::NoExportTable);
        }
        if (directory_size as usize) < EXPORT_DIRECTORY_SIZE {
            return Err(ImageError::malformed(format!(
                "export directory size 0x{:x} is too small",
                directory_size
            )));
        }

        let bytes = image.bytes_at(directory_rva, EXPORT_DIRECTORY_SIZE)?;
        let directory = *bytes
            .read_at::<ImageExportDirectory>(0)
            .map_err(|()| ImageError::malformed("truncated export directory"))?;
        debug!(
            "export directory at RVA 0x{:x}: {} functions, array at 0x{:x}",
            directory_rva,
            directory.number_of_functions.get(LE),
            directory.address_of_functions.get(LE)
        );

        Ok(Self {
            directory_rva,
            directory_size,
            directory,
        })
    }

    pub fn directory(&self) -> &ImageExportDirectory {
        &self.directory
    }

    pub fn number_of_functions(&self) -> u32 {
        self.directory.number_of_functions.get(LE)
    }

    /// Whether `rva` points into the export directory itself, i.e. names a
    /// forwarder string rather than code.
    pub fn is_forwarded(&self, rva: u32) -> bool {
        self.directory_rva <= rva
            && u64::from(rva) < u64::from(self.directory_rva) + u64::from(self.directory_size)
    }

    fn slot_rva(&self, index: u32) -> Result<u32> {
        if index >= self.number_of_functions() {
            return Err(ImageError::malformed(format!(
                "export index {} out of range ({} functions)",
                index,
                self.number_of_functions()
            )));
        }
        let rva = u64::from(self.directory.address_of_functions.get(LE)) + u64::from(index) * 4;
        u32::try_from(rva).map_err(|_| ImageError::AddressOutOfRange {
            kind: AddressKind::Relative,
            value: rva,
        })
    }

    /// Reads the whole function-address array.
    pub fn functions(&self, image: &Image) -> Result<Vec<u32>> {
        let count = self.number_of_functions() as usize;
        let start = self.directory.address_of_functions.get(LE);
        let bytes = image.bytes_at(start, count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    /// Exports that are executable and not forwarded.
    ///
    /// Entries that no section maps (unused ordinals are usually zero) are
    /// skipped.
    pub fn redirectable(&self, image: &Image) -> Result<Vec<ExportEntry>> {
        let mut entries = Vec::new();
        for (index, rva) in self.functions(image)?.into_iter().enumerate() {
            let index = index as u32;
            if self.is_forwarded(rva) {
                debug!("export #{} at 0x{:x} is forwarded", index, rva);
                continue;
            }
            match image.is_executable(rva) {
                Ok(true) => entries.push(ExportEntry { index, rva }),
                Ok(false) => debug!("export #{} at 0x{:x} is not code", index, rva),
                Err(ImageError::AddressNotMapped(_)) => {
                    debug!("export #{} at 0x{:x} is unmapped", index, rva)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    pub fn function(&self, image: &Image, index: u32) -> Result<u32> {
        image.read_u32(self.slot_rva(index)?)
    }

    /// Points export `index` at `rva`.
    pub fn set_function(&self, image: &mut Image, index: u32, rva: u32) -> Result<()> {
        image.write_u32(self.slot_rva(index)?, rva)
    }
}
