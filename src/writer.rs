//! PE file writer.
//!
//! Recomputes every derived layout field, serializes the image and stamps
//! the header checksum.

use std::path::Path;

use object::endian::{LittleEndian as LE, U16, U32};
use object::pod::bytes_of;
use tracing::{debug, info, warn};

use crate::checksum::checksum;
use crate::error::{ImageError, Result};
use crate::image::{
    Image, DIRECTORY_COUNT, DOS_HEADER_SIZE, FILE_ALIGNMENT, NT_FIXED_SIZE, OPTIONAL_HEADER_SIZE,
    SECTION_ALIGNMENT, SECTION_HEADER_SIZE,
};
use crate::utils::align_up;

/// Offset of `CheckSum` inside the PE32 optional header.
const CHECKSUM_OFFSET: usize = 64;

/// Derived layout values, computed before anything is mutated.
struct Layout {
    e_lfanew: u32,
    size_of_headers: u32,
    size_of_image: u32,
    raw_offsets: Vec<u32>,
}

fn to_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| ImageError::unsupported(format!("{} 0x{:x} exceeds 32 bits", what, value)))
}

impl Image {
    /// Unaligned length of everything before the first section's data.
    fn headers_len(&self) -> u64 {
        (DOS_HEADER_SIZE
            + self.stub.len()
            + NT_FIXED_SIZE
            + OPTIONAL_HEADER_SIZE
            + self.sections.len() * SECTION_HEADER_SIZE) as u64
    }

    /// `SizeOfHeaders` as the next save will write it.
    pub fn size_of_headers(&self) -> u64 {
        align_up(self.headers_len(), u64::from(FILE_ALIGNMENT))
    }

    /// `SizeOfImage` as the next save will write it: the end of the last
    /// section, aligned to the section alignment.
    pub fn size_of_image(&self) -> u64 {
        let end = match self.sections.last() {
            Some(last) => last.virtual_end(),
            None => self.size_of_headers(),
        };
        align_up(end, u64::from(SECTION_ALIGNMENT))
    }

    fn compute_layout(&self) -> Result<Layout> {
        let e_lfanew = to_u32((DOS_HEADER_SIZE + self.stub.len()) as u64, "e_lfanew")?;
        let size_of_headers = to_u32(self.size_of_headers(), "SizeOfHeaders")?;
        let size_of_image = to_u32(self.size_of_image(), "SizeOfImage")?;

        let mut raw_offsets = Vec::with_capacity(self.sections.len());
        let mut file_pos = u64::from(size_of_headers);
        for section in &self.sections {
            raw_offsets.push(to_u32(file_pos, "PointerToRawData")?);
            file_pos = align_up(
                file_pos + section.data.len() as u64,
                u64::from(FILE_ALIGNMENT),
            );
        }
        to_u32(file_pos, "file size")?;

        Ok(Layout {
            e_lfanew,
            size_of_headers,
            size_of_image,
            raw_offsets,
        })
    }

    /// Recomputes every derived header field and section file offset.
    ///
    /// Alignments and the directory count are reset to their fixed values
    /// regardless of what was loaded. On error the image is left unchanged.
    pub fn finalize(&mut self) -> Result<()> {
        let layout = self.compute_layout()?;

        let loaded_file_alignment = self.optional_header.file_alignment.get(LE);
        let loaded_section_alignment = self.optional_header.section_alignment.get(LE);
        if loaded_file_alignment != FILE_ALIGNMENT || loaded_section_alignment != SECTION_ALIGNMENT
        {
            warn!(
                "overriding alignments 0x{:x}/0x{:x} with 0x{:x}/0x{:x}",
                loaded_file_alignment, loaded_section_alignment, FILE_ALIGNMENT, SECTION_ALIGNMENT
            );
        }

        self.dos_header.e_lfanew = U32::new(LE, layout.e_lfanew);
        self.file_header.number_of_sections = U16::new(LE, self.sections.len() as u16);
        self.file_header.size_of_optional_header = U16::new(LE, OPTIONAL_HEADER_SIZE as u16);

        let opt = &mut self.optional_header;
        opt.file_alignment = U32::new(LE, FILE_ALIGNMENT);
        opt.section_alignment = U32::new(LE, SECTION_ALIGNMENT);
        opt.number_of_rva_and_sizes = U32::new(LE, DIRECTORY_COUNT as u32);
        opt.size_of_image = U32::new(LE, layout.size_of_image);
        opt.size_of_headers = U32::new(LE, layout.size_of_headers);

        for (section, offset) in self.sections.iter_mut().zip(layout.raw_offsets) {
            section.header.pointer_to_raw_data = U32::new(LE, offset);
            debug!(
                "section {:?} -> file offset 0x{:x}",
                section.name(),
                offset
            );
        }
        debug!(
            "layout: headers=0x{:x} image=0x{:x}",
            layout.size_of_headers, layout.size_of_image
        );
        Ok(())
    }

    /// Finalizes the layout and serializes the image, checksum included.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        self.finalize()?;

        let mut buffer = Vec::with_capacity(self.size_of_headers() as usize);
        buffer.extend_from_slice(bytes_of(&self.dos_header));
        buffer.extend_from_slice(&self.stub);

        let checksum_pos = buffer.len() + NT_FIXED_SIZE + CHECKSUM_OFFSET;
        buffer.extend_from_slice(&self.signature.to_le_bytes());
        buffer.extend_from_slice(bytes_of(&self.file_header));
        buffer.extend_from_slice(bytes_of(&self.optional_header));
        for directory in &self.data_directories {
            buffer.extend_from_slice(bytes_of(directory));
        }
        for section in &self.sections {
            buffer.extend_from_slice(bytes_of(&section.header));
        }

        for section in &self.sections {
            let start = section.pointer_to_raw_data() as usize;
            if start > buffer.len() {
                buffer.resize(start, 0);
            }
            buffer.extend_from_slice(&section.data);
        }

        buffer[checksum_pos..checksum_pos + 4].fill(0);
        let sum = checksum(&buffer);
        buffer[checksum_pos..checksum_pos + 4].copy_from_slice(&sum.to_le_bytes());
        self.optional_header.check_sum = U32::new(LE, sum);
        debug!("checksum: 0x{:08x} over 0x{:x} bytes", sum, buffer.len());

        Ok(buffer)
    }

    /// Serializes the image and writes it to `path`.
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let buffer = self.to_bytes()?;
        std::fs::write(path, &buffer).map_err(|e| ImageError::io(path, e))?;
        info!("wrote {} ({} bytes)", path.display(), buffer.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::pe;

    const RX: u32 = pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_EXECUTE;
    const RW: u32 = pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_WRITE;

    fn two_sections() -> Image {
        let mut image = Image::new();
        image.add_section(".text", 0x1000, 0x321, &[0x90; 0x321], RX).unwrap();
        image.add_section(".data", 0x2000, 0x10, &[0x01; 0x10], RW).unwrap();
        image
    }

    #[test]
    fn sections_are_file_aligned() {
        let mut image = two_sections();
        image.finalize().unwrap();

        let headers = image.optional_header().size_of_headers.get(LE);
        assert_eq!(headers, 0x200);
        let text = &image.sections()[0];
        let data = &image.sections()[1];
        assert_eq!(text.pointer_to_raw_data(), headers);
        assert_eq!(data.pointer_to_raw_data(), 0x600);
        assert_eq!(image.optional_header().size_of_image.get(LE), 0x3000);
    }

    #[test]
    fn finalize_overrides_loaded_alignment() {
        let mut image = two_sections();
        image.optional_header.file_alignment = U32::new(LE, 0x1000);
        image.optional_header.section_alignment = U32::new(LE, 0x2000);
        image.optional_header.number_of_rva_and_sizes = U32::new(LE, 10);
        image.finalize().unwrap();

        let opt = image.optional_header();
        assert_eq!(opt.file_alignment.get(LE), FILE_ALIGNMENT);
        assert_eq!(opt.section_alignment.get(LE), SECTION_ALIGNMENT);
        assert_eq!(opt.number_of_rva_and_sizes.get(LE), DIRECTORY_COUNT as u32);
    }

    #[test]
    fn serialized_checksum_verifies() {
        let mut image = two_sections();
        let mut bytes = image.to_bytes().unwrap();

        assert_eq!(bytes.len(), 0x600 + 0x10);
        let pos = 0x80 + NT_FIXED_SIZE + CHECKSUM_OFFSET;
        let stored = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        assert_eq!(stored, image.optional_header().check_sum.get(LE));

        bytes[pos..pos + 4].fill(0);
        assert_eq!(checksum(&bytes), stored);
    }

    #[test]
    fn padding_between_sections_is_zero() {
        let mut image = two_sections();
        let bytes = image.to_bytes().unwrap();
        assert!(bytes[0x200 + 0x321..0x600].iter().all(|&b| b == 0));
        assert_eq!(&bytes[0x600..], &[0x01; 0x10]);
    }

    #[test]
    fn overflowing_layout_leaves_image_untouched() {
        let mut image = Image::new();
        image.add_section(".huge", 0xffff_f000, 0x2000, &[], RW).unwrap();
        let before = image.optional_header().size_of_image.get(LE);

        assert!(matches!(image.finalize(), Err(ImageError::UnsupportedLayout(_))));
        assert_eq!(image.optional_header().size_of_image.get(LE), before);
    }

    #[test]
    fn save_reports_unwritable_destination() {
        let mut image = two_sections();
        let err = image.save("/nonexistent/dir/out.dll").unwrap_err();
        assert!(matches!(err, ImageError::Io { .. }));
    }
}
