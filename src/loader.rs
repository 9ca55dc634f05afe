//! Image loading.
//!
//! Parses a raw PE32 file into an [`Image`]. Every read is bounds-checked
//! against the input; anything that runs off the end of the buffer is
//! reported as [`ImageError::MalformedImage`].

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use object::endian::{LittleEndian as LE, U32};
use object::pe::{
    self, ImageDataDirectory, ImageDosHeader, ImageFileHeader, ImageOptionalHeader32,
    ImageSectionHeader,
};
use object::ReadRef;
use tracing::{debug, info, warn};

use crate::error::{ImageError, Result};
use crate::image::{
    Image, Section, DIRECTORY_COUNT, DOS_HEADER_SIZE, NT_FIXED_SIZE, OPTIONAL_HEADER_SIZE,
    SECTION_HEADER_SIZE,
};
use crate::utils::{section_name, zeroed};

const OPTIONAL_HEADER_FIXED_SIZE: usize = std::mem::size_of::<ImageOptionalHeader32>();

impl Image {
    /// Maps the file at `path` and parses it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ImageError::io(path, e))?;
        // SAFETY: the mapping is read-only and only lives for the duration of
        // the parse, which copies everything it keeps.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| ImageError::io(path, e))?;
        let image = Self::parse(&mmap)?;
        info!(
            "loaded {} ({} sections, {} bytes)",
            path.display(),
            image.sections.len(),
            mmap.len()
        );
        Ok(image)
    }

    /// Parses a PE32 image from `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let dos_header: ImageDosHeader = *data
            .read_at::<ImageDosHeader>(0)
            .map_err(|()| ImageError::malformed("file too small for the DOS header"))?;
        if dos_header.e_magic.get(LE) != pe::IMAGE_DOS_SIGNATURE {
            return Err(ImageError::malformed("missing MZ signature"));
        }

        let e_lfanew = dos_header.e_lfanew.get(LE);
        let nt_offset = u64::from(e_lfanew);
        let stub_len = nt_offset.saturating_sub(DOS_HEADER_SIZE as u64);
        if nt_offset < DOS_HEADER_SIZE as u64 {
            warn!(
                "e_lfanew 0x{:x} points inside the DOS header; treating the stub as empty",
                e_lfanew
            );
        }
        let stub = data
            .read_bytes_at(DOS_HEADER_SIZE as u64, stub_len)
            .map_err(|()| ImageError::malformed("DOS stub extends past end of file"))?
            .to_vec();
        debug!("e_lfanew: 0x{:x}, stub: 0x{:x} bytes", e_lfanew, stub.len());

        let signature = data
            .read_at::<U32<LE>>(nt_offset)
            .map_err(|()| ImageError::malformed("e_lfanew points past end of file"))?
            .get(LE);
        if signature != pe::IMAGE_NT_SIGNATURE {
            return Err(ImageError::malformed(format!(
                "bad PE signature 0x{:08x}",
                signature
            )));
        }

        let file_header: ImageFileHeader = *data
            .read_at::<ImageFileHeader>(nt_offset + 4)
            .map_err(|()| ImageError::malformed("truncated file header"))?;
        debug!("{:#x?}", file_header);

        let optional_size = usize::from(file_header.size_of_optional_header.get(LE));
        if optional_size < OPTIONAL_HEADER_FIXED_SIZE {
            return Err(ImageError::malformed(format!(
                "SizeOfOptionalHeader 0x{:x} is smaller than a PE32 optional header",
                optional_size
            )));
        }
        if optional_size > OPTIONAL_HEADER_SIZE {
            return Err(ImageError::unsupported(format!(
                "SizeOfOptionalHeader 0x{:x} exceeds 0x{:x}",
                optional_size, OPTIONAL_HEADER_SIZE
            )));
        }
        let optional_offset = nt_offset + NT_FIXED_SIZE as u64;
        let optional_bytes = data
            .read_bytes_at(optional_offset, optional_size as u64)
            .map_err(|()| ImageError::malformed("truncated optional header"))?;

        // Bytes the header does not declare read as zero.
        let mut optional = [0u8; OPTIONAL_HEADER_SIZE];
        optional[..optional_size].copy_from_slice(optional_bytes);
        let optional = &optional[..];

        let optional_header: ImageOptionalHeader32 = *optional
            .read_at::<ImageOptionalHeader32>(0)
            .map_err(|()| ImageError::malformed("truncated optional header"))?;
        let magic = optional_header.magic.get(LE);
        if magic != pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC {
            return Err(ImageError::unsupported(format!(
                "optional header magic 0x{:x} is not PE32",
                magic
            )));
        }

        let directory_count = optional_header.number_of_rva_and_sizes.get(LE);
        if directory_count as usize > DIRECTORY_COUNT {
            return Err(ImageError::malformed(format!(
                "bad value of NumberOfRvaAndSizes: {}",
                directory_count
            )));
        }
        let directories: &[ImageDataDirectory] = optional
            .read_slice_at(OPTIONAL_HEADER_FIXED_SIZE as u64, DIRECTORY_COUNT)
            .map_err(|()| ImageError::malformed("truncated data directories"))?;
        let mut data_directories: [ImageDataDirectory; DIRECTORY_COUNT] = [zeroed(); DIRECTORY_COUNT];
        data_directories.copy_from_slice(directories);

        let section_count = usize::from(file_header.number_of_sections.get(LE));
        let table_offset = optional_offset + optional_size as u64;
        let mut sections = Vec::with_capacity(section_count);
        for index in 0..section_count {
            let offset = table_offset + (index * SECTION_HEADER_SIZE) as u64;
            let header: ImageSectionHeader = *data
                .read_at::<ImageSectionHeader>(offset)
                .map_err(|()| ImageError::malformed(format!("truncated section header {}", index)))?;
            let raw = data
                .read_bytes_at(
                    u64::from(header.pointer_to_raw_data.get(LE)),
                    u64::from(header.size_of_raw_data.get(LE)),
                )
                .map_err(|()| {
                    ImageError::malformed(format!(
                        "raw data of section {:?} extends past end of file",
                        section_name(&header.name)
                    ))
                })?;
            debug!(
                "0x{:x}: section {:?} rva=0x{:x} vsize=0x{:x} raw=0x{:x}@0x{:x}",
                offset,
                section_name(&header.name),
                header.virtual_address.get(LE),
                header.virtual_size.get(LE),
                header.size_of_raw_data.get(LE),
                header.pointer_to_raw_data.get(LE),
            );
            sections.push(Section::new(header, raw.to_vec()));
        }

        Ok(Self {
            dos_header,
            stub,
            signature,
            file_header,
            optional_header,
            data_directories,
            sections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::FILE_ALIGNMENT;

    const RX: u32 = pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_EXECUTE;

    fn sample_bytes() -> Vec<u8> {
        let mut image = Image::new();
        image.add_section(".text", 0x1000, 0x30, &[0xcc; 0x30], RX).unwrap();
        image.to_bytes().unwrap()
    }

    fn nt_offset(bytes: &[u8]) -> usize {
        u32::from_le_bytes(bytes[0x3c..0x40].try_into().unwrap()) as usize
    }

    #[test]
    fn parses_generated_image() {
        let bytes = sample_bytes();
        let image = Image::parse(&bytes).unwrap();

        assert_eq!(image.stub().len(), 64);
        assert_eq!(image.sections().len(), 1);
        let text = &image.sections()[0];
        assert_eq!(text.name(), ".text");
        assert_eq!(text.data(), &[0xcc; 0x30]);
        assert_eq!(text.pointer_to_raw_data(), FILE_ALIGNMENT);
    }

    #[test]
    fn rejects_missing_mz() {
        let mut bytes = sample_bytes();
        bytes[0] = b'X';
        assert!(matches!(Image::parse(&bytes), Err(ImageError::MalformedImage(_))));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = sample_bytes();
        assert!(matches!(Image::parse(&bytes[..32]), Err(ImageError::MalformedImage(_))));
        // Headers intact, section data cut off.
        assert!(matches!(
            Image::parse(&bytes[..0x210]),
            Err(ImageError::MalformedImage(_))
        ));
    }

    #[test]
    fn rejects_too_many_directories() {
        let mut bytes = sample_bytes();
        // NumberOfRvaAndSizes sits at offset 92 of the optional header.
        let at = nt_offset(&bytes) + NT_FIXED_SIZE + 92;
        bytes[at..at + 4].copy_from_slice(&17u32.to_le_bytes());
        assert!(matches!(Image::parse(&bytes), Err(ImageError::MalformedImage(_))));
    }

    #[test]
    fn rejects_pe32_plus() {
        let mut bytes = sample_bytes();
        let at = nt_offset(&bytes) + NT_FIXED_SIZE;
        bytes[at..at + 2].copy_from_slice(&pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC.to_le_bytes());
        assert!(matches!(Image::parse(&bytes), Err(ImageError::UnsupportedLayout(_))));
    }

    #[test]
    fn rejects_short_optional_header() {
        let mut bytes = sample_bytes();
        // SizeOfOptionalHeader sits at offset 16 of the file header.
        let at = nt_offset(&bytes) + 4 + 16;
        bytes[at..at + 2].copy_from_slice(&64u16.to_le_bytes());
        assert!(matches!(Image::parse(&bytes), Err(ImageError::MalformedImage(_))));
    }

    #[test]
    fn rejects_bad_pe_signature() {
        let mut bytes = sample_bytes();
        let at = nt_offset(&bytes);
        bytes[at..at + 4].copy_from_slice(b"PX\0\0");
        assert!(matches!(Image::parse(&bytes), Err(ImageError::MalformedImage(_))));
    }

    #[test]
    fn rejects_oversized_optional_header() {
        let mut bytes = sample_bytes();
        let at = nt_offset(&bytes) + 4 + 16;
        bytes[at..at + 2].copy_from_slice(&0xf0u16.to_le_bytes());
        assert!(matches!(Image::parse(&bytes), Err(ImageError::UnsupportedLayout(_))));
    }

    #[test]
    fn short_optional_header_moves_section_table() {
        let mut bytes = sample_bytes();
        let nt = nt_offset(&bytes);
        let optional = nt + NT_FIXED_SIZE;
        // Declare ten directories (176 bytes) and slide the section table down.
        let short = OPTIONAL_HEADER_FIXED_SIZE + 10 * 8;
        bytes[nt + 4 + 16..nt + 4 + 18].copy_from_slice(&(short as u16).to_le_bytes());
        bytes[optional + 92..optional + 96].copy_from_slice(&10u32.to_le_bytes());
        let table = optional + OPTIONAL_HEADER_SIZE;
        bytes.copy_within(table..table + SECTION_HEADER_SIZE, optional + short);

        let image = Image::parse(&bytes).unwrap();
        assert_eq!(image.sections().len(), 1);
        assert_eq!(image.sections()[0].name(), ".text");
        assert_eq!(image.sections()[0].data(), &[0xcc; 0x30]);
        // The section header now overlaps directory 10; it must not leak in.
        for dir in &image.data_directories[10..] {
            assert_eq!(dir.virtual_address.get(LE), 0);
            assert_eq!(dir.size.get(LE), 0);
        }
        assert!(image.data_directory(10).is_none());

        let mut image = image;
        let resaved = Image::parse(&image.to_bytes().unwrap()).unwrap();
        assert_eq!(resaved.sections()[0].data(), &[0xcc; 0x30]);
        assert_eq!(
            usize::from(resaved.file_header().size_of_optional_header.get(LE)),
            OPTIONAL_HEADER_SIZE
        );
    }

    #[test]
    fn short_e_lfanew_reads_headers_inside_dos_header() {
        let mut bytes = sample_bytes();
        let nt = nt_offset(&bytes);
        let headers = NT_FIXED_SIZE + OPTIONAL_HEADER_SIZE + SECTION_HEADER_SIZE;
        bytes.copy_within(nt..nt + headers, 0x20);
        // e_lfanew now overlaps SizeOfCode; both read as 0x20.
        bytes[0x3c..0x40].copy_from_slice(&0x20u32.to_le_bytes());

        let image = Image::parse(&bytes).unwrap();
        assert!(image.stub().is_empty());
        assert_eq!(image.dos_header().e_lfanew.get(LE), 0x20);
        assert_eq!(image.sections()[0].name(), ".text");
        assert_eq!(image.sections()[0].data(), &[0xcc; 0x30]);

        let mut image = image;
        let resaved = Image::parse(&image.to_bytes().unwrap()).unwrap();
        assert_eq!(resaved.dos_header().e_lfanew.get(LE), DOS_HEADER_SIZE as u32);
        assert!(resaved.stub().is_empty());
        assert_eq!(resaved.sections()[0].data(), &[0xcc; 0x30]);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Image::load("/nonexistent/dir/lib.dll").unwrap_err();
        assert!(matches!(err, ImageError::Io { .. }));
    }
}
