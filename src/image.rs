//! In-memory PE32 image model.
//!
//! An [`Image`] owns the legacy (DOS) header and stub, the NT headers, the
//! data directories and an ordered list of [`Section`]s, each with its own
//! raw-data buffer. Layout fields (file offsets, `SizeOfImage`,
//! `SizeOfHeaders`) are derived and only recomputed by the writer.

use std::mem::size_of;

use object::endian::{LittleEndian as LE, U16, U32};
use object::pe::{
    self, ImageDataDirectory, ImageDosHeader, ImageFileHeader, ImageOptionalHeader32,
    ImageSectionHeader,
};
use tracing::{debug, warn};

use crate::address::Address;
use crate::error::{ImageError, Result};
use crate::utils::{align_up, section_name, zeroed};

/// Number of data-directory slots in a PE32 optional header.
pub const DIRECTORY_COUNT: usize = pe::IMAGE_NUMBEROF_DIRECTORY_ENTRIES;
pub const DOS_HEADER_SIZE: usize = size_of::<ImageDosHeader>();
/// Signature plus file header.
pub const NT_FIXED_SIZE: usize = size_of::<U32<LE>>() + size_of::<ImageFileHeader>();
/// Optional header including the full data-directory array.
pub const OPTIONAL_HEADER_SIZE: usize =
    size_of::<ImageOptionalHeader32>() + DIRECTORY_COUNT * size_of::<ImageDataDirectory>();
pub const SECTION_HEADER_SIZE: usize = size_of::<ImageSectionHeader>();

/// File alignment forced on every save.
pub const FILE_ALIGNMENT: u32 = 0x200;
/// Section alignment forced on every save.
pub const SECTION_ALIGNMENT: u32 = 0x1000;
pub const DEFAULT_IMAGE_BASE: u32 = 0x1000_0000;

/// A section header together with the raw bytes it describes.
///
/// `data.len()` always equals the header's `SizeOfRawData`.
#[derive(Debug, Clone)]
pub struct Section {
    pub(crate) header: ImageSectionHeader,
    pub(crate) data: Vec<u8>,
}

impl Section {
    pub(crate) fn new(header: ImageSectionHeader, data: Vec<u8>) -> Self {
        Self { header, data }
    }

    pub fn header(&self) -> &ImageSectionHeader {
        &self.header
    }

    pub fn name(&self) -> String {
        section_name(&self.header.name)
    }

    pub fn virtual_address(&self) -> u32 {
        self.header.virtual_address.get(LE)
    }

    pub fn virtual_size(&self) -> u32 {
        self.header.virtual_size.get(LE)
    }

    pub fn size_of_raw_data(&self) -> u32 {
        self.header.size_of_raw_data.get(LE)
    }

    pub fn pointer_to_raw_data(&self) -> u32 {
        self.header.pointer_to_raw_data.get(LE)
    }

    pub fn characteristics(&self) -> u32 {
        self.header.characteristics.get(LE)
    }

    /// The raw bytes of this section.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the raw bytes. The length is fixed.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// End of the virtual range, exclusive.
    pub fn virtual_end(&self) -> u64 {
        u64::from(self.virtual_address()) + u64::from(self.virtual_size())
    }

    /// Whether `rva` lies in `[VirtualAddress, VirtualAddress + VirtualSize)`.
    pub fn contains_rva(&self, rva: u32) -> bool {
        self.virtual_address() <= rva && u64::from(rva) < self.virtual_end()
    }

    /// Whether `offset` lies in `[PointerToRawData, PointerToRawData + SizeOfRawData)`.
    pub fn contains_file_offset(&self, offset: u32) -> bool {
        let start = self.pointer_to_raw_data();
        start <= offset && u64::from(offset) < u64::from(start) + u64::from(self.size_of_raw_data())
    }

    /// Whether `rva` maps into this section's owned buffer.
    pub fn contains_data_rva(&self, rva: u32) -> bool {
        let start = self.virtual_address();
        start <= rva && u64::from(rva) < u64::from(start) + self.data.len() as u64
    }

    pub fn is_readable(&self) -> bool {
        self.characteristics() & pe::IMAGE_SCN_MEM_READ != 0
    }

    pub fn is_writable(&self) -> bool {
        self.characteristics() & pe::IMAGE_SCN_MEM_WRITE != 0
    }

    pub fn is_executable(&self) -> bool {
        self.characteristics() & pe::IMAGE_SCN_MEM_EXECUTE != 0
    }
}

/// A PE32 image held entirely in memory.
#[derive(Debug, Clone)]
pub struct Image {
    pub(crate) dos_header: ImageDosHeader,
    pub(crate) stub: Vec<u8>,
    pub(crate) signature: u32,
    pub(crate) file_header: ImageFileHeader,
    pub(crate) optional_header: ImageOptionalHeader32,
    pub(crate) data_directories: [ImageDataDirectory; DIRECTORY_COUNT],
    pub(crate) sections: Vec<Section>,
}

impl Default for Image {
    fn default() -> Self {
        Self::new()
    }
}

impl Image {
    /// Creates an empty PE32 DLL with no sections.
    pub fn new() -> Self {
        let mut stub = vec![
            0x0e, 0x1f, 0xba, 0x0e, 0x00, 0xb4, 0x09, 0xcd, 0x21, 0xb8, 0x01, 0x4c, 0xcd, 0x21,
        ];
        stub.extend_from_slice(b"This program cannot be run in DOS mode.\r\r\n$");
        stub.resize(64, 0);

        let mut dos_header: ImageDosHeader = zeroed();
        dos_header.e_magic = U16::new(LE, pe::IMAGE_DOS_SIGNATURE);
        dos_header.e_cblp = U16::new(LE, 0x90);
        dos_header.e_cp = U16::new(LE, 3);
        dos_header.e_cparhdr = U16::new(LE, 4);
        dos_header.e_maxalloc = U16::new(LE, 0xffff);
        dos_header.e_sp = U16::new(LE, 0xb8);
        dos_header.e_lfarlc = U16::new(LE, 0x40);
        dos_header.e_lfanew = U32::new(LE, (DOS_HEADER_SIZE + stub.len()) as u32);

        let mut file_header: ImageFileHeader = zeroed();
        file_header.machine = U16::new(LE, pe::IMAGE_FILE_MACHINE_I386);
        file_header.size_of_optional_header = U16::new(LE, OPTIONAL_HEADER_SIZE as u16);
        file_header.characteristics = U16::new(
            LE,
            pe::IMAGE_FILE_EXECUTABLE_IMAGE | pe::IMAGE_FILE_32BIT_MACHINE | pe::IMAGE_FILE_DLL,
        );

        let mut opt: ImageOptionalHeader32 = zeroed();
        opt.magic = U16::new(LE, pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC);
        opt.major_linker_version = 14;
        opt.image_base = U32::new(LE, DEFAULT_IMAGE_BASE);
        opt.section_alignment = U32::new(LE, SECTION_ALIGNMENT);
        opt.file_alignment = U32::new(LE, FILE_ALIGNMENT);
        opt.major_operating_system_version = U16::new(LE, 6);
        opt.major_subsystem_version = U16::new(LE, 6);
        opt.subsystem = U16::new(LE, pe::IMAGE_SUBSYSTEM_WINDOWS_GUI);
        opt.size_of_stack_reserve = U32::new(LE, 0x10_0000);
        opt.size_of_stack_commit = U32::new(LE, 0x1000);
        opt.size_of_heap_reserve = U32::new(LE, 0x10_0000);
        opt.size_of_heap_commit = U32::new(LE, 0x1000);
        opt.number_of_rva_and_sizes = U32::new(LE, DIRECTORY_COUNT as u32);

        Self {
            dos_header,
            stub,
            signature: pe::IMAGE_NT_SIGNATURE,
            file_header,
            optional_header: opt,
            data_directories: [zeroed(); DIRECTORY_COUNT],
            sections: Vec::new(),
        }
    }

    pub fn dos_header(&self) -> &ImageDosHeader {
        &self.dos_header
    }

    /// Bytes between the legacy header and the NT headers.
    pub fn stub(&self) -> &[u8] {
        &self.stub
    }

    pub fn signature(&self) -> u32 {
        self.signature
    }

    pub fn file_header(&self) -> &ImageFileHeader {
        &self.file_header
    }

    pub fn optional_header(&self) -> &ImageOptionalHeader32 {
        &self.optional_header
    }

    pub fn image_base(&self) -> u32 {
        self.optional_header.image_base.get(LE)
    }

    /// Section alignment from the optional header, or the default when unset.
    pub fn section_alignment(&self) -> u32 {
        match self.optional_header.section_alignment.get(LE) {
            0 => SECTION_ALIGNMENT,
            align => align,
        }
    }

    pub fn file_alignment(&self) -> u32 {
        match self.optional_header.file_alignment.get(LE) {
            0 => FILE_ALIGNMENT,
            align => align,
        }
    }

    /// Returns the data directory at `index`, if the header declares it.
    pub fn data_directory(&self, index: usize) -> Option<&ImageDataDirectory> {
        let declared = self.optional_header.number_of_rva_and_sizes.get(LE) as usize;
        if index >= declared {
            return None;
        }
        self.data_directories.get(index)
    }

    /// Replaces the data directory at `index`, returning the previous entry.
    ///
    /// Returns `None` and leaves the image untouched when `index` is past the
    /// fixed directory array.
    pub fn set_data_directory(
        &mut self,
        index: usize,
        virtual_address: u32,
        size: u32,
    ) -> Option<ImageDataDirectory> {
        let slot = self.data_directories.get_mut(index)?;
        let previous = *slot;
        slot.virtual_address = U32::new(LE, virtual_address);
        slot.size = U32::new(LE, size);
        Some(previous)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, index: usize) -> Option<&Section> {
        self.sections.get(index)
    }

    pub fn section_mut(&mut self, index: usize) -> Option<&mut Section> {
        self.sections.get_mut(index)
    }

    /// Appends a section and returns its index.
    ///
    /// The name is truncated to eight bytes. Overlap with existing sections
    /// is not checked.
    pub fn add_section(
        &mut self,
        name: &str,
        rva: u32,
        virtual_size: u32,
        data: &[u8],
        characteristics: u32,
    ) -> Result<usize> {
        let raw_size = u32::try_from(data.len())
            .map_err(|_| ImageError::unsupported("section data exceeds 4 GiB"))?;
        let count = u16::try_from(self.sections.len() + 1)
            .map_err(|_| ImageError::unsupported("too many sections"))?;

        let mut header: ImageSectionHeader = zeroed();
        let bytes = name.as_bytes();
        if bytes.len() > header.name.len() {
            warn!("section name {:?} truncated to {} bytes", name, header.name.len());
        }
        let len = bytes.len().min(header.name.len());
        header.name[..len].copy_from_slice(&bytes[..len]);
        header.characteristics = U32::new(LE, characteristics);
        header.virtual_address = U32::new(LE, rva);
        header.virtual_size = U32::new(LE, virtual_size);
        header.size_of_raw_data = U32::new(LE, raw_size);

        debug!(
            "adding section {:?} at RVA 0x{:x} (vsize 0x{:x}, raw 0x{:x})",
            name, rva, virtual_size, raw_size
        );
        self.sections.push(Section::new(header, data.to_vec()));
        self.file_header.number_of_sections = U16::new(LE, count);
        Ok(self.sections.len() - 1)
    }

    /// Removes the section at `index` and returns it.
    pub fn remove_section(&mut self, index: usize) -> Result<Section> {
        let count = self.sections.len();
        if index >= count {
            return Err(ImageError::SectionIndexOutOfRange { index, count });
        }
        let section = self.sections.remove(index);
        self.file_header.number_of_sections = U16::new(LE, (count - 1) as u16);
        debug!("removed section {:?}", section.name());
        Ok(section)
    }

    /// First relative address past the last section, aligned to the section
    /// alignment.
    ///
    /// Assumes the last section in the table has the highest address; the
    /// table order is not checked.
    pub fn next_free_rva(&self) -> Result<u32> {
        let align = u64::from(self.section_alignment());
        let next = match self.sections.last() {
            Some(last) => {
                u64::from(last.virtual_address()) + align_up(u64::from(last.virtual_size()), align)
            }
            None => align_up(self.size_of_headers(), align),
        };
        u32::try_from(next).map_err(|_| ImageError::unsupported("next free RVA exceeds 32 bits"))
    }

    /// Index of the first section whose virtual range contains `rva`.
    pub fn section_index_from_rva(&self, rva: u32) -> Result<usize> {
        self.sections
            .iter()
            .position(|s| s.contains_rva(rva))
            .ok_or(ImageError::AddressNotMapped(Address::Relative(rva)))
    }

    /// The first section whose virtual range contains `rva`.
    pub fn section_from_rva(&self, rva: u32) -> Result<&Section> {
        self.section_index_from_rva(rva).map(|i| &self.sections[i])
    }

    pub fn is_readable(&self, rva: u32) -> Result<bool> {
        self.section_from_rva(rva).map(Section::is_readable)
    }

    pub fn is_writable(&self, rva: u32) -> Result<bool> {
        self.section_from_rva(rva).map(Section::is_writable)
    }

    pub fn is_executable(&self, rva: u32) -> Result<bool> {
        self.section_from_rva(rva).map(Section::is_executable)
    }
}
