//! Address translation.
//!
//! An image is addressed in four spaces:
//! - `Relative`: offset from the image base (RVA).
//! - `Virtual`: RVA plus the configured image base.
//! - `FileOffset`: byte offset in the serialized file.
//! - `Pointer`: offset into one section's in-memory buffer.
//!
//! All conversions between two non-relative spaces go through the relative
//! space. Section lookups scan the table in order and the first match wins.

use std::fmt;

use crate::error::{ImageError, Result};
use crate::image::Image;

/// Tag identifying an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Relative,
    Virtual,
    FileOffset,
    Pointer,
}

/// An address tagged with its space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    Relative(u32),
    Virtual(u32),
    FileOffset(u32),
    /// Offset into the buffer of the section at index `section`.
    Pointer { section: usize, offset: usize },
}

impl Address {
    pub fn kind(&self) -> AddressKind {
        match self {
            Address::Relative(_) => AddressKind::Relative,
            Address::Virtual(_) => AddressKind::Virtual,
            Address::FileOffset(_) => AddressKind::FileOffset,
            Address::Pointer { .. } => AddressKind::Pointer,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Relative(v) => write!(f, "RVA 0x{:08x}", v),
            Address::Virtual(v) => write!(f, "VA 0x{:08x}", v),
            Address::FileOffset(v) => write!(f, "file offset 0x{:08x}", v),
            Address::Pointer { section, offset } => {
                write!(f, "section #{} + 0x{:x}", section, offset)
            }
        }
    }
}

fn out_of_range(kind: AddressKind, value: impl Into<u64>) -> ImageError {
    ImageError::AddressOutOfRange {
        kind,
        value: value.into(),
    }
}

impl Image {
    /// Converts `address` into the space named by `to`.
    pub fn convert(&self, address: Address, to: AddressKind) -> Result<Address> {
        if address.kind() == to {
            return Ok(address);
        }
        let rva = self.to_relative(address)?;
        self.from_relative(rva, to)
    }

    /// Converts any address to an RVA.
    pub fn to_relative(&self, address: Address) -> Result<u32> {
        match address {
            Address::Relative(rva) => Ok(rva),
            Address::Virtual(va) => {
                let base = u64::from(self.image_base());
                let va64 = u64::from(va);
                if va64 < base || va64 >= base + self.size_of_image() {
                    return Err(out_of_range(AddressKind::Virtual, va));
                }
                Ok((va64 - base) as u32)
            }
            Address::FileOffset(offset) => {
                let section = self
                    .sections
                    .iter()
                    .find(|s| s.contains_file_offset(offset))
                    .ok_or(ImageError::AddressNotMapped(address))?;
                let rva = u64::from(section.virtual_address())
                    + u64::from(offset - section.pointer_to_raw_data());
                u32::try_from(rva).map_err(|_| out_of_range(AddressKind::Relative, rva))
            }
            Address::Pointer { section, offset } => {
                let s = self
                    .sections
                    .get(section)
                    .filter(|s| offset < s.data.len())
                    .ok_or(ImageError::AddressNotMapped(address))?;
                let rva = u64::from(s.virtual_address()) + offset as u64;
                u32::try_from(rva).map_err(|_| out_of_range(AddressKind::Relative, rva))
            }
        }
    }

    /// Converts an RVA into the space named by `to`.
    pub fn from_relative(&self, rva: u32, to: AddressKind) -> Result<Address> {
        match to {
            AddressKind::Relative => Ok(Address::Relative(rva)),
            AddressKind::Virtual => {
                if u64::from(rva) >= self.size_of_image() {
                    return Err(out_of_range(AddressKind::Relative, rva));
                }
                let va = u64::from(self.image_base()) + u64::from(rva);
                u32::try_from(va)
                    .map(Address::Virtual)
                    .map_err(|_| out_of_range(AddressKind::Virtual, va))
            }
            AddressKind::FileOffset => {
                let section = self
                    .sections
                    .iter()
                    .find(|s| s.contains_rva(rva))
                    .ok_or(ImageError::AddressNotMapped(Address::Relative(rva)))?;
                let offset = u64::from(section.pointer_to_raw_data())
                    + u64::from(rva - section.virtual_address());
                u32::try_from(offset)
                    .map(Address::FileOffset)
                    .map_err(|_| out_of_range(AddressKind::FileOffset, offset))
            }
            AddressKind::Pointer => {
                let (section, offset) = self.pointer_from_relative(rva)?;
                Ok(Address::Pointer { section, offset })
            }
        }
    }

    fn pointer_from_relative(&self, rva: u32) -> Result<(usize, usize)> {
        let section = self
            .sections
            .iter()
            .position(|s| s.contains_data_rva(rva))
            .ok_or(ImageError::AddressNotMapped(Address::Relative(rva)))?;
        let offset = (rva - self.sections[section].virtual_address()) as usize;
        Ok((section, offset))
    }

    /// Locates `len` bytes at `rva` inside a single section buffer.
    fn data_window(&self, rva: u32, len: usize) -> Result<(usize, usize)> {
        let (section, offset) = self.pointer_from_relative(rva)?;
        let available = self.sections[section].data.len() - offset;
        if len > available {
            return Err(ImageError::unsupported(format!(
                "0x{:x} bytes at RVA 0x{:08x} cross the end of section {:?}",
                len,
                rva,
                self.sections[section].name()
            )));
        }
        Ok((section, offset))
    }

    /// Borrows `len` bytes of section data starting at `rva`.
    pub fn bytes_at(&self, rva: u32, len: usize) -> Result<&[u8]> {
        let (section, offset) = self.data_window(rva, len)?;
        Ok(&self.sections[section].data[offset..offset + len])
    }

    /// Mutably borrows `len` bytes of section data starting at `rva`.
    pub fn bytes_at_mut(&mut self, rva: u32, len: usize) -> Result<&mut [u8]> {
        let (section, offset) = self.data_window(rva, len)?;
        Ok(&mut self.sections[section].data[offset..offset + len])
    }

    pub fn read_u32(&self, rva: u32) -> Result<u32> {
        let bytes = self.bytes_at(rva, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&mut self, rva: u32, value: u32) -> Result<()> {
        self.bytes_at_mut(rva, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}
