//! Utility functions.

use object::pod::Pod;

/// Aligns an address or size up to the next multiple of `align`.
///
/// Values read from an input image are not guaranteed to be powers of two,
/// so this rounds by remainder. An alignment of zero leaves `addr` untouched.
pub fn align_up(addr: u64, align: u64) -> u64 {
    if align == 0 {
        return addr;
    }
    addr.next_multiple_of(align)
}

/// Decodes an 8-byte section name, stopping at the first NUL.
pub fn section_name(raw: &[u8; 8]) -> String {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..len]).into_owned()
}

/// Returns an all-zero instance of a plain-old-data header record.
pub fn zeroed<T: Pod>() -> T {
    let bytes = vec![0u8; std::mem::size_of::<T>()];
    let (value, _) = object::pod::from_bytes::<T>(&bytes)
        .expect("header records have byte alignment");
    *value
}
