//! PE header checksum.
//!
//! The checksum is a 16-bit one's-complement style sum over the whole file
//! (with the `CheckSum` field zeroed), plus the file length.

/// Computes the image checksum of `data`.
///
/// The buffer is summed as little-endian 16-bit words. An odd trailing byte
/// is treated as if followed by a zero byte. Carries out of the low 16 bits
/// are folded back after every addition.
pub fn checksum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for word in data.chunks(2) {
        let hi = word.get(1).copied().unwrap_or(0);
        sum += u32::from(u16::from_le_bytes([word[0], hi]));
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum.wrapping_add(data.len() as u32)
}
