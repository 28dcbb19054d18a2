#![forbid(unsafe_code)]

/// Checksum of a page image. The block number is mixed in so a page written
/// to the wrong location fails verification.
pub fn page_crc32(block: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&block.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
