//! CRC-32 engine.
//!
//! All checksums use CRC-32/MPEG-2 (poly 0x04C11DB7, init 0xFFFFFFFF, no
//! reflection, no final xor), the same parameters as the STM32 CRC unit in
//! its reset configuration. Bytes are always fed in transmission order.

use {
    crate::{error::Result, flash::FlashMemory},
    crc::{CRC_32_MPEG_2, Crc},
};

/// Shared CRC-32/MPEG-2 instance.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Size of a four-word block in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Bytes read from flash per step when checksumming a region.
const REGION_CHUNK: usize = 256;

/// Checksum over an arbitrary byte span.
///
/// Bytes are fed in order with no word padding, so a trailing partial word
/// gives the same result as [`region_checksum`] over the same bytes in
/// flash.
pub fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Checksum over a block of four 32-bit words.
pub fn block_checksum(block: &[u8; BLOCK_SIZE]) -> u32 {
    CRC32.checksum(block)
}

/// Checksum over a short control payload, zero-padded to one block.
///
/// Payloads longer than a block are truncated; control payloads never
/// exceed [`BLOCK_SIZE`].
pub fn padded_block_checksum(payload: &[u8]) -> u32 {
    let mut block = [0u8; BLOCK_SIZE];
    let len = payload.len().min(BLOCK_SIZE);
    block[..len].copy_from_slice(&payload[..len]);
    block_checksum(&block)
}

/// Checksum over `len` bytes of flash starting at `address`.
///
/// Reads exactly `len` bytes, so a non-word-aligned tail is included.
pub fn region_checksum<F: FlashMemory + ?Sized>(flash: &F, address: u32, len: u32) -> Result<u32> {
    let mut digest = CRC32.digest();
    let mut chunk = [0u8; REGION_CHUNK];
    let mut offset = 0u32;

    while offset < len {
        let step = ((len - offset) as usize).min(REGION_CHUNK);
        flash.read(address + offset, &mut chunk[..step])?;
        digest.update(&chunk[..step]);
        offset += step as u32;
    }

    Ok(digest.finalize())
}
