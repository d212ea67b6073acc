//! Flash abstraction and memory layout.
//!
//! The engine never touches flash registers. It drives a [`FlashMemory`]
//! implementation that exposes the three primitives the hardware offers:
//! page erase, double-word program and memory-mapped read.
//!
//! ```text
//! 0x0800_0000 +------------------+
//!             |   bootloader     |
//! 0x0800_4000 +------------------+  slot A (executable)
//!             |   application    |
//!             +------------------+  slot B (dual-slot layout only)
//!             |   staged image   |
//! 0x0803_E000 +------------------+  free page (dual-slot layout only)
//! 0x0803_E800 +------------------+  update record page
//!             |   record         |
//! 0x0804_0000 +------------------+
//! ```

pub mod swap;

pub use swap::swap_bank;

use {
    crate::error::{Error, Result},
    log::trace,
};

/// Flash page size in bytes.
pub const PAGE_SIZE: usize = 2048;

/// Value of an erased flash byte.
pub const ERASED_BYTE: u8 = 0xFF;

/// Programming granularity in bytes.
pub const DOUBLE_WORD: usize = 8;

/// Start of flash on the target.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Total flash size on the target.
pub const FLASH_SIZE: u32 = 256 * 1024;

/// First byte of application slot A.
pub const APP_A_ADDRESS: u32 = 0x0800_4000;

/// Page reserved between the slots and the record in the dual-slot layout.
pub const FREE_PAGE_ADDRESS: u32 = 0x0803_E000;

/// Page holding the persistent update record.
pub const RECORD_ADDRESS: u32 = 0x0803_E800;

/// Raw flash primitives.
pub trait FlashMemory {
    /// Erase the page starting at `address`.
    fn erase_page(&mut self, address: u32) -> Result<()>;

    /// Program eight bytes at a double-word aligned `address`.
    fn program_double_word(&mut self, address: u32, data: [u8; DOUBLE_WORD]) -> Result<()>;

    /// Read `buf.len()` bytes starting at `address`.
    fn read(&self, address: u32, buf: &mut [u8]) -> Result<()>;
}

impl<F: FlashMemory + ?Sized> FlashMemory for &mut F {
    fn erase_page(&mut self, address: u32) -> Result<()> {
        (**self).erase_page(address)
    }

    fn program_double_word(&mut self, address: u32, data: [u8; DOUBLE_WORD]) -> Result<()> {
        (**self).program_double_word(address, data)
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read(address, buf)
    }
}

/// Program `data` at `address` one double word at a time.
///
/// A trailing partial double word is padded with [`ERASED_BYTE`].
pub fn program_bytes<F: FlashMemory + ?Sized>(flash: &mut F, address: u32, data: &[u8]) -> Result<()> {
    if address % DOUBLE_WORD as u32 != 0 {
        return Err(Error::Misaligned {
            address,
            align: DOUBLE_WORD as u32,
        });
    }

    for (i, chunk) in data.chunks(DOUBLE_WORD).enumerate() {
        let mut word = [ERASED_BYTE; DOUBLE_WORD];
        word[..chunk.len()].copy_from_slice(chunk);
        flash.program_double_word(address + (i * DOUBLE_WORD) as u32, word)?;
    }
    Ok(())
}

/// Erase `pages` consecutive pages starting at `address`.
pub fn erase_pages<F: FlashMemory + ?Sized>(flash: &mut F, address: u32, pages: u32) -> Result<()> {
    trace!("Erasing {pages} pages from {address:#010x}");
    for page in 0..pages {
        flash.erase_page(address + page * PAGE_SIZE as u32)?;
    }
    Ok(())
}

/// Where incoming images are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StagingMode {
    /// Write straight into the executable slot.
    Direct,
    /// Write into a secondary slot and promote it at boot.
    Secondary,
}

/// Addresses of the regions the bootloader manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashLayout {
    /// Start of the flash device.
    pub flash_base: u32,
    /// Size of the flash device in bytes.
    pub flash_size: u32,
    /// First byte of the executable slot.
    pub app_address: u32,
    /// Size of each slot in bytes.
    pub slot_size: u32,
    /// First byte of the page holding the update record.
    pub record_address: u32,
    /// Where images are staged.
    pub staging: StagingMode,
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self::single_slot()
    }
}

impl FlashLayout {
    /// Layout staging images straight into slot A.
    pub const fn single_slot() -> Self {
        Self {
            flash_base: FLASH_BASE,
            flash_size: FLASH_SIZE,
            app_address: APP_A_ADDRESS,
            slot_size: RECORD_ADDRESS - APP_A_ADDRESS,
            record_address: RECORD_ADDRESS,
            staging: StagingMode::Direct,
        }
    }

    /// Layout staging images into slot B and promoting them at boot.
    pub const fn dual_slot() -> Self {
        Self {
            flash_base: FLASH_BASE,
            flash_size: FLASH_SIZE,
            app_address: APP_A_ADDRESS,
            slot_size: (FREE_PAGE_ADDRESS - APP_A_ADDRESS) / 2,
            record_address: RECORD_ADDRESS,
            staging: StagingMode::Secondary,
        }
    }

    /// Address of the secondary slot, if this layout has one.
    pub fn secondary_address(&self) -> Option<u32> {
        match self.staging {
            StagingMode::Direct => None,
            StagingMode::Secondary => Some(self.app_address + self.slot_size),
        }
    }

    /// Address images are written to during reception.
    pub fn staging_address(&self) -> u32 {
        self.secondary_address()
            .unwrap_or(self.app_address)
    }

    /// Number of pages in one slot.
    pub fn slot_pages(&self) -> u32 {
        self.slot_size / PAGE_SIZE as u32
    }

    /// Largest image the layout accepts.
    pub fn max_image_size(&self) -> u32 {
        self.slot_pages() * PAGE_SIZE as u32
    }

    /// Check alignment and that no region overlaps another or leaves flash.
    pub fn validate(&self) -> Result<()> {
        let page = PAGE_SIZE as u32;
        for address in [self.app_address, self.record_address, self.flash_base] {
            if address % page != 0 {
                return Err(Error::Misaligned {
                    address,
                    align: page,
                });
            }
        }
        if self.slot_size == 0 || self.slot_size % page != 0 {
            return Err(Error::InvalidLayout("slot size must be a non-zero multiple of the page size"));
        }

        let slots = match self.staging {
            StagingMode::Direct => 1,
            StagingMode::Secondary => 2,
        };
        let slots_end = self
            .app_address
            .checked_add(self.slot_size * slots)
            .ok_or(Error::InvalidLayout("slots overflow the address space"))?;

        if self.app_address < self.flash_base {
            return Err(Error::InvalidLayout("application slot starts before flash"));
        }
        if slots_end > self.record_address {
            return Err(Error::InvalidLayout("slots overlap the update record"));
        }
        if self.record_address + page > self.flash_base + self.flash_size {
            return Err(Error::InvalidLayout("update record lies outside flash"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slot_layout() {
        let layout = FlashLayout::single_slot();
        assert_eq!(layout.staging_address(), 0x0800_4000);
        assert_eq!(layout.max_image_size(), 0x3A800);
        assert_eq!(layout.slot_pages(), 117);
        assert!(layout.secondary_address().is_none());
        layout.validate().unwrap();
    }

    #[test]
    fn test_dual_slot_layout() {
        let layout = FlashLayout::dual_slot();
        assert_eq!(layout.slot_size, 0x1D000);
        assert_eq!(layout.secondary_address(), Some(0x0802_1000));
        assert_eq!(layout.staging_address(), 0x0802_1000);
        layout.validate().unwrap();
    }

    #[test]
    fn test_layout_rejects_overlap_with_record() {
        let mut layout = FlashLayout::single_slot();
        layout.slot_size += PAGE_SIZE as u32;
        assert!(matches!(layout.validate(), Err(Error::InvalidLayout(_))));
    }

    #[test]
    fn test_layout_rejects_misaligned_slot() {
        let mut layout = FlashLayout::single_slot();
        layout.app_address += 4;
        assert!(matches!(layout.validate(), Err(Error::Misaligned { .. })));
    }
}
