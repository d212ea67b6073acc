//! In-memory NOR flash.

use {
    crate::{
        error::{Error, FlashOp, Result},
        flash::{DOUBLE_WORD, ERASED_BYTE, FLASH_BASE, FLASH_SIZE, FlashMemory, PAGE_SIZE},
    },
    std::collections::HashSet,
};

/// In-memory flash with NOR semantics.
///
/// Programming can only clear bits, so writing a double word that is not
/// erased fails the same way the hardware reports a programming error.
/// Individual addresses can be armed to fail erase or program operations.
#[derive(Debug, Clone)]
pub struct SimFlash {
    base: u32,
    memory: Vec<u8>,
    fail_erase: HashSet<u32>,
    fail_program: HashSet<u32>,
    erase_count: usize,
    program_count: usize,
}

impl SimFlash {
    /// Create an erased flash of `size` bytes mapped at `base`.
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            memory: vec![ERASED_BYTE; size],
            fail_erase: HashSet::new(),
            fail_program: HashSet::new(),
            erase_count: 0,
            program_count: 0,
        }
    }

    /// Flash matching the target device.
    pub fn target() -> Self {
        Self::new(FLASH_BASE, FLASH_SIZE as usize)
    }

    /// Borrow `len` bytes at `address`.
    ///
    /// Panics if the range lies outside the device.
    pub fn slice(&self, address: u32, len: usize) -> &[u8] {
        let start = (address - self.base) as usize;
        &self.memory[start..start + len]
    }

    /// Make the next erase of the page at `address` fail.
    pub fn fail_erase_at(&mut self, address: u32) {
        self.fail_erase
            .insert(address);
    }

    /// Make the next program of the double word at `address` fail.
    pub fn fail_program_at(&mut self, address: u32) {
        self.fail_program
            .insert(address);
    }

    /// Number of successful page erases.
    pub fn erase_count(&self) -> usize {
        self.erase_count
    }

    /// Number of successful double-word programs.
    pub fn program_count(&self) -> usize {
        self.program_count
    }

    fn offset(&self, address: u32, len: usize) -> Result<usize> {
        let out_of_range = Error::OutOfRange { address, len };
        let offset = address
            .checked_sub(self.base)
            .ok_or(out_of_range)? as usize;
        if offset + len > self.memory.len() {
            return Err(Error::OutOfRange { address, len });
        }
        Ok(offset)
    }
}

impl FlashMemory for SimFlash {
    fn erase_page(&mut self, address: u32) -> Result<()> {
        let offset = self.offset(address, PAGE_SIZE)?;
        if offset % PAGE_SIZE != 0 {
            return Err(Error::Misaligned {
                address,
                align: PAGE_SIZE as u32,
            });
        }
        if self
            .fail_erase
            .remove(&address)
        {
            return Err(Error::Flash {
                op: FlashOp::Erase,
                address,
            });
        }

        self.memory[offset..offset + PAGE_SIZE].fill(ERASED_BYTE);
        self.erase_count += 1;
        Ok(())
    }

    fn program_double_word(&mut self, address: u32, data: [u8; DOUBLE_WORD]) -> Result<()> {
        if address % DOUBLE_WORD as u32 != 0 {
            return Err(Error::Misaligned {
                address,
                align: DOUBLE_WORD as u32,
            });
        }
        let offset = self.offset(address, DOUBLE_WORD)?;
        let target = &mut self.memory[offset..offset + DOUBLE_WORD];
        if self
            .fail_program
            .remove(&address)
            || target
                .iter()
                .any(|&b| b != ERASED_BYTE)
        {
            return Err(Error::Flash {
                op: FlashOp::Program,
                address,
            });
        }

        target.copy_from_slice(&data);
        self.program_count += 1;
        Ok(())
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<()> {
        let offset = self.offset(address, buf.len())?;
        buf.copy_from_slice(&self.memory[offset..offset + buf.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_flash_is_erased() {
        let flash = SimFlash::new(0x0800_0000, PAGE_SIZE);
        assert!(
            flash
                .slice(0x0800_0000, PAGE_SIZE)
                .iter()
                .all(|&b| b == ERASED_BYTE)
        );
    }

    #[test]
    fn test_program_requires_erase() {
        let mut flash = SimFlash::new(0x0800_0000, PAGE_SIZE);
        flash
            .program_double_word(0x0800_0000, [0; 8])
            .unwrap();
        assert!(matches!(
            flash.program_double_word(0x0800_0000, [0; 8]),
            Err(Error::Flash {
                op: FlashOp::Program,
                ..
            })
        ));

        flash.erase_page(0x0800_0000).unwrap();
        flash
            .program_double_word(0x0800_0000, [1; 8])
            .unwrap();
        assert_eq!(flash.slice(0x0800_0000, 8), &[1; 8]);
    }

    #[test]
    fn test_alignment_and_bounds() {
        let mut flash = SimFlash::new(0x0800_0000, PAGE_SIZE);
        assert!(matches!(
            flash.program_double_word(0x0800_0004, [0; 8]),
            Err(Error::Misaligned { align: 8, .. })
        ));
        assert!(matches!(
            flash.erase_page(0x0800_0800),
            Err(Error::OutOfRange { .. })
        ));
        let mut buf = [0u8; 4];
        assert!(flash.read(0x07FF_FFFE, &mut buf).is_err());
    }

    #[test]
    fn test_injected_failures_fire_once() {
        let mut flash = SimFlash::new(0x0800_0000, PAGE_SIZE);
        flash.fail_erase_at(0x0800_0000);
        assert!(flash.erase_page(0x0800_0000).is_err());
        assert!(flash.erase_page(0x0800_0000).is_ok());
        assert_eq!(flash.erase_count(), 1);
    }
}
