//! Persistent update record.
//!
//! One flash page holds a fixed-layout record that survives reset and
//! tells the boot path what to do:
//!
//! | offset | field                | encoding                         |
//! |--------|----------------------|----------------------------------|
//! | 0      | magic                | `0x4ED177EC`                     |
//! | 4      | `flag_update`        | `0` = set, `1` = clear           |
//! | 8      | `flag_block_updates` | `0` = set, `1` = clear           |
//! | 12     | `version`            | u32                              |
//! | 16     | `fw_received_size`   | u32                              |
//! | 20     | `fw_crc`             | u32                              |
//! | 24     | padding              | `0xFFFFFFFF` × 2                 |
//! | 32     | swap journal         | one double word per promoted page |
//!
//! Any change to the fields erases the page and reprograms every field. A
//! power loss in between leaves an erased page, which reads back as "no
//! record". Swap progress is never written that way: each promoted page
//! programs the next journal double word to zero, so recording progress
//! only clears bits and the fields above stay intact.

use {
    crate::{
        error::{Error, Result},
        flash::{DOUBLE_WORD, ERASED_BYTE, FlashMemory, PAGE_SIZE, program_bytes},
    },
    byteorder::{ByteOrder, LittleEndian},
    log::{debug, info},
};

/// Marker identifying a written record.
pub const RECORD_MAGIC: u32 = 0x4ED1_77EC;

/// Encoded record size, padded to whole double words.
pub const RECORD_SIZE: usize = 32;

/// Pages the swap journal can track.
pub const SWAP_JOURNAL_ENTRIES: u32 = ((PAGE_SIZE - RECORD_SIZE) / DOUBLE_WORD) as u32;

const FLAG_TRUE: u32 = 0;
const FLAG_FALSE: u32 = 1;
const JOURNAL_MARK: [u8; DOUBLE_WORD] = [0; DOUBLE_WORD];

/// Decoded update record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UpdateRecord {
    /// A new image is staged and awaits validation.
    pub flag_update: bool,
    /// Updates are refused.
    pub flag_block_updates: bool,
    /// Application-defined firmware version.
    pub version: u32,
    /// Size of the staged image.
    pub fw_received_size: u32,
    /// CRC of the staged image.
    pub fw_crc: u32,
    /// Pages already promoted by an interrupted swap. Kept in the swap
    /// journal, not in the encoded fields.
    pub swap_progress: Option<u32>,
}

impl UpdateRecord {
    /// Encode into the on-flash layout.
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [ERASED_BYTE; RECORD_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], RECORD_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], encode_flag(self.flag_update));
        LittleEndian::write_u32(&mut buf[8..12], encode_flag(self.flag_block_updates));
        LittleEndian::write_u32(&mut buf[12..16], self.version);
        LittleEndian::write_u32(&mut buf[16..20], self.fw_received_size);
        LittleEndian::write_u32(&mut buf[20..24], self.fw_crc);
        buf
    }

    /// Decode, returning `None` when the magic is absent.
    ///
    /// `swap_progress` is left empty; [`RecordStore::load`] fills it from
    /// the journal.
    pub fn decode(buf: &[u8; RECORD_SIZE]) -> Option<Self> {
        if LittleEndian::read_u32(&buf[0..4]) != RECORD_MAGIC {
            return None;
        }
        Some(Self {
            flag_update: LittleEndian::read_u32(&buf[4..8]) == FLAG_TRUE,
            flag_block_updates: LittleEndian::read_u32(&buf[8..12]) == FLAG_TRUE,
            version: LittleEndian::read_u32(&buf[12..16]),
            fw_received_size: LittleEndian::read_u32(&buf[16..20]),
            fw_crc: LittleEndian::read_u32(&buf[20..24]),
            swap_progress: None,
        })
    }

    /// Copy with the fields present in `update` replaced.
    #[must_use]
    pub fn apply(mut self, update: &RecordUpdate) -> Self {
        if let Some(flag) = update.update {
            self.flag_update = flag;
        }
        if let Some(flag) = update.block_updates {
            self.flag_block_updates = flag;
        }
        if let Some(version) = update.version {
            self.version = version;
        }
        if let Some(size) = update.received_size {
            self.fw_received_size = size;
        }
        if let Some(crc) = update.crc {
            self.fw_crc = crc;
        }
        if let Some(progress) = update.swap_progress {
            self.swap_progress = progress;
        }
        self
    }
}

fn encode_flag(flag: bool) -> u32 {
    if flag { FLAG_TRUE } else { FLAG_FALSE }
}

/// Partial change to a record. `None` leaves the field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    /// New `flag_update`.
    pub update: Option<bool>,
    /// New `flag_block_updates`.
    pub block_updates: Option<bool>,
    /// New version.
    pub version: Option<u32>,
    /// New staged size.
    pub received_size: Option<u32>,
    /// New staged CRC.
    pub crc: Option<u32>,
    /// New swap progress; `Some(None)` clears it.
    pub swap_progress: Option<Option<u32>>,
}

impl RecordUpdate {
    /// An update that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `flag_update`.
    #[must_use]
    pub fn update(mut self, flag: bool) -> Self {
        self.update = Some(flag);
        self
    }

    /// Set `flag_block_updates`.
    #[must_use]
    pub fn block_updates(mut self, flag: bool) -> Self {
        self.block_updates = Some(flag);
        self
    }

    /// Set the version.
    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Set the staged image size.
    #[must_use]
    pub fn received_size(mut self, size: u32) -> Self {
        self.received_size = Some(size);
        self
    }

    /// Set the staged image CRC.
    #[must_use]
    pub fn crc(mut self, crc: u32) -> Self {
        self.crc = Some(crc);
        self
    }

    /// Set or clear the swap progress.
    #[must_use]
    pub fn swap_progress(mut self, progress: Option<u32>) -> Self {
        self.swap_progress = Some(progress);
        self
    }
}

/// Access to the record page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordStore {
    address: u32,
}

impl RecordStore {
    /// Store whose page starts at `address`.
    pub const fn new(address: u32) -> Self {
        Self { address }
    }

    /// Page address.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Read the record, `None` if the page holds no valid magic.
    pub fn load<F: FlashMemory + ?Sized>(&self, flash: &F) -> Result<Option<UpdateRecord>> {
        let mut buf = [0u8; RECORD_SIZE];
        flash.read(self.address, &mut buf)?;
        let Some(mut record) = UpdateRecord::decode(&buf) else {
            return Ok(None);
        };
        let promoted = self.journal_len(flash)?;
        record.swap_progress = (promoted > 0).then_some(promoted);
        Ok(Some(record))
    }

    fn journal_address(&self, entry: u32) -> Result<u32> {
        if entry >= SWAP_JOURNAL_ENTRIES {
            return Err(Error::OutOfRange {
                address: self.address + RECORD_SIZE as u32,
                len: (entry as usize + 1) * DOUBLE_WORD,
            });
        }
        Ok(self.address + RECORD_SIZE as u32 + entry * DOUBLE_WORD as u32)
    }

    /// Leading journal entries with any bit programmed. An entry torn by a
    /// power loss still counts: it is only written once its page is copied.
    fn journal_len<F: FlashMemory + ?Sized>(&self, flash: &F) -> Result<u32> {
        let mut word = [0u8; DOUBLE_WORD];
        for entry in 0..SWAP_JOURNAL_ENTRIES {
            flash.read(self.journal_address(entry)?, &mut word)?;
            if word == [ERASED_BYTE; DOUBLE_WORD] {
                return Ok(entry);
            }
        }
        Ok(SWAP_JOURNAL_ENTRIES)
    }

    /// Note that `pages` pages of a swap are done, without erasing.
    ///
    /// Programs every journal entry below `pages` that is still erased.
    pub fn record_swap_progress<F: FlashMemory + ?Sized>(
        &self,
        flash: &mut F,
        pages: u32,
    ) -> Result<()> {
        if let Some(last) = pages.checked_sub(1) {
            self.journal_address(last)?;
        }
        let mut word = [0u8; DOUBLE_WORD];
        for entry in 0..pages {
            let address = self.journal_address(entry)?;
            flash.read(address, &mut word)?;
            if word == [ERASED_BYTE; DOUBLE_WORD] {
                flash.program_double_word(address, JOURNAL_MARK)?;
            }
        }
        Ok(())
    }

    /// Read the record, substituting defaults for a missing one.
    pub fn read<F: FlashMemory + ?Sized>(&self, flash: &F) -> Result<UpdateRecord> {
        Ok(self
            .load(flash)?
            .unwrap_or_default())
    }

    /// Erase the page and program the full record, then replay its swap
    /// progress into the fresh journal.
    pub fn write<F: FlashMemory + ?Sized>(&self, flash: &mut F, record: &UpdateRecord) -> Result<()> {
        debug!("Writing update record: {record:?}");
        flash.erase_page(self.address)?;
        program_bytes(flash, self.address, &record.encode())?;
        match record.swap_progress {
            Some(pages) => self.record_swap_progress(flash, pages),
            None => Ok(()),
        }
    }

    /// Read-modify-write with the fields present in `update`.
    pub fn set_flags<F: FlashMemory + ?Sized>(
        &self,
        flash: &mut F,
        update: &RecordUpdate,
    ) -> Result<UpdateRecord> {
        let record = self
            .read(&*flash)?
            .apply(update);
        self.write(flash, &record)?;
        Ok(record)
    }

    /// Write the defaults when no valid record exists.
    pub fn init_if_needed<F: FlashMemory + ?Sized>(&self, flash: &mut F) -> Result<UpdateRecord> {
        if let Some(record) = self.load(&*flash)? {
            return Ok(record);
        }
        info!("No update record at {:#010x}, writing defaults", self.address);
        let record = UpdateRecord::default();
        self.write(flash, &record)?;
        Ok(record)
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use {
        super::*,
        crate::{
            flash::{PAGE_SIZE, RECORD_ADDRESS},
            sim::SimFlash,
        },
    };

    fn store_and_flash() -> (RecordStore, SimFlash) {
        (
            RecordStore::new(RECORD_ADDRESS),
            SimFlash::new(RECORD_ADDRESS, PAGE_SIZE),
        )
    }

    #[test]
    fn test_erased_page_has_no_record() {
        let (store, flash) = store_and_flash();
        assert_eq!(store.load(&flash).unwrap(), None);
        assert_eq!(store.read(&flash).unwrap(), UpdateRecord::default());
    }

    #[test]
    fn test_on_flash_encoding() {
        let record = UpdateRecord {
            flag_update: true,
            flag_block_updates: false,
            version: 3,
            fw_received_size: 0x800,
            fw_crc: 0x1122_3344,
            swap_progress: None,
        };
        let buf = record.encode();
        assert_eq!(&buf[0..4], &[0xEC, 0x77, 0xD1, 0x4E]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
        assert_eq!(&buf[8..12], &[1, 0, 0, 0]);
        assert_eq!(&buf[24..32], &[0xFF; 8]);
        assert_eq!(UpdateRecord::decode(&buf), Some(record));
    }

    #[test]
    fn test_write_then_read_twice_is_identical() {
        let (store, mut flash) = store_and_flash();
        let record = UpdateRecord {
            version: 7,
            fw_received_size: 1234,
            fw_crc: 0xDEAD_BEEF,
            ..UpdateRecord::default()
        };
        store
            .write(&mut flash, &record)
            .unwrap();

        let first = store.read(&flash).unwrap();
        let second = store.read(&flash).unwrap();
        assert_eq!(first, record);
        assert_eq!(first, second);
    }

    #[test]
    fn test_set_flags_leaves_unspecified_fields() {
        let (store, mut flash) = store_and_flash();
        store
            .write(
                &mut flash,
                &UpdateRecord {
                    version: 2,
                    fw_crc: 0xAAAA_AAAA,
                    ..UpdateRecord::default()
                },
            )
            .unwrap();

        let updated = store
            .set_flags(
                &mut flash,
                &RecordUpdate::new()
                    .update(true)
                    .received_size(4096),
            )
            .unwrap();

        assert!(updated.flag_update);
        assert_eq!(updated.version, 2);
        assert_eq!(updated.fw_crc, 0xAAAA_AAAA);
        assert_eq!(updated.fw_received_size, 4096);
        assert_eq!(store.read(&flash).unwrap(), updated);
    }

    #[test]
    fn test_all_ones_crc_is_storable() {
        let (store, mut flash) = store_and_flash();
        let record = store
            .set_flags(&mut flash, &RecordUpdate::new().crc(0xFFFF_FFFF))
            .unwrap();
        assert_eq!(store.read(&flash).unwrap().fw_crc, 0xFFFF_FFFF);
        assert_eq!(record.fw_crc, 0xFFFF_FFFF);
    }

    #[test]
    fn test_init_if_needed_writes_defaults_once() {
        let (store, mut flash) = store_and_flash();
        store
            .init_if_needed(&mut flash)
            .unwrap();
        assert_eq!(flash.erase_count(), 1);
        assert!(store.load(&flash).unwrap().is_some());

        store
            .init_if_needed(&mut flash)
            .unwrap();
        assert_eq!(flash.erase_count(), 1);
    }

    #[test]
    fn test_interrupted_write_reads_as_missing() {
        let (store, mut flash) = store_and_flash();
        store
            .write(&mut flash, &UpdateRecord::default())
            .unwrap();
        flash.fail_program_at(RECORD_ADDRESS);

        assert!(
            store
                .write(&mut flash, &UpdateRecord::default())
                .is_err()
        );
        assert_eq!(store.load(&flash).unwrap(), None);
    }

    #[test]
    fn test_swap_progress_set_and_clear() {
        let (store, mut flash) = store_and_flash();
        let record = store
            .set_flags(&mut flash, &RecordUpdate::new().swap_progress(Some(4)))
            .unwrap();
        assert_eq!(record.swap_progress, Some(4));

        assert_eq!(store.read(&flash).unwrap().swap_progress, Some(4));

        let record = store
            .set_flags(&mut flash, &RecordUpdate::new().swap_progress(None))
            .unwrap();
        assert_eq!(record.swap_progress, None);
        assert_eq!(store.read(&flash).unwrap().swap_progress, None);
    }

    #[test]
    fn test_swap_progress_never_erases_the_record() {
        let (store, mut flash) = store_and_flash();
        let record = store
            .set_flags(
                &mut flash,
                &RecordUpdate::new()
                    .update(true)
                    .received_size(3 * PAGE_SIZE as u32)
                    .crc(0x1234),
            )
            .unwrap();
        let erases = flash.erase_count();

        for pages in 1..=3 {
            store
                .record_swap_progress(&mut flash, pages)
                .unwrap();
            let loaded = store
                .load(&flash)
                .unwrap()
                .unwrap();
            assert_eq!(loaded.swap_progress, Some(pages));
            assert_eq!(loaded.fw_crc, record.fw_crc);
        }
        assert_eq!(flash.erase_count(), erases);
    }

    #[test]
    fn test_failed_journal_write_keeps_record_and_earlier_progress() {
        let (store, mut flash) = store_and_flash();
        store
            .set_flags(&mut flash, &RecordUpdate::new().update(true))
            .unwrap();
        store
            .record_swap_progress(&mut flash, 1)
            .unwrap();
        flash.fail_program_at(RECORD_ADDRESS + RECORD_SIZE as u32 + DOUBLE_WORD as u32);

        assert!(
            store
                .record_swap_progress(&mut flash, 2)
                .is_err()
        );
        let record = store
            .load(&flash)
            .unwrap()
            .unwrap();
        assert!(record.flag_update);
        assert_eq!(record.swap_progress, Some(1));
    }

    #[test]
    fn test_journal_is_bounded() {
        let (store, mut flash) = store_and_flash();
        store
            .write(&mut flash, &UpdateRecord::default())
            .unwrap();
        assert!(matches!(
            store.record_swap_progress(&mut flash, SWAP_JOURNAL_ENTRIES + 1),
            Err(Error::OutOfRange { .. })
        ));
    }
}
