//! Page buffer and flash writer.
//!
//! Data packets arrive in chunks of up to 256 bytes while flash is erased
//! and verified per 2048-byte page. The writer re-chunks the stream into
//! pages, checks each page against the CRC announced in its bulk header,
//! and only then programs it.

use {
    crate::{
        engine::FirmwareTransfer,
        error::{Error, Result},
        flash::{ERASED_BYTE, FlashMemory, PAGE_SIZE, program_bytes},
        protocol::crc::checksum,
    },
    log::{debug, warn},
};

/// What a call to [`PageWriter::process_data`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Bytes were buffered; no page was due.
    Buffered {
        /// Bytes taken from the payload.
        copied: usize,
    },
    /// A page was verified and programmed.
    Committed {
        /// Address the page was written to.
        address: u32,
        /// CRC of the page contents before padding.
        crc: u32,
        /// Whether the page was padded with the erase value.
        padded: bool,
    },
}

/// Page-sized staging buffer with a write cursor into flash.
pub struct PageWriter {
    buffer: [u8; PAGE_SIZE],
    offset: usize,
    base: u32,
    cursor: u32,
    last_page_crc: Option<u32>,
}

impl PageWriter {
    /// Writer whose first page goes to `base`.
    pub const fn new(base: u32) -> Self {
        Self {
            buffer: [ERASED_BYTE; PAGE_SIZE],
            offset: 0,
            base,
            cursor: base,
            last_page_crc: None,
        }
    }

    /// Bytes currently buffered.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Address of the next page to program.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// CRC of the last page that was flushed, matched or not.
    pub fn last_page_crc(&self) -> Option<u32> {
        self.last_page_crc
    }

    /// Empty the buffer and move the cursor back to `base`.
    pub fn reset(&mut self, base: u32) {
        self.clear();
        self.base = base;
        self.cursor = base;
        self.last_page_crc = None;
    }

    /// Drop the bytes of a page still being received and take them back
    /// out of `received_size`. Returns the number of bytes dropped.
    pub fn discard_page(&mut self, transfer: &mut FirmwareTransfer) -> usize {
        let dropped = self.offset;
        transfer.received_size -= dropped as u32;
        self.clear();
        dropped
    }

    fn clear(&mut self) {
        self.buffer
            .fill(ERASED_BYTE);
        self.offset = 0;
    }

    /// Buffer `payload` and flush the page when it is full or the image is
    /// complete.
    ///
    /// On a page CRC mismatch the page is discarded, `received_size` is
    /// rolled back by the page's bytes, and [`Error::PageCrcMismatch`] is
    /// returned so the sender can retransmit the page.
    pub fn process_data<F: FlashMemory + ?Sized>(
        &mut self,
        payload: &[u8],
        transfer: &mut FirmwareTransfer,
        flash: &mut F,
    ) -> Result<WriteOutcome> {
        let space = PAGE_SIZE - self.offset;
        let outstanding = transfer
            .total_size
            .saturating_sub(transfer.received_size) as usize;
        let copied = payload
            .len()
            .min(space)
            .min(outstanding);
        if copied < payload.len() {
            warn!(
                "Dropping {} bytes past the page or image boundary",
                payload.len() - copied
            );
        }

        self.buffer[self.offset..self.offset + copied].copy_from_slice(&payload[..copied]);
        self.offset += copied;
        transfer.received_size += copied as u32;

        let page_full = self.offset == PAGE_SIZE;
        let image_done = transfer.received_size >= transfer.total_size;
        if !page_full && !image_done {
            return Ok(WriteOutcome::Buffered { copied });
        }

        self.flush(transfer, flash)
    }

    fn flush<F: FlashMemory + ?Sized>(
        &mut self,
        transfer: &mut FirmwareTransfer,
        flash: &mut F,
    ) -> Result<WriteOutcome> {
        let filled = self.offset;
        let padded = filled < PAGE_SIZE;
        let crc = checksum(&self.buffer[..filled]);
        self.last_page_crc = Some(crc);

        if crc != transfer.bulk_crc {
            warn!(
                "Page at {:#010x} failed CRC: announced {:#010x}, computed {crc:#010x}",
                self.cursor, transfer.bulk_crc
            );
            transfer.received_size -= filled as u32;
            self.clear();
            return Err(Error::PageCrcMismatch {
                expected: transfer.bulk_crc,
                actual: crc,
            });
        }

        // The tail of a short page is already the erase value.
        let address = self.cursor;
        let result = program_bytes(flash, address, &self.buffer);
        self.clear();
        result?;

        self.cursor += PAGE_SIZE as u32;
        debug!(
            "Committed page {:#010x} ({filled} bytes, crc {crc:#010x}, {} of {} received)",
            address, transfer.received_size, transfer.total_size
        );
        Ok(WriteOutcome::Committed {
            address,
            crc,
            padded,
        })
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use {
        super::*,
        crate::{flash::APP_A_ADDRESS, sim::SimFlash},
    };

    fn setup(total: u32) -> (PageWriter, FirmwareTransfer, SimFlash) {
        let transfer = FirmwareTransfer {
            total_size: total,
            ..FirmwareTransfer::default()
        };
        (
            PageWriter::new(APP_A_ADDRESS),
            transfer,
            SimFlash::new(APP_A_ADDRESS, PAGE_SIZE * 4),
        )
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| (i * 7 % 256) as u8)
            .collect()
    }

    #[test]
    fn test_full_page_commits_after_last_chunk() {
        let data = image(PAGE_SIZE);
        let (mut writer, mut transfer, mut flash) = setup(PAGE_SIZE as u32 * 2);
        transfer.bulk_crc = checksum(&data);

        for chunk in data[..PAGE_SIZE - 256].chunks(256) {
            let outcome = writer
                .process_data(chunk, &mut transfer, &mut flash)
                .unwrap();
            assert_eq!(outcome, WriteOutcome::Buffered { copied: 256 });
        }
        let outcome = writer
            .process_data(&data[PAGE_SIZE - 256..], &mut transfer, &mut flash)
            .unwrap();

        assert_eq!(
            outcome,
            WriteOutcome::Committed {
                address: APP_A_ADDRESS,
                crc: checksum(&data),
                padded: false,
            }
        );
        assert_eq!(writer.cursor(), APP_A_ADDRESS + PAGE_SIZE as u32);
        assert_eq!(writer.offset(), 0);
        assert_eq!(flash.slice(APP_A_ADDRESS, PAGE_SIZE), &data[..]);
    }

    #[test]
    fn test_final_partial_page_is_padded() {
        let data = image(300);
        let (mut writer, mut transfer, mut flash) = setup(300);
        transfer.bulk_crc = checksum(&data);

        writer
            .process_data(&data[..256], &mut transfer, &mut flash)
            .unwrap();
        let outcome = writer
            .process_data(&data[256..], &mut transfer, &mut flash)
            .unwrap();

        assert!(matches!(
            outcome,
            WriteOutcome::Committed { padded: true, .. }
        ));
        assert_eq!(flash.slice(APP_A_ADDRESS, 300), &data[..]);
        assert!(
            flash
                .slice(APP_A_ADDRESS + 300, PAGE_SIZE - 300)
                .iter()
                .all(|&b| b == ERASED_BYTE)
        );
        assert_eq!(transfer.received_size, 300);
    }

    #[test]
    fn test_exact_multiple_never_pads() {
        let data = image(PAGE_SIZE * 2);
        let (mut writer, mut transfer, mut flash) = setup(PAGE_SIZE as u32 * 2);

        for page in data.chunks(PAGE_SIZE) {
            transfer.bulk_crc = checksum(page);
            let mut last = None;
            for chunk in page.chunks(256) {
                last = Some(
                    writer
                        .process_data(chunk, &mut transfer, &mut flash)
                        .unwrap(),
                );
            }
            assert!(matches!(
                last,
                Some(WriteOutcome::Committed { padded: false, .. })
            ));
        }
        assert_eq!(flash.slice(APP_A_ADDRESS, data.len()), &data[..]);
    }

    #[test]
    fn test_crc_mismatch_drops_page_and_rolls_back() {
        let data = image(PAGE_SIZE);
        let (mut writer, mut transfer, mut flash) = setup(PAGE_SIZE as u32 * 2);
        transfer.bulk_crc = checksum(&data) ^ 1;

        let mut result = Ok(WriteOutcome::Buffered { copied: 0 });
        for chunk in data.chunks(256) {
            result = writer.process_data(chunk, &mut transfer, &mut flash);
        }

        assert!(matches!(result, Err(Error::PageCrcMismatch { .. })));
        assert_eq!(transfer.received_size, 0);
        assert_eq!(writer.cursor(), APP_A_ADDRESS);
        assert_eq!(writer.offset(), 0);
        assert_eq!(flash.program_count(), 0);

        // Retransmission with the right CRC lands on the same page.
        transfer.bulk_crc = checksum(&data);
        for chunk in data.chunks(256) {
            result = writer.process_data(chunk, &mut transfer, &mut flash);
        }
        assert!(matches!(result, Ok(WriteOutcome::Committed { .. })));
        assert_eq!(transfer.received_size, PAGE_SIZE as u32);
    }

    #[test]
    fn test_program_failure_is_reported() {
        let data = image(64);
        let (mut writer, mut transfer, mut flash) = setup(64);
        transfer.bulk_crc = checksum(&data);
        flash.fail_program_at(APP_A_ADDRESS + 8);

        let result = writer.process_data(&data, &mut transfer, &mut flash);
        assert!(matches!(result, Err(Error::Flash { .. })));
        assert_eq!(writer.offset(), 0);
    }

    #[test]
    fn test_bytes_beyond_page_are_not_copied() {
        let data = image(PAGE_SIZE + 16);
        let (mut writer, mut transfer, mut flash) = setup(PAGE_SIZE as u32 * 2);
        transfer.bulk_crc = checksum(&data[..PAGE_SIZE]);

        writer
            .process_data(&data[..PAGE_SIZE - 8], &mut transfer, &mut flash)
            .unwrap();
        let outcome = writer
            .process_data(&data[PAGE_SIZE - 8..], &mut transfer, &mut flash)
            .unwrap();

        assert!(matches!(outcome, WriteOutcome::Committed { .. }));
        assert_eq!(transfer.received_size, PAGE_SIZE as u32);
    }
}
