//! Boot-path decision.
//!
//! Runs at every reset before anything else. Reads the update record and
//! decides whether to jump to the application or stay in the bootloader,
//! promoting and validating a staged image on the way when one is pending.

use {
    crate::{
        error::Result,
        flash::{ERASED_BYTE, FlashLayout, FlashMemory, PAGE_SIZE, swap_bank},
        protocol::crc::region_checksum,
        record::{RecordStore, RecordUpdate},
    },
    log::{info, warn},
};

/// Where execution continues after reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BootAction {
    /// Jump to the application slot.
    RunApplication,
    /// Stay in the bootloader and wait for an update.
    StayInBootloader,
}

/// Whether slot A holds something that looks like an image.
pub fn application_present<F: FlashMemory + ?Sized>(flash: &F, layout: &FlashLayout) -> Result<bool> {
    let mut word = [0u8; 4];
    flash.read(layout.app_address, &mut word)?;
    Ok(word != [ERASED_BYTE; 4])
}

fn run_if_present<F: FlashMemory + ?Sized>(flash: &F, layout: &FlashLayout) -> Result<BootAction> {
    if application_present(flash, layout)? {
        Ok(BootAction::RunApplication)
    } else {
        info!("No application at {:#010x}", layout.app_address);
        Ok(BootAction::StayInBootloader)
    }
}

/// Decide the boot path, acting on the update record.
///
/// A pending image is copied into slot A first when the layout stages
/// into a secondary slot. The copy resumes from the persisted swap
/// progress. The image is then checked against the recorded CRC. A
/// failed check blocks further updates and keeps the device in the
/// bootloader.
pub fn decide_boot<F: FlashMemory + ?Sized>(flash: &mut F, layout: &FlashLayout) -> Result<BootAction> {
    let store = RecordStore::new(layout.record_address);
    let Some(record) = store.load(&*flash)? else {
        store.init_if_needed(flash)?;
        return run_if_present(&*flash, layout);
    };

    if !record.flag_update {
        return run_if_present(&*flash, layout);
    }
    if record.fw_received_size == 0 {
        info!("Update requested, waiting for an image");
        return Ok(BootAction::StayInBootloader);
    }

    if let Some(secondary) = layout.secondary_address() {
        let pages = record
            .fw_received_size
            .div_ceil(PAGE_SIZE as u32);
        let first = record
            .swap_progress
            .unwrap_or(0);
        info!("Promoting staged image: pages {first}..{pages}");
        swap_bank(flash, secondary, layout.app_address, pages, first, |flash, done| {
            store.record_swap_progress(flash, done)
        })?;
    }

    let crc = region_checksum(&*flash, layout.app_address, record.fw_received_size)?;
    if crc == record.fw_crc {
        info!("Image valid (crc {crc:#010x})");
        store.set_flags(
            flash,
            &RecordUpdate::new()
                .update(false)
                .swap_progress(None),
        )?;
        Ok(BootAction::RunApplication)
    } else {
        warn!(
            "Image check failed: recorded {:#010x}, computed {crc:#010x}; blocking updates",
            record.fw_crc
        );
        store.set_flags(
            flash,
            &RecordUpdate::new()
                .update(false)
                .block_updates(true)
                .swap_progress(None),
        )?;
        Ok(BootAction::StayInBootloader)
    }
}
