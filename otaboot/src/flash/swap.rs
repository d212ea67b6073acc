//! Page-by-page bank copy used to promote a staged image.

use {
    super::{DOUBLE_WORD, FlashMemory, PAGE_SIZE},
    crate::error::Result,
    log::{debug, trace},
};

/// Copy `pages` pages from `source` to `destination`, starting at page
/// `first_page`.
///
/// Each destination page is erased and then programmed from the source.
/// `on_page` runs after every completed page with the number of pages
/// finished so far, so the caller can persist progress and resume after a
/// reset. A page interrupted between erase and program is simply copied
/// again on resume; the source is never modified.
pub fn swap_bank<F, P>(
    flash: &mut F,
    source: u32,
    destination: u32,
    pages: u32,
    first_page: u32,
    mut on_page: P,
) -> Result<()>
where
    F: FlashMemory + ?Sized,
    P: FnMut(&mut F, u32) -> Result<()>,
{
    debug!(
        "Copying {} pages {source:#010x} -> {destination:#010x} (resume at {first_page})",
        pages
    );

    for page in first_page..pages {
        let offset = page * PAGE_SIZE as u32;
        copy_page(flash, source + offset, destination + offset)?;
        on_page(flash, page + 1)?;
    }
    Ok(())
}

fn copy_page<F: FlashMemory + ?Sized>(flash: &mut F, source: u32, destination: u32) -> Result<()> {
    trace!("Copy page {source:#010x} -> {destination:#010x}");
    flash.erase_page(destination)?;

    let mut word = [0u8; DOUBLE_WORD];
    for offset in (0..PAGE_SIZE as u32).step_by(DOUBLE_WORD) {
        flash.read(source + offset, &mut word)?;
        flash.program_double_word(destination + offset, word)?;
    }
    Ok(())
}
