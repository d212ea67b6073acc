//! Raw application binaries.
//!
//! An image is uploaded as-is: the bootloader writes it byte for byte from
//! the start of the staging slot. The host precomputes the whole-image CRC
//! for the Header and one CRC per page for the BulkHeaders.

use {
    crate::{
        error::{Error, Result},
        flash::{FlashLayout, PAGE_SIZE},
        protocol::{crc::checksum, packet::DATA_MAX_SIZE},
    },
    std::{fs, path::Path},
};

/// One flash page worth of image bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page<'a> {
    /// Zero-based page number.
    pub index: usize,
    /// Bytes of the page, shorter than a page only for the last one.
    pub data: &'a [u8],
    /// CRC announced in the page's BulkHeader.
    pub crc: u32,
}

impl<'a> Page<'a> {
    /// Data packet payloads of this page.
    pub fn chunks(&self) -> impl ExactSizeIterator<Item = &'a [u8]> + 'a {
        self.data
            .chunks(DATA_MAX_SIZE)
    }
}

/// Upload statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImageSummary {
    /// File name, if loaded from disk.
    pub name: Option<String>,
    /// Size in bytes.
    pub size: u32,
    /// Whole-image CRC.
    pub crc: u32,
    /// Flash pages covered.
    pub pages: usize,
    /// Data packets needed.
    pub data_packets: usize,
    /// Frames sent in total, including Header, BulkHeaders and END.
    pub total_packets: usize,
}

/// A firmware binary ready to upload.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    name: Option<String>,
    data: Vec<u8>,
    crc: u32,
}

impl FirmwareImage {
    /// Load a binary from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let mut image = Self::from_bytes(data)?;
        image.name = path
            .file_name()
            .map(|n| {
                n.to_string_lossy()
                    .into_owned()
            });
        Ok(image)
    }

    /// Wrap `data`, rejecting empty images and images larger than the
    /// biggest slot any layout offers.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidImage("image is empty".into()));
        }
        let max = FlashLayout::single_slot().max_image_size() as usize;
        if data.len() > max {
            return Err(Error::InvalidImage(format!(
                "image is {} bytes, the application slot holds {max}",
                data.len()
            )));
        }
        let crc = checksum(&data);
        Ok(Self {
            name: None,
            data,
            crc,
        })
    }

    /// Fail when the image does not fit the staging slot of `layout`.
    pub fn ensure_fits(&self, layout: &FlashLayout) -> Result<()> {
        let max = layout.max_image_size();
        if self.len() > max {
            return Err(Error::InvalidImageSize {
                size: self.len(),
                max,
            });
        }
        Ok(())
    }

    /// File name, if loaded from disk.
    pub fn name(&self) -> Option<&str> {
        self.name
            .as_deref()
    }

    /// Raw bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u32 {
        self.data
            .len() as u32
    }

    /// Whole-image CRC.
    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Number of flash pages.
    pub fn page_count(&self) -> usize {
        self.data
            .len()
            .div_ceil(PAGE_SIZE)
    }

    /// Pages in upload order.
    pub fn pages(&self) -> impl ExactSizeIterator<Item = Page<'_>> {
        self.data
            .chunks(PAGE_SIZE)
            .enumerate()
            .map(|(index, data)| Page {
                index,
                data,
                crc: checksum(data),
            })
    }

    /// Number of Data packets across all pages.
    pub fn data_packet_count(&self) -> usize {
        self.pages()
            .map(|p| {
                p.chunks()
                    .len()
            })
            .sum()
    }

    /// Size, CRC and packet counts.
    pub fn summary(&self) -> ImageSummary {
        let pages = self.page_count();
        let data_packets = self.data_packet_count();
        ImageSummary {
            name: self
                .name
                .clone(),
            size: self.len(),
            crc: self.crc,
            pages,
            data_packets,
            // Header, one BulkHeader per page, the Data packets and END.
            total_packets: 1 + pages + data_packets + 1,
        }
    }
}
