//! Firmware images on the host side.

mod firmware;

pub use firmware::{FirmwareImage, ImageSummary, Page};
