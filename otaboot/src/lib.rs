//! # otaboot
//!
//! Serial over-the-air update engine for STM32 bootloaders.
//!
//! The device side receives a firmware image as a stream of framed packets,
//! checks every 2048-byte page against the CRC announced for it, programs
//! it, verifies the whole image and records the result in a persistent
//! update record that the boot path acts on after reset:
//!
//! - [`protocol`]: frame layout, CRC-32/MPEG-2, the byte framer and the
//!   ASCII response lines
//! - [`queue`]: the interrupt-to-task frame queue
//! - [`engine`]: the protocol state machine
//! - [`writer`]: page buffering and flash programming
//! - [`record`]: the persistent update record
//! - [`routine`]: the task loop that ties them together
//! - [`boot`]: the boot-time decision, including slot promotion
//!
//! The device side runs without `std`. With the `std` feature the crate
//! also provides the host side: serial ports, image loading, the
//! [`OtaSender`](sender::OtaSender) and an in-process
//! [`SimulatedDevice`](sim::SimulatedDevice).
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `std`: host-side support without a serial backend
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use otaboot::{FirmwareImage, NativePort, OtaSender, SerialConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("app.bin")?;
//!     let mut port = NativePort::open(&SerialConfig::new("/dev/ttyACM0", 115_200))?;
//!
//!     let report = OtaSender::new(&mut port).upload(&image, |sent, total| {
//!         println!("{sent}/{total}");
//!     })?;
//!     println!("Sent {} pages", report.pages);
//!     Ok(())
//! }
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod boot;
pub mod engine;
pub mod error;
pub mod flash;
pub mod protocol;
pub mod queue;
pub mod record;
pub mod routine;
pub mod writer;

#[cfg(feature = "std")]
pub mod device;
#[cfg(feature = "std")]
pub mod host;
#[cfg(feature = "std")]
pub mod image;
#[cfg(feature = "std")]
pub mod port;
#[cfg(feature = "std")]
pub mod sender;
#[cfg(feature = "std")]
pub mod sim;

#[cfg(feature = "std")]
use std::sync::{Arc, OnceLock};

#[cfg(feature = "std")]
static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running host loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
#[cfg(feature = "std")]
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[cfg(feature = "std")]
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
#[cfg(feature = "std")]
pub use {
    device::{DetectedPort, DeviceKind},
    host::{auto_detect_port, discover_candidate_ports, discover_ports},
    image::{FirmwareImage, ImageSummary},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    sender::{OtaSender, SendReport, SenderConfig},
    sim::{Fault, SimFlash, SimulatedDevice},
};
pub use {
    boot::{BootAction, decide_boot},
    engine::{EngineConfig, OtaEngine, OtaState, Step},
    error::{Error, Result},
    flash::{FlashLayout, FlashMemory, StagingMode},
    queue::PacketQueue,
    record::{RecordStore, UpdateRecord},
    routine::{RoutineConfig, RoutineEvent, SystemControl, Transmitter, UpdateRoutine},
};

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        assert!(!is_interrupted_requested());
    }
}
