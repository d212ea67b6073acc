//! Error types for otaboot.
//!
//! Device-side variants carry only `Copy` data so the engine can run without
//! an allocator. Host-side variants (serial I/O, timeouts, image loading) are
//! only available with the `std` feature.

use {
    crate::{engine::OtaState, protocol::packet::PacketType},
    core::fmt,
    thiserror::Error,
};

/// Result type for otaboot operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Flash primitive that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    /// Page erase.
    Erase,
    /// Double-word program.
    Program,
    /// Read back.
    Read,
}

impl fmt::Display for FlashOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Erase => "erase",
            Self::Program => "program",
            Self::Read => "read",
        })
    }
}

/// Error type for otaboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[cfg(feature = "std")]
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The flash primitive reported a failure.
    #[error("Flash {op} failed at {address:#010x}")]
    Flash {
        /// Operation that failed.
        op: FlashOp,
        /// Address passed to the primitive.
        address: u32,
    },

    /// Access outside the flash device or the configured region.
    #[error("Flash access out of range: {address:#010x} (+{len} bytes)")]
    OutOfRange {
        /// Start address of the access.
        address: u32,
        /// Length of the access in bytes.
        len: usize,
    },

    /// Address does not satisfy the required alignment.
    #[error("Address {address:#010x} is not aligned to {align} bytes")]
    Misaligned {
        /// Offending address.
        address: u32,
        /// Required alignment.
        align: u32,
    },

    /// A completed page does not match the CRC announced by its bulk header.
    #[error("Page CRC mismatch: announced {expected:#010x}, computed {actual:#010x}")]
    PageCrcMismatch {
        /// CRC announced by the sender.
        expected: u32,
        /// CRC computed over the buffered page.
        actual: u32,
    },

    /// The staged image does not match the CRC from the header.
    #[error("Image CRC mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ImageCrcMismatch {
        /// CRC announced in the header (or stored in the record).
        expected: u32,
        /// CRC computed over the staged region.
        actual: u32,
    },

    /// The CRC field of a frame does not match its payload.
    #[error("Frame CRC mismatch: carried {carried:#010x}, computed {computed:#010x}")]
    FrameCrcMismatch {
        /// CRC carried in the frame.
        carried: u32,
        /// CRC computed over the payload.
        computed: u32,
    },

    /// Packet failed structural validation.
    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// Packet type byte is not a known type.
    #[error("Unknown packet type {0:#04x}")]
    UnknownPacketType(u8),

    /// Command byte is not a known command.
    #[error("Unknown command {0:#04x}")]
    UnknownCommand(u8),

    /// Packet is valid but not expected in the current state.
    #[error("{packet:?} packet not expected in state {state:?}")]
    UnexpectedPacket {
        /// Engine state when the packet arrived.
        state: OtaState,
        /// Type of the offending packet.
        packet: PacketType,
    },

    /// Announced image size is zero or larger than the staging slot.
    #[error("Invalid image size {size} (maximum {max})")]
    InvalidImageSize {
        /// Announced size.
        size: u32,
        /// Largest size the layout accepts.
        max: u32,
    },

    /// The update record has updates disabled.
    #[error("Updates are blocked by the update record")]
    UpdatesBlocked,

    /// Invalid flash layout.
    #[error("Invalid flash layout: {0}")]
    InvalidLayout(&'static str),

    /// The response transmitter failed.
    #[error("Transport error")]
    Transport,

    /// Communication timeout.
    #[cfg(feature = "std")]
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unexpected response from the bootloader.
    #[cfg(feature = "std")]
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Firmware image could not be used.
    #[cfg(feature = "std")]
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// No serial device found.
    #[cfg(feature = "std")]
    #[error("No serial device found")]
    DeviceNotFound,

    /// The embedding application requested cancellation.
    #[cfg(feature = "std")]
    #[error("Operation interrupted")]
    Interrupted,
}

impl Error {
    /// Whether this error leaves the current transfer recoverable by a
    /// retransmission rather than a restart from the header.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PageCrcMismatch { .. }
                | Self::FrameCrcMismatch { .. }
                | Self::MalformedPacket(_)
                | Self::UnexpectedPacket { .. }
        )
    }

    /// Whether this error comes from the flash primitives.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Flash { .. } | Self::OutOfRange { .. } | Self::Misaligned { .. }
        )
    }
}
