//! Host-side byte transport.
//!
//! The sender only needs a blocking byte pipe with a read timeout. The
//! [`Port`] trait captures that, so the same upload code runs over a real
//! serial port or against the in-process [`SimulatedDevice`].
//!
//! ```text
//!            +-------------------+
//!            |     OtaSender     |
//!            +---------+---------+
//!                      |
//!                  Port trait
//!           +----------+-----------+
//!           |                      |
//! +---------+---------+  +---------+---------+
//! |    NativePort     |  |  SimulatedDevice  |
//! |   (serialport)    |  | framer + routine  |
//! +-------------------+  +-------------------+
//! ```
//!
//! [`SimulatedDevice`]: crate::sim::SimulatedDevice
//!
//! ## Example
//!
//! ```rust,no_run
//! use otaboot::port::Port;
//!
//! fn ping<P: Port>(port: &mut P) -> otaboot::Result<()> {
//!     port.clear_buffers()?;
//!     port.write_all_bytes(b"$\x00\x01\x00\x00\x00\x00\x00\x00\r\n")?;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use {
    crate::error::Result,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Default line speed of the bootloader UART.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port path, e.g. `/dev/ttyACM0` or `COM5`.
    pub port_name: String,
    /// Line speed.
    pub baud_rate: u32,
    /// Read timeout.
    pub timeout: Duration,
    /// Data bits per character.
    pub data_bits: DataBits,
    /// Parity bit.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: Duration::from_millis(100),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl SerialConfig {
    /// Settings for `port_name` at `baud_rate`, 8N1.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the parity bit.
    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }
}

/// Data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// Seven bits.
    Seven,
    /// Eight bits.
    #[default]
    Eight,
}

/// Parity bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// One stop bit.
    #[default]
    One,
    /// Two stop bits.
    Two,
}

/// An enumerated serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortInfo {
    /// Port path.
    pub name: String,
    /// USB vendor ID.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port without USB metadata.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// `VID:PID` in hex, if known.
    pub fn usb_id(&self) -> Option<String> {
        Some(format!("{:04X}:{:04X}", self.vid?, self.pid?))
    }
}

/// Blocking byte transport used by the sender.
///
/// Reads return `ErrorKind::TimedOut` (or zero bytes) when nothing arrives
/// within [`timeout`](Self::timeout).
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Current read timeout.
    fn timeout(&self) -> Duration;

    /// Change the line speed.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Current line speed.
    fn baud_rate(&self) -> u32;

    /// Discard pending input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Port path or a descriptive name.
    fn name(&self) -> &str;

    /// Release the port.
    fn close(&mut self) -> Result<()>;

    /// Write every byte and flush.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        Write::write_all(self, buf)?;
        Write::flush(self)?;
        Ok(())
    }
}

/// Lists ports without opening one.
pub trait PortEnumerator {
    /// Every serial port on the system.
    fn list_ports() -> Result<Vec<PortInfo>>;

    /// Ports with a matching USB VID and PID.
    fn find_by_vid_pid(vid: u16, pid: u16) -> Result<Vec<PortInfo>> {
        Ok(Self::list_ports()?
            .into_iter()
            .filter(|p| p.vid == Some(vid) && p.pid == Some(pid))
            .collect())
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
