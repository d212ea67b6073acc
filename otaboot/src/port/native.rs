//! Serial backend on top of the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        port::{DataBits, Parity, Port, PortEnumerator, PortInfo, SerialConfig, StopBits},
    },
    log::debug,
    serialport::{ClearBuffer, FlowControl, SerialPort, SerialPortType},
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// An open OS serial port.
pub struct NativePort {
    inner: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial port closed")
}

impl NativePort {
    /// Open the port described by `config`. Flow control is always off;
    /// the bootloader UART has no handshake lines.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!(
            "Opening {} at {} baud ({:?}, {:?}, {:?})",
            config.port_name, config.baud_rate, config.data_bits, config.parity, config.stop_bits
        );
        let inner = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(
                config
                    .data_bits
                    .into(),
            )
            .parity(
                config
                    .parity
                    .into(),
            )
            .stop_bits(
                config
                    .stop_bits
                    .into(),
            )
            .flow_control(FlowControl::None)
            .open()?;

        Ok(Self {
            inner: Some(inner),
            name: config
                .port_name
                .clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    fn inner(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.inner
            .as_mut()
            .ok_or_else(closed)
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(port) = self
            .inner
            .as_mut()
        {
            port.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        if let Some(port) = self
            .inner
            .as_mut()
        {
            port.set_baud_rate(baud_rate)?;
        }
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(port) = self
            .inner
            .as_mut()
        {
            port.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if self
            .inner
            .take()
            .is_some()
        {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner()?
            .read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner()?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner()?
            .flush()
    }
}

/// Port listing through `serialport::available_ports`.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;
        Ok(ports
            .into_iter()
            .map(|p| match p.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    name: p.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                    serial_number: usb.serial_number,
                },
                _ => PortInfo::plain(p.port_name),
            })
            .collect())
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports_does_not_panic() {
        let _ = NativePortEnumerator::list_ports();
    }

    #[test]
    fn test_opening_missing_port_fails() {
        let config = SerialConfig::new("/dev/otaboot-does-not-exist", 115_200);
        assert!(NativePort::open(&config).is_err());
    }

    #[test]
    fn test_line_settings_convert() {
        assert_eq!(
            serialport::Parity::from(Parity::Even),
            serialport::Parity::Even
        );
        assert_eq!(
            serialport::StopBits::from(StopBits::Two),
            serialport::StopBits::Two
        );
        assert_eq!(
            serialport::DataBits::from(DataBits::Seven),
            serialport::DataBits::Seven
        );
    }
}
