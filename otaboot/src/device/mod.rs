//! Serial port discovery and USB bridge classification.
//!
//! Development boards for the target expose their UART through an
//! ST-LINK virtual COM port or a stand-alone USB-UART bridge. Ports are
//! classified by USB VID/PID and ranked so auto-detection picks the most
//! likely one.

use {
    crate::{
        error::{Error, Result},
        port::PortInfo,
    },
    log::{debug, info, trace},
};

/// Known USB bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceKind {
    /// ST-LINK virtual COM port or STM32 USB CDC.
    StLink,
    /// WCH CH340/CH341.
    Ch340,
    /// Silicon Labs CP210x.
    Cp210x,
    /// FTDI FT232 family.
    Ftdi,
    /// Prolific PL2303.
    Prolific,
    /// Anything else.
    Unknown,
}

const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x0483,
        &[0x374B, 0x374E, 0x374F, 0x3752, 0x3753, 0x3754, 0x5740],
        DeviceKind::StLink,
    ),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], DeviceKind::Cp210x),
    (0x0403, &[0x6001, 0x6010, 0x6014, 0x6015], DeviceKind::Ftdi),
    (0x067B, &[0x2303, 0x23A3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| *known_vid == vid && pids.contains(&pid))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StLink => "ST-LINK VCP",
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the bridge is in the known table.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Auto-detection preference, lower first.
    fn rank(self) -> u8 {
        match self {
            Self::StLink => 0,
            Self::Ch340 | Self::Cp210x => 1,
            Self::Ftdi | Self::Prolific => 2,
            Self::Unknown => 3,
        }
    }
}

/// A port with its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectedPort {
    /// Port path.
    pub name: String,
    /// Bridge kind.
    pub device: DeviceKind,
    /// USB vendor ID.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial: Option<String>,
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        trace!("Port {} classified as {device:?}", info.name);
        Self {
            name: info.name,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

impl DetectedPort {
    /// Whether the port is a known bridge.
    pub fn is_candidate(&self) -> bool {
        self.device
            .is_known()
    }
}

/// Every serial port with its classification.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    use crate::port::{NativePortEnumerator, PortEnumerator};

    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(DetectedPort::from)
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Every serial port with its classification. Empty without a backend.
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    debug!("No serial backend compiled in");
    Vec::new()
}

/// Ports on known bridges.
pub fn detect_candidate_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(DetectedPort::is_candidate)
        .collect()
}

/// Best port in `ports`: the highest-ranked bridge, else the first port.
pub fn pick_best(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports
        .iter()
        .min_by_key(|p| {
            p.device
                .rank()
        })
}

/// Auto-detect a single port.
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = detect_ports();
    let best = pick_best(&ports).ok_or(Error::DeviceNotFound)?;
    if best
        .device
        .is_known()
    {
        info!("Auto-detected {} on {}", best.device.name(), best.name);
    } else {
        info!("Using first available port: {}", best.name);
    }
    Ok(best.clone())
}

/// One display line per port.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let kind = if port
                .device
                .is_known()
            {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [{vid:04X}:{pid:04X}]")
            } else {
                String::new()
            };
            let product = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{kind}{product}", port.name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort::from(PortInfo {
            vid: Some(vid),
            pid: Some(pid),
            ..PortInfo::plain(name)
        })
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x0483, 0x374B), DeviceKind::StLink);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x067B, 0x2303), DeviceKind::Prolific);
        assert_eq!(DeviceKind::from_vid_pid(0x0483, 0xDF11), DeviceKind::Unknown);
    }

    #[test]
    fn test_plain_port_is_unknown() {
        let port = DetectedPort::from(PortInfo::plain("/dev/ttyS0"));
        assert_eq!(port.device, DeviceKind::Unknown);
        assert!(!port.is_candidate());
    }

    #[test]
    fn test_pick_best_prefers_stlink() {
        let ports = vec![
            DetectedPort::from(PortInfo::plain("/dev/ttyS0")),
            usb("/dev/ttyUSB0", 0x1A86, 0x7523),
            usb("/dev/ttyACM0", 0x0483, 0x374B),
        ];
        assert_eq!(
            pick_best(&ports).map(|p| p.name.as_str()),
            Some("/dev/ttyACM0")
        );
    }

    #[test]
    fn test_pick_best_falls_back_to_first() {
        let ports = vec![
            DetectedPort::from(PortInfo::plain("/dev/ttyS0")),
            DetectedPort::from(PortInfo::plain("/dev/ttyS1")),
        ];
        assert_eq!(
            pick_best(&ports).map(|p| p.name.as_str()),
            Some("/dev/ttyS0")
        );
        assert!(pick_best(&[]).is_none());
    }

    #[test]
    fn test_format_port_list() {
        let mut stlink = usb("/dev/ttyACM0", 0x0483, 0x374B);
        stlink.product = Some("STLINK-V3".to_string());
        let ports = vec![stlink, usb("/dev/ttyACM1", 0x1234, 0x5678)];

        let lines = format_port_list(&ports);
        assert_eq!(lines[0], "/dev/ttyACM0 [ST-LINK VCP] - STLINK-V3");
        assert_eq!(lines[1], "/dev/ttyACM1 [1234:5678]");
    }
}
