//! Host-side port discovery entry points.

use crate::device::DetectedPort;

/// Every serial port.
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    crate::device::detect_ports()
}

/// Ports on known USB-UART bridges.
#[must_use]
pub fn discover_candidate_ports() -> Vec<DetectedPort> {
    crate::device::detect_candidate_ports()
}

/// The single best port candidate.
pub fn auto_detect_port() -> crate::Result<DetectedPort> {
    crate::device::auto_detect_port()
}
