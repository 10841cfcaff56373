//! Host-side serial port discovery.
//!
//! The optical adapter is a plain USB-to-UART bridge driving an LED, so
//! discovery can only classify the bridge chip; it cannot tell an adapter
//! from any other board using the same bridge.

use crate::error::{Error, Result};
use crate::port::PortInfo;

use log::info;

#[cfg(feature = "native")]
use log::{debug, trace};

/// USB-to-UART bridge families seen on optical adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum BridgeKind {
    /// CH340/CH341.
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

/// Known USB VID/PID pairs for common USB-to-UART bridges.
const KNOWN_BRIDGES: &[(u16, &[u16], BridgeKind)] = &[
    (0x1A86, &[0x7523, 0x7522, 0x5523, 0x55D4], BridgeKind::Ch340),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], BridgeKind::Cp210x),
    (0x0403, &[0x6001, 0x6010, 0x6014, 0x6015], BridgeKind::Ftdi),
    (0x067B, &[0x2303, 0x23A3], BridgeKind::Prolific),
];

impl BridgeKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_BRIDGES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && pids.contains(&pid))
            .map_or(Self::Unknown, |&(_, _, kind)| kind)
    }

    /// Human readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the bridge was recognised.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// A serial port with its classification.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Bridge classification.
    pub kind: BridgeKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let kind = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => BridgeKind::from_vid_pid(vid, pid),
            _ => BridgeKind::Unknown,
        };
        Self {
            name: info.name,
            kind,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

impl DetectedPort {
    /// Whether this port sits behind a recognised USB bridge.
    pub fn is_known_bridge(&self) -> bool {
        self.kind.is_known()
    }
}

/// Discover all available serial ports.
#[cfg(feature = "native")]
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    use crate::port::{NativePortEnumerator, PortEnumerator};

    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(DetectedPort::from)
            .inspect(|p| trace!("Found port {} ({})", p.name, p.kind.name()))
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Discover all available serial ports (no serial backend compiled in).
#[cfg(not(feature = "native"))]
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Ports behind a recognised USB bridge.
#[must_use]
pub fn discover_adapter_ports() -> Vec<DetectedPort> {
    discover_ports()
        .into_iter()
        .filter(DetectedPort::is_known_bridge)
        .collect()
}

/// Pick the only plausible adapter port.
///
/// Succeeds when exactly one recognised bridge is present, or failing that,
/// exactly one serial port of any kind.
pub fn auto_detect_port() -> Result<DetectedPort> {
    select_single(discover_ports())
}

fn select_single(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    let known: Vec<&DetectedPort> = ports
        .iter()
        .filter(|p| p.is_known_bridge())
        .collect();
    if let [port] = known[..] {
        info!("Auto-detected {} adapter: {}", port.kind.name(), port.name);
        return Ok(port.clone());
    }
    if known.is_empty() {
        if let [port] = &ports[..] {
            return Ok(port.clone());
        }
    }

    Err(Error::Config(if ports.is_empty() {
        "no serial ports found".to_string()
    } else {
        format!(
            "{} candidate serial ports found, choose one explicitly",
            if known.is_empty() {
                ports.len()
            } else {
                known.len()
            }
        )
    }))
}
