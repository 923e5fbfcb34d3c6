//! Device summary block and primary settings encoding
//!
//! Strings on the wire are WINDOWS-1251 encoded, NUL-terminated inside a
//! fixed slot; IPv4 addresses are four raw octets; the port is little-endian.

use crate::frame::SerialNumber;
use encoding_rs::WINDOWS_1251;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

/// Size of the summary block a device reports in a poll response
pub const SUMMARY_LEN: usize = 128;

/// Device model reported in the summary block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceModel {
    Unknown,
    Cp18,
    Pos,
    ApPro,
    Tw2020,
}

impl From<u8> for DeviceModel {
    fn from(value: u8) -> Self {
        match value {
            1 => DeviceModel::Cp18,
            2 => DeviceModel::Pos,
            3 => DeviceModel::ApPro,
            4 => DeviceModel::Tw2020,
            _ => DeviceModel::Unknown,
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceModel::Unknown => "UNKNOWN",
            DeviceModel::Cp18 => "CP-18",
            DeviceModel::Pos => "POS",
            DeviceModel::ApPro => "AP-PRO",
            DeviceModel::Tw2020 => "TW-2020",
        })
    }
}

/// Whether the device is executing its bootloader or its main program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    Bootloader,
    Main,
}

impl BootMode {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BootMode::Bootloader),
            1 => Some(BootMode::Main),
            _ => None,
        }
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootMode::Bootloader => "BTLDR",
            BootMode::Main => "MAIN",
        })
    }
}

/// 6-byte MAC address; all-zero means "not reported"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    #[must_use]
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 6]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl serde::Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Two-byte version slot; the wire stores (minor, major)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version([u8; 2]);

impl Version {
    /// Build from wire order: low byte first
    #[must_use]
    pub fn from_wire(lo: u8, hi: u8) -> Self {
        Self([lo, hi])
    }

    #[must_use]
    pub fn major(&self) -> u8 {
        self.0[1]
    }

    #[must_use]
    pub fn minor(&self) -> u8 {
        self.0[0]
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0, 0]
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

impl serde::Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Decode a NUL-terminated WINDOWS-1251 slot
fn str_from_slot(slot: &[u8]) -> String {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    let (s, _, _) = WINDOWS_1251.decode(&slot[..end]);
    s.into_owned()
}

/// Encode a string into a fixed WINDOWS-1251 slot, NUL-padded and silently
/// truncated to the slot size
fn str_to_slot(s: &str, len: usize) -> Vec<u8> {
    let (bytes, _, _) = WINDOWS_1251.encode(s);
    let mut out = bytes.into_owned();
    out.truncate(len);
    out.resize(len, 0);
    out
}

fn ip_from_bytes(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

/// The 128-byte identity/configuration block a device reports
///
/// ```text
/// offset size field
/// 0      1    model
/// 1      1    boot mode
/// 2      16   serial number (LSB first)
/// 18     6    MAC address
/// 24     2    firmware version
/// 26     2    bootloader version
/// 28     2    PCB version
/// 30     16   name (CP1251, NUL terminated)
/// 46     4    device IP
/// 50     4    subnet mask
/// 54     4    gateway IP
/// 58     4    support host IP
/// 62     2    UDP port (LE)
/// 64     64   comment (CP1251, NUL terminated)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub model: DeviceModel,
    pub boot_mode: Option<BootMode>,
    pub serial: SerialNumber,
    pub mac: MacAddr,
    pub fw: Version,
    pub btldr: Version,
    pub pcb: Version,
    pub name: String,
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub host: Ipv4Addr,
    pub port: u16,
    pub comment: String,
}

impl DeviceSummary {
    /// Parse a summary block; anything but exactly 128 bytes reads as zeros
    #[must_use]
    pub fn parse(data: &[u8]) -> Self {
        let zeros = [0u8; SUMMARY_LEN];
        let data: &[u8] = if data.len() == SUMMARY_LEN { data } else { &zeros };

        let mut serial = [0u8; 16];
        serial.copy_from_slice(&data[2..18]);
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&data[18..24]);

        Self {
            model: DeviceModel::from(data[0]),
            boot_mode: BootMode::from_u8(data[1]),
            serial: SerialNumber::from_wire(&serial),
            mac: MacAddr::new(mac),
            fw: Version::from_wire(data[24], data[25]),
            btldr: Version::from_wire(data[26], data[27]),
            pcb: Version::from_wire(data[28], data[29]),
            name: str_from_slot(&data[30..46]),
            ip: ip_from_bytes(&data[46..50]),
            mask: ip_from_bytes(&data[50..54]),
            gateway: ip_from_bytes(&data[54..58]),
            host: ip_from_bytes(&data[58..62]),
            port: u16::from_le_bytes([data[62], data[63]]),
            comment: str_from_slot(&data[64..128]),
        }
    }

    /// Snapshot of the writable subset, ready for editing and a SetPrimary
    #[must_use]
    pub fn primary_settings(&self) -> PrimarySettings {
        PrimarySettings {
            name: self.name.clone(),
            ip: self.ip,
            mask: self.mask,
            gateway: self.gateway,
            host: self.host,
            port: self.port,
            comment: self.comment.clone(),
        }
    }
}

impl Default for DeviceSummary {
    fn default() -> Self {
        Self::parse(&[])
    }
}

/// Payload of a SetPrimary command: name, addressing, port, and comment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimarySettings {
    pub name: String,
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub host: Ipv4Addr,
    pub port: u16,
    pub comment: String,
}

impl PrimarySettings {
    /// Encoded length: name(16) + 4 addresses + port(2) + comment(64)
    pub const LEN: usize = 98;

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ba = Vec::with_capacity(Self::LEN);
        ba.extend_from_slice(&str_to_slot(&self.name, 16));
        ba.extend_from_slice(&self.ip.octets());
        ba.extend_from_slice(&self.mask.octets());
        ba.extend_from_slice(&self.gateway.octets());
        ba.extend_from_slice(&self.host.octets());
        ba.extend_from_slice(&self.port.to_le_bytes());
        ba.extend_from_slice(&str_to_slot(&self.comment, 64));
        ba
    }
}
