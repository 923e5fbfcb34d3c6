//! Locator frame structure and checksum handling

use crate::commands::LocatorCmd;
use crate::types::ProtocolError;
use std::fmt;

/// Shared secret prefix carried by every Locator frame
pub const PASSWORD: &[u8; 8] = b"12345678";

/// Frame overhead: password(8) + serial(16) + ver(1) + cmd(1) + len(1) + checksum(1)
pub const FRAME_OVERHEAD: usize = 28;

/// Protocol version emitted by this implementation
pub const PROTOCOL_VERSION: u8 = 1;

const PAYLOAD_OFFSET: usize = 27;

/// 16-byte device serial number.
///
/// Held in display order; the wire carries it reversed (LSB first). Renders
/// as a 32-char lowercase hex string, or nothing when all bytes are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SerialNumber([u8; 16]);

impl SerialNumber {
    /// Serial used by broadcast requests addressed to every device
    pub const WILDCARD: SerialNumber = SerialNumber([0xFF; 16]);

    #[must_use]
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Read a serial from wire order (reversed)
    #[must_use]
    pub fn from_wire(bytes: &[u8; 16]) -> Self {
        let mut b = *bytes;
        b.reverse();
        Self(b)
    }

    /// Wire representation (reversed)
    #[must_use]
    pub fn to_wire(self) -> [u8; 16] {
        let mut b = self.0;
        b.reverse();
        b
    }

    /// An all-zero serial means "no serial assigned"
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 16]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl serde::Serialize for SerialNumber {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Locator protocol frame
///
/// Frame format (all little-endian):
/// ```text
/// [Password: 8 ASCII bytes "12345678"]
/// [Serial: 16 bytes, LSB first]
/// [Version: 1 byte]
/// [Command: 1 byte]
/// [Length: 1 byte] (payload length)
/// [Payload: variable]
/// [Checksum: 1 byte] (two's complement of the byte sum)
/// ```
#[derive(Debug, Clone)]
pub struct Frame {
    pub serial: SerialNumber,
    pub ver: u8,
    pub cmd: LocatorCmd,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame at the current protocol version
    #[must_use]
    pub fn new(cmd: LocatorCmd, serial: SerialNumber, payload: Vec<u8>) -> Self {
        Self {
            serial,
            ver: PROTOCOL_VERSION,
            cmd,
            payload,
        }
    }

    /// Serialize the frame, appending the checksum byte
    #[must_use]
    #[allow(clippy::missing_panics_doc)] // Panic only on protocol-violating payload size
    pub fn serialize(&self) -> Vec<u8> {
        let len = u8::try_from(self.payload.len()).expect("payload exceeds protocol maximum");

        let mut data = Vec::with_capacity(FRAME_OVERHEAD + self.payload.len());
        data.extend_from_slice(PASSWORD);
        data.extend_from_slice(&self.serial.to_wire());
        data.push(self.ver);
        data.push(self.cmd as u8);
        data.push(len);
        data.extend_from_slice(&self.payload);
        data.push(Self::checksum(&data));
        data
    }

    /// Deserialize a frame received from the wire.
    ///
    /// A declared length that disagrees with the datagram size is tolerated
    /// with a warning; the payload is whatever sits between the header and
    /// the trailing checksum byte.
    #[allow(clippy::missing_errors_doc)]
    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < FRAME_OVERHEAD {
            return Err(ProtocolError::FrameTooShort(data.len()));
        }
        if &data[..8] != PASSWORD {
            return Err(ProtocolError::BadPassword);
        }

        let checksum_offset = data.len() - 1;
        let expected = Self::checksum(&data[..checksum_offset]);
        if expected != data[checksum_offset] {
            return Err(ProtocolError::ChecksumMismatch {
                expected,
                actual: data[checksum_offset],
            });
        }

        let mut serial = [0u8; 16];
        serial.copy_from_slice(&data[8..24]);
        let ver = data[24];
        let cmd = LocatorCmd::from_u8(data[25]).ok_or(ProtocolError::UnknownCommand(data[25]))?;

        let len = data[26] as usize;
        if data.len() != len + FRAME_OVERHEAD {
            tracing::warn!(
                declared = len,
                actual = data.len() - FRAME_OVERHEAD,
                "frame length mismatch, accepting payload as received"
            );
        }
        let payload = data[PAYLOAD_OFFSET..checksum_offset].to_vec();

        Ok(Self {
            serial: SerialNumber::from_wire(&serial),
            ver,
            cmd,
            payload,
        })
    }

    /// Two's-complement byte checksum; appending it makes the frame sum to
    /// zero modulo 256
    #[must_use]
    pub fn checksum(data: &[u8]) -> u8 {
        let mut sum: u8 = 0;
        for &b in data {
            sum = sum.wrapping_sub(b);
        }
        sum
    }
}
