//! Firmware file parsing and the lazy update packet stream
//!
//! A `.fw` file is a 20-byte header followed by `fw_len * 4` image bytes.
//! The stream renders it as one FwInfo packet carrying the raw header, then
//! numbered FwPack blocks of up to 32 bytes each.

use crate::commands::ElCmd;
use crate::summary::Version;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Size of the `.fw` file header
pub const FW_HEADER_LEN: usize = 20;

/// Image bytes carried by one FwPack packet
pub const FW_BLOCK_SIZE: usize = 32;

/// Firmware file errors
#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Firmware header too short: {0} bytes")]
    HeaderTooShort(usize),

    #[error("Firmware image truncated: header declares {expected} bytes, file has {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Image encryption advertised by the header; never performed host-side,
/// the device handles its own decryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptMode {
    None,
    Gost,
    XorGost,
    Unknown(u8),
}

impl From<u8> for CryptMode {
    fn from(value: u8) -> Self {
        match value {
            0 => CryptMode::None,
            1 => CryptMode::Gost,
            2 => CryptMode::XorGost,
            v => CryptMode::Unknown(v),
        }
    }
}

/// The 20-byte `.fw` header
///
/// ```text
/// offset size field
/// 0      1    crypt mode
/// 1      1    device header version
/// 2      2    firmware version
/// 4      2    reserved
/// 6      2    PCB version the image targets
/// 8      2    bootloader version the image targets
/// 8*     4    start offset (u32 LE)       * at byte 8 after the versions
/// 12     2    image length in 4-byte words (u16 LE)
/// 14     2    reserved
/// 16     4    checksum (u32 LE, verified by the device)
/// ```
#[derive(Debug, Clone)]
pub struct FirmwareHeader {
    raw: [u8; FW_HEADER_LEN],
}

impl FirmwareHeader {
    #[allow(clippy::missing_errors_doc)]
    pub fn parse(data: &[u8]) -> Result<Self, FirmwareError> {
        if data.len() < FW_HEADER_LEN {
            return Err(FirmwareError::HeaderTooShort(data.len()));
        }
        let mut raw = [0u8; FW_HEADER_LEN];
        raw.copy_from_slice(&data[..FW_HEADER_LEN]);
        Ok(Self { raw })
    }

    #[must_use]
    pub fn crypt_mode(&self) -> CryptMode {
        CryptMode::from(self.raw[0])
    }

    #[must_use]
    pub fn device_header(&self) -> u8 {
        self.raw[1]
    }

    #[must_use]
    pub fn fw_ver(&self) -> Version {
        Version::from_wire(self.raw[2], self.raw[3])
    }

    #[must_use]
    pub fn pcb_ver(&self) -> Version {
        Version::from_wire(self.raw[4], self.raw[5])
    }

    #[must_use]
    pub fn btldr_ver(&self) -> Version {
        Version::from_wire(self.raw[6], self.raw[7])
    }

    /// Flash address the image is written to
    #[must_use]
    pub fn offset(&self) -> u32 {
        u32::from_le_bytes([self.raw[8], self.raw[9], self.raw[10], self.raw[11]])
    }

    /// Image length in 4-byte words
    #[must_use]
    pub fn fw_len_words(&self) -> u16 {
        u16::from_le_bytes([self.raw[12], self.raw[13]])
    }

    /// Image length in bytes
    #[must_use]
    pub fn image_len(&self) -> usize {
        usize::from(self.fw_len_words()) * 4
    }

    /// Image checksum; verified device-side only
    #[must_use]
    pub fn check_sum(&self) -> u32 {
        u32::from_le_bytes([self.raw[16], self.raw[17], self.raw[18], self.raw[19]])
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; FW_HEADER_LEN] {
        &self.raw
    }
}

/// A lazy source of command packets with its own progress reading.
///
/// The command queue treats a generator entry as a sequence of payloads plus
/// a progress source; this is that seam.
pub trait PackStream: Send {
    /// Produce the next packet, or `None` once the stream is exhausted
    fn next_pack(&mut self) -> Option<Vec<u8>>;

    /// Progress in percent; an observed 100 latches back to 0
    fn progress(&mut self) -> u8;
}

/// A parsed firmware file, streamed as one FwInfo packet followed by
/// numbered FwPack blocks
pub struct Firmware {
    header: FirmwareHeader,
    image: Vec<u8>,
    offset: usize,
    info_sent: bool,
    progress: u8,
}

impl Firmware {
    /// Read and validate a `.fw` file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read, is shorter than the header, or
    /// holds fewer image bytes than the header declares. Callers must not
    /// start an update from a firmware that failed to open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FirmwareError> {
        Self::from_bytes(&fs::read(path)?)
    }

    /// Parse a firmware image already held in memory
    #[allow(clippy::missing_errors_doc)]
    pub fn from_bytes(data: &[u8]) -> Result<Self, FirmwareError> {
        let header = FirmwareHeader::parse(data)?;
        let expected = header.image_len();
        let actual = data.len() - FW_HEADER_LEN;
        if actual < expected {
            return Err(FirmwareError::Truncated { expected, actual });
        }
        let image = data[FW_HEADER_LEN..FW_HEADER_LEN + expected].to_vec();
        Ok(Self {
            header,
            image,
            offset: 0,
            info_sent: false,
            progress: 0,
        })
    }

    #[must_use]
    pub fn header(&self) -> &FirmwareHeader {
        &self.header
    }

    #[must_use]
    pub fn image_len(&self) -> usize {
        self.image.len()
    }
}

impl PackStream for Firmware {
    fn next_pack(&mut self) -> Option<Vec<u8>> {
        if !self.info_sent {
            self.info_sent = true;
            let mut pack = Vec::with_capacity(1 + FW_HEADER_LEN);
            pack.push(ElCmd::FwInfo as u8);
            pack.extend_from_slice(self.header.as_bytes());
            return Some(pack);
        }

        if self.offset >= self.image.len() {
            self.progress = 100;
            return None;
        }

        let block = FW_BLOCK_SIZE.min(self.image.len() - self.offset);
        let word_index = (self.offset / 4) as u16;
        let mut pack = Vec::with_capacity(3 + block);
        pack.push(ElCmd::FwPack as u8);
        pack.extend_from_slice(&word_index.to_le_bytes());
        pack.extend_from_slice(&self.image[self.offset..self.offset + block]);

        self.offset += block;
        self.progress = (100 * self.offset / self.image.len()) as u8;
        Some(pack)
    }

    fn progress(&mut self) -> u8 {
        let p = self.progress;
        if p == 100 {
            self.progress = 0;
        }
        p
    }
}
