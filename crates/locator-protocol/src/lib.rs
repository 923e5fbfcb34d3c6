//! Locator wire protocol for the Device Service Utility
//!
//! This crate implements the framing, command sets, the 128-byte device
//! summary block, and `.fw` firmware streaming used to talk to embedded
//! devices over broadcast and unicast UDP.

pub mod commands;
pub mod firmware;
pub mod frame;
pub mod summary;
pub mod types;

pub use commands::{ElCmd, LocatorCmd, LocatorResult, DEFAULT_ERROR_CODE};
pub use firmware::{
    CryptMode, Firmware, FirmwareError, FirmwareHeader, PackStream, FW_BLOCK_SIZE, FW_HEADER_LEN,
};
pub use frame::{Frame, SerialNumber, FRAME_OVERHEAD, PASSWORD, PROTOCOL_VERSION};
pub use summary::{
    BootMode, DeviceModel, DeviceSummary, MacAddr, PrimarySettings, Version, SUMMARY_LEN,
};
pub use types::ProtocolError;
