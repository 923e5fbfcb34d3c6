//! Locator and ElUDP command definitions

use serde::Serialize;

/// Command IDs of the broadcast Locator protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum LocatorCmd {
    /// Broadcast poll; devices answer with their summary block
    Request = 0x01,
    /// Write primary settings (name, addressing, comment)
    SetPrimary = 0x02,
    /// Read a settings record selected by the payload
    ReadSettings = 0x03,
    /// Tunnel an ElUDP command through the broadcast channel
    ExeElCmd = 0x04,
    /// Read memory region properties
    ReadMemProp = 0x05,
    /// Read a memory dump
    ReadMemDump = 0x06,
    /// Read the object map
    GetMap = 0x07,
    /// Read the device log
    GetLog = 0x08,
    /// Clear the device log
    ClearLog = 0x09,
    /// Write a user record
    SetUser = 0x0A,
    /// Read a user record
    GetUser = 0x0B,
}

impl LocatorCmd {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(LocatorCmd::Request),
            0x02 => Some(LocatorCmd::SetPrimary),
            0x03 => Some(LocatorCmd::ReadSettings),
            0x04 => Some(LocatorCmd::ExeElCmd),
            0x05 => Some(LocatorCmd::ReadMemProp),
            0x06 => Some(LocatorCmd::ReadMemDump),
            0x07 => Some(LocatorCmd::GetMap),
            0x08 => Some(LocatorCmd::GetLog),
            0x09 => Some(LocatorCmd::ClearLog),
            0x0A => Some(LocatorCmd::SetUser),
            0x0B => Some(LocatorCmd::GetUser),
            _ => None,
        }
    }
}

/// Result byte a device reports for an executed Locator command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum LocatorResult {
    UnknownCmd = 0x00,
    Ok = 0x01,
    Error = 0x02,
    OutOfMem = 0x03,
    MemError = 0x04,
}

impl LocatorResult {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(LocatorResult::UnknownCmd),
            0x01 => Some(LocatorResult::Ok),
            0x02 => Some(LocatorResult::Error),
            0x03 => Some(LocatorResult::OutOfMem),
            0x04 => Some(LocatorResult::MemError),
            _ => None,
        }
    }
}

/// Error code used when a short result response carries none of its own
pub const DEFAULT_ERROR_CODE: u8 = 0xFF;

/// Low-level device commands carried as the first payload byte of an
/// [`LocatorCmd::ExeElCmd`] envelope or of a raw ElUDP datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ElCmd {
    /// Set the controller address
    SetAddr = 0x01,
    /// Restart the controller
    Restart = 0x02,
    /// Write firmware image information
    FwInfo = 0x03,
    /// Load one firmware image block
    FwPack = 0x04,
    /// Jump to the main program
    RunMain = 0x05,
    /// Jump to the bootloader
    RunBtldr = 0x06,
}

impl ElCmd {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ElCmd::SetAddr),
            0x02 => Some(ElCmd::Restart),
            0x03 => Some(ElCmd::FwInfo),
            0x04 => Some(ElCmd::FwPack),
            0x05 => Some(ElCmd::RunMain),
            0x06 => Some(ElCmd::RunBtldr),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_round_trip() {
        for value in 0x01..=0x0B {
            let cmd = LocatorCmd::from_u8(value).unwrap();
            assert_eq!(cmd as u8, value);
        }
        assert!(LocatorCmd::from_u8(0x00).is_none());
        assert!(LocatorCmd::from_u8(0x0C).is_none());
    }

    #[test]
    fn test_result_round_trip() {
        for value in 0x00..=0x04 {
            let result = LocatorResult::from_u8(value).unwrap();
            assert_eq!(result as u8, value);
        }
        assert!(LocatorResult::from_u8(0x05).is_none());
    }
}
