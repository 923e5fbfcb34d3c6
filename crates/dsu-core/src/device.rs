//! Device representation
//!
//! A device aggregates the summary it reported, the transports it is
//! reachable over, the host interface pinned to its subnet, and its own
//! command queue.

use crate::eludp::ElUdp;
use crate::locator::LocatorHandle;
use crate::queue::CmdQueue;
use locator_protocol::{
    DeviceSummary, ElCmd, Firmware, FirmwareError, LocatorCmd, PrimarySettings, SerialNumber,
};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// One IPv4 interface of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetIf {
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

pub(crate) fn subnet_of(addr: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) & u32::from(mask))
}

/// Interface whose subnet contains the device, if any
pub(crate) fn pick_interface(
    interfaces: &[NetIf],
    ip: Ipv4Addr,
    mask: Ipv4Addr,
) -> Option<NetIf> {
    interfaces
        .iter()
        .copied()
        .find(|ifc| subnet_of(ifc.addr, ifc.netmask) == subnet_of(ip, mask))
}

/// Quiet time after a bootloader mode change before the next command
const MODE_CHANGE_PAUSE: Duration = Duration::from_secs(10);

/// A device reachable over the Locator and/or ElUDP protocols
pub struct Device {
    summary: RwLock<DeviceSummary>,
    /// Interface pinned to the device's subnet; `None` broadcasts everywhere
    ai: Option<NetIf>,
    locator: Option<LocatorHandle>,
    eludp: Option<ElUdp>,
    queue: CmdQueue,
    /// Inventory this device currently belongs to
    pub(crate) inventory: Mutex<Weak<crate::inventory::Shared>>,
    /// Liveness timer; armed by the inventory, cancelled on removal
    pub(crate) watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Build a device from a summary block received in a poll response.
    ///
    /// Anything but exactly 128 bytes of data produces a zeroed summary.
    #[must_use]
    pub fn from_summary(
        data: &[u8],
        locator: Option<LocatorHandle>,
        eludp: Option<ElUdp>,
    ) -> Arc<Self> {
        Self::build(DeviceSummary::parse(data), locator, eludp)
    }

    /// Build a unicast-only device from a bare address; the summary stays
    /// empty apart from ip and port
    #[must_use]
    pub fn from_addr(ip: Ipv4Addr, port: u16, eludp: Option<ElUdp>) -> Arc<Self> {
        let mut summary = DeviceSummary::default();
        summary.ip = ip;
        summary.port = port;
        Self::build(summary, None, eludp)
    }

    fn build(summary: DeviceSummary, locator: Option<LocatorHandle>, eludp: Option<ElUdp>) -> Arc<Self> {
        let ai = locator
            .as_ref()
            .and_then(|loc| pick_interface(loc.interfaces(), summary.ip, summary.mask));
        Arc::new_cyclic(|weak: &Weak<Device>| Device {
            summary: RwLock::new(summary),
            ai,
            locator,
            eludp,
            queue: CmdQueue::new(weak.clone()),
            inventory: Mutex::new(Weak::new()),
            watchdog: Mutex::new(None),
        })
    }

    /// Snapshot of the current summary
    #[must_use]
    pub fn summary(&self) -> DeviceSummary {
        self.summary.read().unwrap().clone()
    }

    #[must_use]
    pub fn serial(&self) -> SerialNumber {
        self.summary.read().unwrap().serial
    }

    /// Address used for unicast commands
    #[must_use]
    pub fn addr(&self) -> (Ipv4Addr, u16) {
        let summary = self.summary.read().unwrap();
        (summary.ip, summary.port)
    }

    /// Interface pinned at construction time
    #[must_use]
    pub fn ai(&self) -> Option<&NetIf> {
        self.ai.as_ref()
    }

    /// This device's command queue
    #[must_use]
    pub fn queue(&self) -> &CmdQueue {
        &self.queue
    }

    pub(crate) fn has_locator(&self) -> bool {
        self.locator.is_some()
    }

    pub(crate) fn update(&self, summary: DeviceSummary) {
        *self.summary.write().unwrap() = summary;
    }

    /// Send one packet to this device.
    ///
    /// A Locator command goes out broadcast, restricted to the pinned
    /// interface when there is one; anything else is unicast over ElUDP.
    /// Send failures are logged, never propagated: command outcomes are
    /// reported through the queue callbacks.
    pub async fn send_pack(&self, cmd: Option<LocatorCmd>, pack: &[u8]) {
        match (cmd, &self.locator, &self.eludp) {
            (Some(cmd), Some(locator), _) => {
                locator.send(cmd, pack, Some(self)).await;
            }
            (_, _, Some(eludp)) => {
                if let Err(e) = eludp.send_pack(self, pack).await {
                    tracing::warn!(device = %self, error = %e, "unicast send failed");
                }
            }
            _ => {
                tracing::debug!(device = %self, "no transport for outgoing packet");
            }
        }
    }

    /// Writable settings snapshot, ready for editing
    #[must_use]
    pub fn primary_settings(&self) -> PrimarySettings {
        self.summary.read().unwrap().primary_settings()
    }

    /// Fire-and-forget write of primary settings; enqueue a
    /// [`LocatorCmd::SetPrimary`] entry instead to observe the result
    pub async fn set_primary_settings(&self, settings: &PrimarySettings) {
        self.send_pack(Some(LocatorCmd::SetPrimary), &settings.to_bytes())
            .await;
    }

    /// Queue the full firmware update sequence: jump to the bootloader,
    /// stream the image, jump back to the main program.
    ///
    /// # Errors
    ///
    /// Fails when the firmware file cannot be opened or is malformed; in
    /// that case nothing is queued.
    pub fn queue_firmware_update(&self, path: impl AsRef<std::path::Path>) -> Result<(), FirmwareError> {
        use crate::queue::CmdEntry;

        let firmware = Firmware::open(path)?;
        self.queue.append(
            CmdEntry::new(LocatorCmd::ExeElCmd, vec![ElCmd::RunBtldr as u8])
                .with_pause(MODE_CHANGE_PAUSE),
        );
        self.queue
            .append(CmdEntry::with_stream(LocatorCmd::ExeElCmd, Box::new(firmware)));
        self.queue.append(
            CmdEntry::new(LocatorCmd::ExeElCmd, vec![ElCmd::RunMain as u8])
                .with_pause(MODE_CHANGE_PAUSE),
        );
        Ok(())
    }
}

impl PartialEq for Device {
    /// Identity: equal serials when the serial is assigned, the (ip, port)
    /// pair otherwise
    fn eq(&self, other: &Self) -> bool {
        let a = self.summary();
        let b = other.summary();
        if a.serial.is_empty() {
            (a.ip, a.port) == (b.ip, b.port)
        } else {
            a.serial == b.serial
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.summary();
        write!(
            f,
            "\"{}\" s/n={}, IP={}, port={}, MAC={}",
            s.name, s.serial, s.ip, s.port, s.mac
        )
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.summary();
        f.debug_struct("Device")
            .field("serial", &s.serial.to_string())
            .field("ip", &s.ip)
            .field("port", &s.port)
            .finish_non_exhaustive()
    }
}
