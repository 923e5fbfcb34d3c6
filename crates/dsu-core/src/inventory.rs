//! Device inventory: deduplication, liveness watchdogs, and synchronous
//! observer fan-out
//!
//! The inventory owns the devices; devices keep a non-owning back-reference
//! for response routing, and watchdog cancellation on removal breaks the
//! remaining cycle.

use crate::device::Device;
use bytes::Bytes;
use locator_protocol::{Frame, LocatorCmd};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Time without any packet from a device before it is dropped
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Kinds of inventory events an observer can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Appended,
    Removed,
    Updated,
    PollResponse,
    CmdResponse,
    ConnectionLost,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Appended,
        EventKind::Removed,
        EventKind::Updated,
        EventKind::PollResponse,
        EventKind::CmdResponse,
        EventKind::ConnectionLost,
    ];
}

/// An inventory event delivered to observers
#[derive(Clone)]
pub enum InventoryEvent {
    /// A new device was inserted
    Appended(Arc<Device>),
    /// A device was removed
    Removed(Arc<Device>),
    /// A known device reported different attributes
    Updated(Arc<Device>),
    /// A known device answered a poll
    PollResponse(Arc<Device>),
    /// A device answered a management command
    CmdResponse {
        device: Arc<Device>,
        cmd: LocatorCmd,
        pack: Bytes,
    },
    /// A device went silent past the watchdog timeout
    ConnectionLost(Arc<Device>),
}

impl InventoryEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            InventoryEvent::Appended(_) => EventKind::Appended,
            InventoryEvent::Removed(_) => EventKind::Removed,
            InventoryEvent::Updated(_) => EventKind::Updated,
            InventoryEvent::PollResponse(_) => EventKind::PollResponse,
            InventoryEvent::CmdResponse { .. } => EventKind::CmdResponse,
            InventoryEvent::ConnectionLost(_) => EventKind::ConnectionLost,
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        match self {
            InventoryEvent::Appended(d)
            | InventoryEvent::Removed(d)
            | InventoryEvent::Updated(d)
            | InventoryEvent::PollResponse(d)
            | InventoryEvent::ConnectionLost(d) => d,
            InventoryEvent::CmdResponse { device, .. } => device,
        }
    }
}

/// Observer callback; invoked synchronously on the task emitting the event,
/// so it must not block for long
pub type Observer = Arc<dyn Fn(&InventoryEvent) + Send + Sync>;

/// Token handed out by [`Inventory::bind`], used to deregister
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

pub(crate) struct Shared {
    devices: Mutex<Vec<Arc<Device>>>,
    observers: Mutex<HashMap<EventKind, Vec<(ObserverId, Observer)>>>,
    next_observer_id: AtomicU64,
    watchdog_timeout: Duration,
}

/// Ordered collection of discovered devices with liveness tracking and
/// observer fan-out
#[derive(Clone)]
pub struct Inventory {
    pub(crate) shared: Arc<Shared>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    #[must_use]
    pub fn new() -> Self {
        Self::with_watchdog(WATCHDOG_TIMEOUT)
    }

    /// Inventory with a non-default watchdog timeout
    #[must_use]
    pub fn with_watchdog(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                devices: Mutex::new(Vec::new()),
                observers: Mutex::new(HashMap::new()),
                next_observer_id: AtomicU64::new(1),
                watchdog_timeout: timeout,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Register an observer for the given event kinds (`None` = all).
    /// Returns the token for [`Inventory::unbind`].
    pub fn bind(&self, observer: Observer, events: Option<&[EventKind]>) -> ObserverId {
        let id = ObserverId(self.shared.next_observer_id.fetch_add(1, Ordering::Relaxed));
        let mut map = self.shared.observers.lock().unwrap();
        for kind in events.unwrap_or(&EventKind::ALL) {
            map.entry(*kind).or_default().push((id, observer.clone()));
        }
        id
    }

    /// Deregister an observer from every event kind it was bound to
    pub fn unbind(&self, id: ObserverId) {
        let mut map = self.shared.observers.lock().unwrap();
        for list in map.values_mut() {
            list.retain(|(oid, _)| *oid != id);
        }
    }

    /// Number of devices currently present
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.devices.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the device list in insertion order
    #[must_use]
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.shared.devices.lock().unwrap().clone()
    }

    /// Offer a device to the inventory.
    ///
    /// A device already present by instance yields a poll response event; one
    /// present by identity restarts its watchdog and, when attributes
    /// changed, is updated in place. Otherwise the device is inserted and its
    /// watchdog armed. Devices with neither a serial nor a usable port are
    /// rejected.
    pub fn append(&self, dev: Arc<Device>) {
        let mut pending = Vec::new();
        {
            let mut devices = self.shared.devices.lock().unwrap();
            if devices.iter().any(|d| Arc::ptr_eq(d, &dev)) {
                pending.push(InventoryEvent::PollResponse(Arc::clone(&dev)));
            } else {
                let summary = dev.summary();
                if summary.serial.is_empty() && summary.port == 0 {
                    return;
                }
                if let Some(i) = position(&devices, &dev) {
                    let existing = Arc::clone(&devices[i]);
                    if existing.has_locator() {
                        self.shared.restart_watchdog(&existing);
                        pending.push(InventoryEvent::PollResponse(Arc::clone(&existing)));
                    }
                    if existing.summary() != summary {
                        existing.update(summary);
                        pending.push(InventoryEvent::Updated(existing));
                    }
                } else {
                    *dev.inventory.lock().unwrap() = Arc::downgrade(&self.shared);
                    devices.push(Arc::clone(&dev));
                    self.shared.restart_watchdog(&dev);
                    pending.push(InventoryEvent::Appended(dev));
                }
            }
        }
        for event in pending {
            self.emit(&event);
        }
    }

    /// Remove a device by identity, cancelling its watchdog
    pub fn remove(&self, dev: &Device) {
        let removed = {
            let mut devices = self.shared.devices.lock().unwrap();
            position(&devices, dev).map(|i| devices.remove(i))
        };
        if let Some(removed) = removed {
            *removed.inventory.lock().unwrap() = Weak::new();
            cancel_watchdog(&removed);
            self.emit(&InventoryEvent::Removed(removed));
        }
    }

    /// Cancel every watchdog, drop every observer, and empty the list
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut devices = self.shared.devices.lock().unwrap();
            devices.drain(..).collect()
        };
        for dev in &drained {
            *dev.inventory.lock().unwrap() = Weak::new();
            cancel_watchdog(dev);
        }
        self.shared.observers.lock().unwrap().clear();
    }

    /// Route a non-poll response to the device it belongs to.
    ///
    /// The matched device's watchdog restarts on any packet; command
    /// responses additionally fan out to observers.
    pub fn response_processing(&self, frame: &Frame) {
        if frame.serial.is_empty() {
            return;
        }
        let dev = {
            let devices = self.shared.devices.lock().unwrap();
            devices
                .iter()
                .find(|d| d.serial() == frame.serial)
                .cloned()
        };
        let Some(dev) = dev else { return };

        self.shared.restart_watchdog(&dev);
        if frame.cmd != LocatorCmd::Request {
            self.emit(&InventoryEvent::CmdResponse {
                device: dev,
                cmd: frame.cmd,
                pack: Bytes::copy_from_slice(&frame.payload),
            });
        }
    }

    pub(crate) fn emit(&self, event: &InventoryEvent) {
        let observers: Vec<Observer> = {
            let map = self.shared.observers.lock().unwrap();
            map.get(&event.kind())
                .map(|list| list.iter().map(|(_, o)| Arc::clone(o)).collect())
                .unwrap_or_default()
        };
        for observer in observers {
            observer(event);
        }
    }
}

impl Shared {
    /// (Re)arm a device's liveness timer; only locator-connected devices are
    /// watched, unicast-only ones never expire
    pub(crate) fn restart_watchdog(self: &Arc<Self>, dev: &Arc<Device>) {
        if !dev.has_locator() {
            return;
        }
        let mut slot = dev.watchdog.lock().unwrap();
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        let shared = Arc::downgrade(self);
        let dev = Arc::clone(dev);
        let timeout = self.watchdog_timeout;
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            tracing::info!(device = %dev, "connection lost");
            let inventory = Inventory::from_shared(shared);
            inventory.emit(&InventoryEvent::ConnectionLost(Arc::clone(&dev)));
            inventory.remove(&dev);
        }));
    }
}

fn cancel_watchdog(dev: &Device) {
    if let Some(handle) = dev.watchdog.lock().unwrap().take() {
        handle.abort();
    }
}

/// Index of a device with the same identity, if present
fn position(devices: &[Arc<Device>], dev: &Device) -> Option<usize> {
    let summary = dev.summary();
    if summary.serial.is_empty() {
        devices.iter().position(|d| d.addr() == (summary.ip, summary.port))
    } else {
        devices.iter().position(|d| d.serial() == summary.serial)
    }
}
