//! Host-side core of the Device Service Utility
//!
//! Discovers embedded devices over the broadcast Locator protocol, keeps a
//! live inventory with per-device liveness watchdogs, and streams commands
//! and firmware to individual devices over UDP.

pub mod device;
pub mod eludp;
pub mod inventory;
pub mod locator;
pub mod queue;
pub mod seed;

pub use device::{Device, NetIf};
pub use eludp::{ElUdp, ElUdpError, PackCallback, SubscriptionId, ELUDP_PORT};
pub use inventory::{
    EventKind, Inventory, InventoryEvent, Observer, ObserverId, WATCHDOG_TIMEOUT,
};
pub use locator::{
    Locator, LocatorConfig, LocatorHandle, TransportError, LOCATOR_PORT, POLL_INTERVAL,
};
pub use queue::{
    CmdEntry, CmdQueue, CmdResult, EntryCallback, EntryOutcome, QueueCallback, QueueError,
    QueueResult, ResponseData, DEFAULT_CMD_TIMEOUT, MAX_ATTEMPT_NUM,
};
pub use seed::load_seed;
