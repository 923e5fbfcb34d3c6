//! Broadcast discovery and management transport
//!
//! One UDP socket, one receive task, one poll task. Polls go to the
//! broadcast address of every usable interface; replies are routed into the
//! inventory.

use crate::device::{Device, NetIf};
use crate::inventory::Inventory;
use locator_protocol::{Frame, LocatorCmd, SerialNumber, SUMMARY_LEN};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// UDP port devices listen on for broadcast frames
pub const LOCATOR_PORT: u16 = 1770;

/// Secondary port reserved by the protocol; unused here
pub const LOCATOR_PORT2: u16 = 1760;

/// Interval between broadcast polls
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

const RECV_BUF_SIZE: usize = 1024;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Socket error: {0}")]
    Io(#[from] io::Error),
}

/// Locator transport configuration
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    /// Local bind address
    pub bind: SocketAddr,
    /// Destination port devices listen on
    pub device_port: u16,
    /// Broadcast poll interval
    pub poll_interval: Duration,
    /// Interface override; `None` enumerates the host's interfaces
    pub interfaces: Option<Vec<NetIf>>,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], LOCATOR_PORT)),
            device_port: LOCATOR_PORT,
            poll_interval: POLL_INTERVAL,
            interfaces: None,
        }
    }
}

struct Shared {
    socket: UdpSocket,
    interfaces: Vec<NetIf>,
    device_port: u16,
    cancel: CancellationToken,
}

/// Cheap handle devices keep for outbound sends
#[derive(Clone)]
pub struct LocatorHandle {
    shared: Arc<Shared>,
}

impl LocatorHandle {
    pub(crate) fn interfaces(&self) -> &[NetIf] {
        &self.shared.interfaces
    }

    /// Build one frame and broadcast it.
    ///
    /// With a device the frame carries its serial and, when the device is
    /// pinned to an interface, goes out on that interface only; without one
    /// it is a wildcard frame for every interface. Per-interface send
    /// failures are logged and skipped.
    pub async fn send(&self, cmd: LocatorCmd, payload: &[u8], dev: Option<&Device>) {
        let serial = dev.map_or(SerialNumber::WILDCARD, Device::serial);
        let data = Frame::new(cmd, serial, payload.to_vec()).serialize();
        let pinned = dev.and_then(|d| d.ai().copied());

        for ifc in &self.shared.interfaces {
            if let Some(pin) = pinned {
                if pin != *ifc {
                    continue;
                }
            }
            if self.shared.cancel.is_cancelled() {
                break;
            }
            let dest = SocketAddr::from((ifc.broadcast, self.shared.device_port));
            match self.shared.socket.send_to(&data, dest).await {
                Ok(_) => {
                    tracing::debug!(cmd = ?cmd, %dest, len = data.len(), "frame sent");
                }
                Err(e) => {
                    tracing::warn!(%dest, error = %e, "broadcast send failed");
                }
            }
        }
    }
}

/// Owner of the broadcast socket and its poll and receive tasks
pub struct Locator {
    handle: LocatorHandle,
    inventory: Inventory,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Locator {
    /// Bind the socket, enumerate interfaces, and start the poll and
    /// receive loops.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be bound or configured for broadcast.
    pub async fn start(config: LocatorConfig, inventory: Inventory) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(config.bind).await?;
        socket.set_broadcast(true)?;

        let interfaces = match config.interfaces {
            Some(list) => list,
            None => host_interfaces(),
        };
        if interfaces.is_empty() {
            tracing::warn!("no usable IPv4 interfaces, broadcasts will reach nothing");
        }
        tracing::info!(
            addr = %socket.local_addr()?,
            interfaces = interfaces.len(),
            "locator listening"
        );

        let shared = Arc::new(Shared {
            socket,
            interfaces,
            device_port: config.device_port,
            cancel: CancellationToken::new(),
        });
        let handle = LocatorHandle { shared };

        let tasks = vec![
            tokio::spawn(Self::receive_loop(handle.clone(), inventory.clone())),
            tokio::spawn(Self::poll_loop(handle.clone(), config.poll_interval)),
        ];

        Ok(Self {
            handle,
            inventory,
            tasks: Mutex::new(tasks),
        })
    }

    /// Handle for sending frames outside the poll loop
    #[must_use]
    pub fn handle(&self) -> LocatorHandle {
        self.handle.clone()
    }

    async fn poll_loop(handle: LocatorHandle, interval: Duration) {
        let cancel = handle.shared.cancel.clone();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    handle.send(LocatorCmd::Request, &[], None).await;
                }
            }
        }
        tracing::debug!("poll loop stopped");
    }

    async fn receive_loop(handle: LocatorHandle, inventory: Inventory) {
        let shared = &handle.shared;
        let local_addrs: Vec<Ipv4Addr> = shared.interfaces.iter().map(|i| i.addr).collect();
        let mut buf = [0u8; RECV_BUF_SIZE];

        loop {
            let received = tokio::select! {
                () = shared.cancel.cancelled() => break,
                r = shared.socket.recv_from(&mut buf) => r,
            };
            let (n, src) = match received {
                Ok(v) => v,
                Err(e) => {
                    if shared.cancel.is_cancelled() {
                        break;
                    }
                    tracing::error!(error = %e, "receive failed, stopping");
                    break;
                }
            };

            let IpAddr::V4(src_ip) = src.ip() else { continue };
            // Our own broadcasts loop back from every interface
            if local_addrs.contains(&src_ip) {
                continue;
            }

            let frame = match Frame::deserialize(&buf[..n]) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(%src, error = %e, "dropping malformed frame");
                    continue;
                }
            };
            tracing::debug!(%src, cmd = ?frame.cmd, len = frame.payload.len(), "frame received");

            if frame.cmd == LocatorCmd::Request {
                let data = frame.payload.get(..SUMMARY_LEN).unwrap_or(&[]);
                let dev = Device::from_summary(data, Some(handle.clone()), None);
                inventory.append(dev);
            } else {
                inventory.response_processing(&frame);
            }
        }
        tracing::debug!("receive loop stopped");
    }

    /// Cancel both loops, join them, and clear the inventory
    pub async fn shutdown(&self) {
        self.handle.shared.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.inventory.clear();
    }
}

/// Enumerate the host's usable IPv4 interfaces as (addr, netmask, broadcast)
fn host_interfaces() -> Vec<NetIf> {
    let mut out = Vec::new();
    for iface in netdev::get_interfaces() {
        if !iface.is_up() || iface.is_loopback() {
            continue;
        }
        for net in &iface.ipv4 {
            let addr = net.addr();
            let netmask = net.netmask();
            let broadcast = Ipv4Addr::from(u32::from(addr) | !u32::from(netmask));
            out.push(NetIf {
                addr,
                netmask,
                broadcast,
            });
        }
    }
    out
}
