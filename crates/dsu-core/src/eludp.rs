//! Unicast command transport
//!
//! One socket and listener task per device port; inbound datagrams are
//! dispatched to the callbacks subscribed to their exact source address.

use crate::device::Device;
use dashmap::DashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default device-side ElUDP port
pub const ELUDP_PORT: u16 = 1775;

const RECV_BUF_SIZE: usize = 1024;

/// Unicast transport errors
#[derive(Error, Debug)]
pub enum ElUdpError {
    #[error("Socket error: {0}")]
    Io(#[from] io::Error),

    #[error("No socket bound for {0}")]
    NotBound(SocketAddr),
}

/// Callback receiving raw datagrams from a subscribed device
pub type PackCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Token handed out by [`ElUdp::bind`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct PortListener {
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

struct Shared {
    /// Open sockets keyed by local port
    ports: DashMap<u16, PortListener>,
    /// Subscriber callbacks keyed by device address
    subscribers: DashMap<(Ipv4Addr, u16), Vec<(SubscriptionId, PackCallback)>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

/// Unicast transport handle; clones share the sockets and subscriptions
#[derive(Clone)]
pub struct ElUdp {
    shared: Arc<Shared>,
}

impl Default for ElUdp {
    fn default() -> Self {
        Self::new()
    }
}

impl ElUdp {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                ports: DashMap::new(),
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Subscribe a callback to datagrams from the device's address; the
    /// first subscriber on a port opens its socket and listener.
    ///
    /// # Errors
    ///
    /// Fails when the port socket cannot be bound.
    pub async fn bind(&self, dev: &Device, cbs: PackCallback) -> Result<SubscriptionId, ElUdpError> {
        let (ip, port) = dev.addr();

        if !self.shared.ports.contains_key(&port) {
            let socket = Arc::new(UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?);
            tracing::info!(port, "eludp listening");
            let task = tokio::spawn(Self::listen(Arc::clone(&socket), Arc::clone(&self.shared)));
            self.shared.ports.insert(port, PortListener { socket, task });
        }

        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .subscribers
            .entry((ip, port))
            .or_default()
            .push((id, cbs));
        Ok(id)
    }

    async fn listen(socket: Arc<UdpSocket>, shared: Arc<Shared>) {
        let mut buf = [0u8; RECV_BUF_SIZE];
        loop {
            let received = tokio::select! {
                () = shared.cancel.cancelled() => break,
                r = socket.recv_from(&mut buf) => r,
            };
            let (n, src) = match received {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(error = %e, "eludp receive failed, stopping");
                    break;
                }
            };

            let IpAddr::V4(src_ip) = src.ip() else { continue };
            let subs: Vec<PackCallback> = shared
                .subscribers
                .get(&(src_ip, src.port()))
                .map(|list| list.iter().map(|(_, cbs)| Arc::clone(cbs)).collect())
                .unwrap_or_default();
            for cbs in subs {
                cbs(&buf[..n]);
            }
        }
        tracing::debug!("eludp listener stopped");
    }

    /// Remove one subscription, or all of the device's subscriptions when no
    /// id is given. The port socket closes only once no device on that port
    /// has subscribers left.
    pub fn unbind(&self, dev: &Device, id: Option<SubscriptionId>) {
        let (ip, port) = dev.addr();
        let key = (ip, port);

        let drop_entry = {
            let Some(mut subs) = self.shared.subscribers.get_mut(&key) else {
                return;
            };
            match id {
                Some(id) => {
                    subs.retain(|(sid, _)| *sid != id);
                    subs.is_empty()
                }
                None => true,
            }
        };
        if drop_entry {
            self.shared.subscribers.remove(&key);
        }

        let port_in_use = self.shared.subscribers.iter().any(|e| e.key().1 == port);
        if !port_in_use {
            if let Some((_, listener)) = self.shared.ports.remove(&port) {
                listener.task.abort();
                tracing::info!(port, "eludp port closed");
            }
        }
    }

    /// Send a raw pack to the device's address.
    ///
    /// # Errors
    ///
    /// Fails when the device's port has no open socket (no subscriber ever
    /// bound it) or the send itself fails.
    pub async fn send_pack(&self, dev: &Device, pack: &[u8]) -> Result<(), ElUdpError> {
        let (ip, port) = dev.addr();
        let dest = SocketAddr::from((ip, port));
        let socket = self
            .shared
            .ports
            .get(&port)
            .map(|listener| Arc::clone(&listener.socket))
            .ok_or(ElUdpError::NotBound(dest))?;
        socket.send_to(pack, dest).await?;
        tracing::debug!(%dest, len = pack.len(), "pack sent");
        Ok(())
    }

    /// Stop every listener and drop all sockets and subscriptions
    pub fn close(&self) {
        self.shared.cancel.cancel();
        for entry in self.shared.ports.iter() {
            entry.value().task.abort();
        }
        self.shared.ports.clear();
        self.shared.subscribers.clear();
    }
}
