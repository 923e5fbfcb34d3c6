//! Per-device serial command queue
//!
//! Entries execute strictly in insertion order. Each packet is sent up to
//! [`MAX_ATTEMPT_NUM`] times with a per-attempt timeout; the first terminal
//! failure or timeout aborts the rest of the queue. Generator entries expand
//! a lazy packet stream in place, one response awaited per produced packet.

use crate::device::Device;
use crate::inventory::{EventKind, Inventory, InventoryEvent, Observer, ObserverId};
use locator_protocol::{LocatorCmd, LocatorResult, PackStream, DEFAULT_ERROR_CODE};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Maximum number of times one packet is sent before giving up
pub const MAX_ATTEMPT_NUM: u32 = 3;

/// Default per-command response timeout
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(2);

/// Queue API errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Device is not in an inventory")]
    NotInInventory,

    #[error("Queue is already running")]
    AlreadyRunning,

    #[error("Queue device is gone")]
    DeviceGone,
}

/// Terminal outcome of a whole queue run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueResult {
    Ok,
    Fail,
    Timeout,
}

/// Short "command result" response: result byte plus optional error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdResult {
    pub result: LocatorResult,
    /// Device error code, or [`DEFAULT_ERROR_CODE`] when none was sent
    pub error_code: u8,
}

/// What a successful response contained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseData {
    /// Opaque data payload
    Pack(Vec<u8>),
    /// Short command-result response
    Result(CmdResult),
}

/// Per-entry report delivered to the entry callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Ok(ResponseData),
    Fail(CmdResult),
    Timeout,
}

/// Entry callback; invoked once per awaited response
pub type EntryCallback = Arc<dyn Fn(&EntryOutcome) + Send + Sync>;

/// Queue-level callback; invoked once when the run reaches a terminal state
pub type QueueCallback = Arc<dyn Fn(QueueResult) + Send + Sync>;

/// One queued command
pub struct CmdEntry {
    /// Locator command; `None` sends the raw pack over ElUDP
    pub code: Option<LocatorCmd>,
    pub pack: Vec<u8>,
    /// Lazy packet source expanded in place of `pack`
    pub gen: Option<Box<dyn PackStream>>,
    /// Per-entry response timeout; `None` uses [`DEFAULT_CMD_TIMEOUT`]
    pub timeout: Option<Duration>,
    /// Quiet time after the entry succeeds
    pub pause: Duration,
    pub cbs: Option<EntryCallback>,
}

impl CmdEntry {
    /// Entry sending a single Locator command
    #[must_use]
    pub fn new(code: LocatorCmd, pack: Vec<u8>) -> Self {
        Self {
            code: Some(code),
            pack,
            gen: None,
            timeout: None,
            pause: Duration::ZERO,
            cbs: None,
        }
    }

    /// Entry sending a raw pack over ElUDP
    #[must_use]
    pub fn raw(pack: Vec<u8>) -> Self {
        Self {
            code: None,
            pack,
            gen: None,
            timeout: None,
            pause: Duration::ZERO,
            cbs: None,
        }
    }

    /// Entry expanding a lazy packet stream under one Locator command
    #[must_use]
    pub fn with_stream(code: LocatorCmd, gen: Box<dyn PackStream>) -> Self {
        Self {
            code: Some(code),
            pack: Vec::new(),
            gen: Some(gen),
            timeout: None,
            pause: Duration::ZERO,
            cbs: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    #[must_use]
    pub fn with_callback(mut self, cbs: EntryCallback) -> Self {
        self.cbs = Some(cbs);
        self
    }
}

/// Terminal classification of one response
#[derive(Debug, Clone)]
enum Terminal {
    Received(ResponseData),
    Failed(CmdResult),
}

/// Outcome of sending one packet through the retry loop
enum AttemptStatus {
    Ok(ResponseData),
    Fail(CmdResult),
    Timeout,
    Shutdown,
}

#[derive(Default)]
struct GateInner {
    /// Command currently awaited; `None` while idle
    code: Option<LocatorCmd>,
    waiting: bool,
    state: Option<Terminal>,
}

/// Wait point between the worker and the response observer
struct Gate {
    inner: Mutex<GateInner>,
    notify: Notify,
}

struct Shared {
    dev: Weak<Device>,
    entries: Mutex<Vec<CmdEntry>>,
    cbs: Mutex<Option<QueueCallback>>,
    progress: AtomicU8,
    gate: Gate,
    cancel: Mutex<CancellationToken>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Serial command pipeline owned by a single device
pub struct CmdQueue {
    shared: Arc<Shared>,
}

impl CmdQueue {
    pub(crate) fn new(dev: Weak<Device>) -> Self {
        Self {
            shared: Arc::new(Shared {
                dev,
                entries: Mutex::new(Vec::new()),
                cbs: Mutex::new(None),
                progress: AtomicU8::new(0),
                gate: Gate {
                    inner: Mutex::new(GateInner::default()),
                    notify: Notify::new(),
                },
                cancel: Mutex::new(CancellationToken::new()),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Install the queue-level callback for the next run
    pub fn set_callback(&self, cbs: QueueCallback) {
        *self.shared.cbs.lock().unwrap() = Some(cbs);
    }

    /// Append an entry; silently rejected while a run is in flight
    pub fn append(&self, entry: CmdEntry) {
        let progress = self.shared.progress.load(Ordering::Acquire);
        if progress > 0 && progress < 100 {
            tracing::debug!("queue busy, entry rejected");
            return;
        }
        self.shared.entries.lock().unwrap().push(entry);
    }

    /// Progress in percent; an observed 100 latches back to 0
    pub fn progress(&self) -> u8 {
        let progress = self.shared.progress.load(Ordering::Acquire);
        if progress == 100 {
            let _ = self.shared.progress.compare_exchange(
                100,
                0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
        progress
    }

    /// Subscribe to command responses and start the worker task.
    ///
    /// # Errors
    ///
    /// Fails when a run is already in flight, the device is gone, or the
    /// device is not in an inventory (responses could never be routed).
    pub fn run(&self) -> Result<(), QueueError> {
        let progress = self.shared.progress.load(Ordering::Acquire);
        if progress > 0 && progress < 100 {
            return Err(QueueError::AlreadyRunning);
        }

        let dev = self.shared.dev.upgrade().ok_or(QueueError::DeviceGone)?;
        let inventory_shared = dev
            .inventory
            .lock()
            .unwrap()
            .upgrade()
            .ok_or(QueueError::NotInInventory)?;
        let inventory = Inventory::from_shared(inventory_shared);

        let cancel = CancellationToken::new();
        *self.shared.cancel.lock().unwrap() = cancel.clone();
        self.shared.progress.store(1, Ordering::Release);

        let observer_shared = Arc::downgrade(&self.shared);
        let observer_dev = Arc::clone(&dev);
        let observer: Observer = Arc::new(move |event: &InventoryEvent| {
            let InventoryEvent::CmdResponse { device, cmd, pack } = event else {
                return;
            };
            let Some(shared) = observer_shared.upgrade() else {
                return;
            };
            if !Arc::ptr_eq(device, &observer_dev) {
                return;
            }
            shared.handle_response(*cmd, pack);
        });
        let observer_id = inventory.bind(observer, Some(&[EventKind::CmdResponse]));

        let shared = Arc::clone(&self.shared);
        let worker = tokio::spawn(async move {
            Shared::worker(shared, dev, inventory, observer_id, cancel).await;
        });
        *self.shared.worker.lock().unwrap() = Some(worker);
        Ok(())
    }

    /// Cancel the run, wait for the worker, and drop pending entries
    pub async fn stop(&self) {
        let cancel = self.shared.cancel.lock().unwrap().clone();
        cancel.cancel();
        let worker = self.shared.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.shared.entries.lock().unwrap().clear();
    }
}

/// Entry counts driving the progress formula
struct Totals {
    total: usize,
    non_gen: usize,
    gens: usize,
}

impl Totals {
    fn of(entries: &[CmdEntry]) -> Self {
        let gens = entries.iter().filter(|e| e.gen.is_some()).count();
        Self {
            total: entries.len(),
            non_gen: entries.len() - gens,
            gens,
        }
    }
}

/// Mid-run progress, clamped to [2, 99]; 0/1/100 are set at the
/// lifecycle edges.
///
/// Without generators: percentage of the entry index. With generators:
/// finished plain entries count one percent apiece and every generator
/// spreads `(97 - plain) / generators` percent across its own progress.
fn progress_value(totals: &Totals, done_non_gen: usize, done_gens: usize, gen_progress: u8) -> u8 {
    let value = if totals.gens == 0 {
        100 * (done_non_gen + done_gens) / totals.total.max(1)
    } else {
        let weight = 97usize.saturating_sub(totals.non_gen) / totals.gens;
        done_non_gen + done_gens * weight + weight * usize::from(gen_progress) / 100
    };
    value.clamp(2, 99) as u8
}

impl Shared {
    /// Classify an inbound response against the awaited command and wake the
    /// worker on a terminal state
    fn handle_response(&self, cmd: LocatorCmd, pack: &[u8]) {
        let mut gate = self.gate.inner.lock().unwrap();
        if !gate.waiting || gate.state.is_some() {
            return;
        }
        let Some(code) = gate.code else {
            // ElUDP entries are answered out of band, not through Locator
            return;
        };
        if cmd != code {
            tracing::debug!(got = ?cmd, want = ?code, "response for another command ignored");
            return;
        }
        let Some(terminal) = classify(cmd, pack) else {
            return;
        };
        gate.state = Some(terminal);
        drop(gate);
        self.gate.notify.notify_one();
    }

    /// Raise the stored progress, never lowering an earlier observation
    fn bump_progress(&self, value: u8) {
        let _ = self
            .progress
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (value > current).then_some(value)
            });
    }

    /// Send one packet and drive the retry state machine to a terminal state
    async fn run_once(
        &self,
        dev: &Device,
        code: Option<LocatorCmd>,
        pack: &[u8],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> AttemptStatus {
        {
            let mut gate = self.gate.inner.lock().unwrap();
            gate.code = code;
            gate.waiting = true;
            gate.state = None;
        }

        let mut attempts = 0;
        let status = loop {
            attempts += 1;
            dev.send_pack(code, pack).await;
            let deadline = tokio::time::Instant::now() + timeout;

            let terminal = loop {
                let notified = self.gate.notify.notified();
                if let Some(terminal) = self.gate.inner.lock().unwrap().state.take() {
                    break Some(terminal);
                }
                tokio::select! {
                    () = cancel.cancelled() => break None,
                    result = tokio::time::timeout_at(deadline, notified) => {
                        if result.is_err() {
                            break None; // deadline hit, re-check attempts
                        }
                    }
                }
            };
            if cancel.is_cancelled() {
                break AttemptStatus::Shutdown;
            }

            match terminal {
                Some(Terminal::Received(data)) => break AttemptStatus::Ok(data),
                Some(Terminal::Failed(result)) => break AttemptStatus::Fail(result),
                None => {
                    if attempts >= MAX_ATTEMPT_NUM {
                        break AttemptStatus::Timeout;
                    }
                    tracing::debug!(attempt = attempts, code = ?code, "no response, resending");
                }
            }
        };

        let mut gate = self.gate.inner.lock().unwrap();
        gate.code = None;
        gate.waiting = false;
        gate.state = None;
        drop(gate);
        status
    }

    /// Report one attempt's terminal state; returns whether the queue may
    /// continue
    fn settle(
        entry_cbs: Option<&EntryCallback>,
        code: Option<LocatorCmd>,
        status: AttemptStatus,
        outcome: &mut Option<QueueResult>,
    ) -> bool {
        match status {
            AttemptStatus::Ok(data) => {
                if let Some(cbs) = entry_cbs {
                    cbs(&EntryOutcome::Ok(data));
                }
                true
            }
            AttemptStatus::Fail(result) => {
                tracing::warn!(code = ?code, result = ?result.result, "command failed");
                if let Some(cbs) = entry_cbs {
                    cbs(&EntryOutcome::Fail(result));
                }
                *outcome = Some(QueueResult::Fail);
                false
            }
            AttemptStatus::Timeout => {
                tracing::warn!(code = ?code, "command timed out");
                if let Some(cbs) = entry_cbs {
                    cbs(&EntryOutcome::Timeout);
                }
                *outcome = Some(QueueResult::Timeout);
                false
            }
            AttemptStatus::Shutdown => {
                tracing::debug!("queue stopped");
                *outcome = None;
                false
            }
        }
    }

    async fn pause_or_cancel(pause: Duration, cancel: &CancellationToken) -> bool {
        if pause.is_zero() {
            return true;
        }
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(pause) => true,
        }
    }

    async fn worker(
        shared: Arc<Self>,
        dev: Arc<Device>,
        inventory: Inventory,
        observer_id: ObserverId,
        cancel: CancellationToken,
    ) {
        let entries = std::mem::take(&mut *shared.entries.lock().unwrap());
        let totals = Totals::of(&entries);
        let mut outcome = Some(QueueResult::Ok);
        let mut done_non_gen = 0usize;
        let mut done_gens = 0usize;

        'queue: for mut entry in entries {
            shared.bump_progress(progress_value(&totals, done_non_gen, done_gens, 0));
            let timeout = entry.timeout.unwrap_or(DEFAULT_CMD_TIMEOUT);

            match entry.gen.take() {
                None => {
                    let status = shared
                        .run_once(&dev, entry.code, &entry.pack, timeout, &cancel)
                        .await;
                    if !Self::settle(entry.cbs.as_ref(), entry.code, status, &mut outcome) {
                        break 'queue;
                    }
                    done_non_gen += 1;
                }
                Some(mut gen) => {
                    while let Some(pack) = gen.next_pack() {
                        let status = shared
                            .run_once(&dev, entry.code, &pack, timeout, &cancel)
                            .await;
                        if !Self::settle(entry.cbs.as_ref(), entry.code, status, &mut outcome) {
                            break 'queue;
                        }
                        shared.bump_progress(progress_value(
                            &totals,
                            done_non_gen,
                            done_gens,
                            gen.progress(),
                        ));
                    }
                    done_gens += 1;
                }
            }

            shared.bump_progress(progress_value(&totals, done_non_gen, done_gens, 0));
            if !Self::pause_or_cancel(entry.pause, &cancel).await {
                outcome = None;
                break 'queue;
            }
        }

        let cbs = shared.cbs.lock().unwrap().clone();
        match outcome {
            Some(QueueResult::Ok) => {
                shared.progress.store(100, Ordering::Release);
                if let Some(cbs) = cbs {
                    cbs(QueueResult::Ok);
                }
            }
            Some(result) => {
                shared.progress.store(0, Ordering::Release);
                if let Some(cbs) = cbs {
                    cbs(result);
                }
            }
            // Stopped from outside; no terminal report
            None => shared.progress.store(0, Ordering::Release),
        }

        inventory.unbind(observer_id);
        shared.entries.lock().unwrap().clear();
    }
}

/// Map a response payload to a terminal wait state; `None` leaves the
/// retry/timeout machinery in charge
fn classify(cmd: LocatorCmd, pack: &[u8]) -> Option<Terminal> {
    match cmd {
        LocatorCmd::SetPrimary | LocatorCmd::ExeElCmd | LocatorCmd::ClearLog => short_result(pack),
        LocatorCmd::ReadSettings => {
            let looks_like_result = pack.len() <= 2
                && pack
                    .first()
                    .is_some_and(|&b| LocatorResult::from_u8(b).is_some());
            if looks_like_result {
                short_result(pack)
            } else {
                Some(Terminal::Received(ResponseData::Pack(pack.to_vec())))
            }
        }
        LocatorCmd::ReadMemProp
        | LocatorCmd::ReadMemDump
        | LocatorCmd::GetMap
        | LocatorCmd::GetLog
        | LocatorCmd::SetUser
        | LocatorCmd::GetUser => Some(Terminal::Received(ResponseData::Pack(pack.to_vec()))),
        LocatorCmd::Request => None,
    }
}

fn short_result(pack: &[u8]) -> Option<Terminal> {
    let &first = pack.first()?;
    let Some(result) = LocatorResult::from_u8(first) else {
        tracing::warn!(byte = first, "unknown result byte in response");
        return None;
    };
    let error_code = if result == LocatorResult::Ok || pack.len() < 2 {
        DEFAULT_ERROR_CODE
    } else {
        pack[1]
    };
    let cmd_result = CmdResult { result, error_code };
    Some(if result == LocatorResult::Ok {
        Terminal::Received(ResponseData::Result(cmd_result))
    } else {
        Terminal::Failed(cmd_result)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Inventory;
    use crate::locator::tests::{fake_summary, test_config, WIRE_SERIAL};
    use crate::locator::Locator;
    use locator_protocol::{Firmware, Frame, SerialNumber, FW_HEADER_LEN};
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;

    #[test]
    fn test_classify_short_results() {
        match classify(LocatorCmd::SetPrimary, &[0x01]) {
            Some(Terminal::Received(ResponseData::Result(r))) => {
                assert_eq!(r.result, LocatorResult::Ok);
                assert_eq!(r.error_code, DEFAULT_ERROR_CODE);
            }
            _ => panic!("expected a successful short result"),
        }

        match classify(LocatorCmd::ExeElCmd, &[0x02, 0x13]) {
            Some(Terminal::Failed(r)) => {
                assert_eq!(r.result, LocatorResult::Error);
                assert_eq!(r.error_code, 0x13);
            }
            _ => panic!("expected a failure"),
        }

        // Unknown result byte: not terminal, retries take over
        assert!(classify(LocatorCmd::ClearLog, &[0x77]).is_none());
        assert!(classify(LocatorCmd::ClearLog, &[]).is_none());
    }

    #[test]
    fn test_classify_read_settings() {
        // Long payload is data even when it starts with a result-like byte
        let data = [0x20, 1, 2, 3, 4, 5, 6, 7];
        match classify(LocatorCmd::ReadSettings, &data) {
            Some(Terminal::Received(ResponseData::Pack(p))) => assert_eq!(p, data),
            _ => panic!("expected a data payload"),
        }

        // Two bytes starting with a known result code is a short result
        match classify(LocatorCmd::ReadSettings, &[0x02, 0x05]) {
            Some(Terminal::Failed(r)) => assert_eq!(r.error_code, 0x05),
            _ => panic!("expected a failure"),
        }
    }

    #[test]
    fn test_classify_opaque_commands_complete() {
        for cmd in [
            LocatorCmd::ReadMemProp,
            LocatorCmd::ReadMemDump,
            LocatorCmd::GetMap,
            LocatorCmd::GetLog,
            LocatorCmd::SetUser,
            LocatorCmd::GetUser,
        ] {
            assert!(
                matches!(
                    classify(cmd, &[1, 2, 3]),
                    Some(Terminal::Received(ResponseData::Pack(_)))
                ),
                "{cmd:?} must complete the wait"
            );
        }
    }

    #[test]
    fn test_progress_formula_plain_queue() {
        let entries = vec![
            CmdEntry::new(LocatorCmd::SetPrimary, vec![]),
            CmdEntry::new(LocatorCmd::SetPrimary, vec![]),
            CmdEntry::new(LocatorCmd::ReadSettings, vec![0x20]),
        ];
        let totals = Totals::of(&entries);
        assert_eq!(progress_value(&totals, 0, 0, 0), 2);
        assert_eq!(progress_value(&totals, 1, 0, 0), 33);
        assert_eq!(progress_value(&totals, 2, 0, 0), 66);
    }

    #[test]
    fn test_progress_formula_with_generator() {
        // Bootloader jump, image stream, main jump: the stream carries
        // (97 - 2) / 1 = 95 points
        let image: Vec<u8> = vec![0u8; FW_HEADER_LEN + 12];
        let entries = vec![
            CmdEntry::new(LocatorCmd::ExeElCmd, vec![6]),
            CmdEntry::with_stream(
                LocatorCmd::ExeElCmd,
                Box::new(Firmware::from_bytes(&image).unwrap()),
            ),
            CmdEntry::new(LocatorCmd::ExeElCmd, vec![5]),
        ];
        let totals = Totals::of(&entries);
        assert_eq!(progress_value(&totals, 0, 0, 0), 2);
        assert_eq!(progress_value(&totals, 1, 0, 0), 2);
        assert_eq!(progress_value(&totals, 1, 0, 50), 48);
        assert_eq!(progress_value(&totals, 1, 1, 0), 96);
        assert_eq!(progress_value(&totals, 2, 1, 0), 97);
    }

    /// Answering side of the loopback tests: counts frames per command and
    /// replies according to a tiny script
    struct FakeDevice {
        socket: UdpSocket,
        serial: SerialNumber,
    }

    impl FakeDevice {
        async fn start() -> (Self, u16) {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let port = socket.local_addr().unwrap().port();
            let fake = Self {
                socket,
                serial: SerialNumber::from_wire(&WIRE_SERIAL),
            };
            (fake, port)
        }

        /// Answer the next poll with our summary so discovery completes
        async fn announce(&self) -> SocketAddr {
            loop {
                let mut buf = [0u8; 1024];
                let (n, src) = self.socket.recv_from(&mut buf).await.unwrap();
                let frame = Frame::deserialize(&buf[..n]).unwrap();
                if frame.cmd == LocatorCmd::Request {
                    let reply =
                        Frame::new(LocatorCmd::Request, self.serial, fake_summary()).serialize();
                    self.socket.send_to(&reply, src).await.unwrap();
                    return src;
                }
            }
        }

        /// Receive the next non-poll frame
        async fn next_cmd(&self) -> (Frame, SocketAddr) {
            loop {
                let mut buf = [0u8; 1024];
                let (n, src) = self.socket.recv_from(&mut buf).await.unwrap();
                let frame = Frame::deserialize(&buf[..n]).unwrap();
                if frame.cmd != LocatorCmd::Request {
                    return (frame, src);
                }
            }
        }

        async fn reply(&self, cmd: LocatorCmd, payload: Vec<u8>, to: SocketAddr) {
            let frame = Frame::new(cmd, self.serial, payload).serialize();
            self.socket.send_to(&frame, to).await.unwrap();
        }
    }

    async fn discovered_device(
        inventory: &Inventory,
        fake: &FakeDevice,
    ) -> (Arc<Device>, SocketAddr) {
        let mut rx =
            crate::locator::tests::watch_events(inventory, Some(&[EventKind::Appended]));
        let host = fake.announce().await;
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        (Arc::clone(event.device()), host)
    }

    fn outcome_channel() -> (QueueCallback, mpsc::UnboundedReceiver<QueueResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(move |result: QueueResult| {
                let _ = tx.send(result);
            }),
            rx,
        )
    }

    async fn expect_outcome(rx: &mut mpsc::UnboundedReceiver<QueueResult>) -> QueueResult {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for the queue outcome")
            .expect("queue callback dropped")
    }

    #[tokio::test]
    async fn test_set_primary_round_trip() {
        let (fake, fake_port) = FakeDevice::start().await;
        let inventory = Inventory::new();
        let locator = Locator::start(test_config(fake_port), inventory.clone())
            .await
            .unwrap();
        let (dev, _) = discovered_device(&inventory, &fake).await;

        let (entry_tx, mut entry_rx) = mpsc::unbounded_channel();
        let mut settings = dev.primary_settings();
        settings.name = "New".to_string();
        dev.queue().append(
            CmdEntry::new(LocatorCmd::SetPrimary, settings.to_bytes()).with_callback(Arc::new(
                move |outcome: &EntryOutcome| {
                    let _ = entry_tx.send(outcome.clone());
                },
            )),
        );

        let (queue_cbs, mut queue_rx) = outcome_channel();
        dev.queue().set_callback(queue_cbs);
        dev.queue().run().unwrap();

        let (frame, host) = fake.next_cmd().await;
        assert_eq!(frame.cmd, LocatorCmd::SetPrimary);
        assert_eq!(&frame.payload[..3], b"New");
        fake.reply(LocatorCmd::SetPrimary, vec![0x01], host).await;

        assert_eq!(
            entry_rx.recv().await.unwrap(),
            EntryOutcome::Ok(ResponseData::Result(CmdResult {
                result: LocatorResult::Ok,
                error_code: DEFAULT_ERROR_CODE,
            }))
        );
        assert_eq!(expect_outcome(&mut queue_rx).await, QueueResult::Ok);
        assert_eq!(dev.queue().progress(), 100);
        assert_eq!(dev.queue().progress(), 0);

        locator.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_settings_returns_data() {
        let (fake, fake_port) = FakeDevice::start().await;
        let inventory = Inventory::new();
        let locator = Locator::start(test_config(fake_port), inventory.clone())
            .await
            .unwrap();
        let (dev, _) = discovered_device(&inventory, &fake).await;

        let (entry_tx, mut entry_rx) = mpsc::unbounded_channel();
        dev.queue().append(
            CmdEntry::new(LocatorCmd::ReadSettings, vec![0x20]).with_callback(Arc::new(
                move |outcome: &EntryOutcome| {
                    let _ = entry_tx.send(outcome.clone());
                },
            )),
        );
        let (queue_cbs, mut queue_rx) = outcome_channel();
        dev.queue().set_callback(queue_cbs);
        dev.queue().run().unwrap();

        let (frame, host) = fake.next_cmd().await;
        assert_eq!(frame.cmd, LocatorCmd::ReadSettings);
        let clock = vec![0x20, 30, 45, 13, 28, 2, 26, 1];
        fake.reply(LocatorCmd::ReadSettings, clock.clone(), host)
            .await;

        assert_eq!(
            entry_rx.recv().await.unwrap(),
            EntryOutcome::Ok(ResponseData::Pack(clock))
        );
        assert_eq!(expect_outcome(&mut queue_rx).await, QueueResult::Ok);

        locator.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_device_gets_three_sends_then_timeout() {
        let (fake, fake_port) = FakeDevice::start().await;
        let inventory = Inventory::new();
        let locator = Locator::start(test_config(fake_port), inventory.clone())
            .await
            .unwrap();
        let (dev, _) = discovered_device(&inventory, &fake).await;

        dev.queue().append(
            CmdEntry::new(LocatorCmd::ExeElCmd, vec![0x02])
                .with_timeout(Duration::from_millis(100)),
        );
        let (queue_cbs, mut queue_rx) = outcome_channel();
        dev.queue().set_callback(queue_cbs);
        dev.queue().run().unwrap();

        // Exactly three identical datagrams, then the queue gives up
        for _ in 0..3 {
            let (frame, _) = fake.next_cmd().await;
            assert_eq!(frame.cmd, LocatorCmd::ExeElCmd);
            assert_eq!(frame.payload, vec![0x02]);
        }
        assert_eq!(expect_outcome(&mut queue_rx).await, QueueResult::Timeout);

        // No fourth send arrives
        let extra = tokio::time::timeout(Duration::from_millis(400), fake.next_cmd()).await;
        assert!(extra.is_err());
        assert_eq!(dev.queue().progress(), 0);

        locator.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_aborts_remaining_entries() {
        let (fake, fake_port) = FakeDevice::start().await;
        let inventory = Inventory::new();
        let locator = Locator::start(test_config(fake_port), inventory.clone())
            .await
            .unwrap();
        let (dev, _) = discovered_device(&inventory, &fake).await;

        // A succeeds, B stays unanswered, C must never be sent
        dev.queue()
            .append(CmdEntry::new(LocatorCmd::ClearLog, vec![]));
        dev.queue().append(
            CmdEntry::new(LocatorCmd::ExeElCmd, vec![0x02])
                .with_timeout(Duration::from_millis(100)),
        );
        dev.queue()
            .append(CmdEntry::new(LocatorCmd::GetLog, vec![]));

        let (queue_cbs, mut queue_rx) = outcome_channel();
        dev.queue().set_callback(queue_cbs);
        dev.queue().run().unwrap();

        let (frame, host) = fake.next_cmd().await;
        assert_eq!(frame.cmd, LocatorCmd::ClearLog);
        fake.reply(LocatorCmd::ClearLog, vec![0x01], host).await;

        for _ in 0..3 {
            let (frame, _) = fake.next_cmd().await;
            assert_eq!(frame.cmd, LocatorCmd::ExeElCmd);
        }
        assert_eq!(expect_outcome(&mut queue_rx).await, QueueResult::Timeout);

        let extra = tokio::time::timeout(Duration::from_millis(400), fake.next_cmd()).await;
        assert!(extra.is_err(), "entry after a timeout must not be sent");

        locator.shutdown().await;
    }

    #[tokio::test]
    async fn test_device_error_fails_queue() {
        let (fake, fake_port) = FakeDevice::start().await;
        let inventory = Inventory::new();
        let locator = Locator::start(test_config(fake_port), inventory.clone())
            .await
            .unwrap();
        let (dev, _) = discovered_device(&inventory, &fake).await;

        let (entry_tx, mut entry_rx) = mpsc::unbounded_channel();
        dev.queue().append(
            CmdEntry::new(LocatorCmd::SetPrimary, vec![]).with_callback(Arc::new(
                move |outcome: &EntryOutcome| {
                    let _ = entry_tx.send(outcome.clone());
                },
            )),
        );
        let (queue_cbs, mut queue_rx) = outcome_channel();
        dev.queue().set_callback(queue_cbs);
        dev.queue().run().unwrap();

        let (_, host) = fake.next_cmd().await;
        fake.reply(LocatorCmd::SetPrimary, vec![0x03, 0x21], host)
            .await;

        assert_eq!(
            entry_rx.recv().await.unwrap(),
            EntryOutcome::Fail(CmdResult {
                result: LocatorResult::OutOfMem,
                error_code: 0x21,
            })
        );
        assert_eq!(expect_outcome(&mut queue_rx).await, QueueResult::Fail);

        locator.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_rejects_append_mid_run() {
        let (fake, fake_port) = FakeDevice::start().await;
        let inventory = Inventory::new();
        let locator = Locator::start(test_config(fake_port), inventory.clone())
            .await
            .unwrap();
        let (dev, _) = discovered_device(&inventory, &fake).await;

        dev.queue().append(
            CmdEntry::new(LocatorCmd::ExeElCmd, vec![0x02])
                .with_timeout(Duration::from_millis(200)),
        );
        let (queue_cbs, mut queue_rx) = outcome_channel();
        dev.queue().set_callback(queue_cbs);
        dev.queue().run().unwrap();
        assert!(matches!(dev.queue().run(), Err(QueueError::AlreadyRunning)));

        // Swallow the first send, then try to append mid-run
        let _ = fake.next_cmd().await;
        dev.queue()
            .append(CmdEntry::new(LocatorCmd::GetLog, vec![]));

        assert_eq!(expect_outcome(&mut queue_rx).await, QueueResult::Timeout);
        // The rejected entry is gone: a fresh run completes empty
        assert!(dev.queue().run().is_ok());
        assert_eq!(expect_outcome(&mut queue_rx).await, QueueResult::Ok);

        locator.shutdown().await;
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_through_firmware_stream() {
        let (fake, fake_port) = FakeDevice::start().await;
        let inventory = Inventory::new();
        let locator = Locator::start(test_config(fake_port), inventory.clone())
            .await
            .unwrap();
        let (dev, _) = discovered_device(&inventory, &fake).await;

        // 40-byte image: FwInfo plus two blocks
        let mut image = vec![0u8; FW_HEADER_LEN];
        image[12..14].copy_from_slice(&10u16.to_le_bytes());
        image.extend((0u8..40).collect::<Vec<_>>());
        let firmware = Firmware::from_bytes(&image).unwrap();

        dev.queue()
            .append(CmdEntry::new(LocatorCmd::ExeElCmd, vec![0x06]));
        dev.queue()
            .append(CmdEntry::with_stream(LocatorCmd::ExeElCmd, Box::new(firmware)));
        dev.queue()
            .append(CmdEntry::new(LocatorCmd::ExeElCmd, vec![0x05]));

        let (queue_cbs, mut queue_rx) = outcome_channel();
        dev.queue().set_callback(queue_cbs);
        dev.queue().run().unwrap();

        let mut observations = Vec::new();
        let mut streamed: Vec<Vec<u8>> = Vec::new();
        // RunBtldr, FwInfo, two FwPacks, RunMain
        for i in 0..5 {
            let (frame, host) = fake.next_cmd().await;
            assert_eq!(frame.cmd, LocatorCmd::ExeElCmd);
            streamed.push(frame.payload.clone());
            fake.reply(LocatorCmd::ExeElCmd, vec![0x01], host).await;
            // Skip the observation racing the final reply: it could consume
            // the latched 100 checked below
            if i < 4 {
                observations.push(dev.queue().progress());
            }
        }
        assert_eq!(expect_outcome(&mut queue_rx).await, QueueResult::Ok);

        assert_eq!(streamed[0], vec![0x06]);
        assert_eq!(streamed[1][0], 0x03);
        assert_eq!(streamed[1].len(), 1 + FW_HEADER_LEN);
        assert_eq!(streamed[2][0], 0x04);
        assert_eq!(&streamed[2][1..3], &0u16.to_le_bytes());
        assert_eq!(streamed[3][0], 0x04);
        assert_eq!(&streamed[3][1..3], &8u16.to_le_bytes());
        assert_eq!(streamed[4], vec![0x05]);

        // Monotonic run ending in a single 100 that latches back to 0
        for pair in observations.windows(2) {
            assert!(pair[1] >= pair[0], "progress regressed: {observations:?}");
        }
        assert_eq!(dev.queue().progress(), 100);
        assert_eq!(dev.queue().progress(), 0);

        locator.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_interrupts_run() {
        let (fake, fake_port) = FakeDevice::start().await;
        let inventory = Inventory::new();
        let locator = Locator::start(test_config(fake_port), inventory.clone())
            .await
            .unwrap();
        let (dev, _) = discovered_device(&inventory, &fake).await;

        dev.queue().append(
            CmdEntry::new(LocatorCmd::ExeElCmd, vec![0x02]).with_timeout(Duration::from_secs(30)),
        );
        let (queue_cbs, mut queue_rx) = outcome_channel();
        dev.queue().set_callback(queue_cbs);
        dev.queue().run().unwrap();

        let _ = fake.next_cmd().await;
        dev.queue().stop().await;

        assert_eq!(dev.queue().progress(), 0);
        assert!(queue_rx.try_recv().is_err(), "stop is not a queue outcome");

        locator.shutdown().await;
    }
}
