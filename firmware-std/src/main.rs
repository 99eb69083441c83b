//! Transitwatch ESP-IDF std firmware
//!
//! Thread-based receiver using FreeRTOS threads and std::sync::mpsc.
//! NimBLE scan callbacks push advertisement events into a channel; one
//! reconcile thread drains it and owns all notification-store mutation,
//! which keeps the merge policy serialized without per-entry locking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use esp_idf_svc::hal::task::block_on;
use esp32_nimble::{BLEAddress, BLEDevice, BLEScan};

use transitwatch::protocol::MANUFACTURER_ID;
use transitwatch::report::{self, DeviceMessage, IdString, MsgBuffer};
use transitwatch::router::{self, AdvEvent, RouteOutcome, ScanSource};
use transitwatch::session::{ScanBackend, ScanMode, SessionManager, SessionStatus, StartError};
use transitwatch::store::NotificationStore;

/// Duration of one NimBLE scan round (ms). Stop requests take effect at
/// the latest when the current round ends, usually sooner via the
/// in-callback stop check.
const SCAN_ROUND_MS: i32 = 3000;

/// Selection window for the targeted watch (ms). No vendor-tagged peer
/// within the window counts as a cancelled selection, not an error.
const SELECT_WINDOW_MS: i32 = 5000;

/// Status report interval.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

// ── Shared state ─────────────────────────────────────────────────────

/// The notification store. Mutated only by the reconcile thread; the
/// status thread takes read-only snapshots of the counts.
static STORE: Mutex<NotificationStore> = Mutex::new(NotificationStore::new());

/// Snapshot of (status, mode) for the status thread, refreshed after
/// every session-manager call on the main thread.
static SESSION_SNAPSHOT: Mutex<(SessionStatus, ScanMode)> =
    Mutex::new((SessionStatus::Idle, ScanMode::None));

/// Boot time, captured once in main. Used for uptime stamping.
static BOOT_INSTANT: Mutex<Option<Instant>> = Mutex::new(None);

fn uptime_secs() -> u32 {
    BOOT_INSTANT
        .lock()
        .ok()
        .and_then(|i| i.map(|boot| boot.elapsed().as_secs() as u32))
        .unwrap_or(0)
}

fn uptime_millis() -> u64 {
    BOOT_INSTANT
        .lock()
        .ok()
        .and_then(|i| i.map(|boot| boot.elapsed().as_millis() as u64))
        .unwrap_or(0)
}

// ── NimBLE scan backend ──────────────────────────────────────────────

/// A live scan session: worker thread plus its stop flag. Setting the
/// flag makes the scan callback end the round immediately; join waits
/// for the radio to be released.
struct ScanWorker {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl ScanWorker {
    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.thread.join();
    }
}

/// [`ScanBackend`] over esp32-nimble. Both session flavors run scan
/// rounds on a worker thread and push events into the shared channel;
/// the targeted watch additionally filters on the selected peer address.
struct NimbleBackend {
    adv_tx: SyncSender<AdvEvent>,
}

impl NimbleBackend {
    fn new(adv_tx: SyncSender<AdvEvent>) -> Self {
        Self { adv_tx }
    }

    fn spawn_worker(
        &self,
        name: &str,
        source: ScanSource,
        peer: Option<BLEAddress>,
    ) -> Result<ScanWorker, StartError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let adv_tx = self.adv_tx.clone();

        let thread = thread::Builder::new()
            .name(name.into())
            .stack_size(4096)
            .spawn(move || {
                scan_worker(source, peer, stop_flag, adv_tx);
            })
            .map_err(|e| {
                log::error!("scan thread spawn failed: {e}");
                StartError::Failed
            })?;

        Ok(ScanWorker { stop, thread })
    }
}

impl ScanBackend for NimbleBackend {
    type ScanHandle = ScanWorker;
    type WatchHandle = ScanWorker;
    type Peer = BLEAddress;

    fn start_broad_scan(&mut self) -> Result<ScanWorker, StartError> {
        self.spawn_worker("blescan", ScanSource::BroadScan, None)
    }

    fn stop_broad_scan(&mut self, handle: ScanWorker) {
        handle.stop();
    }

    /// One bounded scan round that tracks the strongest peer carrying the
    /// vendor manufacturer identifier.
    fn select_peer(&mut self) -> Result<Option<BLEAddress>, StartError> {
        let best: Mutex<Option<(BLEAddress, i32)>> = Mutex::new(None);

        let ble_device = BLEDevice::take();
        let mut scan = BLEScan::new();
        scan.active_scan(true).interval(100).window(99);

        let result = block_on(scan.start(ble_device, SELECT_WINDOW_MS, |device, data| {
            if let Some(mfg) = data.manufacture_data() {
                if mfg.company_identifier == MANUFACTURER_ID {
                    let rssi = device.rssi();
                    let mut guard = best.lock().unwrap();
                    if guard.map_or(true, |(_, prev)| rssi > prev) {
                        *guard = Some((device.addr(), rssi));
                    }
                }
            }
            None::<()> // keep scanning until the window elapses
        }));

        if let Err(e) = result {
            log::error!("selection scan failed: {e:?}");
            return Err(StartError::AdapterUnavailable);
        }

        Ok(best.into_inner().unwrap().map(|(addr, _)| addr))
    }

    fn start_watch(&mut self, peer: BLEAddress) -> Result<ScanWorker, StartError> {
        self.spawn_worker("blewatch", ScanSource::TargetedWatch, Some(peer))
    }

    fn stop_watch(&mut self, handle: ScanWorker) {
        handle.stop();
    }
}

/// Scan-round loop shared by both session flavors.
fn scan_worker(
    source: ScanSource,
    peer: Option<BLEAddress>,
    stop: Arc<AtomicBool>,
    adv_tx: SyncSender<AdvEvent>,
) {
    log::info!("scan worker started ({})", source.as_str());

    let ble_device = BLEDevice::take();
    let mut scan = BLEScan::new();
    scan.active_scan(true).interval(100).window(99);

    while !stop.load(Ordering::Relaxed) {
        let _ = block_on(scan.start(ble_device, SCAN_ROUND_MS, |device, data| {
            if stop.load(Ordering::Relaxed) {
                return Some(()); // end the round promptly
            }
            if let Some(watched) = peer {
                if device.addr() != watched {
                    return None::<()>;
                }
            }
            if let Some(mfg) = data.manufacture_data() {
                let event = AdvEvent::from_manufacturer_data(
                    source,
                    mfg.company_identifier,
                    mfg.payload,
                    Some(device.rssi() as i8),
                    uptime_millis(),
                );
                // Drop on the floor if the reconcile thread is behind
                let _ = adv_tx.try_send(event);
            }
            None::<()>
        }));
    }

    log::info!("scan worker stopped ({})", source.as_str());
}

// ── Reconcile thread ─────────────────────────────────────────────────

/// Single consumer of the advertisement channel and single writer of the
/// store. Every event becomes an NDJSON line: a notification message when
/// the record reached the store, a scan diagnostic otherwise.
fn reconcile_thread(adv_rx: Receiver<AdvEvent>, output_tx: SyncSender<MsgBuffer>) {
    log::info!("Reconcile thread started");

    while let Ok(event) = adv_rx.recv() {
        let outcome = {
            let mut store = STORE.lock().unwrap();
            router::route(&event, &mut store)
        };

        let msg = match outcome {
            RouteOutcome::Reconciled {
                notification_id, ..
            } => notification_message(&notification_id),
            _ => report::scan_message(&event, outcome),
        };
        if let Some(buf) = msg {
            let _ = output_tx.try_send(buf);
        }
    }
}

/// Serialize the stored entry for a just-reconciled identifier.
fn notification_message(notification_id: &[u8; 4]) -> Option<MsgBuffer> {
    let store = STORE.lock().unwrap();
    let record = store.get(notification_id)?;

    let mut id = IdString::new();
    report::format_id(&record.notification_id, &mut id);
    let mut station = IdString::new();
    report::format_id(&record.source_id, &mut station);

    report::to_msg_buffer(&DeviceMessage::notification(record, &id, &station))
}

// ── Output and status threads ────────────────────────────────────────

/// Serial output thread: writes NDJSON lines to the log.
fn output_thread(output_rx: Receiver<MsgBuffer>) {
    log::info!("Output thread started");

    while let Ok(msg) = output_rx.recv() {
        if let Ok(s) = std::str::from_utf8(&msg) {
            log::info!("{}", s.trim_end());
        }
    }
}

/// Periodic status reporting thread.
fn status_thread(output_tx: SyncSender<MsgBuffer>) {
    loop {
        thread::sleep(STATUS_INTERVAL);

        let (status, mode) = *SESSION_SNAPSHOT.lock().unwrap();
        let buf = {
            let store = STORE.lock().unwrap();
            report::to_msg_buffer(&DeviceMessage::status(status, mode, &store, uptime_secs()))
        };
        if let Some(buf) = buf {
            let _ = output_tx.try_send(buf);
        }
    }
}

fn snapshot_session(manager: &SessionManager<NimbleBackend>) {
    *SESSION_SNAPSHOT.lock().unwrap() = (manager.status(), manager.mode());
}

// ── Entry point ──────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    // Bind the ESP-IDF logger to the `log` facade
    esp_idf_svc::log::EspLogger::initialize_default();

    *BOOT_INSTANT.lock().unwrap() = Some(Instant::now());

    log::info!("Transitwatch v{} starting (std)", report::VERSION);

    // ── Channels ─────────────────────────────────────────────────────

    let (adv_tx, adv_rx) = mpsc::sync_channel::<AdvEvent>(16);
    let (output_tx, output_rx) = mpsc::sync_channel::<MsgBuffer>(8);

    // ── Worker threads ───────────────────────────────────────────────

    let reconcile_output_tx = output_tx.clone();
    thread::Builder::new()
        .name("reconcile".into())
        .stack_size(8192)
        .spawn(move || {
            reconcile_thread(adv_rx, reconcile_output_tx);
        })?;
    log::info!("Reconcile thread spawned");

    thread::Builder::new()
        .name("output".into())
        .stack_size(4096)
        .spawn(move || {
            output_thread(output_rx);
        })?;
    log::info!("Output thread spawned");

    let status_output_tx = output_tx.clone();
    thread::Builder::new()
        .name("status".into())
        .stack_size(4096)
        .spawn(move || {
            status_thread(status_output_tx);
        })?;
    log::info!("Status thread spawned");

    // ── Sessions ─────────────────────────────────────────────────────

    let mut manager = SessionManager::new(NimbleBackend::new(adv_tx));

    if let Err(e) = manager.start_broad_scan() {
        log::error!("broad scan unavailable: {}", e.as_str());
    }
    snapshot_session(&manager);

    // The broad scan runs until power-off; the manager keeps the session
    // handle so a future control surface can stop_all() for teardown.
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
