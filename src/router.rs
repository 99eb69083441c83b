//! Advertisement routing: from raw BLE advertisement events to the store.
//!
//! Both listening sessions (broad scan and targeted watch) push their
//! events onto one ordered channel; a single consumer loop calls [`route`]
//! for each. That single-writer shape is what serializes reconciliation;
//! there is no lock around the store.
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use heapless::Vec;

use crate::protocol::{NotificationRecord, MANUFACTURER_ID};
use crate::store::{NotificationStore, ReconcileOutcome};

/// Largest vendor payload a legacy advertisement can carry after the
/// 2-byte company identifier (31-byte AD budget).
pub const MAX_VENDOR_PAYLOAD: usize = 27;

/// Which listening session observed an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSource {
    BroadScan,
    TargetedWatch,
}

impl ScanSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BroadScan => "broad_scan",
            Self::TargetedWatch => "targeted_watch",
        }
    }
}

/// One advertisement event as delivered by a session to the router.
#[derive(Debug, Clone)]
pub struct AdvEvent {
    pub source: ScanSource,
    /// Company identifier from the manufacturer-data AD structure.
    pub company_id: u16,
    /// Manufacturer payload bytes after the company identifier.
    pub payload: Vec<u8, MAX_VENDOR_PAYLOAD>,
    pub rssi: Option<i8>,
    /// Host milliseconds at capture time.
    pub ts_ms: u64,
}

impl AdvEvent {
    /// Build an event from a pre-split manufacturer-data slot, the shape
    /// NimBLE-style stacks deliver. Oversized payloads are truncated to the
    /// legacy advertisement budget; the record only needs its first 25 bytes.
    pub fn from_manufacturer_data(
        source: ScanSource,
        company_id: u16,
        payload: &[u8],
        rssi: Option<i8>,
        ts_ms: u64,
    ) -> Self {
        let mut bounded = Vec::new();
        let take = payload.len().min(MAX_VENDOR_PAYLOAD);
        let _ = bounded.extend_from_slice(&payload[..take]);
        Self {
            source,
            company_id,
            payload: bounded,
            rssi,
            ts_ms,
        }
    }

    /// Build an event from raw advertisement data (AD structures), for
    /// hosts that deliver whole advertisements. Returns `None` when the
    /// advertisement carries no manufacturer-specific data at all.
    pub fn from_ad_structures(
        source: ScanSource,
        ad_data: &[u8],
        rssi: Option<i8>,
        ts_ms: u64,
    ) -> Option<Self> {
        let (company_id, payload) = extract_manufacturer_data(ad_data)?;
        Some(Self::from_manufacturer_data(
            source, company_id, payload, rssi, ts_ms,
        ))
    }
}

/// Walk AD structures ([length] [type] [data...]) and return the first
/// manufacturer-specific data slot (type 0xFF) as (company id, payload).
///
/// The company identifier is the first 2 bytes of the slot, little-endian.
pub fn extract_manufacturer_data(ad_data: &[u8]) -> Option<(u16, &[u8])> {
    let mut pos = 0;
    while pos < ad_data.len() {
        let len = ad_data[pos] as usize;
        if len == 0 || pos + 1 + len > ad_data.len() {
            break;
        }

        let ad_type = ad_data[pos + 1];
        let data = &ad_data[pos + 2..pos + 1 + len];

        if ad_type == 0xFF && data.len() >= 2 {
            let company_id = u16::from_le_bytes([data[0], data[1]]);
            return Some((company_id, &data[2..]));
        }

        pos += 1 + len;
    }
    None
}

/// Async channel carrying advertisement events from both sessions to the
/// single reconciliation loop.
pub type AdvChannel = Channel<CriticalSectionRawMutex, AdvEvent, 16>;
pub type AdvSender<'a> = Sender<'a, CriticalSectionRawMutex, AdvEvent, 16>;
pub type AdvReceiver<'a> = Receiver<'a, CriticalSectionRawMutex, AdvEvent, 16>;

/// What [`route`] did with an advertisement event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Foreign company identifier: seen but not ours, dropped.
    NotOurs,
    /// Our identifier but the payload failed to decode.
    Undecodable,
    /// Decoded and handed to the store.
    Reconciled {
        outcome: ReconcileOutcome,
        notification_id: [u8; 4],
    },
}

impl RouteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotOurs => "not_ours",
            Self::Undecodable => "undecodable",
            Self::Reconciled { outcome, .. } => match outcome {
                ReconcileOutcome::Inserted { evicted: false } => "inserted",
                ReconcileOutcome::Inserted { evicted: true } => "inserted_evicted",
                ReconcileOutcome::Upgraded => "upgraded",
                ReconcileOutcome::KeptVerified => "kept_verified",
                ReconcileOutcome::KeptUnverified => "kept_unverified",
            },
        }
    }
}

/// The one handler every advertisement event flows through: vendor filter,
/// decode + verify, reconcile. Must only be called from the single
/// consumer of the advertisement channel.
pub fn route(event: &AdvEvent, store: &mut NotificationStore) -> RouteOutcome {
    if event.company_id != MANUFACTURER_ID {
        log::debug!(
            "advertisement from foreign manufacturer {:04X}, dropped",
            event.company_id
        );
        return RouteOutcome::NotOurs;
    }

    let record = match NotificationRecord::decode(&event.payload, event.rssi, event.ts_ms) {
        Some(rec) => rec,
        None => {
            log::debug!(
                "undecodable vendor payload ({} bytes) via {}",
                event.payload.len(),
                event.source.as_str()
            );
            return RouteOutcome::Undecodable;
        }
    };

    let notification_id = record.notification_id;
    let verified = record.client_verified;
    let outcome = store.reconcile(record);

    log::info!(
        "notification {:02X}{:02X}{:02X}{:02X} via {} (verified: {}) -> {:?}",
        notification_id[0],
        notification_id[1],
        notification_id[2],
        notification_id[3],
        event.source.as_str(),
        verified,
        outcome
    );

    RouteOutcome::Reconciled {
        outcome,
        notification_id,
    }
}

/// Diagnostic record of one routed advertisement event, for the external
/// logging collaborator. Pass-through only; nothing in the core reads it.
#[derive(Debug, Clone)]
pub struct ScanLogEntry {
    pub ts: u64,
    pub source: &'static str,
    /// Company identifier seen in the advertisement.
    pub mfr: u16,
    pub rssi: Option<i8>,
    pub outcome: &'static str,
    /// Notification id when the payload decoded.
    pub id: Option<[u8; 4]>,
}

impl ScanLogEntry {
    pub fn new(event: &AdvEvent, outcome: RouteOutcome) -> Self {
        let id = match outcome {
            RouteOutcome::Reconciled {
                notification_id, ..
            } => Some(notification_id),
            _ => None,
        };
        Self {
            ts: event.ts_ms,
            source: event.source.as_str(),
            mfr: event.company_id,
            rssi: event.rssi,
            outcome: outcome.as_str(),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        RecordFields, TransportStatus, TransportType, CLIENT_TAG_LEN, INFRA_TAG_LEN,
    };

    fn wire(id: u32, signed: bool) -> [u8; crate::protocol::RECORD_SIZE] {
        let fields = RecordFields {
            source_id: [1, 2, 3, 4],
            notification_id: id.to_be_bytes(),
            event_id: 0,
            destination_id: 1,
            transport_type: TransportType::Bus,
            transport_status: TransportStatus::Passing,
            duration_secs: 15,
        };
        let infra = [0xEE; INFRA_TAG_LEN];
        if signed {
            fields.encode_client_signed(&infra)
        } else {
            fields.encode(&infra, &[0; CLIENT_TAG_LEN])
        }
    }

    fn event(company_id: u16, payload: &[u8], source: ScanSource) -> AdvEvent {
        AdvEvent::from_manufacturer_data(source, company_id, payload, Some(-55), 100)
    }

    // ── AD structure parsing ────────────────────────────────────────

    #[test]
    fn extracts_manufacturer_slot_after_other_structures() {
        // Flags, complete local name, then manufacturer data
        let mut ad: std::vec::Vec<u8> = vec![
            0x02, 0x01, 0x06, // flags
            0x05, 0x09, b'S', b't', b'o', b'p', // local name
        ];
        ad.push(3 + 2); // len: type byte + company id + 2 payload bytes
        ad.push(0xFF);
        ad.extend_from_slice(&MANUFACTURER_ID.to_le_bytes());
        ad.extend_from_slice(&[0xAB, 0xCD]);

        let (company, payload) = extract_manufacturer_data(&ad).unwrap();
        assert_eq!(company, MANUFACTURER_ID);
        assert_eq!(payload, &[0xAB, 0xCD]);
    }

    #[test]
    fn no_manufacturer_slot_yields_none() {
        let ad = [0x02, 0x01, 0x06, 0x03, 0x03, 0x0F, 0x18];
        assert!(extract_manufacturer_data(&ad).is_none());
        assert!(AdvEvent::from_ad_structures(ScanSource::BroadScan, &ad, None, 0).is_none());
    }

    #[test]
    fn truncated_ad_structure_stops_the_walk() {
        // Claims 10 bytes but only 2 follow
        let ad = [0x0A, 0xFF, 0xFF];
        assert!(extract_manufacturer_data(&ad).is_none());
    }

    #[test]
    fn oversized_payload_is_truncated_to_budget() {
        let big = [0x55u8; 40];
        let ev = event(MANUFACTURER_ID, &big, ScanSource::BroadScan);
        assert_eq!(ev.payload.len(), MAX_VENDOR_PAYLOAD);
    }

    // ── Routing ─────────────────────────────────────────────────────

    #[test]
    fn foreign_manufacturer_is_dropped_before_decode() {
        let mut store = NotificationStore::new();
        let ev = event(0x004C, &wire(1, true), ScanSource::BroadScan);
        assert_eq!(route(&ev, &mut store), RouteOutcome::NotOurs);
        assert!(store.is_empty());
    }

    #[test]
    fn undecodable_payload_is_reported() {
        let mut store = NotificationStore::new();
        let ev = event(MANUFACTURER_ID, &[0x01, 0x02], ScanSource::TargetedWatch);
        assert_eq!(route(&ev, &mut store), RouteOutcome::Undecodable);
        assert!(store.is_empty());
    }

    #[test]
    fn valid_record_reaches_the_store() {
        let mut store = NotificationStore::new();
        let ev = event(MANUFACTURER_ID, &wire(42, true), ScanSource::BroadScan);
        let outcome = route(&ev, &mut store);
        assert_eq!(
            outcome,
            RouteOutcome::Reconciled {
                outcome: ReconcileOutcome::Inserted { evicted: false },
                notification_id: 42u32.to_be_bytes(),
            }
        );
        let stored = store.get(&42u32.to_be_bytes()).unwrap();
        assert!(stored.client_verified);
        assert_eq!(stored.rssi, Some(-55));
        assert_eq!(stored.received_at_ms, 100);
    }

    #[test]
    fn interleaved_sessions_share_one_store() {
        let mut store = NotificationStore::new();
        // Unsigned copy first via the broad scan, signed copy later via the
        // targeted watch: the entry upgrades in place.
        route(
            &event(MANUFACTURER_ID, &wire(7, false), ScanSource::BroadScan),
            &mut store,
        );
        let outcome = route(
            &event(MANUFACTURER_ID, &wire(7, true), ScanSource::TargetedWatch),
            &mut store,
        );
        assert_eq!(
            outcome,
            RouteOutcome::Reconciled {
                outcome: ReconcileOutcome::Upgraded,
                notification_id: 7u32.to_be_bytes(),
            }
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.verified_count(), 1);
    }

    // ── Event channel ───────────────────────────────────────────────

    #[test]
    fn channel_preserves_event_order_across_sessions() {
        let channel = AdvChannel::new();
        channel
            .try_send(event(MANUFACTURER_ID, &wire(1, false), ScanSource::BroadScan))
            .unwrap();
        channel
            .try_send(event(MANUFACTURER_ID, &wire(1, true), ScanSource::TargetedWatch))
            .unwrap();

        // Drain in order through the single consumer, as the reconcile
        // loop would.
        let mut store = NotificationStore::new();
        while let Ok(ev) = channel.try_receive() {
            route(&ev, &mut store);
        }
        let entry = store.get(&1u32.to_be_bytes()).unwrap();
        assert!(entry.client_verified, "verified copy should have upgraded");
    }

    // ── Scan log ────────────────────────────────────────────────────

    #[test]
    fn scan_log_entry_captures_outcome() {
        let ev = event(0x1234, &[0u8; 4], ScanSource::BroadScan);
        let entry = ScanLogEntry::new(&ev, RouteOutcome::NotOurs);
        assert_eq!(entry.outcome, "not_ours");
        assert_eq!(entry.mfr, 0x1234);
        assert_eq!(entry.source, "broad_scan");
        assert!(entry.id.is_none());
    }
}
