//! NDJSON reporting for the companion/serial collaborator.
//!
//! The display layer is an external collaborator; this module is its feed.
//! All messages are newline-delimited JSON built with `heapless` buffers
//! so the path stays allocation-free.
use core::fmt::Write;

use heapless::{String, Vec};
use serde::Serialize;

use crate::protocol::NotificationRecord;
use crate::router::{RouteOutcome, ScanLogEntry};
use crate::session::{ScanMode, SessionStatus};
use crate::store::NotificationStore;

/// Length of a hex-encoded 4-byte identifier ("11223344").
pub type IdString = String<8>;

/// Maximum size of a serialized JSON message.
pub const MAX_MSG_LEN: usize = 256;

/// Buffer type for serialized JSON messages.
pub type MsgBuffer = Vec<u8, MAX_MSG_LEN>;

/// Receiver version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Format a 4-byte identifier as uppercase hex.
pub fn format_id(id: &[u8; 4], buf: &mut IdString) {
    let _ = write!(buf, "{:02X}{:02X}{:02X}{:02X}", id[0], id[1], id[2], id[3]);
}

/// Messages sent to the companion app.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum DeviceMessage<'a> {
    /// A notification that reached the store (any reconcile outcome).
    #[serde(rename = "notification")]
    Notification {
        id: &'a IdString,
        /// Originating station.
        station: &'a IdString,
        event: u8,
        dest: u8,
        transport: &'static str,
        status: &'static str,
        /// Relay duration in seconds.
        duration: u16,
        verified: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        rssi: Option<i8>,
        /// Host milliseconds when captured.
        ts: u64,
    },
    /// Diagnostic pass-through of a routed advertisement event.
    #[serde(rename = "scan")]
    Scan {
        source: &'static str,
        /// Company identifier seen in the advertisement.
        mfr: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        rssi: Option<i8>,
        outcome: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a IdString>,
        ts: u64,
    },
    /// Periodic receiver status.
    #[serde(rename = "status")]
    Status {
        status: &'static str,
        mode: &'static str,
        verified: u32,
        unverified: u32,
        /// Uptime in seconds.
        uptime: u32,
        version: &'static str,
    },
}

impl<'a> DeviceMessage<'a> {
    /// Build the notification message for a decoded record. The id strings
    /// are borrowed so the caller controls their storage.
    pub fn notification(
        record: &NotificationRecord,
        id: &'a IdString,
        station: &'a IdString,
    ) -> Self {
        Self::Notification {
            id,
            station,
            event: record.event_id,
            dest: record.destination_id,
            transport: record.transport_type.as_str(),
            status: record.transport_status.as_str(),
            duration: record.duration_secs,
            verified: record.client_verified,
            rssi: record.rssi,
            ts: record.received_at_ms,
        }
    }

    pub fn status(
        status: SessionStatus,
        mode: ScanMode,
        store: &NotificationStore,
        uptime_secs: u32,
    ) -> Self {
        Self::Status {
            status: status.as_str(),
            mode: mode.as_str(),
            verified: store.verified_count() as u32,
            unverified: store.unverified_count() as u32,
            uptime: uptime_secs,
            version: VERSION,
        }
    }
}

/// Serialize a message to JSON and append the NDJSON newline.
/// Returns the number of bytes written, or `None` if it did not fit.
pub fn serialize_message<T: Serialize>(msg: &T, buf: &mut [u8]) -> Option<usize> {
    match serde_json_core::to_slice(msg, buf) {
        Ok(len) => {
            if len < buf.len() {
                buf[len] = b'\n';
                Some(len + 1)
            } else {
                Some(len)
            }
        }
        Err(_) => None,
    }
}

/// Convenience: serialize into a fresh bounded buffer.
pub fn to_msg_buffer<T: Serialize>(msg: &T) -> Option<MsgBuffer> {
    let mut buf = MsgBuffer::new();
    buf.resize_default(MAX_MSG_LEN).ok()?;
    let len = serialize_message(msg, &mut buf)?;
    buf.truncate(len);
    Some(buf)
}

/// Shorthand for reporting one routed event as NDJSON.
pub fn scan_message(event: &crate::router::AdvEvent, outcome: RouteOutcome) -> Option<MsgBuffer> {
    let entry = ScanLogEntry::new(event, outcome);
    let mut id = IdString::new();
    let id = match entry.id {
        Some(ref raw) => {
            format_id(raw, &mut id);
            Some(&id)
        }
        None => None,
    };
    let msg = DeviceMessage::Scan {
        source: entry.source,
        mfr: entry.mfr,
        rssi: entry.rssi,
        outcome: entry.outcome,
        id,
        ts: entry.ts,
    };
    to_msg_buffer(&msg)
}
