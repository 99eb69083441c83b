//! Wire format and codec for transit notification records.
//!
//! A notification travels as BLE manufacturer-specific data: the 2-byte
//! company identifier claims the slot, followed by a fixed 25-byte record.
//! Multi-byte fields are little-endian, two field pairs are nibble-packed:
//!
//! | offset | len | field                                      |
//! |--------|-----|--------------------------------------------|
//! | 0      | 1   | protocol version (must equal 1)            |
//! | 1      | 4   | source id (opaque)                         |
//! | 5      | 4   | notification id (dedup key)                |
//! | 9      | 1   | event id (hi nibble) / destination (lo)    |
//! | 10     | 1   | transport type (hi) / status (lo)          |
//! | 11     | 2   | duration in seconds, u16 LE                |
//! | 13     | 8   | infra HMAC tag (pass-through)              |
//! | 21     | 4   | client HMAC tag (verified here)            |
use crate::auth;

/// Custom manufacturer ID used by the notification protocol.
pub const MANUFACTURER_ID: u16 = 0xFFFF;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the full wire record in bytes (including both HMAC tags).
pub const RECORD_SIZE: usize = 25;

/// Number of bytes of the truncated infrastructure tag. Signed by the
/// broadcaster, verified along the repeater chain, never by this core.
pub const INFRA_TAG_LEN: usize = 8;

/// Number of bytes of the truncated client tag. Signed by the first
/// repeater, verified here against [`auth::CLIENT_KEY`].
pub const CLIENT_TAG_LEN: usize = 4;

/// Byte size of the base payload (everything before the two HMAC tags).
/// This is what both tags authenticate.
pub const BASE_PAYLOAD_SIZE: usize = RECORD_SIZE - INFRA_TAG_LEN - CLIENT_TAG_LEN;

/// Vehicle class carried in the high nibble of byte 10.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Bus = 1,
    Train = 2,
}

impl TransportType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Bus),
            2 => Some(Self::Train),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bus => "bus",
            Self::Train => "train",
        }
    }
}

/// Service state carried in the low nibble of byte 10.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Passing = 1,
    Coming = 2,
    Late = 3,
}

impl TransportStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Passing),
            2 => Some(Self::Coming),
            3 => Some(Self::Late),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passing => "passing",
            Self::Coming => "coming",
            Self::Late => "late",
        }
    }
}

/// A decoded transit notification. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationRecord {
    pub version: u8,
    /// Opaque origin identifier (station).
    pub source_id: [u8; 4],
    /// Identity key for deduplication in the store.
    pub notification_id: [u8; 4],
    pub event_id: u8,
    pub destination_id: u8,
    pub transport_type: TransportType,
    pub transport_status: TransportStatus,
    /// How long (in seconds) the relay chain re-broadcasts this record.
    pub duration_secs: u16,
    /// Infrastructure HMAC tag, retained for display. Never verified here.
    pub infra_tag: [u8; INFRA_TAG_LEN],
    pub client_tag: [u8; CLIENT_TAG_LEN],
    /// Result of the client-tag verification. False also covers the
    /// unsigned (all-zero tag) case.
    pub client_verified: bool,
    /// Exact wire record, retained for diagnostics.
    pub raw: [u8; RECORD_SIZE],
    /// Capture timestamp in host milliseconds (the library has no clock;
    /// the host stamps uptime the same way it stamps message `ts`).
    pub received_at_ms: u64,
    /// Signal strength reading for the carrying advertisement, if any.
    pub rssi: Option<i8>,
}

impl NotificationRecord {
    /// Decode a vendor payload into a notification record.
    ///
    /// Returns `None` for malformed input: short buffer, wrong protocol
    /// version, or an out-of-range type/status nibble. Authentication
    /// failure is not malformed: the record is returned with
    /// `client_verified = false` so the caller can still inspect it.
    /// An all-zero client tag means "not signed yet": unverifiable,
    /// decoded without calling the authenticator.
    pub fn decode(payload: &[u8], rssi: Option<i8>, now_ms: u64) -> Option<Self> {
        if payload.len() < RECORD_SIZE {
            log::debug!("record too short: {} bytes", payload.len());
            return None;
        }

        let version = payload[0];
        if version != PROTOCOL_VERSION {
            log::debug!("unsupported protocol version {}", version);
            return None;
        }

        let mut source_id = [0u8; 4];
        source_id.copy_from_slice(&payload[1..5]);
        let mut notification_id = [0u8; 4];
        notification_id.copy_from_slice(&payload[5..9]);

        let event_id = payload[9] >> 4;
        let destination_id = payload[9] & 0x0F;

        let transport_type = TransportType::from_u8(payload[10] >> 4)?;
        let transport_status = TransportStatus::from_u8(payload[10] & 0x0F)?;

        let duration_secs = u16::from_le_bytes([payload[11], payload[12]]);

        let mut infra_tag = [0u8; INFRA_TAG_LEN];
        infra_tag.copy_from_slice(&payload[13..13 + INFRA_TAG_LEN]);
        let mut client_tag = [0u8; CLIENT_TAG_LEN];
        client_tag.copy_from_slice(&payload[21..21 + CLIENT_TAG_LEN]);

        // All-zero tag = not signed yet by any repeater. Unverifiable but
        // still a valid record; skip the HMAC computation entirely.
        let client_verified = if client_tag == [0u8; CLIENT_TAG_LEN] {
            false
        } else {
            auth::verify(auth::CLIENT_KEY, &payload[..BASE_PAYLOAD_SIZE], &client_tag)
        };

        let mut raw = [0u8; RECORD_SIZE];
        raw.copy_from_slice(&payload[..RECORD_SIZE]);

        Some(Self {
            version,
            source_id,
            notification_id,
            event_id,
            destination_id,
            transport_type,
            transport_status,
            duration_secs,
            infra_tag,
            client_tag,
            client_verified,
            raw,
            received_at_ms: now_ms,
            rssi,
        })
    }
}

/// Record fields in unpacked form, for building wire payloads.
///
/// The receiver never transmits; this exists for test fixtures and for
/// bench tooling that needs to fabricate records the way the broadcaster
/// does.
#[derive(Debug, Clone, Copy)]
pub struct RecordFields {
    pub source_id: [u8; 4],
    pub notification_id: [u8; 4],
    pub event_id: u8,
    pub destination_id: u8,
    pub transport_type: TransportType,
    pub transport_status: TransportStatus,
    pub duration_secs: u16,
}

impl RecordFields {
    /// Pack the base payload: everything both HMAC tags authenticate.
    pub fn encode_base(&self) -> [u8; BASE_PAYLOAD_SIZE] {
        let mut base = [0u8; BASE_PAYLOAD_SIZE];
        base[0] = PROTOCOL_VERSION;
        base[1..5].copy_from_slice(&self.source_id);
        base[5..9].copy_from_slice(&self.notification_id);
        base[9] = (self.event_id << 4) | (self.destination_id & 0x0F);
        base[10] = ((self.transport_type as u8) << 4) | (self.transport_status as u8);
        base[11..13].copy_from_slice(&self.duration_secs.to_le_bytes());
        base
    }

    /// Pack a full wire record with the given tags.
    pub fn encode(
        &self,
        infra_tag: &[u8; INFRA_TAG_LEN],
        client_tag: &[u8; CLIENT_TAG_LEN],
    ) -> [u8; RECORD_SIZE] {
        let mut rec = [0u8; RECORD_SIZE];
        rec[..BASE_PAYLOAD_SIZE].copy_from_slice(&self.encode_base());
        rec[13..21].copy_from_slice(infra_tag);
        rec[21..25].copy_from_slice(client_tag);
        rec
    }

    /// Pack a record with a valid client tag, as the first repeater would.
    pub fn encode_client_signed(&self, infra_tag: &[u8; INFRA_TAG_LEN]) -> [u8; RECORD_SIZE] {
        let client_tag: [u8; CLIENT_TAG_LEN] = auth::tag(auth::CLIENT_KEY, &self.encode_base());
        self.encode(infra_tag, &client_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> RecordFields {
        RecordFields {
            source_id: [0xAA, 0xBB, 0xCC, 0xDD],
            notification_id: [0x11, 0x22, 0x33, 0x44],
            event_id: 3,
            destination_id: 7,
            transport_type: TransportType::Bus,
            transport_status: TransportStatus::Coming,
            duration_secs: 30,
        }
    }

    const INFRA: [u8; INFRA_TAG_LEN] = [1, 2, 3, 4, 5, 6, 7, 8];

    // ── Rejection paths ─────────────────────────────────────────────

    #[test]
    fn decode_rejects_short_payloads() {
        let rec = fields().encode(&INFRA, &[0; CLIENT_TAG_LEN]);
        for len in 0..RECORD_SIZE {
            assert!(
                NotificationRecord::decode(&rec[..len], None, 0).is_none(),
                "{len}-byte payload should be rejected"
            );
        }
    }

    #[test]
    fn decode_rejects_wrong_version() {
        let mut rec = fields().encode(&INFRA, &[0; CLIENT_TAG_LEN]);
        rec[0] = 2;
        assert!(NotificationRecord::decode(&rec, None, 0).is_none());
        rec[0] = 0;
        assert!(NotificationRecord::decode(&rec, None, 0).is_none());
    }

    #[test]
    fn decode_rejects_invalid_type_nibble() {
        let mut rec = fields().encode(&INFRA, &[0; CLIENT_TAG_LEN]);
        for bad_type in [0u8, 3, 15] {
            rec[10] = (bad_type << 4) | (TransportStatus::Coming as u8);
            assert!(
                NotificationRecord::decode(&rec, None, 0).is_none(),
                "type nibble {bad_type} should be rejected"
            );
        }
    }

    #[test]
    fn decode_rejects_invalid_status_nibble() {
        let mut rec = fields().encode(&INFRA, &[0; CLIENT_TAG_LEN]);
        for bad_status in [0u8, 4, 15] {
            rec[10] = ((TransportType::Bus as u8) << 4) | bad_status;
            assert!(
                NotificationRecord::decode(&rec, None, 0).is_none(),
                "status nibble {bad_status} should be rejected"
            );
        }
    }

    // ── Field extraction ────────────────────────────────────────────

    #[test]
    fn decode_known_byte_sequence() {
        // version 1, source AABBCCDD, id 11223344, event 3 / dest 7,
        // bus / coming, 30 s, infra tag 01..08, zero client tag
        let rec: [u8; RECORD_SIZE] = [
            0x01, 0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44, 0x37, 0x12, 0x1E, 0x00, 0x01,
            0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x00, 0x00, 0x00, 0x00,
        ];
        let n = NotificationRecord::decode(&rec, Some(-60), 1234).unwrap();
        assert_eq!(n.version, 1);
        assert_eq!(n.source_id, [0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(n.notification_id, [0x11, 0x22, 0x33, 0x44]);
        assert_eq!(n.event_id, 3);
        assert_eq!(n.destination_id, 7);
        assert_eq!(n.transport_type, TransportType::Bus);
        assert_eq!(n.transport_status, TransportStatus::Coming);
        assert_eq!(n.duration_secs, 30);
        assert_eq!(n.infra_tag, INFRA);
        assert!(!n.client_verified);
        assert_eq!(n.raw, rec);
        assert_eq!(n.received_at_ms, 1234);
        assert_eq!(n.rssi, Some(-60));
    }

    #[test]
    fn decode_duration_is_little_endian() {
        let mut f = fields();
        f.duration_secs = 0x0102;
        let rec = f.encode(&INFRA, &[0; CLIENT_TAG_LEN]);
        assert_eq!(rec[11], 0x02);
        assert_eq!(rec[12], 0x01);
        let n = NotificationRecord::decode(&rec, None, 0).unwrap();
        assert_eq!(n.duration_secs, 0x0102);
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let rec = fields().encode_client_signed(&INFRA);
        let mut padded = [0u8; RECORD_SIZE + 4];
        padded[..RECORD_SIZE].copy_from_slice(&rec);
        let n = NotificationRecord::decode(&padded, None, 0).unwrap();
        assert_eq!(n.raw, rec);
        assert!(n.client_verified);
    }

    // ── Client tag verification ─────────────────────────────────────

    #[test]
    fn signed_record_round_trips_verified() {
        let rec = fields().encode_client_signed(&INFRA);
        let n = NotificationRecord::decode(&rec, None, 0).unwrap();
        assert!(n.client_verified);
    }

    #[test]
    fn zero_client_tag_decodes_unverified() {
        let rec = fields().encode(&INFRA, &[0; CLIENT_TAG_LEN]);
        let n = NotificationRecord::decode(&rec, None, 0).unwrap();
        assert!(!n.client_verified);
    }

    #[test]
    fn forged_client_tag_decodes_unverified() {
        let rec = fields().encode(&INFRA, &[0xDE, 0xAD, 0xBE, 0xEF]);
        let n = NotificationRecord::decode(&rec, None, 0).unwrap();
        assert!(!n.client_verified);
    }

    #[test]
    fn any_base_bit_flip_breaks_verification() {
        let signed = fields().encode_client_signed(&INFRA);
        for byte in 0..BASE_PAYLOAD_SIZE {
            for bit in 0..8 {
                let mut tampered = signed;
                tampered[byte] ^= 1 << bit;
                // Some flips hit the version or enum nibbles and fail to
                // decode at all; those that decode must come back unverified.
                if let Some(n) = NotificationRecord::decode(&tampered, None, 0) {
                    assert!(
                        !n.client_verified,
                        "flip of byte {byte} bit {bit} still verified"
                    );
                }
            }
        }
    }

    #[test]
    fn infra_tag_flip_does_not_affect_client_verification() {
        let mut rec = fields().encode_client_signed(&INFRA);
        rec[13] ^= 0xFF;
        let n = NotificationRecord::decode(&rec, None, 0).unwrap();
        assert!(n.client_verified);
    }
}
