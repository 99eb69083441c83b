//! Truncated HMAC-SHA256 authentication for notification records.
//!
//! The broadcast record carries two tags: an 8-byte infrastructure tag
//! (repeater-chain verification, opaque to us) and a 4-byte client tag that
//! this core verifies. Truncation trades authentication strength for BLE
//! advertisement space, a deliberate protocol decision.
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Client-facing key: used by the first repeater to sign, and by this
/// receiver to verify. Distinct from the infrastructure key, which never
/// leaves the broadcaster/repeater chain.
pub const CLIENT_KEY: &[u8] = b"client-secret-key-app!!!";

/// Full HMAC-SHA256 digest size in bytes.
pub const DIGEST_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Compute a truncated HMAC-SHA256 tag of `N` bytes over the given data.
pub fn tag<const N: usize>(key: &[u8], data: &[u8]) -> [u8; N] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; N];
    out.copy_from_slice(&result[..N]);
    out
}

/// Verify a presented truncated tag against a recomputation with `key`.
///
/// The first `presented.len()` bytes of the full digest must match
/// byte-for-byte. An empty tag or one longer than the digest never
/// verifies. The threat model does not call for constant-time comparison.
pub fn verify(key: &[u8], data: &[u8], presented: &[u8]) -> bool {
    if presented.is_empty() || presented.len() > DIGEST_LEN {
        return false;
    }
    let expected: [u8; DIGEST_LEN] = tag(key, data);
    expected[..presented.len()] == *presented
}
