//! Transitwatch library: BLE transit notification receiver core.
//!
//! Stations broadcast signed 25-byte transit notifications as BLE
//! manufacturer data; repeaters relay them and add a truncated client
//! HMAC tag. This crate is the receiving end: the wire codec, the
//! client-tag verifier, the advertisement router, the two listening
//! session lifecycles, and the bounded deduplicated notification store.
//! All logic is platform-free and testable on any host with `cargo test`.
//! Platform binaries (the ESP-IDF firmware in `firmware-std/`) are thin
//! consumers that provide radio access and output sinks.
//!
//! The display/companion layer is an external collaborator: it feeds raw
//! advertisement events in and reads the store, the session status, and
//! the NDJSON diagnostics stream out.

#![cfg_attr(not(test), no_std)]

pub mod auth;
pub mod protocol;
pub mod report;
pub mod router;
pub mod session;
pub mod store;
