//! Identifier regimes.
//!
//! Three kinds of ids share the `id` field of records:
//!
//! - **canonical** ids are issued by the server (hyphenated UUIDs);
//! - **temporary** call ids (`tmp-<hex>`) are derived from
//!   `(timestamp, phone_number)` when a call is read off the device;
//! - **local** contact ids (`local-<uuid>`) name contacts created on the
//!   client that the server has not seen yet.
//!
//! The prefixes never occur in canonical ids, so a record's regime can be
//! decided from its id alone.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const TEMP_CALL_PREFIX: &str = "tmp-";
const LOCAL_CONTACT_PREFIX: &str = "local-";

/// Derives the temporary id for a call read off the device.
///
/// The id is a pure function of `(timestamp, phone_number)`, so ingesting the
/// same device record twice yields the same id.
pub fn temp_call_id(timestamp: &DateTime<Utc>, phone_number: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.timestamp_millis().to_be_bytes());
    hasher.update(b"|");
    hasher.update(phone_number.as_bytes());
    let digest = hasher.finalize();

    let mut id = String::with_capacity(TEMP_CALL_PREFIX.len() + 32);
    id.push_str(TEMP_CALL_PREFIX);
    for byte in &digest[..16] {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

/// Returns true if `id` is a temporary call id.
pub fn is_temp_call_id(id: &str) -> bool {
    id.starts_with(TEMP_CALL_PREFIX)
}

/// Generates a fresh id for a contact created on the client.
pub fn new_local_contact_id() -> String {
    format!("{LOCAL_CONTACT_PREFIX}{}", Uuid::new_v4())
}

/// Returns true if `id` names a contact the server has not issued.
pub fn is_local_contact_id(id: &str) -> bool {
    id.starts_with(LOCAL_CONTACT_PREFIX)
}

/// Generates a canonical (server-issued) id.
pub fn new_canonical_id() -> String {
    Uuid::new_v4().to_string()
}
