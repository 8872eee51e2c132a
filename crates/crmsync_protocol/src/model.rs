//! Records exchanged between client and server.

use crate::ids::is_temp_call_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A CRM contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Server-issued or locally generated id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Phone number as entered.
    pub phone_raw: String,
    /// Canonical phone key, unique among non-deleted contacts.
    pub phone_normalized: String,
    /// Owning user.
    pub owner_id: String,
    /// Creation time; the upload conflict tie-breaker.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Contact {
    /// Returns true if the contact is soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Direction of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// Answered incoming call.
    Incoming,
    /// Outgoing call.
    Outgoing,
    /// Unanswered incoming call.
    Missed,
}

/// A call record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLog {
    /// Temporary (`tmp-…`) or canonical id.
    pub id: String,
    /// Owning user.
    pub owner_id: String,
    /// Weak reference to a contact; not ownership.
    #[serde(default)]
    pub contact_id: Option<String>,
    /// Call direction.
    pub direction: CallDirection,
    /// Duration in seconds.
    pub duration_seconds: u32,
    /// When the call happened.
    pub timestamp: DateTime<Utc>,
    /// Normalized number of the other party.
    pub phone_number: String,
    /// When the record was stored; delta queries filter on it.
    pub created_at: DateTime<Utc>,
}

impl CallLog {
    /// Returns true if this record still carries a temporary id.
    pub fn is_temporary(&self) -> bool {
        is_temp_call_id(&self.id)
    }

    /// The reconciliation key: `(phone_number, timestamp)`.
    pub fn match_key(&self) -> (String, DateTime<Utc>) {
        (self.phone_number.clone(), self.timestamp)
    }
}

/// A sync domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDomain {
    /// Contacts.
    Contacts,
    /// Call logs.
    Calls,
}

impl SyncDomain {
    /// All domains in run order.
    pub const ALL: [SyncDomain; 2] = [SyncDomain::Contacts, SyncDomain::Calls];

    /// Wire name of the domain.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDomain::Contacts => "contacts",
            SyncDomain::Calls => "calls",
        }
    }
}

impl fmt::Display for SyncDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded in an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// The domain synced.
    Success,
    /// The domain failed.
    Error,
}

/// Append-only record of one domain's sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAudit {
    /// Server-issued id.
    pub id: String,
    /// Owning user.
    pub owner_id: String,
    /// Domain that was synced.
    pub sync_type: SyncDomain,
    /// Outcome.
    pub status: AuditStatus,
    /// Contacts moved in this attempt.
    pub synced_contacts: u64,
    /// Calls moved in this attempt.
    pub synced_calls: u64,
    /// Failure description.
    #[serde(default)]
    pub error_message: Option<String>,
    /// When the entry was recorded.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::temp_call_id;
    use chrono::TimeZone;

    #[test]
    fn direction_wire_names() {
        assert_eq!(serde_json::to_string(&CallDirection::Missed).unwrap(), "\"missed\"");
        let parsed: CallDirection = serde_json::from_str("\"outgoing\"").unwrap();
        assert_eq!(parsed, CallDirection::Outgoing);
    }

    #[test]
    fn call_temporary_flag() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut call = CallLog {
            id: temp_call_id(&ts, "+15551234567"),
            owner_id: "u1".into(),
            contact_id: None,
            direction: CallDirection::Incoming,
            duration_seconds: 30,
            timestamp: ts,
            phone_number: "+15551234567".into(),
            created_at: ts,
        };
        assert!(call.is_temporary());
        call.id = "srv-1".into();
        assert!(!call.is_temporary());
        assert_eq!(call.match_key(), ("+15551234567".to_string(), ts));
    }

    #[test]
    fn contact_missing_deleted_at_defaults() {
        let json = r#"{
            "id": "c1", "name": "Ada", "phone_raw": "555 0100",
            "phone_normalized": "5550100", "owner_id": "u1",
            "created_at": "2024-01-01T00:00:00Z", "updated_at": "2024-01-01T00:00:00Z"
        }"#;
        let contact: Contact = serde_json::from_str(json).unwrap();
        assert!(!contact.is_deleted());
    }
}
