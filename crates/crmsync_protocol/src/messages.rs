//! Protocol messages for sync.

use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{AuditStatus, CallDirection, CallLog, Contact, SyncAudit, SyncDomain};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Hard cap on records per batch upload request.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Encodes a message as JSON.
pub fn encode<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decodes a message from JSON.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Query parameters of a paginated list request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    /// 1-based page number.
    pub page: u32,
    /// Page size.
    pub limit: u32,
    /// Only records changed at or after this instant.
    pub updated_since: Option<DateTime<Utc>>,
}

impl PageQuery {
    /// Creates a query for the given page.
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page,
            limit,
            updated_since: None,
        }
    }

    /// Restricts the query to records changed since `since`.
    pub fn with_updated_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.updated_since = since;
        self
    }

    /// Renders the query string (without the leading `?`).
    pub fn to_query_string(&self) -> String {
        let mut query = format!("page={}&limit={}", self.page, self.limit);
        if let Some(since) = &self.updated_since {
            query.push_str("&updated_since=");
            query.push_str(&since.to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        query
    }

    /// Parses a query string. Missing `page`/`limit` fall back to the defaults.
    pub fn parse(query: &str, default_limit: u32) -> ProtocolResult<Self> {
        let mut parsed = PageQuery::new(1, default_limit);
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let invalid = || ProtocolError::InvalidQuery {
                name: name.to_string(),
                value: value.to_string(),
            };
            match name {
                "page" => parsed.page = value.parse().map_err(|_| invalid())?,
                "limit" => parsed.limit = value.parse().map_err(|_| invalid())?,
                "updated_since" => {
                    let since = DateTime::parse_from_rfc3339(value).map_err(|_| invalid())?;
                    parsed.updated_since = Some(since.with_timezone(&Utc));
                }
                _ => {}
            }
        }
        if parsed.page == 0 || parsed.limit == 0 {
            return Err(ProtocolError::InvalidQuery {
                name: "page/limit".into(),
                value: query.to_string(),
            });
        }
        Ok(parsed)
    }
}

/// Pagination metadata of a list response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// 1-based page number.
    pub current_page: u32,
    /// Number of pages.
    pub total_pages: u32,
    /// Number of records across all pages.
    pub total_items: u64,
    /// Page size.
    pub items_per_page: u32,
    /// Whether a later page exists.
    pub has_next: bool,
    /// Whether an earlier page exists.
    pub has_prev: bool,
}

impl Pagination {
    /// Computes pagination metadata for a page of a result set.
    pub fn new(current_page: u32, items_per_page: u32, total_items: u64) -> Self {
        let per_page = u64::from(items_per_page.max(1));
        let total_pages = total_items.div_ceil(per_page) as u32;
        Self {
            current_page,
            total_pages,
            total_items,
            items_per_page,
            has_next: current_page < total_pages,
            has_prev: current_page > 1,
        }
    }
}

/// A page of records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Records on this page.
    pub data: Vec<T>,
    /// Pagination metadata.
    pub pagination: Pagination,
}

impl<T> Page<T> {
    /// Returns true if this page ends the sweep.
    ///
    /// The server may serve fewer records per page than were asked for, so
    /// a page is short relative to its own `items_per_page`. A page without
    /// a successor also ends the sweep.
    pub fn is_last(&self) -> bool {
        self.data.len() < self.pagination.items_per_page as usize || !self.pagination.has_next
    }
}

/// One contact in a batch upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInput {
    /// Display name.
    pub name: String,
    /// Phone number as entered.
    pub phone_raw: String,
    /// Creation time of the local values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// `POST /contacts/batch` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactBatchRequest {
    /// Contacts to upsert.
    pub contacts: Vec<ContactInput>,
    /// Revive the caller's soft-deleted record with the same phone key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_restore: Option<bool>,
}

impl ContactBatchRequest {
    /// Creates a batch request.
    pub fn new(contacts: Vec<ContactInput>) -> Self {
        Self {
            contacts,
            force_restore: None,
        }
    }

    /// Sets the `force_restore` flag.
    pub fn with_force_restore(mut self, force_restore: bool) -> Self {
        self.force_restore = force_restore.then_some(true);
        self
    }
}

/// What the server did with one uploaded contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    /// No record had the phone key; a new one was inserted.
    Created,
    /// The uploaded values were newer and replaced the remote values.
    Updated,
    /// The remote record won; the returned contact carries its values.
    Existing,
    /// A soft-deleted record was revived with the uploaded values.
    Restored,
}

/// A successfully resolved batch entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Position of the entry in the request.
    pub index: usize,
    /// Resolution.
    pub action: UpsertAction,
    /// The remote record after resolution.
    pub contact: Contact,
}

/// Why a batch entry was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchErrorKind {
    /// The phone key belongs to another owner.
    Conflict,
    /// The entry is malformed.
    Validation,
}

/// A rejected batch entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchError {
    /// Position of the entry in the request.
    pub index: usize,
    /// Human-readable reason.
    pub error: String,
    /// Machine-readable reason.
    pub kind: BatchErrorKind,
    /// The rejected input.
    pub contact: ContactInput,
}

/// Counters of a batch response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Entries in the request.
    pub total: usize,
    /// Inserted.
    pub created: usize,
    /// Remote took local values.
    pub updated: usize,
    /// Remote won.
    pub existing: usize,
    /// Revived soft-deleted records.
    #[serde(default)]
    pub restored: usize,
    /// Rejected entries.
    pub errors: usize,
}

/// `POST /contacts/batch` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactBatchResponse {
    /// Resolved entries.
    pub results: Vec<BatchResult>,
    /// Rejected entries.
    pub errors: Vec<BatchError>,
    /// Counters.
    pub summary: BatchSummary,
}

/// One call in a call upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInput {
    /// Weak reference to a contact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    /// Call direction.
    pub direction: CallDirection,
    /// Duration in seconds.
    pub duration_seconds: u32,
    /// When the call happened.
    pub timestamp: DateTime<Utc>,
    /// Number of the other party.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_normalized: Option<String>,
}

impl From<&CallLog> for CallInput {
    fn from(call: &CallLog) -> Self {
        Self {
            contact_id: call.contact_id.clone(),
            direction: call.direction,
            duration_seconds: call.duration_seconds,
            timestamp: call.timestamp,
            phone_normalized: Some(call.phone_number.clone()),
        }
    }
}

/// `POST /calls` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallBatchRequest {
    /// Calls to store.
    pub calls: Vec<CallInput>,
}

/// `POST /calls` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallBatchResponse {
    /// Canonical records, one per stored input.
    pub calls: Vec<CallLog>,
    /// Number of records returned.
    pub count: usize,
}

/// `POST /sync-audit` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRequest {
    /// Domain that was synced.
    pub sync_type: SyncDomain,
    /// Outcome.
    pub status: AuditStatus,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Contacts moved.
    pub synced_contacts: u64,
    /// Calls moved.
    pub synced_calls: u64,
}

/// `POST /sync-audit` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResponse {
    /// The stored entry.
    pub sync_audit: SyncAudit,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error description.
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn pagination_envelope_uses_camel_case() {
        let page: Page<Contact> = Page {
            data: vec![],
            pagination: Pagination::new(1, 50, 120),
        };
        let json = String::from_utf8(encode(&page).unwrap()).unwrap();
        assert!(json.contains("\"currentPage\":1"));
        assert!(json.contains("\"totalPages\":3"));
        assert!(json.contains("\"hasNext\":true"));
        assert!(json.contains("\"hasPrev\":false"));
    }

    #[test]
    fn pagination_edges() {
        let empty = Pagination::new(1, 100, 0);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next);

        let last = Pagination::new(3, 50, 120);
        assert!(!last.has_next);
        assert!(last.has_prev);
    }

    #[test]
    fn end_of_data_follows_server_pagination() {
        let page_of = |len: u32, items_per_page: u32, has_next: bool| Page {
            data: (0..len).collect::<Vec<u32>>(),
            pagination: Pagination {
                current_page: 1,
                total_pages: 5,
                total_items: 10,
                items_per_page,
                has_next,
                has_prev: false,
            },
        };

        // A full page at the server's size is not the end, whatever the
        // client asked for.
        assert!(!page_of(2, 2, true).is_last());
        assert!(page_of(1, 2, true).is_last());
        assert!(page_of(2, 2, false).is_last());
        assert!(page_of(0, 2, false).is_last());
    }

    #[test]
    fn query_string_roundtrip() {
        let since = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let query = PageQuery::new(2, 100).with_updated_since(Some(since));
        let rendered = query.to_query_string();
        assert_eq!(rendered, "page=2&limit=100&updated_since=2024-03-01T12:30:00.000Z");
        assert_eq!(PageQuery::parse(&rendered, 10).unwrap(), query);
    }

    #[test]
    fn query_defaults_and_errors() {
        let parsed = PageQuery::parse("", 25).unwrap();
        assert_eq!(parsed, PageQuery::new(1, 25));
        assert!(PageQuery::parse("page=abc", 25).is_err());
        assert!(PageQuery::parse("page=0", 25).is_err());
        assert!(PageQuery::parse("updated_since=yesterday", 25).is_err());
    }

    #[test]
    fn batch_request_omits_absent_fields() {
        let request = ContactBatchRequest::new(vec![ContactInput {
            name: "Ada".into(),
            phone_raw: "555 0100".into(),
            created_at: None,
        }]);
        let json = String::from_utf8(encode(&request).unwrap()).unwrap();
        assert!(!json.contains("force_restore"));
        assert!(!json.contains("created_at"));

        let forced = request.with_force_restore(true);
        let json = String::from_utf8(encode(&forced).unwrap()).unwrap();
        assert!(json.contains("\"force_restore\":true"));
    }

    #[test]
    fn batch_response_decodes_without_restored_counter() {
        let json = br#"{"results":[],"errors":[],
            "summary":{"total":0,"created":0,"updated":0,"existing":0,"errors":0}}"#;
        let response: ContactBatchResponse = decode(json).unwrap();
        assert_eq!(response.summary.restored, 0);
    }
}
