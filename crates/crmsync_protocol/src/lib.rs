//! # crmsync Protocol
//!
//! Wire types and JSON codecs for the crmsync contact/call-log protocol.
//!
//! This crate provides:
//! - `Contact`, `CallLog` and `SyncAudit` records
//! - Paginated list envelopes and batch upload messages
//! - Phone normalization and temporary call id derivation
//! - Transport-neutral HTTP request/response values and route constants
//!
//! This is a pure protocol crate with no I/O operations. Both the client
//! engine and the reference server implement their halves of the protocol
//! against these types.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod http;
mod ids;
mod messages;
mod model;
mod phone;

pub use error::{ProtocolError, ProtocolResult};
pub use http::{routes, HttpRequest, HttpResponse, Method};
pub use ids::{is_local_contact_id, is_temp_call_id, new_canonical_id, new_local_contact_id, temp_call_id};
pub use messages::{
    decode, encode, AuditRequest, AuditResponse, BatchError, BatchErrorKind, BatchResult,
    BatchSummary, CallBatchRequest, CallBatchResponse, CallInput, ContactBatchRequest,
    ContactBatchResponse, ContactInput, ErrorBody, Page, PageQuery, Pagination, UpsertAction,
    MAX_BATCH_SIZE,
};
pub use model::{AuditStatus, CallDirection, CallLog, Contact, SyncAudit, SyncDomain};
pub use phone::{normalize_phone, MAX_PHONE_DIGITS, MIN_PHONE_DIGITS};
