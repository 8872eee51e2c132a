//! # crmsync Engine
//!
//! Offline-first sync engine for CRM contacts and call logs.
//!
//! This crate provides:
//! - Upload of dirty local records in capped batches
//! - Paged download sweeps (full and delta) with safe pruning
//! - Reconciliation of device-sourced calls with their server records
//! - A coordinator with per-owner single-flight runs and audit entries
//! - Durable local stores (in-memory and file-backed)
//! - A device bridge contract for the call log and address book
//! - A tokio scheduler with backoff
//!
//! ## Architecture
//!
//! The engine implements a **push-then-pull** model per domain:
//! 1. Push dirty local records (the server resolves conflicts)
//! 2. Pull server pages and merge them locally
//! 3. Advance the checkpoint only after the sweep completed
//!
//! ## Key Invariants
//!
//! - Pruning happens only after a complete full sweep
//! - Records are replaced, never lost, when ids change
//! - At most one run per owner at a time
//! - Every local write is atomic and durable

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod audit;
mod config;
mod context;
mod coordinator;
mod device;
mod download;
mod error;
mod file_store;
mod http;
mod mirror;
mod reconcile;
mod report;
mod scheduler;
mod store;
mod transport;
mod upload;

pub use audit::AuditRecorder;
pub use config::{RetryConfig, SyncConfig};
pub use context::{CancelHandle, RunContext, Session};
pub use coordinator::SyncCoordinator;
pub use device::{DeviceBridge, DeviceRef, MemoryDeviceBridge, NoDevice, RawCallKind, RawCallRecord, RawContact};
pub use download::{CallDownloadReport, ContactDownloadReport, DownloadStage, SyncMode};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use file_store::FileLocalStore;
pub use http::{HttpClient, HttpTransport, LoopbackClient, LoopbackServer};
pub use mirror::{export_contacts, import_call_logs, import_contacts, DeviceReport};
pub use reconcile::{CallCollision, ReconcileReport, ReconciliationEngine};
pub use report::{DomainReport, DomainStatus, SyncRunReport, SyncState, SyncStats};
pub use scheduler::{SyncScheduler, SyncTrigger};
pub use store::{
    CallChanges, Changes, Checkpoints, ContactChanges, ContactUpdate, LocalContact, LocalStore,
    MemoryLocalStore, Snapshot,
};
pub use transport::SyncTransport;
pub use upload::{CallUploadReport, ContactUploadReport, RejectedContact, UploadStage};
