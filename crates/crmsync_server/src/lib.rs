//! # crmsync Server
//!
//! Reference server half of the crmsync protocol.
//!
//! This crate provides:
//! - The authoritative contact / call-log / audit store
//! - Batch-upsert conflict resolution keyed by normalized phone number
//! - Request routing for the JSON endpoints
//! - Bearer-token authentication (HMAC-SHA256)
//!
//! # Conflict Resolution
//!
//! Uploaded contacts are matched on `phone_normalized`:
//! 1. No live record with the key → insert (`created`)
//! 2. Same owner, uploaded `created_at` strictly newer → apply (`updated`)
//! 3. Same owner otherwise → keep remote (`existing`)
//! 4. Different owner → per-entry `conflict`, nothing mutated
//!
//! A whole batch is resolved under one write lock, and a batch over the cap
//! is rejected before any entry is processed.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod server;
mod store;

pub use auth::{AuthConfig, Authenticator, Principal, Role, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::SyncServer;
pub use store::RemoteStore;
