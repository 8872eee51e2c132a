//! Transport-neutral HTTP values.
//!
//! The engine's HTTP transport produces [`HttpRequest`]s and the reference
//! server consumes them, so neither side depends on a particular HTTP stack.

use crate::error::ProtocolResult;
use crate::messages::{encode, ErrorBody};
use serde::Serialize;
use std::fmt;

/// Endpoint paths.
pub mod routes {
    /// `GET` paginated contacts.
    pub const CONTACTS: &str = "/contacts";
    /// `POST` a contact batch.
    pub const CONTACTS_BATCH: &str = "/contacts/batch";
    /// `GET` paginated calls, `POST` new calls.
    pub const CALLS: &str = "/calls";
    /// `POST` an audit entry.
    pub const SYNC_AUDIT: &str = "/sync-audit";

    /// Path of a single contact (`DELETE`).
    pub fn contact(id: &str) -> String {
        format!("{CONTACTS}/{id}")
    }
}

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET.
    Get,
    /// POST.
    Post,
    /// DELETE.
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        })
    }
}

/// An HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Path without query string.
    pub path: String,
    /// Query string without the leading `?`.
    pub query: String,
    /// Bearer token from the `Authorization` header.
    pub bearer_token: Option<String>,
    /// JSON body; empty for GET and DELETE.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Creates a GET request.
    pub fn get(path: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: query.into(),
            bearer_token: None,
            body: Vec::new(),
        }
    }

    /// Creates a POST request with a JSON body.
    pub fn post<T: Serialize>(path: impl Into<String>, body: &T) -> ProtocolResult<Self> {
        Ok(Self {
            method: Method::Post,
            path: path.into(),
            query: String::new(),
            bearer_token: None,
            body: encode(body)?,
        })
    }

    /// Creates a DELETE request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            path: path.into(),
            query: String::new(),
            bearer_token: None,
            body: Vec::new(),
        }
    }

    /// Attaches a bearer token.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Path plus query string.
    pub fn target(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

/// An HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// JSON body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with a JSON body.
    pub fn json<T: Serialize>(status: u16, body: &T) -> Self {
        match encode(body) {
            Ok(bytes) => Self {
                status,
                body: bytes,
            },
            Err(e) => Self::error(500, format!("failed to encode response: {e}")),
        }
    }

    /// Creates an error response with an [`ErrorBody`].
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let body = ErrorBody {
            error: message.into(),
        };
        Self {
            status,
            body: serde_json::to_vec(&body).unwrap_or_default(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Extracts the error message of a non-2xx response.
    pub fn error_message(&self) -> String {
        serde_json::from_slice::<ErrorBody>(&self.body)
            .map(|b| b.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.body).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_target() {
        let request = HttpRequest::get(routes::CONTACTS, "page=1&limit=10");
        assert_eq!(request.target(), "/contacts?page=1&limit=10");
        assert_eq!(HttpRequest::delete(routes::contact("abc")).target(), "/contacts/abc");
    }

    #[test]
    fn error_response_message() {
        let response = HttpResponse::error(403, "not your contact");
        assert!(!response.is_success());
        assert_eq!(response.error_message(), "not your contact");

        let raw = HttpResponse {
            status: 502,
            body: b"bad gateway".to_vec(),
        };
        assert_eq!(raw.error_message(), "bad gateway");
    }
}
