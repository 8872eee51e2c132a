//! Authentication support for the sync server.
//!
//! Bearer tokens are signed with HMAC-SHA256 and carry the caller's identity,
//! so every request resolves to a [`Principal`] before it touches the store.
//!
//! ## Token Format
//!
//! ```text
//! <role>.<issued_at_millis>.<hex(owner_id)>.<hex(hmac)>
//! ```
//!
//! `role` is `user` or `admin`; the MAC covers everything before the last dot.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Capability level of an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Regular user; may mutate only their own contacts.
    User,
    /// Administrative capability; may mutate any contact.
    Admin,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Owner id the caller acts as.
    pub owner_id: String,
    /// Capability level.
    pub role: Role,
}

impl Principal {
    /// Creates a regular user principal.
    pub fn user(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            role: Role::User,
        }
    }

    /// Creates an administrative principal.
    pub fn admin(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            role: Role::Admin,
        }
    }

    /// Returns true if the caller may mutate a record owned by `owner_id`.
    pub fn may_mutate(&self, owner_id: &str) -> bool {
        self.role == Role::Admin || self.owner_id == owner_id
    }
}

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and validates signed bearer tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a token for `principal`.
    pub fn create_token(&self, principal: &Principal) -> ServerResult<String> {
        let payload = format!(
            "{}.{}.{}",
            principal.role.as_str(),
            now_millis(),
            hex(principal.owner_id.as_bytes())
        );
        let signature = self.sign(payload.as_bytes())?;
        Ok(format!("{payload}.{}", hex(&signature)))
    }

    /// Validates a token and returns the principal it names.
    pub fn validate_token(&self, token: &str) -> ServerResult<Principal> {
        let (payload, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed token".into()))?;

        let expected = hex(&self.sign(payload.as_bytes())?);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(ServerError::AuthenticationFailed("invalid signature".into()));
        }

        let mut parts = payload.splitn(3, '.');
        let role = parts.next().and_then(Role::parse);
        let issued_at = parts.next().and_then(|s| s.parse::<u64>().ok());
        let owner = parts.next().and_then(unhex).and_then(|b| String::from_utf8(b).ok());

        let (Some(role), Some(issued_at), Some(owner_id)) = (role, issued_at, owner) else {
            return Err(ServerError::AuthenticationFailed("malformed token".into()));
        };

        let expiry_millis = self.config.token_expiry.as_millis() as u64;
        if now_millis() > issued_at.saturating_add(expiry_millis) {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }

        Ok(Principal { owner_id, role })
    }

    /// Signs data with HMAC-SHA256.
    fn sign(&self, data: &[u8]) -> ServerResult<[u8; 32]> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key: {e}")))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }
}

/// Resolves bearer tokens to principals.
#[derive(Clone)]
pub enum Authenticator {
    /// Tokens must be HMAC-signed.
    Signed(TokenValidator),
    /// Tokens are taken at face value: `<owner>` or `admin:<owner>`.
    ///
    /// For development and in-process tests only.
    Trusted,
}

impl Authenticator {
    /// Resolves the bearer token of a request.
    pub fn authenticate(&self, bearer: Option<&str>) -> ServerResult<Principal> {
        let token = bearer
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ServerError::AuthenticationFailed("missing bearer token".into()))?;

        match self {
            Authenticator::Signed(validator) => validator.validate_token(token),
            Authenticator::Trusted => Ok(match token.strip_prefix("admin:") {
                Some(owner) => Principal::admin(owner),
                None => Principal::user(token),
            }),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec()))
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let token = validator.create_token(&Principal::user("owner-1")).unwrap();

        let principal = validator.validate_token(&token).unwrap();
        assert_eq!(principal, Principal::user("owner-1"));
    }

    #[test]
    fn admin_role_survives_roundtrip() {
        let validator = validator();
        let token = validator.create_token(&Principal::admin("root")).unwrap();
        assert_eq!(validator.validate_token(&token).unwrap().role, Role::Admin);
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let token = validator.create_token(&Principal::user("owner-1")).unwrap();
        let forged = token.replacen("user", "admin", 1);

        assert!(validator.validate_token(&forged).is_err());
    }

    #[test]
    fn reject_foreign_secret() {
        let token = validator().create_token(&Principal::user("owner-1")).unwrap();
        let other = TokenValidator::new(AuthConfig::new(b"another-secret".to_vec()));
        assert!(other.validate_token(&token).is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator = TokenValidator::new(
            AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec())
                .with_expiry(Duration::from_secs(0)),
        );
        let token = validator.create_token(&Principal::user("owner-1")).unwrap();

        std::thread::sleep(Duration::from_millis(10));

        assert!(validator.validate_token(&token).is_err());
    }

    #[test]
    fn trusted_tokens() {
        let auth = Authenticator::Trusted;
        assert_eq!(auth.authenticate(Some("alice")).unwrap(), Principal::user("alice"));
        assert_eq!(auth.authenticate(Some("admin:bob")).unwrap(), Principal::admin("bob"));
        assert!(auth.authenticate(None).is_err());
        assert!(auth.authenticate(Some("")).is_err());
    }

    #[test]
    fn ownership_rules() {
        assert!(Principal::user("a").may_mutate("a"));
        assert!(!Principal::user("a").may_mutate("b"));
        assert!(Principal::admin("a").may_mutate("b"));
    }
}
