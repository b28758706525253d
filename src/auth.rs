//! Authentication Collaborator
//!
//! The engine treats credentials as opaque: the only contract is that a
//! bearer token resolves to a verified identity or a typed failure. The
//! default verifier decodes a JWT and checks the account is still active.
//! Failed attempts are throttled per source address.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::models::{Role, User};
use crate::settings::AuthSettings;
use crate::storage::Store;

/// A verified caller
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("credential expired")]
    Expired,
    #[error("credential invalid")]
    Invalid,
    #[error("account inactive")]
    Inactive,
    #[error("too many failed attempts")]
    Throttled,
}

/// Resolves an opaque credential to an identity
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    username: String,
    email: String,
    role: Role,
    exp: i64,
}

/// JWT-based verifier backed by the users table for the active flag
pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_minutes: i64,
    store: Arc<dyn Store>,
}

impl JwtVerifier {
    pub fn new(settings: &AuthSettings, store: Arc<dyn Store>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(settings.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(settings.jwt_secret.as_bytes()),
            validation: Validation::default(),
            ttl_minutes: settings.token_ttl_minutes,
            store,
        }
    }

    /// Issue a token for a known user; used by the auth collaborator and by
    /// tests, never by the engine itself
    pub fn issue(&self, user: &User) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
            exp: (Utc::now() + chrono::Duration::minutes(self.ttl_minutes)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|_| AuthError::Invalid)
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let decoded = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            }
        })?;
        let claims = decoded.claims;

        // the token may outlive the account; the row is authoritative
        let user = self
            .store
            .user(claims.sub)
            .await
            .map_err(|_| AuthError::Invalid)?;
        if !user.active {
            return Err(AuthError::Inactive);
        }

        Ok(Identity {
            user_id: user.id,
            username: user.username,
            role: user.role,
        })
    }
}

/// Per-address lockout after repeated authentication failures
pub struct FailureThrottle {
    max_failures: u32,
    lockout: Duration,
    failures: Mutex<HashMap<IpAddr, AddrRecord>>,
}

struct AddrRecord {
    attempts: Vec<Instant>,
    locked_until: Option<Instant>,
}

impl FailureThrottle {
    pub fn new(settings: &AuthSettings) -> Self {
        Self {
            max_failures: settings.max_failures,
            lockout: Duration::from_secs(settings.lockout_minutes * 60),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Whether this address may attempt authentication right now
    pub fn allows(&self, addr: IpAddr) -> bool {
        let mut failures = self.failures.lock();
        let locked_until = failures.get(&addr).and_then(|record| record.locked_until);
        match locked_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // lockout elapsed; forget the history
                failures.remove(&addr);
                true
            }
            None => true,
        }
    }

    pub fn record_failure(&self, addr: IpAddr) {
        let now = Instant::now();
        let mut failures = self.failures.lock();
        let record = failures.entry(addr).or_insert_with(|| AddrRecord {
            attempts: Vec::new(),
            locked_until: None,
        });
        record.attempts.retain(|at| now.duration_since(*at) < self.lockout);
        record.attempts.push(now);
        if record.attempts.len() as u32 >= self.max_failures {
            debug!(%addr, "locking out address after repeated auth failures");
            record.locked_until = Some(now + self.lockout);
            record.attempts.clear();
        }
    }

    pub fn record_success(&self, addr: IpAddr) {
        self.failures.lock().remove(&addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn settings() -> AuthSettings {
        AuthSettings {
            jwt_secret: "test-secret".to_string(),
            token_ttl_minutes: 5,
            max_failures: 3,
            lockout_minutes: 15,
        }
    }

    #[tokio::test]
    async fn round_trips_a_valid_token() {
        let store = Arc::new(MemoryStore::new());
        let id = store.add_user("alice", Role::Bidder);
        let verifier = JwtVerifier::new(&settings(), store.clone());

        let user = store.user(id).await.unwrap();
        let token = verifier.issue(&user).unwrap();
        let identity = verifier.verify(&token).await.unwrap();
        assert_eq!(identity.user_id, id);
        assert_eq!(identity.username, "alice");
    }

    #[tokio::test]
    async fn rejects_garbage_and_inactive_accounts() {
        let store = Arc::new(MemoryStore::new());
        let id = store.add_user("bob", Role::Bidder);
        let verifier = JwtVerifier::new(&settings(), store.clone());

        assert_eq!(
            verifier.verify("not-a-token").await.unwrap_err(),
            AuthError::Invalid
        );

        let user = store.user(id).await.unwrap();
        let token = verifier.issue(&user).unwrap();
        store.deactivate_user(id);
        assert_eq!(verifier.verify(&token).await.unwrap_err(), AuthError::Inactive);
    }

    #[test]
    fn locks_out_after_repeated_failures() {
        let throttle = FailureThrottle::new(&settings());
        let addr: IpAddr = "10.1.2.3".parse().unwrap();

        assert!(throttle.allows(addr));
        throttle.record_failure(addr);
        throttle.record_failure(addr);
        assert!(throttle.allows(addr));
        throttle.record_failure(addr);
        assert!(!throttle.allows(addr));

        // other addresses are unaffected
        assert!(throttle.allows("10.9.9.9".parse().unwrap()));
    }

    #[test]
    fn success_clears_failure_history() {
        let throttle = FailureThrottle::new(&settings());
        let addr: IpAddr = "10.1.2.3".parse().unwrap();
        throttle.record_failure(addr);
        throttle.record_failure(addr);
        throttle.record_success(addr);
        throttle.record_failure(addr);
        throttle.record_failure(addr);
        assert!(throttle.allows(addr));
    }
}
