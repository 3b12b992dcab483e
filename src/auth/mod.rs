//! Auth tokens
//!
//! Bearer tokens are JWTs signed with HMAC-SHA-256. The subject claim binds
//! the token to one action on one stream (`"PUSH:<stream>"` or
//! `"PULL:<stream>"`) and the expiry claim bounds its lifetime to one hour.
//! An empty secret disables validation for that action, which is the
//! explicit opt-out for single-tenant deployments.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Action name used in PULL token subjects
pub const ACTION_PULL: &str = "PULL";

/// Action name used in PUSH token subjects
pub const ACTION_PUSH: &str = "PUSH";

/// Token lifetime in seconds (1 hour)
const TOKEN_EXPIRY_SECONDS: u64 = 3600;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: u64,
}

fn now_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Signs an auth token binding (action, stream ID), expiring in one hour
pub fn sign_auth_token(
    secret: &str,
    action: &str,
    stream_id: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: format!("{}:{}", action, stream_id),
        exp: now_unix_seconds() + TOKEN_EXPIRY_SECONDS,
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Validates an auth token against (secret, action, stream ID)
///
/// Rejects expired tokens, wrong subjects, and tokens signed with a
/// different secret or a non-HMAC algorithm.
pub fn validate_auth_token(token: &str, secret: &str, action: &str, stream_id: &str) -> bool {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp", "sub"]);

    let decoded = match jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => data,
        Err(_) => return false,
    };

    decoded.claims.sub == format!("{}:{}", action, stream_id)
}

/// Auth configuration
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Secret for pull tokens; empty disables pull validation
    pub pull_secret: String,

    /// Secret for push tokens; empty disables push validation
    pub push_secret: String,

    /// Whether this node accepts publishers at all
    pub allow_push: bool,
}

/// Validates and signs tokens for one node
///
/// This is the only auth surface the rest of the crate consumes: three
/// predicates plus a pull-token signer used when dialing upstream nodes.
#[derive(Debug)]
pub struct Authenticator {
    config: AuthConfig,
}

impl Authenticator {
    /// Create an authenticator, warning about disabled validation
    pub fn new(config: AuthConfig) -> Self {
        if config.pull_secret.is_empty() {
            tracing::warn!("PULL_SECRET is empty; authentication is disabled for pulling streams");
        }

        if config.push_secret.is_empty() {
            tracing::warn!("PUSH_SECRET is empty; authentication is disabled for pushing streams");
        }

        Self { config }
    }

    /// Whether this node accepts PUSH at all
    pub fn is_push_allowed(&self) -> bool {
        self.config.allow_push
    }

    /// Validate a PULL token for a stream
    pub fn validate_pull_token(&self, token: &str, stream_id: &str) -> bool {
        if self.config.pull_secret.is_empty() {
            return true;
        }

        validate_auth_token(token, &self.config.pull_secret, ACTION_PULL, stream_id)
    }

    /// Validate a PUSH token for a stream
    pub fn validate_push_token(&self, token: &str, stream_id: &str) -> bool {
        if self.config.push_secret.is_empty() {
            return true;
        }

        validate_auth_token(token, &self.config.push_secret, ACTION_PUSH, stream_id)
    }

    /// Create a PULL token for dialing another node
    pub fn create_pull_token(&self, stream_id: &str) -> String {
        if self.config.pull_secret.is_empty() {
            return String::new();
        }

        match sign_auth_token(&self.config.pull_secret, ACTION_PULL, stream_id) {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(error = %e, "Error signing pull token");
                String::new()
            }
        }
    }
}
