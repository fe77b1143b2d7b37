//! Bearer credentials: verification and development issuance.
//!
//! Signature failures, malformed tokens and issuer/audience mismatches are
//! errors here; the transports turn them into an absent credential before the
//! guard sees the request. Expiry is not enforced at this layer; the guard
//! reports it as its own denial reason.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::catalog::AccessCatalog;
use crate::error::{Error, Result};

/// Clock skew tolerated for `nbf` / `iat` checks, in seconds.
const LEEWAY_SECS: u64 = 30;

/// A verified, time-bounded proof of identity and granted scopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credential {
    /// Subject identifier (`sub`).
    pub subject: String,
    /// Expiry (`exp`).
    pub expires_at: DateTime<Utc>,
    /// Issued-at (`iat`), when present.
    pub issued_at: Option<DateTime<Utc>>,
    /// Issuer (`iss`), when present.
    pub issuer: Option<String>,
    /// Audience values (`aud`).
    pub audience: Vec<String>,
    /// Literal scopes granted by the issuer.
    pub granted_scopes: BTreeSet<String>,
    /// Correlation id (`jti`, or generated).
    pub correlation_id: String,
}

impl Credential {
    /// Whether the credential carries a scope.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.granted_scopes.contains(scope)
    }

    /// Whether the credential is expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aud: Option<Audience>,
    /// OAuth space-separated scope string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scopes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    permissions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jti: Option<String>,
}

impl Claims {
    fn into_credential(self) -> Result<Credential> {
        let expires_at = timestamp(self.exp, "exp")?;
        let issued_at = self.iat.map(|iat| timestamp(iat, "iat")).transpose()?;

        let mut granted_scopes: BTreeSet<String> = self
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        granted_scopes.extend(self.scopes.into_iter().flatten());
        granted_scopes.extend(self.permissions.into_iter().flatten());

        let audience = match self.aud {
            Some(Audience::One(aud)) => vec![aud],
            Some(Audience::Many(auds)) => auds,
            None => Vec::new(),
        };

        Ok(Credential {
            subject: self.sub,
            expires_at,
            issued_at,
            issuer: self.iss,
            audience,
            granted_scopes,
            correlation_id: self.jti.unwrap_or_else(|| Uuid::new_v4().to_string()),
        })
    }
}

fn timestamp(secs: i64, claim: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::InvalidToken(format!("{} out of range", claim)))
}

/// Verifies bearer JWTs against a static key.
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    /// Validator for HS256 tokens signed with a shared secret.
    pub fn hs256(secret: &[u8]) -> Self {
        Self::with_key(DecodingKey::from_secret(secret), Algorithm::HS256)
    }

    /// Validator for RS256 tokens, given the issuer's public key PEM.
    pub fn rs256_pem(pem: &[u8]) -> Result<Self> {
        let key = DecodingKey::from_rsa_pem(pem)?;
        Ok(Self::with_key(key, Algorithm::RS256))
    }

    fn with_key(key: DecodingKey, alg: Algorithm) -> Self {
        let mut validation = Validation::new(alg);
        validation.leeway = LEEWAY_SECS;
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self { key, validation }
    }

    /// Require the given issuer.
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        let issuer: String = issuer.into();
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Require one of the given audiences. An empty list disables the check.
    pub fn with_audience(mut self, audience: &[String]) -> Self {
        if !audience.is_empty() {
            self.validation.set_audience(audience);
            self.validation.validate_aud = true;
        }
        self
    }

    /// Verify a raw token.
    pub fn validate(&self, token: &str) -> Result<Credential> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        data.claims.into_credential()
    }

    /// Resolve an `Authorization` header value to a credential.
    ///
    /// Anything that is not a valid bearer token yields `None`.
    pub fn from_authorization(&self, header: Option<&str>) -> Option<Credential> {
        let (scheme, token) = header?.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        match self.validate(token) {
            Ok(credential) => Some(credential),
            Err(e) => {
                debug!(reason = %e, "Rejected bearer token");
                None
            }
        }
    }
}

/// Mints HS256 tokens for development and manual testing.
pub struct DevTokenIssuer {
    key: EncodingKey,
    issuer: String,
    audience: Option<String>,
    catalog: Arc<AccessCatalog>,
}

impl DevTokenIssuer {
    /// Create an issuer signing with `secret`.
    pub fn new(secret: &[u8], issuer: impl Into<String>, catalog: Arc<AccessCatalog>) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            issuer: issuer.into(),
            audience: None,
            catalog,
        }
    }

    /// Stamp issued tokens with an audience.
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Issue a token carrying a role's expanded scopes plus the mandatory ones.
    pub fn issue_for_role(&self, subject: &str, role: &str, ttl: TimeDelta) -> Result<String> {
        let mut scopes = self.catalog.expand_role_named(role)?;
        scopes.extend(self.catalog.mandatory_scopes());
        self.issue_with_scopes(subject, scopes, ttl)
    }

    /// Issue a token carrying exactly `scopes`.
    pub fn issue_with_scopes(
        &self,
        subject: &str,
        scopes: impl IntoIterator<Item = String>,
        ttl: TimeDelta,
    ) -> Result<String> {
        let now = Utc::now();
        let scope = scopes.into_iter().collect::<Vec<_>>().join(" ");
        let claims = Claims {
            sub: subject.to_string(),
            exp: (now + ttl).timestamp(),
            iat: Some(now.timestamp()),
            iss: Some(self.issuer.clone()),
            aud: self.audience.clone().map(Audience::One),
            scope: Some(scope),
            scopes: None,
            permissions: None,
            jti: Some(Uuid::new_v4().to_string()),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.key)?)
    }
}
