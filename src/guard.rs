//! Authorization guard.
//!
//! Decisions are plain values computed per request. The guard never expands
//! wildcards (credentials carry literal scopes) and never re-checks mandatory
//! scopes; it only checks what the requested operation demands.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credential::Credential;

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// No usable credential was presented.
    Unauthenticated,
    /// The credential's expiry has passed.
    Expired,
    /// The credential lacks at least one required scope.
    MissingScopes,
}

impl DenyReason {
    /// Wire name of the reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Unauthenticated => "unauthenticated",
            DenyReason::Expired => "expired",
            DenyReason::MissingScopes => "missing_scopes",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scopes an operation demands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "scopes", rename_all = "snake_case")]
pub enum ScopeRequirement {
    /// Callable without a credential.
    Public,
    /// Any valid, unexpired credential.
    Authenticated,
    /// A credential granting every listed scope.
    Scopes(BTreeSet<String>),
}

impl ScopeRequirement {
    /// Requirement for an explicit scope list.
    pub fn scopes<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Scopes(scopes.into_iter().map(Into::into).collect())
    }

    /// The literal scopes demanded, if any.
    pub fn required_scopes(&self) -> BTreeSet<String> {
        match self {
            Self::Scopes(scopes) => scopes.clone(),
            Self::Public | Self::Authenticated => BTreeSet::new(),
        }
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationDecision {
    /// Allow or deny.
    pub allowed: bool,
    /// Denial reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    /// Scopes demanded but not granted.
    pub missing_scopes: BTreeSet<String>,
    /// Subject of the credential, when one was presented.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl AuthorizationDecision {
    fn allow(subject: Option<String>) -> Self {
        Self {
            allowed: true,
            reason: None,
            missing_scopes: BTreeSet::new(),
            subject,
        }
    }

    fn deny(reason: DenyReason, missing_scopes: BTreeSet<String>, subject: Option<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            missing_scopes,
            subject,
        }
    }

    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Caller-facing description of a denial.
    pub fn message(&self) -> String {
        match self.reason {
            None => "authorized".into(),
            Some(DenyReason::Unauthenticated) => "Authentication required".into(),
            Some(DenyReason::Expired) => "Credential expired".into(),
            Some(DenyReason::MissingScopes) => format!(
                "Missing required scopes: {}",
                self.missing_scopes
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

/// Check a credential against required scopes at the current time.
pub fn authorize(
    credential: Option<&Credential>,
    required: &BTreeSet<String>,
) -> AuthorizationDecision {
    authorize_at(credential, required, Utc::now())
}

/// Check a credential against required scopes at `now`.
pub fn authorize_at(
    credential: Option<&Credential>,
    required: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> AuthorizationDecision {
    let credential = match credential {
        Some(c) => c,
        None if required.is_empty() => return AuthorizationDecision::allow(None),
        None => {
            return AuthorizationDecision::deny(
                DenyReason::Unauthenticated,
                required.clone(),
                None,
            )
        }
    };
    let subject = Some(credential.subject.clone());

    if credential.is_expired_at(now) {
        return AuthorizationDecision::deny(DenyReason::Expired, BTreeSet::new(), subject);
    }

    let missing: BTreeSet<String> = required
        .difference(&credential.granted_scopes)
        .cloned()
        .collect();
    if !missing.is_empty() {
        return AuthorizationDecision::deny(DenyReason::MissingScopes, missing, subject);
    }

    AuthorizationDecision::allow(subject)
}

/// Check a credential against a tool requirement at the current time.
pub fn authorize_requirement(
    credential: Option<&Credential>,
    requirement: &ScopeRequirement,
) -> AuthorizationDecision {
    authorize_requirement_at(credential, requirement, Utc::now())
}

/// Check a credential against a tool requirement at `now`.
pub fn authorize_requirement_at(
    credential: Option<&Credential>,
    requirement: &ScopeRequirement,
    now: DateTime<Utc>,
) -> AuthorizationDecision {
    match requirement {
        ScopeRequirement::Public => {
            AuthorizationDecision::allow(credential.map(|c| c.subject.clone()))
        }
        ScopeRequirement::Authenticated if credential.is_none() => {
            AuthorizationDecision::deny(DenyReason::Unauthenticated, BTreeSet::new(), None)
        }
        ScopeRequirement::Authenticated => authorize_at(credential, &BTreeSet::new(), now),
        ScopeRequirement::Scopes(scopes) => authorize_at(credential, scopes, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn credential(scopes: &[&str], expires_in: TimeDelta) -> Credential {
        Credential {
            subject: "user123".into(),
            expires_at: Utc::now() + expires_in,
            issued_at: Some(Utc::now()),
            issuer: Some("https://auth.example.com".into()),
            audience: vec![],
            granted_scopes: set(scopes),
            correlation_id: "corr-1".into(),
        }
    }

    #[test]
    fn test_absent_credential() {
        assert!(authorize(None, &set(&[])).is_allowed());

        let decision = authorize(None, &set(&["tools:basic"]));
        assert!(!decision.is_allowed());
        assert_eq!(decision.reason, Some(DenyReason::Unauthenticated));
    }

    #[test]
    fn test_expired_credential_denied_even_without_scopes() {
        let cred = credential(&["tools:basic"], TimeDelta::seconds(-1));
        let decision = authorize(Some(&cred), &set(&[]));
        assert_eq!(decision.reason, Some(DenyReason::Expired));
        assert_eq!(decision.subject.as_deref(), Some("user123"));
    }

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let cred = credential(&[], TimeDelta::hours(1));
        let at_expiry = cred.expires_at;
        assert_eq!(
            authorize_at(Some(&cred), &set(&[]), at_expiry).reason,
            Some(DenyReason::Expired)
        );
        assert!(authorize_at(Some(&cred), &set(&[]), at_expiry - TimeDelta::seconds(1)).allowed);
    }

    #[test]
    fn test_ping_scenario_allowed() {
        let cred = credential(&["tools:basic", "profile", "email"], TimeDelta::hours(1));
        let decision = authorize(Some(&cred), &set(&["tools:basic"]));
        assert!(decision.is_allowed());
        assert!(decision.missing_scopes.is_empty());
    }

    #[test]
    fn test_missing_scope_scenario() {
        let cred = credential(&["tools:generation"], TimeDelta::hours(1));
        let decision = authorize(Some(&cred), &set(&["tools:ping"]));
        assert_eq!(decision.reason, Some(DenyReason::MissingScopes));
        assert_eq!(decision.missing_scopes, set(&["tools:ping"]));
        assert!(decision.message().contains("Missing required scopes"));
    }

    #[test]
    fn test_allow_iff_subset_over_all_combinations() {
        let universe = ["a:x", "a:y", "b:z"];
        let subsets: Vec<BTreeSet<String>> = (0..1u8 << universe.len())
            .map(|mask| {
                universe
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, s)| s.to_string())
                    .collect()
            })
            .collect();

        for granted in &subsets {
            let mut cred = credential(&[], TimeDelta::hours(1));
            cred.granted_scopes = granted.clone();
            for required in &subsets {
                let decision = authorize(Some(&cred), required);
                assert_eq!(decision.allowed, required.is_subset(granted));
                let expected: BTreeSet<String> = required.difference(granted).cloned().collect();
                assert_eq!(decision.missing_scopes, expected);
            }
        }
    }

    #[test]
    fn test_denial_names_exactly_the_dropped_scope() {
        let required = set(&["legendary:orchestrator", "tools:basic"]);
        let full = credential(&["legendary:orchestrator", "tools:basic"], TimeDelta::hours(1));
        assert!(authorize(Some(&full), &required).allowed);

        let partial = credential(&["tools:basic"], TimeDelta::hours(1));
        let decision = authorize(Some(&partial), &required);
        assert_eq!(decision.missing_scopes, set(&["legendary:orchestrator"]));
    }

    #[test]
    fn test_requirements() {
        let cred = credential(&["tools:basic"], TimeDelta::hours(1));

        assert!(authorize_requirement(None, &ScopeRequirement::Public).allowed);
        assert_eq!(
            authorize_requirement(None, &ScopeRequirement::Authenticated).reason,
            Some(DenyReason::Unauthenticated)
        );
        assert!(authorize_requirement(Some(&cred), &ScopeRequirement::Authenticated).allowed);
        assert!(
            authorize_requirement(Some(&cred), &ScopeRequirement::scopes(["tools:basic"])).allowed
        );
        assert!(
            !authorize_requirement(Some(&cred), &ScopeRequirement::scopes(["admin:full"])).allowed
        );
    }
}
