//! Scope and role catalogs.
//!
//! The catalog is loaded once at startup and never mutated afterwards, so it
//! is shared as `Arc<AccessCatalog>` and read without locking. Role grants
//! are stored as written: wildcard grants (`tools:*`) are resolved against the
//! scope table every time a role is expanded, so adding a scope to a
//! namespace reaches every role holding that namespace's wildcard.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Suffix marking a namespace wildcard grant.
pub const WILDCARD_SUFFIX: &str = ":*";

/// A named permission unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Scope identifier, usually `category:action`.
    pub id: String,
    /// Human description.
    pub description: String,
    /// Owning category.
    pub category: String,
    /// Must be present in every credential issued to an authenticated principal.
    #[serde(default)]
    pub mandatory: bool,
}

impl Scope {
    fn new(id: &str, description: &str, category: &str) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            category: category.into(),
            mandatory: false,
        }
    }

    fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// A named bundle of scope grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role name.
    pub name: String,
    /// Human description.
    pub description: String,
    /// Scope identifiers or `namespace:*` wildcards, in declaration order.
    pub grants: Vec<String>,
}

impl Role {
    fn new(name: &str, description: &str, grants: &[&str]) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            grants: grants.iter().map(|g| g.to_string()).collect(),
        }
    }
}

/// A single entry of a role's grant list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant<'a> {
    /// Exactly one scope.
    Literal(&'a str),
    /// Every scope whose identifier starts with `<namespace>:`.
    Namespace(&'a str),
}

impl<'a> Grant<'a> {
    /// Parse a grant string.
    pub fn parse(grant: &'a str) -> Self {
        match grant.strip_suffix(WILDCARD_SUFFIX) {
            Some(namespace) => Grant::Namespace(namespace),
            None => Grant::Literal(grant),
        }
    }

    fn matches(&self, scope_id: &str) -> bool {
        match self {
            Grant::Literal(id) => *id == scope_id,
            Grant::Namespace(ns) => scope_id
                .strip_prefix(ns)
                .is_some_and(|rest| rest.starts_with(':')),
        }
    }
}

/// On-disk catalog shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    scopes: Vec<Scope>,
    roles: Vec<Role>,
}

/// Scope catalog plus role catalog.
#[derive(Debug, Clone)]
pub struct AccessCatalog {
    scopes: BTreeMap<String, Scope>,
    roles: BTreeMap<String, Role>,
}

impl AccessCatalog {
    /// Build and validate a catalog.
    pub fn new(scopes: Vec<Scope>, roles: Vec<Role>) -> Result<Self> {
        let mut scope_map = BTreeMap::new();
        for scope in scopes {
            if scope.id.is_empty() || scope.id.chars().any(char::is_whitespace) {
                return Err(Error::Catalog(format!("invalid scope id: {:?}", scope.id)));
            }
            if scope.id.ends_with(WILDCARD_SUFFIX) {
                return Err(Error::Catalog(format!(
                    "scope id may not be a wildcard: {}",
                    scope.id
                )));
            }
            if let Some(dup) = scope_map.insert(scope.id.clone(), scope) {
                return Err(Error::Catalog(format!("duplicate scope: {}", dup.id)));
            }
        }

        let mut role_map = BTreeMap::new();
        for mut role in roles {
            let mut seen = BTreeSet::new();
            role.grants.retain(|g| seen.insert(g.clone()));
            if let Some(dup) = role_map.insert(role.name.clone(), role) {
                return Err(Error::Catalog(format!("duplicate role: {}", dup.name)));
            }
        }

        let catalog = Self {
            scopes: scope_map,
            roles: role_map,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// The catalog shipped with the server.
    pub fn builtin() -> Self {
        let scopes = [
            Scope::new("openid", "OpenID Connect sign-in", "identity").mandatory(),
            Scope::new("profile", "Basic profile information", "identity"),
            Scope::new("email", "Email address", "identity"),
            Scope::new("tools:basic", "Basic tools such as ping", "tools"),
            Scope::new("tools:ping", "Server diagnostics", "tools"),
            Scope::new("tools:generation", "Code generation tools", "tools"),
            Scope::new("legendary:orchestrator", "Multi-agent orchestration", "legendary"),
            Scope::new("legendary:cloud_agent", "Cloud agent sessions", "legendary"),
            Scope::new("legendary:healing", "Self-healing diagnostics", "legendary"),
            Scope::new("legendary:architect", "Architecture generation", "legendary"),
            Scope::new("admin:full", "Full administrative access", "admin"),
        ];
        let roles = [
            Role::new("user", "Signed-in user", &["tools:basic", "profile", "email"]),
            Role::new("developer", "Developer with all tools", &["tools:*", "profile", "email"]),
            Role::new(
                "legendary",
                "Developer with orchestrator access",
                &["tools:*", "legendary:*", "profile", "email"],
            ),
            Role::new(
                "admin",
                "Administrator",
                &["admin:full", "tools:*", "legendary:*", "profile", "email"],
            ),
        ];

        Self {
            scopes: scopes.into_iter().map(|s| (s.id.clone(), s)).collect(),
            roles: roles.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    /// Parse a catalog from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json)?;
        Self::new(file.scopes, file.roles)
    }

    /// Load a catalog from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Serialize the catalog in the shape accepted by [`Self::from_json_str`].
    pub fn to_json_pretty(&self) -> Result<String> {
        let file = CatalogFile {
            scopes: self.scopes.values().cloned().collect(),
            roles: self.roles.values().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    /// Closed-world reference check over every role grant.
    pub fn validate(&self) -> Result<()> {
        for role in self.roles.values() {
            for grant in &role.grants {
                let parsed = Grant::parse(grant);
                if !self.scopes.keys().any(|id| parsed.matches(id)) {
                    return Err(Error::Catalog(format!(
                        "role {} grants unknown scope {}",
                        role.name, grant
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a scope by identifier.
    pub fn lookup_scope(&self, id: &str) -> Result<&Scope> {
        self.scopes
            .get(id)
            .ok_or_else(|| Error::ScopeNotFound(id.to_string()))
    }

    /// Look up a role by name.
    pub fn lookup_role(&self, name: &str) -> Result<&Role> {
        self.roles
            .get(name)
            .ok_or_else(|| Error::RoleNotFound(name.to_string()))
    }

    /// Whether the scope exists.
    pub fn contains_scope(&self, id: &str) -> bool {
        self.scopes.contains_key(id)
    }

    /// Resolve a role's grants, expanding wildcards against the current scopes.
    pub fn expand_role(&self, role: &Role) -> BTreeSet<String> {
        let grants: Vec<Grant<'_>> = role.grants.iter().map(|g| Grant::parse(g)).collect();
        self.scopes
            .keys()
            .filter(|id| grants.iter().any(|g| g.matches(id)))
            .cloned()
            .collect()
    }

    /// Expand a role by name.
    pub fn expand_role_named(&self, name: &str) -> Result<BTreeSet<String>> {
        Ok(self.expand_role(self.lookup_role(name)?))
    }

    /// Scopes every authenticated credential must carry.
    pub fn mandatory_scopes(&self) -> BTreeSet<String> {
        self.scopes
            .values()
            .filter(|s| s.mandatory)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Names of the roles entitled to a scope.
    pub fn roles_granting(&self, scope_id: &str) -> Vec<&str> {
        self.roles
            .values()
            .filter(|r| r.grants.iter().any(|g| Grant::parse(g).matches(scope_id)))
            .map(|r| r.name.as_str())
            .collect()
    }

    /// All scopes, ordered by identifier.
    pub fn scopes(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.values()
    }

    /// All roles, ordered by name.
    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.values()
    }
}

impl Default for AccessCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
