//! Server configuration from the environment.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

/// Default per-request handler timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FeatureFlags {
    /// Whether the self-healing tool performs its (placeholder) diagnosis.
    pub healing_enabled: bool,
    /// Whether usage events are sent to the gateway.
    pub analytics_enabled: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            healing_enabled: true,
            analytics_enabled: true,
        }
    }
}

/// How bearer tokens are verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningKey {
    /// HS256 shared secret.
    Secret(String),
    /// RS256 public key PEM on disk.
    PemFile(PathBuf),
}

/// Analytics gateway coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Collector base URL.
    pub url: Url,
    /// Gateway application identifier.
    pub id: String,
    /// Gateway API key.
    pub key: Option<String>,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Service name reported by `/health` and `initialize`.
    pub service_name: String,
    /// Issuer project identifier.
    pub issuer_project_id: Option<String>,
    /// Issuer base URL, used for discovery and `iss` checks.
    pub issuer_url: Option<Url>,
    /// Accepted audiences. Defaults to the project id.
    pub audience: Vec<String>,
    /// Token verification key, if any.
    pub signing_key: Option<SigningKey>,
    /// Analytics gateway.
    pub gateway: Option<GatewayConfig>,
    /// Feature flags.
    pub features: FeatureFlags,
    /// Upper bound on agents accepted by the orchestrator tool.
    pub max_agents: usize,
    /// Per-request handler timeout.
    pub request_timeout: Duration,
    /// Optional catalog file replacing the built-in catalog.
    pub catalog_file: Option<PathBuf>,
    /// Externally visible base URL, used as the protected resource identifier.
    pub public_url: Option<Url>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service_name: "legendary-mcp".into(),
            issuer_project_id: None,
            issuer_url: None,
            audience: Vec::new(),
            signing_key: None,
            gateway: None,
            features: FeatureFlags::default(),
            max_agents: 5,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            catalog_file: None,
            public_url: None,
        }
    }
}

impl ServerConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        if let Some(v) = get("MCP_SERVICE_NAME") {
            cfg.service_name = v;
        }
        cfg.issuer_project_id = get("MCP_ISSUER_PROJECT_ID");

        if let Some(v) = get("MCP_ISSUER_URL") {
            cfg.issuer_url = Some(parse_url("MCP_ISSUER_URL", &v)?);
        }

        cfg.audience = match get("MCP_AUDIENCE") {
            Some(v) => v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => cfg.issuer_project_id.iter().cloned().collect(),
        };

        cfg.signing_key = match (get("MCP_SIGNING_KEY_FILE"), get("MCP_SIGNING_SECRET")) {
            (Some(path), _) => Some(SigningKey::PemFile(path.into())),
            (None, Some(secret)) => Some(SigningKey::Secret(secret)),
            (None, None) => None,
        };

        if let Some(v) = get("MCP_GATEWAY_URL") {
            let id = get("MCP_GATEWAY_ID").ok_or_else(|| {
                Error::Config("MCP_GATEWAY_ID is required when MCP_GATEWAY_URL is set".into())
            })?;
            cfg.gateway = Some(GatewayConfig {
                url: parse_url("MCP_GATEWAY_URL", &v)?,
                id,
                key: get("MCP_GATEWAY_KEY"),
            });
        }

        if let Some(v) = get("MCP_HEALING_ENABLED") {
            cfg.features.healing_enabled = parse_bool("MCP_HEALING_ENABLED", &v)?;
        }
        if let Some(v) = get("MCP_ANALYTICS_ENABLED") {
            cfg.features.analytics_enabled = parse_bool("MCP_ANALYTICS_ENABLED", &v)?;
        }
        if let Some(v) = get("MCP_MAX_AGENTS") {
            cfg.max_agents = parse_num("MCP_MAX_AGENTS", &v)?;
            if cfg.max_agents == 0 {
                return Err(Error::Config("MCP_MAX_AGENTS must be at least 1".into()));
            }
        }
        if let Some(v) = get("MCP_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = parse_num("MCP_REQUEST_TIMEOUT_SECS", &v)?;
            if secs == 0 {
                return Err(Error::Config("MCP_REQUEST_TIMEOUT_SECS must be at least 1".into()));
            }
            cfg.request_timeout = Duration::from_secs(secs);
        }
        cfg.catalog_file = get("MCP_CATALOG_FILE").map(PathBuf::from);
        if let Some(v) = get("MCP_PUBLIC_URL") {
            cfg.public_url = Some(parse_url("MCP_PUBLIC_URL", &v)?);
        }

        Ok(cfg)
    }

    /// Whether usage events should be sent.
    pub fn analytics_active(&self) -> bool {
        self.features.analytics_enabled && self.gateway.is_some()
    }
}

fn parse_url(key: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| Error::Config(format!("{}: invalid URL {:?}: {}", key, value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{}: expected a boolean, got {:?}", key, value))),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{}: expected a number, got {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.service_name, "legendary-mcp");
        assert_eq!(cfg.max_agents, 5);
        assert_eq!(cfg.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(cfg.features.healing_enabled);
        assert!(cfg.signing_key.is_none());
        assert!(!cfg.analytics_active());
    }

    #[test]
    fn test_full_environment() {
        let cfg = load(&[
            ("MCP_ISSUER_PROJECT_ID", "P2abc"),
            ("MCP_ISSUER_URL", "https://auth.example.com/P2abc"),
            ("MCP_SIGNING_SECRET", "s3cret"),
            ("MCP_GATEWAY_URL", "https://collector.example.com"),
            ("MCP_GATEWAY_ID", "app-1"),
            ("MCP_GATEWAY_KEY", "k"),
            ("MCP_HEALING_ENABLED", "false"),
            ("MCP_MAX_AGENTS", "12"),
            ("MCP_REQUEST_TIMEOUT_SECS", "3"),
        ])
        .unwrap();

        assert_eq!(cfg.audience, vec!["P2abc".to_string()]);
        assert_eq!(cfg.signing_key, Some(SigningKey::Secret("s3cret".into())));
        assert!(!cfg.features.healing_enabled);
        assert!(cfg.analytics_active());
        assert_eq!(cfg.max_agents, 12);
        assert_eq!(cfg.request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_public_url() {
        let cfg = load(&[("MCP_PUBLIC_URL", "https://mcp.example.com/api")]).unwrap();
        assert_eq!(cfg.public_url.unwrap().as_str(), "https://mcp.example.com/api");
        assert!(load(&[("MCP_PUBLIC_URL", "mcp.example.com")]).is_err());
    }

    #[test]
    fn test_key_file_wins_over_secret() {
        let cfg = load(&[
            ("MCP_SIGNING_SECRET", "s3cret"),
            ("MCP_SIGNING_KEY_FILE", "/etc/keys/issuer.pem"),
        ])
        .unwrap();
        assert_eq!(
            cfg.signing_key,
            Some(SigningKey::PemFile("/etc/keys/issuer.pem".into()))
        );
    }

    #[test]
    fn test_explicit_audience_list() {
        let cfg = load(&[("MCP_ISSUER_PROJECT_ID", "P2abc"), ("MCP_AUDIENCE", "a, b,,")]).unwrap();
        assert_eq!(cfg.audience, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(load(&[("MCP_MAX_AGENTS", "many")]).is_err());
        assert!(load(&[("MCP_MAX_AGENTS", "0")]).is_err());
        assert!(load(&[("MCP_HEALING_ENABLED", "perhaps")]).is_err());
        assert!(load(&[("MCP_ISSUER_URL", "not a url")]).is_err());
        assert!(load(&[("MCP_GATEWAY_URL", "https://collector.example.com")]).is_err());
    }

    #[test]
    fn test_analytics_flag_disables_gateway() {
        let cfg = load(&[
            ("MCP_GATEWAY_URL", "https://collector.example.com"),
            ("MCP_GATEWAY_ID", "app-1"),
            ("MCP_ANALYTICS_ENABLED", "off"),
        ])
        .unwrap();
        assert!(cfg.gateway.is_some());
        assert!(!cfg.analytics_active());
    }
}
