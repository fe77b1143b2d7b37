//! Issuer discovery metadata (`/.well-known/openid-configuration`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::error::{Error, Result};

const WELL_KNOWN_PATH: &str = ".well-known/openid-configuration";

/// Subset of the OpenID provider metadata the server republishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerMetadata {
    /// Issuer identifier.
    pub issuer: String,
    /// Authorization endpoint.
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    /// Token endpoint.
    #[serde(default)]
    pub token_endpoint: Option<String>,
    /// Key set location.
    #[serde(default)]
    pub jwks_uri: Option<String>,
    /// Scopes the issuer advertises.
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

/// Discovery document location for an issuer base URL.
pub fn discovery_url(issuer: &Url) -> Result<Url> {
    let mut base = issuer.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(WELL_KNOWN_PATH)
        .map_err(|e| Error::Config(format!("issuer URL: {}", e)))
}

/// Fetch the issuer's discovery document.
pub async fn fetch_metadata(issuer: &Url) -> Result<IssuerMetadata> {
    let url = discovery_url(issuer)?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| Error::UpstreamUnavailable(format!("{}: {}", url, e)))?;
    if !response.status().is_success() {
        return Err(Error::UpstreamUnavailable(format!(
            "{} returned {}",
            url,
            response.status()
        )));
    }

    let metadata: IssuerMetadata = response
        .json()
        .await
        .map_err(|e| Error::UpstreamUnavailable(format!("{}: malformed metadata: {}", url, e)))?;
    Ok(metadata)
}

/// Startup discovery: failures are logged and disable the dependent endpoint.
pub async fn discover(issuer: Option<&Url>) -> Option<IssuerMetadata> {
    let issuer = issuer?;
    match fetch_metadata(issuer).await {
        Ok(metadata) => {
            info!(issuer = %metadata.issuer, "Issuer discovery succeeded");
            Some(metadata)
        }
        Err(e) => {
            warn!(error = %e, "Issuer discovery failed, protected resource metadata disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_discovery_url_keeps_issuer_path() {
        let issuer = Url::parse("https://auth.example.com/P2abc").unwrap();
        assert_eq!(
            discovery_url(&issuer).unwrap().as_str(),
            "https://auth.example.com/P2abc/.well-known/openid-configuration"
        );
    }

    #[tokio::test]
    async fn test_metadata_fetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/P2abc/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": "https://auth.example.com/P2abc",
                "jwks_uri": "https://auth.example.com/P2abc/jwks",
                "scopes_supported": ["openid", "profile"]
            })))
            .mount(&server)
            .await;

        let issuer = Url::parse(&format!("{}/P2abc", server.uri())).unwrap();
        let metadata = fetch_metadata(&issuer).await.unwrap();
        assert_eq!(metadata.issuer, "https://auth.example.com/P2abc");
        assert_eq!(metadata.scopes_supported.len(), 2);
        assert!(metadata.token_endpoint.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_issuer_degrades() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let issuer = Url::parse(&server.uri()).unwrap();

        assert!(matches!(
            fetch_metadata(&issuer).await,
            Err(Error::UpstreamUnavailable(_))
        ));
        assert!(discover(Some(&issuer)).await.is_none());
        assert!(discover(None).await.is_none());
    }
}
