//! HTTP transport.
//!
//! | Route | Access |
//! |-------|--------|
//! | `GET /health` | public |
//! | `POST /mcp` | per method, see [`crate::dispatcher`] |
//! | `GET /mcp/capabilities` | any valid credential |
//! | `GET /.well-known/oauth-protected-resource` | public |

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;

use crate::credential::{Credential, TokenValidator};
use crate::discovery::IssuerMetadata;
use crate::dispatcher::{Dispatcher, Outcome};
use crate::error::Result;
use crate::guard::{authorize_requirement, AuthorizationDecision, DenyReason, ScopeRequirement};

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Request dispatcher.
    pub dispatcher: Dispatcher,
    /// Bearer token validator. Without one every caller is anonymous.
    pub validator: Option<Arc<TokenValidator>>,
    /// Issuer metadata from startup discovery.
    pub metadata: Option<Arc<IssuerMetadata>>,
}

impl AppState {
    /// Create state without issuer metadata.
    pub fn new(dispatcher: Dispatcher, validator: Option<TokenValidator>) -> Self {
        Self {
            dispatcher,
            validator: validator.map(Arc::new),
            metadata: None,
        }
    }

    /// Attach discovered issuer metadata.
    pub fn with_metadata(mut self, metadata: Option<IssuerMetadata>) -> Self {
        self.metadata = metadata.map(Arc::new);
        self
    }

    fn credential(&self, headers: &HeaderMap) -> Option<Credential> {
        let validator = self.validator.as_ref()?;
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok());
        validator.from_authorization(authorization)
    }

    fn service_name(&self) -> &str {
        &self.dispatcher.registry().context().config.service_name
    }
}

/// Build the router with tracing and permissive CORS.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/mcp", post(mcp_handler))
        .route("/mcp/capabilities", get(capabilities_handler))
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `addr` and serve until ctrl-c.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_listener<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(address = %addr, "Starting HTTP server");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": state.service_name(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn mcp_handler(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    let credential = state.credential(&headers);
    let dispatched = state.dispatcher.dispatch(&body, credential.as_ref()).await;

    let missing = dispatched
        .response
        .as_ref()
        .and_then(|r| r.error.as_ref())
        .and_then(|e| e.data.as_ref())
        .and_then(|d| d.get("missing_scopes"))
        .and_then(|m| m.as_array())
        .filter(|m| !m.is_empty())
        .map(|m| {
            m.iter()
                .filter_map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        });

    let status = StatusCode::from_u16(dispatched.outcome.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = match dispatched.response {
        Some(body) => (status, Json(body)).into_response(),
        None => status.into_response(),
    };

    if let Outcome::Unauthorized(reason) = dispatched.outcome {
        if let Some(challenge) = challenge(&state, reason, missing.as_deref()) {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, challenge);
        }
    }
    response
}

async fn capabilities_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let credential = state.credential(&headers);
    let decision = authorize_requirement(credential.as_ref(), &ScopeRequirement::Authenticated);
    if !decision.is_allowed() {
        return denied(&state, &decision);
    }
    Json(state.dispatcher.capabilities()).into_response()
}

async fn protected_resource_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(metadata) = state.metadata.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "issuer metadata unavailable" })),
        )
            .into_response();
    };

    let context = state.dispatcher.registry().context();
    let scopes: Vec<&str> = context.catalog.scopes().map(|s| s.id.as_str()).collect();

    let mut body = json!({
        "resource": resource_url(context.config.public_url.as_ref(), &headers),
        "authorization_servers": [metadata.issuer],
        "scopes_supported": scopes,
        "bearer_methods_supported": ["header"],
        "resource_name": state.service_name(),
    });
    if let Some(project_id) = &context.config.issuer_project_id {
        body["issuer_project_id"] = json!(project_id);
    }
    Json(body).into_response()
}

// Without a configured public URL the resource is derived from the Host header.
fn resource_url(public_url: Option<&Url>, headers: &HeaderMap) -> String {
    if let Some(base) = public_url {
        let mut base = base.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        if let Ok(url) = base.join("mcp") {
            return url.to_string();
        }
    }
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{}/mcp", host)
}

fn denied(state: &AppState, decision: &AuthorizationDecision) -> Response {
    let reason = decision.reason.unwrap_or(DenyReason::Unauthenticated);
    let status = match reason {
        DenyReason::MissingScopes => StatusCode::FORBIDDEN,
        DenyReason::Unauthenticated | DenyReason::Expired => StatusCode::UNAUTHORIZED,
    };
    let mut response = (
        status,
        Json(json!({
            "error": decision.message(),
            "reason": reason,
            "missing_scopes": decision.missing_scopes,
        })),
    )
        .into_response();
    let missing = (!decision.missing_scopes.is_empty())
        .then(|| decision.missing_scopes.iter().cloned().collect::<Vec<_>>().join(" "));
    if let Some(challenge) = challenge(state, reason, missing.as_deref()) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, challenge);
    }
    response
}

fn challenge(state: &AppState, reason: DenyReason, scopes: Option<&str>) -> Option<HeaderValue> {
    let mut value = format!("Bearer realm=\"{}\"", state.service_name());
    match reason {
        DenyReason::Unauthenticated => {}
        DenyReason::Expired => value.push_str(", error=\"invalid_token\""),
        DenyReason::MissingScopes => value.push_str(", error=\"insufficient_scope\""),
    }
    if let Some(scopes) = scopes {
        value.push_str(&format!(", scope=\"{}\"", scopes));
    }
    if state.metadata.is_some() {
        value.push_str(", resource_metadata=\"/.well-known/oauth-protected-resource\"");
    }
    HeaderValue::from_str(&value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::NoopAnalytics;
    use crate::catalog::AccessCatalog;
    use crate::config::ServerConfig;
    use crate::credential::DevTokenIssuer;
    use crate::tools::{ToolContext, ToolRegistry};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeDelta;
    use serde_json::Value;
    use tower::ServiceExt;

    const SECRET: &[u8] = b"test_secret_for_unit_testing_only";

    fn state() -> AppState {
        state_with(ServerConfig::default())
    }

    fn state_with(config: ServerConfig) -> AppState {
        let catalog = Arc::new(AccessCatalog::builtin());
        let context = ToolContext::new(config, catalog, Arc::new(NoopAnalytics));
        let registry = ToolRegistry::with_defaults(context).unwrap();
        AppState::new(
            Dispatcher::new(Arc::new(registry)),
            Some(TokenValidator::hs256(SECRET)),
        )
    }

    fn token(scopes: &[&str], ttl: TimeDelta) -> String {
        DevTokenIssuer::new(SECRET, "https://issuer.test", Arc::new(AccessCatalog::builtin()))
            .issue_with_scopes("user123", scopes.iter().map(|s| s.to_string()), ttl)
            .unwrap()
    }

    fn rpc(body: Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn call(name: &str) -> Value {
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": name}})
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "legendary-mcp");
    }

    #[tokio::test]
    async fn test_tools_list_without_token() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let response = router(state()).oneshot(rpc(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["result"]["tools"].as_array().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_gated_call_without_token_is_401_with_challenge() {
        let response = router(state()).oneshot(rpc(call("ping"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
        assert!(challenge.starts_with("Bearer"));
        assert_eq!(json_body(response).await["error"]["code"], -32001);
    }

    #[tokio::test]
    async fn test_invalid_token_is_treated_as_absent() {
        let response = router(state())
            .oneshot(rpc(call("ping"), Some("garbage")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_expired_token_is_401() {
        let expired = token(&["tools:basic"], TimeDelta::minutes(-10));
        let response = router(state())
            .oneshot(rpc(call("ping"), Some(&expired)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
        assert!(challenge.contains("invalid_token"));
    }

    #[tokio::test]
    async fn test_missing_scope_is_403() {
        let t = token(&["tools:generation"], TimeDelta::hours(1));
        let response = router(state())
            .oneshot(rpc(call("diagnostics"), Some(&t)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
        assert!(challenge.contains("scope=\"tools:ping\""));
        let body = json_body(response).await;
        assert_eq!(body["error"]["data"]["missing_scopes"], json!(["tools:ping"]));
    }

    #[tokio::test]
    async fn test_authorized_ping() {
        let t = token(&["tools:basic", "profile", "email"], TimeDelta::hours(1));
        let response = router(state())
            .oneshot(rpc(call("ping"), Some(&t)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert!(body["result"]["content"][0]["text"].as_str().unwrap().contains("pong"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let request = Request::post("/mcp").body(Body::from("{oops")).unwrap();
        let response = router(state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_notification_is_accepted_without_body() {
        let body = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let response = router(state()).oneshot(rpc(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_capabilities_requires_credential() {
        let app = router(state());
        let response = app
            .clone()
            .oneshot(Request::get("/mcp/capabilities").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let t = token(&[], TimeDelta::hours(1));
        let request = Request::get("/mcp/capabilities")
            .header(header::AUTHORIZATION, format!("Bearer {}", t))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await["tools"].is_array());
    }

    #[tokio::test]
    async fn test_protected_resource_metadata() {
        let request = || {
            Request::get("/.well-known/oauth-protected-resource")
                .header(header::HOST, "mcp.example.com")
                .body(Body::empty())
                .unwrap()
        };

        let response = router(state()).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let app = router(state().with_metadata(Some(issuer_metadata())));
        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["resource"], "http://mcp.example.com/mcp");
        assert_eq!(body["authorization_servers"], json!(["https://auth.example.com/P2abc"]));
        assert!(body["scopes_supported"]
            .as_array()
            .unwrap()
            .contains(&json!("tools:ping")));
        assert!(body.get("issuer_project_id").is_none());
    }

    fn issuer_metadata() -> IssuerMetadata {
        IssuerMetadata {
            issuer: "https://auth.example.com/P2abc".into(),
            authorization_endpoint: None,
            token_endpoint: None,
            jwks_uri: None,
            scopes_supported: vec![],
        }
    }

    #[tokio::test]
    async fn test_protected_resource_uses_public_url_and_project_id() {
        let config = ServerConfig {
            issuer_project_id: Some("P2abc".into()),
            public_url: Some(Url::parse("https://mcp.example.com/api").unwrap()),
            ..Default::default()
        };
        let app = router(state_with(config).with_metadata(Some(issuer_metadata())));
        let request = Request::get("/.well-known/oauth-protected-resource")
            .header(header::HOST, "10.0.0.7:8080")
            .body(Body::empty())
            .unwrap();

        let body = json_body(app.oneshot(request).await.unwrap()).await;
        assert_eq!(body["resource"], "https://mcp.example.com/api/mcp");
        assert_eq!(body["issuer_project_id"], "P2abc");
    }
}
