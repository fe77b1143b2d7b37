//! Usage events for the analytics gateway.
//!
//! Tracking is fire-and-forget: a slow or failing collector never affects
//! the request that produced the event.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::{GatewayConfig, ServerConfig};
use crate::error::{Error, Result};

/// Outcome recorded for a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    /// Handler returned a normal result.
    Success,
    /// Handler returned a result flagged as an error.
    ToolError,
    /// Handler failed, panicked or timed out.
    Failed,
}

/// One tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    /// Tool name.
    pub tool: String,
    /// Caller subject, if authenticated.
    pub subject: Option<String>,
    /// Invocation outcome.
    pub outcome: UsageOutcome,
    /// Request correlation id.
    pub correlation_id: String,
    /// Handler wall time.
    pub duration_ms: u64,
    /// When the invocation finished.
    pub timestamp: DateTime<Utc>,
}

/// Destination for usage events.
pub trait AnalyticsSink: Send + Sync {
    /// Record an event without waiting for delivery.
    fn track(&self, event: UsageEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAnalytics;

impl AnalyticsSink for NoopAnalytics {
    fn track(&self, event: UsageEvent) {
        debug!(tool = %event.tool, "Analytics disabled, dropping usage event");
    }
}

/// Posts events to the gateway collector.
#[derive(Clone)]
pub struct GatewayAnalytics {
    client: reqwest::Client,
    endpoint: Url,
    gateway_id: String,
    key: Option<String>,
}

impl GatewayAnalytics {
    /// Create a client for the configured gateway.
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let mut base = config.url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join("v1/events")
            .map_err(|e| Error::Config(format!("gateway URL: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent(concat!("legendary-mcp/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            endpoint,
            gateway_id: config.id.clone(),
            key: config.key.clone(),
        })
    }

    /// Deliver one event and wait for the collector's answer.
    pub async fn send(&self, event: &UsageEvent) -> Result<()> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header("X-Gateway-Id", &self.gateway_id)
            .json(event);
        if let Some(key) = &self.key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("analytics collector: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::UpstreamUnavailable(format!(
                "analytics collector returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

impl AnalyticsSink for GatewayAnalytics {
    fn track(&self, event: UsageEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(tool = %event.tool, "No runtime available, dropping usage event");
            return;
        };
        let sink = self.clone();
        runtime.spawn(async move {
            if let Err(e) = sink.send(&event).await {
                warn!(tool = %event.tool, error = %e, "Failed to deliver usage event");
            }
        });
    }
}

/// Pick the sink for a configuration, degrading to [`NoopAnalytics`].
pub fn sink_from_config(config: &ServerConfig) -> Arc<dyn AnalyticsSink> {
    match (&config.gateway, config.analytics_active()) {
        (Some(gateway), true) => match GatewayAnalytics::new(gateway) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!(error = %e, "Analytics gateway unusable, disabling analytics");
                Arc::new(NoopAnalytics)
            }
        },
        _ => Arc::new(NoopAnalytics),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Keeps events in memory for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingAnalytics {
        pub(crate) events: Mutex<Vec<UsageEvent>>,
    }

    impl AnalyticsSink for RecordingAnalytics {
        fn track(&self, event: UsageEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn event() -> UsageEvent {
        UsageEvent {
            tool: "ping".into(),
            subject: Some("user123".into()),
            outcome: UsageOutcome::Success,
            correlation_id: "corr-1".into(),
            duration_ms: 1,
            timestamp: Utc::now(),
        }
    }

    fn gateway(url: &str) -> GatewayConfig {
        GatewayConfig {
            url: Url::parse(url).unwrap(),
            id: "app-1".into(),
            key: Some("gw-key".into()),
        }
    }

    #[tokio::test]
    async fn test_event_posted_with_gateway_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest/v1/events"))
            .and(header("X-Gateway-Id", "app-1"))
            .and(header("Authorization", "Bearer gw-key"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink = GatewayAnalytics::new(&gateway(&format!("{}/ingest", server.uri()))).unwrap();
        tokio_test::assert_ok!(sink.send(&event()).await);
    }

    #[tokio::test]
    async fn test_collector_failure_is_upstream_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sink = GatewayAnalytics::new(&gateway(&server.uri())).unwrap();
        let err = sink.send(&event()).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable(_)));

        // Fire-and-forget path swallows the failure.
        sink.track(event());
    }

    #[test]
    fn test_sink_selection_degrades_to_noop() {
        let cfg = ServerConfig::default();
        // No gateway configured: nothing to send to, must not panic outside a runtime.
        sink_from_config(&cfg).track(event());
    }
}
