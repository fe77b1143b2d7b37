//! Smoke test against a running HTTP deployment.
//!
//! The probe checks the authorization surface from outside: discovery is
//! reachable anonymously, gated calls are refused without a token, and with
//! a token the basic ping tool answers.

use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};

/// One probe check.
#[derive(Debug, Clone)]
pub struct ProbeCheck {
    /// Check name.
    pub name: &'static str,
    /// Whether it passed.
    pub passed: bool,
    /// What was observed.
    pub detail: String,
}

/// Result of a probe run.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    /// Checks in execution order.
    pub checks: Vec<ProbeCheck>,
}

impl ProbeReport {
    /// Whether every check passed.
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Failed checks.
    pub fn failures(&self) -> impl Iterator<Item = &ProbeCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }

    fn record(&mut self, name: &'static str, outcome: Result<String>) {
        let check = match outcome {
            Ok(detail) => ProbeCheck {
                name,
                passed: true,
                detail,
            },
            Err(e) => ProbeCheck {
                name,
                passed: false,
                detail: e.to_string(),
            },
        };
        debug!(check = name, passed = check.passed, detail = %check.detail, "Probe check");
        self.checks.push(check);
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for check in &self.checks {
            let mark = if check.passed { "PASS" } else { "FAIL" };
            writeln!(f, "[{}] {}: {}", mark, check.name, check.detail)?;
        }
        let passed = self.checks.iter().filter(|c| c.passed).count();
        write!(f, "{}/{} checks passed", passed, self.checks.len())
    }
}

/// HTTP probe client.
pub struct Probe {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl Probe {
    /// Probe the deployment at `base`. The token enables the authorized check.
    pub fn new(mut base: Url, token: Option<String>) -> Result<Self> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    /// Run every check and collect the report.
    pub async fn run(&self) -> ProbeReport {
        info!(target_url = %self.base, "Probing deployment");
        let mut report = ProbeReport::default();

        report.record("health", self.check_health().await);
        report.record("anonymous tools/list", self.check_anonymous_discovery().await);
        report.record(
            "anonymous ping refused",
            self.expect_status(self.post_mcp(ping_call(), None).await, StatusCode::UNAUTHORIZED),
        );
        report.record(
            "anonymous capabilities refused",
            self.expect_status(self.get("mcp/capabilities").await, StatusCode::UNAUTHORIZED),
        );
        if let Some(token) = &self.token {
            report.record("authorized ping", self.check_authorized_ping(token).await);
        }

        report
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Config(format!("probe URL: {}", e)))
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.endpoint(path)?;
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(e.to_string()))
    }

    async fn post_mcp(&self, body: Value, token: Option<&str>) -> Result<reqwest::Response> {
        let url = self.endpoint("mcp")?;
        let mut request = self.client.post(url).json(&body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(e.to_string()))
    }

    fn expect_status(
        &self,
        response: Result<reqwest::Response>,
        expected: StatusCode,
    ) -> Result<String> {
        let status = response?.status();
        if status == expected {
            Ok(format!("{}", status))
        } else {
            Err(Error::Protocol(format!("expected {}, got {}", expected, status)))
        }
    }

    async fn check_health(&self) -> Result<String> {
        let response = self.get("health").await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::Protocol(format!("expected 200, got {}", status)));
        }
        let body: Value = response.json().await?;
        match body.get("status").and_then(Value::as_str) {
            Some("healthy") => Ok(format!(
                "{} {}",
                body["service"].as_str().unwrap_or("?"),
                body["version"].as_str().unwrap_or("?")
            )),
            other => Err(Error::Protocol(format!("unexpected status field {:?}", other))),
        }
    }

    async fn check_anonymous_discovery(&self) -> Result<String> {
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let response = self.post_mcp(body, None).await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::Protocol(format!("expected 200, got {}", status)));
        }
        let body: Value = response.json().await?;
        let tools = body["result"]["tools"]
            .as_array()
            .ok_or_else(|| Error::Protocol("response has no tool list".into()))?;
        Ok(format!("{} tools listed", tools.len()))
    }

    async fn check_authorized_ping(&self, token: &str) -> Result<String> {
        let response = self.post_mcp(ping_call(), Some(token)).await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::Protocol(format!("expected 200, got {}", status)));
        }
        let body: Value = response.json().await?;
        let text = body["result"]["content"][0]["text"].as_str().unwrap_or_default();
        if text.contains("pong") {
            Ok("pong received".into())
        } else {
            Err(Error::Protocol(format!("unexpected ping result: {}", body)))
        }
    }
}

fn ping_call() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "tools/call",
        "params": { "name": "ping", "arguments": { "message": "probe" } }
    })
}
