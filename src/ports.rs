//! Port registry client.
//!
//! When a central port registry is configured, `pmctl web` asks it which port
//! the dashboard should bind. The registry is optional: anything that goes
//! wrong falls back to the preferred port.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Environment variable holding the registry base URL.
pub const PORT_REGISTRY_ENV: &str = "PMCTL_PORT_REGISTRY";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const SERVICE_NAME: &str = "pmctl";

#[derive(Debug, Serialize)]
struct PortRequest<'a> {
    service: &'a str,
    project: &'a str,
    description: &'a str,
    preferred_port: u16,
}

#[derive(Debug, Deserialize)]
struct PortResponse {
    port: u16,
}

/// Registry URL from the config value or the environment.
pub fn registry_url(configured: Option<&str>) -> Option<String> {
    configured
        .map(str::to_string)
        .or_else(|| env::var(PORT_REGISTRY_ENV).ok())
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty())
}

/// Asks the registry for the dashboard port, falling back to `preferred`.
pub async fn resolve_port(registry: Option<&str>, preferred: u16) -> u16 {
    let Some(base) = registry else {
        return preferred;
    };
    match request_port(base, preferred).await {
        Some(port) if port != preferred => {
            info!(preferred, port, "port registry assigned a different port");
            port
        }
        Some(port) => port,
        None => preferred,
    }
}

async fn request_port(base: &str, preferred: u16) -> Option<u16> {
    let client = reqwest::Client::builder()
        .user_agent(format!("pmctl/{}", env!("CARGO_PKG_VERSION")))
        .timeout(REQUEST_TIMEOUT)
        .build()
        .ok()?;
    let body = PortRequest {
        service: SERVICE_NAME,
        project: SERVICE_NAME,
        description: "pmctl web dashboard",
        preferred_port: preferred,
    };
    let response = match client
        .post(format!("{}/ports/request", base))
        .json(&body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            debug!(registry = base, error = %err, "port registry unreachable");
            return None;
        }
    };
    if !response.status().is_success() {
        debug!(registry = base, status = %response.status(), "port registry refused request");
        return None;
    }
    let payload: PortResponse = response.json().await.ok()?;
    (payload.port != 0).then_some(payload.port)
}
