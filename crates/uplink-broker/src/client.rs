//! HTTP client for the broker's assignment endpoint.

use crate::Assignment;
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Subdomain sentinel the broker interprets as "assign a new random one".
const NEW_SUBDOMAIN: &str = "?new";

/// Assignment fetch errors. All of these are fatal for the current tunnel
/// run; nothing here is retried.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid broker URL '{url}': {source}")]
    Url {
        url: String,
        source: url::ParseError,
    },

    #[error("broker request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("broker returned status {status}")]
    Status { status: reqwest::StatusCode },

    #[error("broker returned malformed assignment: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Source of tunnel endpoint assignments.
///
/// The pool consumes assignments through this trait so that tests can supply
/// canned ones without a broker on the network.
#[async_trait]
pub trait AssignmentSource: Send + Sync {
    /// Request an assignment for `subdomain`, or a new random subdomain when
    /// it is empty.
    async fn request(&self, subdomain: &str) -> Result<Assignment, BrokerError>;
}

/// HTTP/JSON client for the tunnel broker.
pub struct BrokerClient {
    server: String,
    remote_host: String,
    http: reqwest::Client,
}

impl BrokerClient {
    /// Create a client for the broker at `server` (a base URL such as
    /// `https://tunnel.example.com/`).
    pub fn new(server: &str) -> Result<Self, BrokerError> {
        let parsed = Url::parse(server).map_err(|source| BrokerError::Url {
            url: server.to_string(),
            source,
        })?;
        let remote_host = parsed.host_str().unwrap_or_default().to_string();

        Ok(Self {
            server: server.to_string(),
            remote_host,
            http: reqwest::Client::new(),
        })
    }

    /// Host every relay session dials, taken from the broker URL.
    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }
}

#[async_trait]
impl AssignmentSource for BrokerClient {
    async fn request(&self, subdomain: &str) -> Result<Assignment, BrokerError> {
        let subdomain = if subdomain.is_empty() {
            NEW_SUBDOMAIN
        } else {
            subdomain
        };
        // The broker routes on the raw suffix, so the endpoint is formed by
        // concatenation rather than URL joining.
        let endpoint = format!("{}{}", self.server, subdomain);
        debug!(endpoint = %endpoint, "requesting assignment");

        let response = self.http.get(&endpoint).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::Status { status });
        }

        let body = response.text().await?;
        debug!(body = %body, "assignment response");
        let assignment: Assignment = serde_json::from_str(&body)?;
        Ok(assignment)
    }
}
