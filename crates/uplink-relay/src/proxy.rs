//! Remote dialing, optionally through an HTTP forward proxy.
//!
//! When a proxy is configured the dialer connects to the proxy instead of
//! the target, issues a `CONNECT host:port` request and, on a 200 response,
//! hands back the stream as a raw pass-through to the target.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use url::Url;

/// Largest CONNECT response head we are willing to read.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Errors from establishing one remote connection.
#[derive(Debug, Error)]
pub enum DialError {
    /// TCP connect to the remote endpoint (or to the proxy standing in front
    /// of it) failed.
    #[error("connect to {address} failed: {source}")]
    Remote { address: String, source: io::Error },

    /// The proxy answered the CONNECT request with a non-200 status. Carries
    /// the status line's reason phrase.
    #[error("proxy refused CONNECT: {0}")]
    ProxyRefused(String),

    /// The proxy's CONNECT response could not be read or parsed.
    #[error("unreadable proxy response: {0}")]
    ProxyResponse(String),
}

/// Forward proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    /// Parse a proxy URL such as `http://proxy.corp:3128`.
    pub fn parse(value: &str) -> Option<Self> {
        let url = Url::parse(value).ok()?;
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default()?;
        Some(Self { host, port })
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Dials remote endpoints, traversing the configured HTTP forward proxy via
/// CONNECT when there is one.
#[derive(Debug, Clone, Default)]
pub struct ProxyDialer {
    proxy: Option<ProxyConfig>,
}

impl ProxyDialer {
    pub fn new(proxy: Option<ProxyConfig>) -> Self {
        Self { proxy }
    }

    /// Resolve the proxy from `HTTP_PROXY`, falling back to the lowercase
    /// `http_proxy`. An unparseable value is ignored rather than
    /// half-applied.
    pub fn from_env() -> Self {
        let raw = std::env::var("HTTP_PROXY")
            .or_else(|_| std::env::var("http_proxy"))
            .ok();
        let proxy = match raw {
            Some(value) if !value.is_empty() => {
                let parsed = ProxyConfig::parse(&value);
                if parsed.is_none() {
                    warn!(proxy = %value, "ignoring unparseable HTTP_PROXY value");
                }
                parsed
            }
            _ => None,
        };
        Self::new(proxy)
    }

    /// The configured proxy, if any.
    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// Open a TCP connection to `host:port`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let target = format!("{}:{}", host, port);
        match &self.proxy {
            None => {
                let stream =
                    TcpStream::connect(&target)
                        .await
                        .map_err(|source| DialError::Remote {
                            address: target.clone(),
                            source,
                        })?;
                debug!(remote = %target, "connected");
                Ok(stream)
            }
            Some(proxy) => {
                let proxy_address = proxy.address();
                let mut stream = TcpStream::connect(&proxy_address).await.map_err(|source| {
                    DialError::Remote {
                        address: proxy_address.clone(),
                        source,
                    }
                })?;
                connect_handshake(&mut stream, &target).await?;
                debug!(remote = %target, proxy = %proxy_address, "connected through proxy");
                Ok(stream)
            }
        }
    }
}

/// Send the CONNECT request and consume exactly the response head.
async fn connect_handshake(stream: &mut TcpStream, target: &str) -> Result<(), DialError> {
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| DialError::ProxyResponse(e.to_string()))?;

    let head = read_response_head(stream).await?;

    let mut headers = [httparse::EMPTY_HEADER; 16];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {
            let status = response.code.unwrap_or(0);
            if status == 200 {
                Ok(())
            } else {
                let reason = response.reason.unwrap_or("").to_string();
                Err(DialError::ProxyRefused(reason))
            }
        }
        Ok(httparse::Status::Partial) => {
            Err(DialError::ProxyResponse("truncated response head".into()))
        }
        Err(e) => Err(DialError::ProxyResponse(e.to_string())),
    }
}

/// Read up to and including the blank line terminating the response head.
///
/// Reads one byte at a time so that no tunnel byte arriving after a 200 is
/// swallowed with the head.
async fn read_response_head(stream: &mut TcpStream) -> Result<Vec<u8>, DialError> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(DialError::ProxyResponse("response head too large".into()));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| DialError::ProxyResponse(e.to_string()))?;
        if n == 0 {
            return Err(DialError::ProxyResponse(
                "connection closed before response head".into(),
            ));
        }
        head.push(byte[0]);
    }
    Ok(head)
}
