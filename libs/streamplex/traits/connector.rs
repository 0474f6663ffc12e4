//! Transport contract
//!
//! A [`Connector`] turns an [`Endpoint`] into a byte stream in three steps the
//! supervisor drives one at a time, so every lifecycle stage has its own
//! status and its own failure path:
//!
//! ```text
//! resolve(endpoint) ──> connect(addr) ──> secure(endpoint, tcp) ──> WebSocket handshake
//!    Resolving            Connecting          TlsHandshake              WsHandshake
//! ```
//!
//! Closing a stream is dropping it.

use crate::traits::{Result, StreamError};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::http::Uri;

/// The single streaming endpoint an engine talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: String,
    host: String,
    port: u16,
    path: String,
    tls: bool,
}

impl Endpoint {
    /// Parse a `ws://` or `wss://` URL
    ///
    /// The port defaults to 80 / 443 and the path to `/`.
    pub fn parse(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| StreamError::Configuration(format!("Invalid URL '{}': {}", url, e)))?;

        let tls = match uri.scheme_str() {
            Some("wss") => true,
            Some("ws") => false,
            other => {
                return Err(StreamError::Configuration(format!(
                    "Unsupported scheme {:?} in '{}', expected ws or wss",
                    other, url
                )))
            }
        };

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| StreamError::Configuration(format!("Missing host in '{}'", url)))?
            .to_string();

        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("/")
            .to_string();

        Ok(Self {
            url: url.to_string(),
            host,
            port,
            path,
            tls,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Request target including the query string
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Value for the `Host` header (port omitted when it is the scheme default)
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Opens byte streams to the endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connected but not yet secured stream
    type Tcp: Send + 'static;

    /// Stream the WebSocket protocol runs over
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// DNS resolution
    async fn resolve(&self, endpoint: &Endpoint) -> Result<SocketAddr>;

    /// Open the raw connection
    async fn connect(&self, addr: SocketAddr) -> Result<Self::Tcp>;

    /// Wrap the connection in TLS when the endpoint requires it
    async fn secure(&self, endpoint: &Endpoint, tcp: Self::Tcp) -> Result<Self::Stream>;
}
