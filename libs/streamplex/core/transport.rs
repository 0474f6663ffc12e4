//! Default TCP/TLS connector

use crate::traits::{Connector, Endpoint, Result, StreamError};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_native_tls::native_tls;
use tokio_native_tls::TlsConnector;
use tokio_tungstenite::MaybeTlsStream;
use tracing::debug;

/// Plain TCP for `ws://`, native-tls for `wss://`
#[derive(Clone)]
pub struct TcpConnector {
    tls: TlsConnector,
}

impl TcpConnector {
    pub fn new() -> Result<Self> {
        let connector = native_tls::TlsConnector::new().map_err(|e| {
            StreamError::Configuration(format!("Failed to initialise TLS: {}", e))
        })?;
        Ok(Self {
            tls: TlsConnector::from(connector),
        })
    }
}

/// First IPv4 address if any, else the first address
fn prefer_ipv4(addrs: impl IntoIterator<Item = SocketAddr>) -> Option<SocketAddr> {
    let mut fallback = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback
}

#[async_trait]
impl Connector for TcpConnector {
    type Tcp = TcpStream;
    type Stream = MaybeTlsStream<TcpStream>;

    async fn resolve(&self, endpoint: &Endpoint) -> Result<SocketAddr> {
        let addrs = tokio::net::lookup_host((endpoint.host(), endpoint.port()))
            .await
            .map_err(|e| {
                StreamError::Transport(format!("DNS lookup for {} failed: {}", endpoint.host(), e))
            })?;

        let addr = prefer_ipv4(addrs).ok_or_else(|| {
            StreamError::Transport(format!("No addresses found for {}", endpoint.host()))
        })?;
        debug!("Resolved {} to {}", endpoint.host(), addr);
        Ok(addr)
    }

    async fn connect(&self, addr: SocketAddr) -> Result<Self::Tcp> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| StreamError::Transport(format!("Connect to {} failed: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn secure(&self, endpoint: &Endpoint, tcp: Self::Tcp) -> Result<Self::Stream> {
        if !endpoint.is_tls() {
            return Ok(MaybeTlsStream::Plain(tcp));
        }

        let stream = self.tls.connect(endpoint.host(), tcp).await.map_err(|e| {
            StreamError::Handshake(format!("TLS handshake with {} failed: {}", endpoint.host(), e))
        })?;
        Ok(MaybeTlsStream::NativeTls(stream))
    }
}
