//! TCP connector for the framed transport.

use crate::error::{IngestError, Result};
use crate::streaming::channel::{Duplex, DuplexConnector};
use crate::transport::framed::framed_duplex;
use async_trait::async_trait;
use tokio::net::TcpStream;

/// Opens one TCP connection per add operation
pub struct TcpConnector {
    default_endpoint: Option<String>,
}

impl TcpConnector {
    pub fn new(default_endpoint: Option<String>) -> Self {
        Self { default_endpoint }
    }
}

/// Accepts `host:port` and `tcp://host:port`.
pub fn parse_endpoint(endpoint: &str) -> Result<String> {
    let trimmed = endpoint.trim();
    let addr = match trimmed.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(IngestError::Config(format!(
                "Unsupported endpoint scheme {:?} in {}",
                scheme, endpoint
            )))
        }
        None => trimmed,
    };
    let addr = addr.trim_end_matches('/');
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(addr.to_string())
        }
        _ => Err(IngestError::Config(format!(
            "Endpoint must be host:port, got {:?}",
            endpoint
        ))),
    }
}

#[async_trait]
impl DuplexConnector for TcpConnector {
    async fn open(&self, endpoint: Option<&str>) -> Result<Duplex> {
        let endpoint = endpoint
            .or(self.default_endpoint.as_deref())
            .ok_or_else(|| IngestError::Config("No service endpoint configured".into()))?;
        let addr = parse_endpoint(endpoint)?;

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| IngestError::Transport(format!("Failed to connect to {}: {}", addr, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY on {}: {}", addr, e);
        }
        tracing::debug!("Connected to {}", addr);

        let (read_half, write_half) = stream.into_split();
        Ok(framed_duplex(read_half, write_half))
    }
}
