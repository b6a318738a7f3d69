//! `Connector` implementation that opens [`TcpChannel`]s.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, TcpSocket};

use chanpool_core::error::PoolError;
use chanpool_core::transport::{Channel, Connector};
use chanpool_core::Address;

use crate::channel::TcpChannel;

/// Socket options applied to every new channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "bool_true")]
    pub nodelay: bool,
    #[serde(default = "bool_true")]
    pub keepalive: bool,
}

fn bool_true() -> bool { true }

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: true,
        }
    }
}

/// Opens plain TCP channels. The pool applies the connect timeout.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpConfig,
}

impl TcpConnector {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &Address) -> Result<Arc<dyn Channel>, PoolError> {
        let candidates = lookup_host((address.host.as_str(), address.port))
            .await
            .map_err(|e| PoolError::connection(address, format!("lookup failed: {e}")))?;

        let mut last_err = None;
        for target in candidates {
            let socket = if target.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_keepalive(self.config.keepalive)?;

            match socket.connect(target).await {
                Ok(stream) => {
                    stream.set_nodelay(self.config.nodelay)?;
                    tracing::debug!(address = %address, peer = %target, "TCP connected");
                    return Ok(Arc::new(TcpChannel::from_stream(address.clone(), stream)));
                }
                Err(e) => {
                    tracing::debug!(address = %address, peer = %target, error = %e, "TCP connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) => PoolError::connection(address, e),
            None => PoolError::connection(address, "no addresses resolved"),
        })
    }
}
