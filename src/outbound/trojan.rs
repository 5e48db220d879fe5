use async_trait::async_trait;
use futures::FutureExt;
use log::{log_enabled, trace, Level};
use std::sync::Arc;
use tokio::{io::AsyncWriteExt, net::TcpStream};

use super::{handshake, open_relay, tls::TlsConnector, tls::TlsStream, Outbound};
use crate::{common::Address, error::Result};

pub mod header;

use self::header::HeaderCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanRelay {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub ssl: crate::config::Ssl,
}

pub struct TrojanOutbound {
    connector: TlsConnector,
    config: TrojanRelay,
    heads: Arc<HeaderCache>,
}

impl TrojanOutbound {
    pub fn new(config: TrojanRelay, heads: Arc<HeaderCache>) -> Result<Self> {
        let connector = TlsConnector::new(&config.host, &config.ssl)?;

        Ok(TrojanOutbound {
            connector,
            config,
            heads,
        })
    }
}

#[async_trait]
impl Outbound for TrojanOutbound {
    type TcpStream = TlsStream<TcpStream>;

    fn name(&self) -> &'static str {
        "trojan"
    }

    async fn tcp_connect(&self, target: &Address) -> Result<Self::TcpStream> {
        let head = self.heads.head(&self.config.password, target)?;

        if log_enabled!(Level::Trace) {
            trace!(
                "proxy {} through trojan {}:{} (sni {})",
                target,
                self.config.host,
                self.config.port,
                self.connector.sni()
            );
        }

        handshake(
            async {
                let tcp = open_relay(&self.config.host, self.config.port).await?;
                self.connector.wrap(tcp)
            },
            move |stream| {
                async move {
                    TlsConnector::handshake(stream).await?;
                    // write_all parks on a full send buffer until it drains.
                    stream.write_all(&head).await?;
                    stream.flush().await?;
                    Ok(())
                }
                .boxed()
            },
            "trojan",
        )
        .await
    }
}
