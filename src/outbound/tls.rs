use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

pub use tokio_openssl::SslStream as TlsStream;

use crate::{config::Ssl, error::Result};

pub struct TlsConnector {
    connector: SslConnector,
    sni: String,
    verify_hostname: bool,
}

impl TlsConnector {
    /// `host` is the relay host, used as SNI unless `ssl.sni` overrides it.
    pub fn new(host: &str, ssl: &Ssl) -> Result<TlsConnector> {
        let mut builder = SslConnector::builder(SslMethod::tls())?;

        if let Some(ciphers) = &ssl.ciphers {
            // TLS 1.3 suites are configured apart from the classic cipher list.
            let (suites, classic): (Vec<&str>, Vec<&str>) = ciphers
                .split(':')
                .filter(|c| !c.is_empty())
                .partition(|c| c.starts_with("TLS_"));
            if !classic.is_empty() {
                builder.set_cipher_list(&classic.join(":"))?;
            }
            if !suites.is_empty() {
                builder.set_ciphersuites(&suites.join(":"))?;
            }
        }

        if !ssl.alpn.is_empty() {
            builder.set_alpn_protos(&alpn_wire(&ssl.alpn))?;
        }

        if let Some(ca_file) = &ssl.ca_file {
            builder.set_ca_file(ca_file)?;
        }

        if !ssl.verify {
            builder.set_verify(SslVerifyMode::NONE);
        }

        Ok(TlsConnector {
            connector: builder.build(),
            sni: ssl.sni.clone().unwrap_or_else(|| host.to_string()),
            verify_hostname: ssl.verify_hostname,
        })
    }

    pub fn sni(&self) -> &str {
        &self.sni
    }

    /// Wraps a transport without starting the handshake.
    pub fn wrap<IO>(&self, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let mut config = self.connector.configure()?;
        // Chain verification may stay on while the identity check is skipped.
        config.set_verify_hostname(self.verify_hostname);
        let ssl = config.into_ssl(&self.sni)?;

        Ok(TlsStream::new(ssl, stream)?)
    }

    pub async fn handshake<IO>(stream: &mut TlsStream<IO>) -> Result<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        Pin::new(stream).connect().await?;
        Ok(())
    }

    pub async fn connect<IO>(&self, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = self.wrap(stream)?;
        Self::handshake(&mut stream).await?;
        Ok(stream)
    }
}

/// ALPN protocol list in wire format: each name prefixed by its length.
fn alpn_wire(protocols: &[String]) -> Vec<u8> {
    let mut wire = Vec::new();
    for p in protocols.iter().filter(|p| !p.is_empty() && p.len() <= 255) {
        wire.push(p.len() as u8);
        wire.extend_from_slice(p.as_bytes());
    }
    wire
}
