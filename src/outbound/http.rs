use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::FutureExt;
use http::{
    header::{HOST, PROXY_AUTHORIZATION},
    Method, Request, StatusCode,
};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use super::{handshake, open_relay, tls::TlsConnector, Outbound};
use crate::{
    common::{Address, BoxTcpStream},
    config::Ssl,
    error::{Result, TunnelError},
};

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRelay {
    pub host: String,
    pub port: u16,
    pub auth: Option<(String, String)>,
    /// Set for `https` relays.
    pub ssl: Option<Ssl>,
}

pub struct HttpOutbound {
    config: HttpRelay,
    tls: Option<TlsConnector>,
}

impl HttpOutbound {
    pub fn new(config: HttpRelay) -> Result<Self> {
        let tls = match &config.ssl {
            Some(ssl) => Some(TlsConnector::new(&config.host, ssl)?),
            None => None,
        };
        Ok(HttpOutbound { config, tls })
    }
}

#[async_trait]
impl Outbound for HttpOutbound {
    type TcpStream = BoxTcpStream;

    fn name(&self) -> &'static str {
        match self.tls {
            Some(_) => "https",
            None => "http",
        }
    }

    async fn tcp_connect(&self, target: &Address) -> Result<Self::TcpStream> {
        let request = connect_request(target, self.config.auth.as_ref())?;

        handshake(
            async {
                let tcp = open_relay(&self.config.host, self.config.port).await?;
                match &self.tls {
                    Some(connector) => Ok(BoxTcpStream::boxed(connector.connect(tcp).await?)),
                    None => Ok(BoxTcpStream::boxed(tcp)),
                }
            },
            move |stream| {
                async move {
                    stream.write_all(&request).await?;
                    stream.flush().await?;
                    let status = read_response_head(stream).await?;
                    if status != StatusCode::OK {
                        return Err(refused(format!(
                            "relay answered {} {}",
                            status.as_u16(),
                            status.canonical_reason().unwrap_or("")
                        )));
                    }
                    Ok(())
                }
                .boxed()
            },
            self.name(),
        )
        .await
    }
}

fn refused(message: impl Into<String>) -> TunnelError {
    TunnelError::negotiation("http", message)
}

/// `CONNECT host:port HTTP/1.1` with a Host header and optional basic auth.
pub fn connect_request(target: &Address, auth: Option<&(String, String)>) -> Result<Vec<u8>> {
    let authority = target.to_string();
    let mut builder = Request::builder()
        .method(Method::CONNECT)
        .uri(authority.as_str())
        .header(HOST, authority.as_str());
    if let Some((username, password)) = auth {
        let token = STANDARD.encode(format!("{}:{}", username, password));
        builder = builder.header(PROXY_AUTHORIZATION, format!("Basic {}", token));
    }
    let request = builder
        .body(())
        .map_err(|e| refused(format!("bad CONNECT request: {}", e)))?;

    let mut head = format!("{} {} HTTP/1.1\r\n", request.method(), request.uri()).into_bytes();
    for (name, value) in request.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    Ok(head)
}

/// Reads the response head one byte at a time so no tunnel bytes are consumed.
pub async fn read_response_head<S>(stream: &mut S) -> Result<StatusCode>
where
    S: AsyncRead + Unpin + Send,
{
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(refused("response head too large"));
        }
        head.push(stream.read_u8().await?);
    }

    let status_line = head
        .split(|&b| b == b'\n')
        .next()
        .unwrap_or_default();
    let status_line = status_line.strip_suffix(b"\r").unwrap_or(status_line);
    let mut parts = status_line.split(|&b| b == b' ');
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with(b"HTTP/1.") => {
            let status = StatusCode::from_bytes(code)
                .map_err(|_| refused(format!("bad status {}", String::from_utf8_lossy(code))))?;
            debug!("http relay status {}", status);
            Ok(status)
        }
        _ => Err(refused(format!(
            "bad status line {:?}",
            String::from_utf8_lossy(status_line).trim_end()
        ))),
    }
}
