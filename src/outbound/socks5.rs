use async_trait::async_trait;
use futures::FutureExt;
use log::debug;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use super::{handshake, open_relay, Outbound};
use crate::{
    common::Address,
    error::{Result, TunnelError},
};

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const USER_PASS: u8 = 0x02;
const NO_ACCEPTABLE: u8 = 0xFF;
const USER_PASS_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Relay {
    pub host: String,
    pub port: u16,
    pub auth: Option<(String, String)>,
}

pub struct Socks5Outbound {
    config: Socks5Relay,
}

impl Socks5Outbound {
    pub fn new(config: Socks5Relay) -> Self {
        Socks5Outbound { config }
    }
}

#[async_trait]
impl Outbound for Socks5Outbound {
    type TcpStream = TcpStream;

    fn name(&self) -> &'static str {
        "socks5"
    }

    async fn tcp_connect(&self, target: &Address) -> Result<Self::TcpStream> {
        let auth = self.config.auth.clone();
        let target = target.clone();
        handshake(
            open_relay(&self.config.host, self.config.port),
            move |stream| negotiate(stream, auth, target).boxed(),
            "socks5",
        )
        .await
    }
}

fn refused(message: impl Into<String>) -> TunnelError {
    TunnelError::negotiation("socks5", message)
}

/// Client side of RFC 1928, with RFC 1929 username/password when `auth` is set.
pub async fn negotiate<S>(
    stream: &mut S,
    auth: Option<(String, String)>,
    target: Address,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let greeting: &[u8] = match auth {
        Some(_) => &[VERSION, 2, NO_AUTH, USER_PASS],
        None => &[VERSION, 1, NO_AUTH],
    };
    stream.write_all(greeting).await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION {
        return Err(refused(format!("unexpected version {}", choice[0])));
    }
    match (choice[1], &auth) {
        (NO_AUTH, _) => {}
        (USER_PASS, Some((username, password))) => {
            authenticate(stream, username, password).await?;
        }
        (NO_ACCEPTABLE, _) => return Err(refused("no acceptable auth method")),
        (method, _) => return Err(refused(format!("unexpected auth method {}", method))),
    }

    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    target.write_socks5(&mut request)?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(refused(format!("unexpected version {}", reply[0])));
    }
    if reply[1] != 0x00 {
        return Err(refused(reply_message(reply[1])));
    }

    // Bound address; not used by a CONNECT client.
    let remaining = match reply[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => stream.read_u8().await? as usize + 2,
        atyp => return Err(refused(format!("unknown address type {}", atyp))),
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;

    debug!("socks5 CONNECT {} accepted", target);
    Ok(())
}

async fn authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if username.len() > 255 || password.len() > 255 {
        return Err(refused("credentials longer than 255 bytes"));
    }
    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(USER_PASS_VERSION);
    request.push(username.len() as u8);
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[0] != USER_PASS_VERSION {
        return Err(refused(format!("unexpected auth version {}", status[0])));
    }
    if status[1] != 0x00 {
        return Err(refused("authentication rejected"));
    }
    Ok(())
}

fn reply_message(code: u8) -> String {
    let reason = match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply",
    };
    format!("{} ({:#04x})", reason, code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn serve(mut server: tokio::io::DuplexStream, expect_auth: bool, rep: u8) -> Vec<u8> {
        let mut greeting = [0u8; 2];
        server.read_exact(&mut greeting).await.unwrap();
        let mut methods = vec![0u8; greeting[1] as usize];
        server.read_exact(&mut methods).await.unwrap();

        if expect_auth {
            assert!(methods.contains(&USER_PASS));
            server.write_all(&[VERSION, USER_PASS]).await.unwrap();
            let mut head = [0u8; 2];
            server.read_exact(&mut head).await.unwrap();
            let mut user = vec![0u8; head[1] as usize];
            server.read_exact(&mut user).await.unwrap();
            let plen = server.read_u8().await.unwrap();
            let mut pass = vec![0u8; plen as usize];
            server.read_exact(&mut pass).await.unwrap();
            let ok = user == b"foo" && pass == b"bar";
            server
                .write_all(&[USER_PASS_VERSION, if ok { 0 } else { 1 }])
                .await
                .unwrap();
            if !ok {
                return Vec::new();
            }
        } else {
            server.write_all(&[VERSION, NO_AUTH]).await.unwrap();
        }

        let mut request = [0u8; 5];
        server.read_exact(&mut request).await.unwrap();
        let mut rest = vec![0u8; request[4] as usize + 2];
        server.read_exact(&mut rest).await.unwrap();
        server
            .write_all(&[VERSION, rep, 0, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        rest
    }

    #[tokio::test]
    async fn connect_without_auth() {
        let (mut client, server) = duplex(1024);
        let server = tokio::spawn(serve(server, false, 0));
        negotiate(&mut client, None, Address::new("example.com", 80))
            .await
            .unwrap();
        let rest = server.await.unwrap();
        assert_eq!(&rest[..11], b"example.com");
        assert_eq!(&rest[11..], &[0, 80]);
    }

    #[tokio::test]
    async fn connect_with_credentials() {
        let (mut client, server) = duplex(1024);
        let server = tokio::spawn(serve(server, true, 0));
        let auth = Some(("foo".to_string(), "bar".to_string()));
        negotiate(&mut client, auth, Address::new("example.com", 443))
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_credentials() {
        let (mut client, server) = duplex(1024);
        tokio::spawn(serve(server, true, 0));
        let auth = Some(("foo".to_string(), "wrong".to_string()));
        let err = negotiate(&mut client, auth, Address::new("example.com", 443))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "socks5 negotiation failed: authentication rejected");
    }

    #[tokio::test]
    async fn server_refuses_connect() {
        let (mut client, server) = duplex(1024);
        tokio::spawn(serve(server, false, 0x05));
        let err = negotiate(&mut client, None, Address::new("example.com", 80))
            .await
            .unwrap_err();
        assert_eq!(err.code().as_str(), "NEGOTIATION_FAILED");
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn auth_reply_version_is_checked() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[VERSION, USER_PASS]).await.unwrap();
            let mut auth = [0u8; 9];
            server.read_exact(&mut auth).await.unwrap();
            server.write_all(&[VERSION, 0x00]).await.unwrap();
        });

        let auth = Some(("foo".to_string(), "bar".to_string()));
        let err = negotiate(&mut client, auth, Address::new("example.com", 443))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "socks5 negotiation failed: unexpected auth version 5"
        );
    }
}
