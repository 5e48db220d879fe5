use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
};
use socks5_protocol::sync::FromIO;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub trait AsyncTcp: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncTcp for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A live bidirectional stream handed to the hook.
pub struct BoxTcpStream(Box<dyn AsyncTcp + 'static>);

impl BoxTcpStream {
    pub fn boxed(tcp: impl AsyncTcp + 'static) -> Self {
        BoxTcpStream(Box::new(tcp))
    }
}

impl fmt::Debug for BoxTcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoxTcpStream")
    }
}

impl AsyncRead for BoxTcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for BoxTcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.0).poll_shutdown(cx)
    }
}

/// Destination of a tunnel: an IP literal or a name the relay resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Domain(String, u16),
    SocketAddr(SocketAddr),
}

impl Address {
    pub fn new(host: &str, port: u16) -> Self {
        // Bracketed v6 literals come from URL-shaped input.
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        match bare.parse::<IpAddr>() {
            Ok(ip) => Address::SocketAddr(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    pub fn to_socks5_addr(&self) -> socks5_protocol::Address {
        match self {
            Address::Domain(domain, port) => socks5_protocol::Address::Domain(domain.clone(), *port),
            Address::SocketAddr(s) => socks5_protocol::Address::SocketAddr(*s),
        }
    }

    /// SOCKS5 wire encoding: address type, address bytes, big-endian port.
    pub fn write_socks5(&self, dst: &mut Vec<u8>) -> io::Result<()> {
        if let Address::Domain(domain, _) = self {
            if domain.len() > u8::MAX as usize {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("domain too long: {}", domain.len()),
                ));
            }
        }
        self.to_socks5_addr()
            .write_to(dst)
            .map_err(|e| e.to_io_err())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
            Address::SocketAddr(s) => write!(f, "{}", s),
        }
    }
}

impl From<socks5_protocol::Address> for Address {
    fn from(addr: socks5_protocol::Address) -> Self {
        match addr {
            socks5_protocol::Address::SocketAddr(s) => Address::SocketAddr(s),
            socks5_protocol::Address::Domain(d, p) => Address::Domain(d, p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_literals_become_socket_addrs() {
        assert_eq!(
            Address::new("127.0.0.1", 80),
            Address::SocketAddr("127.0.0.1:80".parse().unwrap())
        );
        assert_eq!(
            Address::new("[::1]", 443),
            Address::SocketAddr("[::1]:443".parse().unwrap())
        );
        assert_eq!(
            Address::new("example.com", 443),
            Address::Domain("example.com".into(), 443)
        );
    }

    #[test]
    fn socks5_encoding() {
        let mut buf = Vec::new();
        Address::new("1.2.3.4", 0x1f90).write_socks5(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 1, 2, 3, 4, 0x1f, 0x90]);

        let mut buf = Vec::new();
        Address::new("a.io", 80).write_socks5(&mut buf).unwrap();
        assert_eq!(buf, [0x03, 4, b'a', b'.', b'i', b'o', 0, 80]);
    }
}
