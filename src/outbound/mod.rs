use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use log::{debug, warn};
use std::{convert::TryFrom, fmt, future::Future, str::FromStr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::Instant,
};

use crate::{
    common::{Address, BoxTcpStream},
    config::RelayConfig,
    error::{Result, TunnelError},
    resolver::HostResolver,
    utils::{
        race::deadline_at,
        scoped::{bracket, Release},
    },
};

pub mod direct;
pub mod http;
pub mod shadowsocks;
pub mod socks5;
pub mod tls;
pub mod trojan;

use self::{
    http::{HttpOutbound, HttpRelay},
    shadowsocks::{CipherKind, ShadowsocksOutbound, ShadowsocksRelay},
    socks5::{Socks5Outbound, Socks5Relay},
    trojan::{header::HeaderCache, TrojanOutbound, TrojanRelay},
};

/// Deadline for opening a relay transport and finishing its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Outbound: Send + Sync {
    type TcpStream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn name(&self) -> &'static str;

    async fn tcp_connect(&self, target: &Address) -> Result<Self::TcpStream>;
}

pub(crate) async fn open_relay(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Runs a relay handshake as a scoped resource, with acquire and use sharing
/// one `HANDSHAKE_TIMEOUT` deadline.
pub(crate) async fn handshake<R, A, U>(acquire: A, use_step: U, context: &str) -> Result<R>
where
    R: Release,
    A: Future<Output = Result<R>>,
    U: for<'a> FnOnce(&'a mut R) -> BoxFuture<'a, Result<()>>,
{
    let expires = Instant::now() + HANDSHAKE_TIMEOUT;
    let timed_out = || TunnelError::ServerSocketTimeout(HANDSHAKE_TIMEOUT);

    bracket(
        async move { deadline_at(expires, acquire).await.unwrap_or_else(|| Err(timed_out())) },
        move |resource| {
            let step = use_step(resource);
            async move { deadline_at(expires, step).await.unwrap_or_else(|| Err(timed_out())) }.boxed()
        },
        context,
    )
    .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Socks5,
    Trojan,
    Shadowsocks,
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Socks5 => "socks5",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "ss",
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl FromStr for Protocol {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "socks5" => Ok(Protocol::Socks5),
            "trojan" => Ok(Protocol::Trojan),
            "ss" => Ok(Protocol::Shadowsocks),
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(TunnelError::UnsupportedProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relay with everything its protocol needs, checked once up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDescriptor {
    Socks5(Socks5Relay),
    Trojan(TrojanRelay),
    Shadowsocks(ShadowsocksRelay),
    /// Plain HTTP CONNECT, or over TLS when `ssl` is set.
    Http(HttpRelay),
}

impl RelayDescriptor {
    pub fn protocol(&self) -> Protocol {
        match self {
            RelayDescriptor::Socks5(_) => Protocol::Socks5,
            RelayDescriptor::Trojan(_) => Protocol::Trojan,
            RelayDescriptor::Shadowsocks(_) => Protocol::Shadowsocks,
            RelayDescriptor::Http(r) if r.ssl.is_some() => Protocol::Https,
            RelayDescriptor::Http(_) => Protocol::Http,
        }
    }
}

fn credentials(relay: &RelayConfig, protocol: Protocol) -> Result<Option<(String, String)>> {
    match (&relay.username, &relay.password) {
        (Some(username), Some(password)) => Ok(Some((username.clone(), password.clone()))),
        (None, None) => Ok(None),
        _ => Err(TunnelError::InvalidRelay(format!(
            "{} relay needs both username and password",
            protocol
        ))),
    }
}

fn required<'a>(field: &'a Option<String>, name: &str, protocol: Protocol) -> Result<&'a str> {
    field
        .as_deref()
        .ok_or_else(|| TunnelError::InvalidRelay(format!("{} relay needs a {}", protocol, name)))
}

impl TryFrom<&RelayConfig> for RelayDescriptor {
    type Error = TunnelError;

    fn try_from(relay: &RelayConfig) -> Result<Self> {
        let protocol: Protocol = relay.protocol.parse()?;
        if relay.host.is_empty() {
            return Err(TunnelError::InvalidRelay(format!("{} relay has no host", protocol)));
        }
        let (host, port) = (relay.host.clone(), relay.port);

        let descriptor = match protocol {
            Protocol::Socks5 => RelayDescriptor::Socks5(Socks5Relay {
                host,
                port,
                auth: credentials(relay, protocol)?,
            }),
            Protocol::Trojan => RelayDescriptor::Trojan(TrojanRelay {
                host,
                port,
                password: required(&relay.password, "password", protocol)?.to_string(),
                ssl: relay.ssl.clone(),
            }),
            Protocol::Shadowsocks => RelayDescriptor::Shadowsocks(ShadowsocksRelay {
                host,
                port,
                password: required(&relay.password, "password", protocol)?.to_string(),
                cipher: required(&relay.cipher, "cipher", protocol)?.parse::<CipherKind>()?,
            }),
            Protocol::Http | Protocol::Https => RelayDescriptor::Http(HttpRelay {
                host,
                port,
                auth: credentials(relay, protocol)?,
                ssl: (protocol == Protocol::Https).then(|| relay.ssl.clone()),
            }),
        };
        Ok(descriptor)
    }
}

/// Where a connection goes after resolution.
#[derive(Debug, Clone)]
pub enum Route {
    Origin,
    Relay(RelayConfig),
}

impl From<Option<RelayConfig>> for Route {
    fn from(relay: Option<RelayConfig>) -> Self {
        match relay {
            Some(relay) => Route::Relay(relay),
            None => Route::Origin,
        }
    }
}

/// Receives the established stream and pipes application data through it.
pub type Hook = Box<dyn FnOnce(BoxTcpStream) -> BoxFuture<'static, anyhow::Result<()>> + Send>;
/// Signals the inbound side that the attempt failed. Consumed on first use.
pub type Abort = Box<dyn FnOnce() + Send>;

/// One inbound connection attempt.
pub struct ConnectionContext {
    pub host: String,
    pub port: u16,
    pub hook: Hook,
    pub abort: Abort,
}

impl ConnectionContext {
    pub fn new<H, F, B>(host: impl Into<String>, port: u16, hook: H, abort: B) -> Self
    where
        H: FnOnce(BoxTcpStream) -> F + Send + 'static,
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
        B: FnOnce() + Send + 'static,
    {
        ConnectionContext {
            host: host.into(),
            port,
            hook: Box::new(move |stream| hook(stream).boxed()),
            abort: Box::new(abort),
        }
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

pub struct Dispatcher {
    resolver: Arc<HostResolver>,
    heads: Arc<HeaderCache>,
}

impl Dispatcher {
    pub fn new(resolver: Arc<HostResolver>) -> Self {
        Dispatcher {
            resolver,
            heads: Arc::new(HeaderCache::default()),
        }
    }

    pub fn resolver(&self) -> &HostResolver {
        &self.resolver
    }

    /// Opens the tunnel and hands it to the hook. Any failure, including one
    /// raised by the hook, calls `abort` once and is returned.
    pub async fn connect(&self, ctx: ConnectionContext, route: &Route) -> Result<()> {
        let ConnectionContext {
            host,
            port,
            hook,
            abort,
        } = ctx;

        let result = match self.open(&host, port, route).await {
            Ok(stream) => hook(stream).await.map_err(TunnelError::Hook),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!("Connection to {}:{} aborted: [{}] {}", host, port, e.code(), e);
            abort();
        }
        result
    }

    /// Resolves `host` and builds the stream for `route`.
    pub async fn open(&self, host: &str, port: u16, route: &Route) -> Result<BoxTcpStream> {
        let start = Instant::now();

        // Tags are checked before resolution so a bad relay touches no socket.
        let descriptor = match route {
            Route::Origin => None,
            Route::Relay(relay) => Some(RelayDescriptor::try_from(relay)?),
        };
        let label = descriptor
            .as_ref()
            .map_or("origin", |d| d.protocol().as_str());

        let address = self.resolver.resolve(host).await?;
        let target = Address::new(&address, port);

        let result = match descriptor {
            None => connect_origin(&address, port).await,
            Some(RelayDescriptor::Socks5(relay)) => tunnel(Socks5Outbound::new(relay), &target).await,
            Some(RelayDescriptor::Trojan(relay)) => {
                tunnel(TrojanOutbound::new(relay, self.heads.clone())?, &target).await
            }
            Some(RelayDescriptor::Shadowsocks(relay)) => {
                tunnel(ShadowsocksOutbound::new(relay), &target).await
            }
            Some(RelayDescriptor::Http(relay)) => tunnel(HttpOutbound::new(relay)?, &target).await,
        };

        let elapsed = start.elapsed().as_millis();
        match &result {
            Ok(_) => debug!("{} tunnel to {} established in {}ms", label, target, elapsed),
            Err(e) => debug!("{} tunnel to {} failed after {}ms: {}", label, target, elapsed, e),
        }
        result
    }
}

async fn connect_origin(host: &str, port: u16) -> Result<BoxTcpStream> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, direct::connect_origin(host, port)).await {
        Ok(stream) => Ok(BoxTcpStream::boxed(stream?)),
        Err(_) => Err(TunnelError::ServerSocketTimeout(HANDSHAKE_TIMEOUT)),
    }
}

async fn tunnel<O: Outbound>(outbound: O, target: &Address) -> Result<BoxTcpStream> {
    let stream = outbound.tcp_connect(target).await?;
    Ok(BoxTcpStream::boxed(stream))
}
