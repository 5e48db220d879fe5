#![allow(dead_code)]

use async_trait::async_trait;
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    ssl::{SslAcceptor, SslMethod},
    x509::{
        extension::{BasicConstraints, SubjectAlternativeName},
        X509NameBuilder, X509,
    },
};
use relay_tunnel::{
    common::BoxTcpStream,
    resolver::{Answer, Blocklist, HostResolver, Lookup, RecordType, ResolverConfig},
};
use std::{
    io::Cursor,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

pub const BODY: &str = "hello from upstream";

/// Answers every request on a fresh socket with `BODY`.
pub async fn upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                if read_head(&mut socket).await.is_err() {
                    return;
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    BODY.len(),
                    BODY
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<String> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await?);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Sends a GET through the tunnel and returns the response body.
pub async fn http_get(mut stream: BoxTcpStream, host: &str) -> anyhow::Result<String> {
    let request = format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_head(&mut stream).await?;
    anyhow::ensure!(head.starts_with("HTTP/1.1 200"), "unexpected response {}", head);
    let length: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .ok_or_else(|| anyhow::anyhow!("no content length"))?
        .trim()
        .parse()?;

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    Ok(String::from_utf8(body)?)
}

/// Reads a SOCKS5-encoded address (ATYP, address, port) off the wire.
pub async fn read_socks5_addr<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<String> {
    let atyp = stream.read_u8().await?;
    let rest = match atyp {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => stream.read_u8().await? as usize + 2,
        _ => return Err(std::io::ErrorKind::InvalidData.into()),
    };
    let mut encoded = vec![atyp];
    if atyp == 0x03 {
        encoded.push((rest - 2) as u8);
    }
    let start = encoded.len();
    encoded.resize(start + rest, 0);
    stream.read_exact(&mut encoded[start..]).await?;

    use socks5_protocol::sync::FromIO;
    let address = socks5_protocol::Address::read_from(&mut Cursor::new(encoded))
        .map_err(|e| e.to_io_err())?;
    Ok(relay_tunnel::Address::from(address).to_string())
}

pub async fn unreachable_hook(_stream: BoxTcpStream) -> anyhow::Result<()> {
    panic!("hook must not run")
}

pub async fn noop_hook(_stream: BoxTcpStream) -> anyhow::Result<()> {
    Ok(())
}

/// Plain-DNS transport with a fixed answer that counts its queries.
pub struct StaticLookup {
    address: String,
    calls: AtomicUsize,
}

impl StaticLookup {
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(StaticLookup {
            address: address.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Lookup for StaticLookup {
    async fn query(&self, _host: &str) -> anyhow::Result<Vec<Answer>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Answer::new(RecordType::A, self.address.as_str(), 60)])
    }
}

pub fn resolver(lookup: Arc<StaticLookup>, blocklist: Blocklist) -> Arc<HostResolver> {
    Arc::new(HostResolver::new(ResolverConfig {
        dns: vec![lookup as Arc<dyn Lookup>],
        blocklist,
        ..ResolverConfig::default()
    }))
}

/// Counts how often the abort signal fires.
#[derive(Clone, Default)]
pub struct Aborts(Arc<AtomicUsize>);

impl Aborts {
    pub fn signal(&self) -> impl FnOnce() + Send + 'static {
        let count = self.0.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn self_signed(common_name: &str) -> (PKey<Private>, X509) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    let basic = BasicConstraints::new().critical().ca().build().unwrap();
    builder.append_extension(basic).unwrap();
    let san = SubjectAlternativeName::new()
        .dns(common_name)
        .build(&builder.x509v3_context(None, None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    (key, builder.build())
}

fn acceptor_for(key: &PKey<Private>, cert: &X509) -> SslAcceptor {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).unwrap();
    builder.set_private_key(key).unwrap();
    builder.set_certificate(cert).unwrap();
    builder.check_private_key().unwrap();
    builder.build()
}

pub fn acceptor(common_name: &str) -> SslAcceptor {
    let (key, cert) = self_signed(common_name);
    acceptor_for(&key, &cert)
}

/// Like [`acceptor`], also writing the certificate as a PEM trust anchor.
pub fn trusted_acceptor(common_name: &str) -> (SslAcceptor, PathBuf) {
    static NEXT: AtomicUsize = AtomicUsize::new(0);

    let (key, cert) = self_signed(common_name);
    let path = std::env::temp_dir().join(format!(
        "relay-tunnel-ca-{}-{}.pem",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::write(&path, cert.to_pem().unwrap()).unwrap();
    (acceptor_for(&key, &cert), path)
}
