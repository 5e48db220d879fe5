use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes128Gcm, Aes256Gcm,
};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use futures::FutureExt;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use rand::RngCore;
use sha1::Sha1;
use std::{
    fmt, io,
    pin::Pin,
    str::FromStr,
    task::{ready, Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};

use super::{handshake, open_relay, Outbound};
use crate::{
    common::Address,
    error::{Result, TunnelError},
};

const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const MAX_PAYLOAD: usize = 0x3FFF;
const SUBKEY_INFO: &[u8] = b"ss-subkey";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    pub fn salt_len(&self) -> usize {
        self.key_len()
    }
}

impl FromStr for CipherKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-gcm" | "aead_aes_128_gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" | "aead_aes_256_gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "aead_chacha20_poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            _ => Err(TunnelError::InvalidRelay(format!(
                "unsupported shadowsocks cipher {}",
                s
            ))),
        }
    }
}

/// OpenSSL `EVP_BytesToKey` with MD5 and no salt.
pub fn evp_bytes_to_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password.as_bytes());
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

fn session_key(master: &[u8], salt: &[u8]) -> io::Result<Vec<u8>> {
    let mut subkey = vec![0u8; master.len()];
    Hkdf::<Sha1>::new(Some(salt), master)
        .expand(SUBKEY_INFO, &mut subkey)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    Ok(subkey)
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

enum Cipher {
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

/// One direction of an AEAD session; the nonce is a little-endian counter.
struct AeadCipher {
    cipher: Cipher,
    nonce: u64,
}

impl AeadCipher {
    fn new(kind: CipherKind, key: &[u8]) -> io::Result<Self> {
        let bad_key = |_| io::Error::new(io::ErrorKind::InvalidInput, "bad key length");
        let cipher = match kind {
            CipherKind::Aes128Gcm => Cipher::Aes128Gcm(Aes128Gcm::new_from_slice(key).map_err(bad_key)?),
            CipherKind::Aes256Gcm => Cipher::Aes256Gcm(Aes256Gcm::new_from_slice(key).map_err(bad_key)?),
            CipherKind::ChaCha20Poly1305 => {
                Cipher::ChaCha20Poly1305(ChaCha20Poly1305::new_from_slice(key).map_err(bad_key)?)
            }
        };
        Ok(AeadCipher { cipher, nonce: 0 })
    }

    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&self.nonce.to_le_bytes());
        self.nonce = self.nonce.wrapping_add(1);
        nonce
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let nonce = GenericArray::from_slice(&nonce);
        match &self.cipher {
            Cipher::Aes128Gcm(c) => c.encrypt(nonce, plaintext),
            Cipher::Aes256Gcm(c) => c.encrypt(nonce, plaintext),
            Cipher::ChaCha20Poly1305(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|_| invalid_data("shadowsocks encryption failed"))
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let nonce = GenericArray::from_slice(&nonce);
        match &self.cipher {
            Cipher::Aes128Gcm(c) => c.decrypt(nonce, ciphertext),
            Cipher::Aes256Gcm(c) => c.decrypt(nonce, ciphertext),
            Cipher::ChaCha20Poly1305(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| invalid_data("shadowsocks authentication failed"))
    }
}

enum ReadState {
    Salt,
    Length,
    Payload(usize),
}

/// AEAD stream: `salt`, then chunks of `[len][tag] [payload][tag]`.
///
/// Writes are encrypted into an internal buffer and drained on the next write,
/// flush or shutdown. The peer's salt arrives with its first bytes.
pub struct ShadowsocksStream<S> {
    inner: S,
    kind: CipherKind,
    master: Vec<u8>,
    encrypt: AeadCipher,
    decrypt: Option<AeadCipher>,
    state: ReadState,
    incoming: BytesMut,
    plain: BytesMut,
    outgoing: BytesMut,
}

impl<S> fmt::Debug for ShadowsocksStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowsocksStream")
            .field("kind", &self.kind)
            .finish()
    }
}

impl<S> ShadowsocksStream<S> {
    pub fn new(inner: S, kind: CipherKind, master: &[u8]) -> io::Result<Self> {
        let mut salt = vec![0u8; kind.salt_len()];
        rand::thread_rng().fill_bytes(&mut salt);
        let encrypt = AeadCipher::new(kind, &session_key(master, &salt)?)?;

        let mut outgoing = BytesMut::with_capacity(salt.len() + MAX_PAYLOAD + 2 * TAG_LEN + 2);
        outgoing.extend_from_slice(&salt);

        Ok(ShadowsocksStream {
            inner,
            kind,
            master: master.to_vec(),
            encrypt,
            decrypt: None,
            state: ReadState::Salt,
            incoming: BytesMut::new(),
            plain: BytesMut::new(),
            outgoing,
        })
    }

    fn seal(&mut self, payload: &[u8]) -> io::Result<()> {
        let len = (payload.len() as u16).to_be_bytes();
        let len = self.encrypt.encrypt(&len)?;
        let payload = self.encrypt.encrypt(payload)?;
        self.outgoing.extend_from_slice(&len);
        self.outgoing.extend_from_slice(&payload);
        Ok(())
    }

    /// Opens as much of `incoming` as forms complete frames. Returns false when
    /// more bytes are needed.
    fn open_frame(&mut self) -> io::Result<bool> {
        match self.state {
            ReadState::Salt => {
                let salt_len = self.kind.salt_len();
                if self.incoming.len() < salt_len {
                    return Ok(false);
                }
                let salt = self.incoming.split_to(salt_len);
                let key = session_key(&self.master, &salt)?;
                self.decrypt = Some(AeadCipher::new(self.kind, &key)?);
                self.state = ReadState::Length;
            }
            ReadState::Length => {
                if self.incoming.len() < 2 + TAG_LEN {
                    return Ok(false);
                }
                let frame = self.incoming.split_to(2 + TAG_LEN);
                let len = self.decipher()?.decrypt(&frame)?;
                let len = u16::from_be_bytes([len[0], len[1]]) as usize;
                if len > MAX_PAYLOAD {
                    return Err(invalid_data("shadowsocks chunk too large"));
                }
                self.state = ReadState::Payload(len);
            }
            ReadState::Payload(len) => {
                if self.incoming.len() < len + TAG_LEN {
                    return Ok(false);
                }
                let frame = self.incoming.split_to(len + TAG_LEN);
                let payload = self.decipher()?.decrypt(&frame)?;
                self.plain.extend_from_slice(&payload);
                self.state = ReadState::Length;
            }
        }
        Ok(true)
    }

    fn decipher(&mut self) -> io::Result<&mut AeadCipher> {
        self.decrypt
            .as_mut()
            .ok_or_else(|| invalid_data("shadowsocks salt missing"))
    }
}

impl<S: AsyncWrite + Unpin> ShadowsocksStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.outgoing.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.outgoing))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.outgoing.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ShadowsocksStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plain.is_empty() {
                let n = this.plain.len().min(buf.remaining());
                buf.put_slice(&this.plain.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.open_frame()? {
                continue;
            }

            let mut scratch = [0u8; 8192];
            let mut read = ReadBuf::new(&mut scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read))?;
            if read.filled().is_empty() {
                // Clean EOF only on a frame boundary.
                return match this.state {
                    ReadState::Length | ReadState::Salt if this.incoming.is_empty() => {
                        Poll::Ready(Ok(()))
                    }
                    _ => Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into())),
                };
            }
            this.incoming.extend_from_slice(read.filled());
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ShadowsocksStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_PAYLOAD);
        this.seal(&buf[..n])?;
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ShadowsocksRelay {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub cipher: CipherKind,
}

impl fmt::Debug for ShadowsocksRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowsocksRelay")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("cipher", &self.cipher)
            .finish()
    }
}

pub struct ShadowsocksOutbound {
    config: ShadowsocksRelay,
    master: Vec<u8>,
}

impl ShadowsocksOutbound {
    pub fn new(config: ShadowsocksRelay) -> Self {
        let master = evp_bytes_to_key(&config.password, config.cipher.key_len());
        ShadowsocksOutbound { config, master }
    }
}

#[async_trait]
impl Outbound for ShadowsocksOutbound {
    type TcpStream = ShadowsocksStream<TcpStream>;

    fn name(&self) -> &'static str {
        "ss"
    }

    async fn tcp_connect(&self, target: &Address) -> Result<Self::TcpStream> {
        let mut header = Vec::new();
        target.write_socks5(&mut header)?;

        handshake(
            async {
                let tcp = open_relay(&self.config.host, self.config.port).await?;
                Ok(ShadowsocksStream::new(tcp, self.config.cipher, &self.master)?)
            },
            move |stream| {
                async move {
                    // Salt and address header leave in the first flight.
                    stream.write_all(&header).await?;
                    stream.flush().await?;
                    Ok(())
                }
                .boxed()
            },
            "ss",
        )
        .await
    }
}
