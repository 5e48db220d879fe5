use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha224};
use std::{fmt, io, num::NonZeroUsize, sync::Arc};

use crate::common::Address;

pub const CAPACITY: usize = 256;

const CMD_CONNECT: u8 = 0x01;
const CRLF: &[u8] = b"\r\n";

/// Hex SHA-224 of the password, the credential form trojan servers expect.
pub fn password_hash(password: &str) -> Vec<u8> {
    hex::encode(Sha224::digest(password.as_bytes())).into_bytes()
}

/// `hash CRLF CMD ATYP ADDR PORT CRLF`
pub fn make_head(hash: &[u8], target: &Address) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(hash.len() + 2 + 1 + 259 + 2);
    head.extend_from_slice(hash);
    head.extend_from_slice(CRLF);
    head.push(CMD_CONNECT);
    target.write_socks5(&mut head)?;
    head.extend_from_slice(CRLF);
    Ok(head)
}

/// Bounded memo of password hashes and complete headers. Only saves work,
/// every entry can be recomputed.
pub struct HeaderCache {
    hashes: Mutex<LruCache<String, Arc<[u8]>>>,
    heads: Mutex<LruCache<(String, Address), Arc<[u8]>>>,
}

impl fmt::Debug for HeaderCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderCache")
            .field("hashes", &self.hashes.lock().len())
            .field("heads", &self.heads.lock().len())
            .finish()
    }
}

impl Default for HeaderCache {
    fn default() -> Self {
        HeaderCache::new(CAPACITY)
    }
}

impl HeaderCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        HeaderCache {
            hashes: Mutex::new(LruCache::new(capacity)),
            heads: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn hash(&self, password: &str) -> Arc<[u8]> {
        if let Some(hash) = self.hashes.lock().get(password) {
            return hash.clone();
        }
        let hash: Arc<[u8]> = password_hash(password).into();
        self.hashes.lock().put(password.to_string(), hash.clone());
        hash
    }

    pub fn head(&self, password: &str, target: &Address) -> io::Result<Arc<[u8]>> {
        let key = (password.to_string(), target.clone());
        if let Some(head) = self.heads.lock().get(&key) {
            return Ok(head.clone());
        }
        let head: Arc<[u8]> = make_head(&self.hash(password), target)?.into();
        self.heads.lock().put(key, head.clone());
        Ok(head)
    }
}
