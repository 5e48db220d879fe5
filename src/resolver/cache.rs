use log::trace;
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

pub type TtlAdjust = Arc<dyn Fn(u64) -> u64 + Send + Sync>;

struct Entry {
    address: String,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    generation: u64,
}

/// Host to address map. The first write for a host wins until its eviction
/// timer fires; later writes neither replace the value nor reschedule eviction.
#[derive(Clone)]
pub struct TtlCache {
    inner: Arc<Mutex<Inner>>,
    adjust: Option<TtlAdjust>,
}

impl fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("len", &self.len())
            .field("adjust", &self.adjust.is_some())
            .finish()
    }
}

impl TtlCache {
    pub fn new(adjust: Option<TtlAdjust>) -> Self {
        TtlCache {
            inner: Arc::new(Mutex::new(Inner::default())),
            adjust,
        }
    }

    pub fn get(&self, host: &str) -> Option<String> {
        self.inner
            .lock()
            .entries
            .get(host)
            .map(|entry| entry.address.clone())
    }

    /// Must be called from within a tokio runtime; eviction runs as a task.
    pub fn set(&self, host: &str, address: &str, ttl_seconds: u64) {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.entries.contains_key(host) {
                return;
            }
            inner.generation += 1;
            let generation = inner.generation;
            inner.entries.insert(
                host.to_string(),
                Entry {
                    address: address.to_string(),
                    generation,
                },
            );
            generation
        };

        let ttl = match &self.adjust {
            Some(adjust) => adjust(ttl_seconds),
            None => ttl_seconds,
        };

        let inner = self.inner.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(ttl)).await;
            let mut inner = inner.lock();
            // A flush followed by a fresh write gives the host a new generation.
            if inner.entries.get(&host).map(|e| e.generation) == Some(generation) {
                inner.entries.remove(&host);
                trace!("dns cache evicted {}", host);
            }
        });
    }

    pub fn flush(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// TTL-adjustment function clamping into `[min, max]`.
pub fn clamp(min: u64, max: u64) -> TtlAdjust {
    Arc::new(move |ttl| ttl.max(min).min(max))
}
