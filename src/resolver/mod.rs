//! Hostname resolution raced across DoH, DoT and plain DNS transports.
//!
//! Resolution runs in two explicit stages per transport: a pure stage that picks
//! an address out of the answers, then a write-through into the shared
//! [`TtlCache`]. Transports that lose the race are not cancelled, so their
//! write-through may still land after the winner returned; the cache keeps the
//! first write.

mod blocklist;
mod cache;
mod lookup;

pub use blocklist::Blocklist;
pub use cache::{clamp, TtlAdjust, TtlCache};
pub use lookup::{Answer, Lookup, RecordData, RecordType, SystemLookup};

use futures::FutureExt;
use log::{debug, log_enabled, trace, Level};
use std::{fmt, net::IpAddr, sync::Arc, time::Duration};
use thiserror::Error;

use crate::{
    error::{Result, TunnelError},
    utils::race::{race, Producer},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    DoH,
    DoT,
    Dns,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::DoH => f.write_str("DoH"),
            Transport::DoT => f.write_str("DoT"),
            Transport::Dns => f.write_str("DNS"),
        }
    }
}

/// A single transport's failure. Absorbed by the race and the hostname fallback.
#[derive(Debug, Error)]
enum ResolveError {
    #[error("{0} query failed: {1:#}")]
    Query(Transport, anyhow::Error),
    #[error("No valid entries from {0}")]
    NoValidEntries(Transport),
}

pub struct ResolverConfig {
    pub doh: Vec<Arc<dyn Lookup>>,
    pub dot: Vec<Arc<dyn Lookup>>,
    pub dns: Vec<Arc<dyn Lookup>>,
    pub timeout: Duration,
    pub record_type: RecordType,
    pub ttl: Option<TtlAdjust>,
    pub blocklist: Blocklist,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            doh: Vec::new(),
            dot: Vec::new(),
            dns: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            record_type: RecordType::A,
            ttl: None,
            blocklist: Blocklist::default(),
        }
    }
}

impl fmt::Debug for ResolverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverConfig")
            .field("doh", &self.doh.len())
            .field("dot", &self.dot.len())
            .field("dns", &self.dns.len())
            .field("timeout", &self.timeout)
            .field("record_type", &self.record_type)
            .field("ttl", &self.ttl.is_some())
            .field("blocklist", &self.blocklist)
            .finish()
    }
}

#[derive(Debug)]
pub struct HostResolver {
    config: ResolverConfig,
    cache: TtlCache,
}

impl HostResolver {
    pub fn new(config: ResolverConfig) -> Self {
        let cache = TtlCache::new(config.ttl.clone());
        HostResolver::with_cache(config, cache)
    }

    /// Shares an existing cache, e.g. between resolvers with different transports.
    pub fn with_cache(config: ResolverConfig, cache: TtlCache) -> Self {
        HostResolver { config, cache }
    }

    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    /// Administrative: drops every cached address.
    pub fn flush_cache(&self) {
        debug!("dns cache flushed ({} entries)", self.cache.len());
        self.cache.flush();
    }

    /// Resolves `host` to an address, or returns it unchanged when nothing
    /// answers in time. Fails only with `BlockedHost`.
    pub async fn resolve(&self, host: &str) -> Result<String> {
        let address = self.lookup(host).await;

        if self.config.blocklist.is_blocked(&address) {
            debug!("{} resolved to blocked address {}", host, address);
            return Err(TunnelError::BlockedHost(address));
        }
        Ok(address)
    }

    async fn lookup(&self, host: &str) -> String {
        if host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok()
        {
            return host.to_string();
        }

        if let Some(address) = self.cache.get(host) {
            return address;
        }

        let producers = self.producers(host);
        match race(producers, self.config.timeout).await {
            Some(Ok(address)) => address,
            Some(Err(e)) => {
                debug!("resolving {} fell back to hostname: {}", host, e);
                host.to_string()
            }
            None => host.to_string(),
        }
    }

    fn producers(&self, host: &str) -> Vec<Producer<String, ResolveError>> {
        let transports = [
            (Transport::DoH, &self.config.doh),
            (Transport::DoT, &self.config.dot),
            (Transport::Dns, &self.config.dns),
        ];
        transports
            .iter()
            .flat_map(|(transport, lookups)| lookups.iter().map(move |l| (*transport, l.clone())))
            .map(|(transport, lookup)| {
                query(
                    transport,
                    lookup,
                    host.to_string(),
                    self.config.record_type,
                    self.cache.clone(),
                )
            })
            .collect()
    }
}

fn query(
    transport: Transport,
    lookup: Arc<dyn Lookup>,
    host: String,
    record_type: RecordType,
    cache: TtlCache,
) -> Producer<String, ResolveError> {
    async move {
        let answers = lookup
            .query(&host)
            .await
            .map_err(|e| ResolveError::Query(transport, e))?;
        let (address, ttl) =
            pick_answer(&answers, record_type).ok_or(ResolveError::NoValidEntries(transport))?;

        cache.set(&host, &address, ttl as u64);

        if log_enabled!(Level::Trace) {
            trace!("{} resolved {} to {} (ttl {})", transport, host, address, ttl);
        }
        Ok(address)
    }
    .boxed()
}

/// First answer of the requested class whose payload is an address string.
fn pick_answer(answers: &[Answer], record_type: RecordType) -> Option<(String, u32)> {
    answers.iter().find_map(|answer| match &answer.data {
        RecordData::Text(address) if answer.record_type == record_type => {
            Some((address.clone(), answer.ttl))
        }
        _ => None,
    })
}
