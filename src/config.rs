use anyhow::{Context, Result};
use log::LevelFilter;
use serde_derive::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use std::{sync::Arc, time::Duration};

use crate::resolver::{clamp, Blocklist, Lookup, RecordType, ResolverConfig, SystemLookup};

#[serde_as]
#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default = "default_level")]
    #[serde_as(as = "DisplayFromStr")]
    pub log_level: LevelFilter,
    #[serde(default)]
    pub resolver: Resolver,
    /// Absent means connect to the origin directly.
    pub relay: Option<RelayConfig>,
}

fn default_level() -> LevelFilter {
    LevelFilter::Info
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    A,
    Aaaa,
}

impl From<QueryType> for RecordType {
    fn from(q: QueryType) -> Self {
        match q {
            QueryType::A => RecordType::A,
            QueryType::Aaaa => RecordType::Aaaa,
        }
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_system_ttl() -> u32 {
    60
}

fn default_query_type() -> QueryType {
    QueryType::A
}

fn yes() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone)]
pub struct Resolver {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "yes")]
    pub system: bool,
    #[serde(default = "default_system_ttl")]
    pub system_ttl: u32,
    #[serde(default = "default_query_type")]
    pub record_type: QueryType,
    pub ttl_min: Option<u64>,
    pub ttl_max: Option<u64>,
    #[serde(default)]
    pub block_local: bool,
    #[serde(default)]
    pub blocked: Vec<String>,
}

impl Default for Resolver {
    fn default() -> Self {
        Resolver {
            timeout_ms: default_timeout_ms(),
            system: true,
            system_ttl: default_system_ttl(),
            record_type: default_query_type(),
            ttl_min: None,
            ttl_max: None,
            block_local: false,
            blocked: Vec::new(),
        }
    }
}

impl Resolver {
    /// Builds the resolver configuration. DoH and DoT transports are injected by
    /// the embedding application; only the OS resolver is built in.
    pub fn build(&self) -> Result<ResolverConfig> {
        let mut blocklist = Blocklist::new(self.block_local);
        for cidr in &self.blocked {
            blocklist.insert_cidr(cidr)?;
        }

        let ttl = match (self.ttl_min, self.ttl_max) {
            (None, None) => None,
            (min, max) => Some(clamp(min.unwrap_or(0), max.unwrap_or(u64::MAX))),
        };

        let mut dns: Vec<Arc<dyn Lookup>> = Vec::new();
        if self.system {
            dns.push(Arc::new(SystemLookup::new(self.system_ttl)));
        }

        Ok(ResolverConfig {
            doh: Vec::new(),
            dot: Vec::new(),
            dns,
            timeout: Duration::from_millis(self.timeout_ms),
            record_type: self.record_type.into(),
            ttl,
            blocklist,
        })
    }
}

/// TLS parameters for TLS-carried relays.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Ssl {
    pub ciphers: Option<String>,
    pub sni: Option<String>,
    #[serde(default)]
    pub alpn: Vec<String>,
    #[serde(default = "yes")]
    pub verify: bool,
    #[serde(default = "yes")]
    pub verify_hostname: bool,
    /// Extra trust anchors (PEM) on top of the system store.
    pub ca_file: Option<String>,
}

impl Default for Ssl {
    fn default() -> Self {
        Ssl {
            ciphers: None,
            sni: None,
            alpn: Vec::new(),
            verify: true,
            verify_hostname: true,
            ca_file: None,
        }
    }
}

/// Relay descriptor as written in configuration. The protocol tag stays a
/// plain string here; it is checked when the descriptor is dispatched.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cipher: Option<String>,
    #[serde(default)]
    pub ssl: Ssl,
}

pub fn load_config_from_path(s: &str) -> Result<Config> {
    let config_string =
        std::fs::read_to_string(s).with_context(|| format!("Failed to read config {}", s))?;
    let config = toml::from_str(&config_string).with_context(|| format!("Invalid config {}", s))?;

    Ok(config)
}
