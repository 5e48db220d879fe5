use anyhow::Result;
use async_trait::async_trait;
use std::{fmt, net::IpAddr};
use tokio::net::lookup_host;

/// DNS record class of an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Other(u16),
}

impl From<u16> for RecordType {
    fn from(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            5 => RecordType::Cname,
            28 => RecordType::Aaaa,
            other => RecordType::Other(other),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => f.write_str("A"),
            RecordType::Aaaa => f.write_str("AAAA"),
            RecordType::Cname => f.write_str("CNAME"),
            RecordType::Other(code) => write!(f, "TYPE{}", code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    Text(String),
    Binary(Vec<u8>),
}

/// One answer record as returned by a lookup transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub record_type: RecordType,
    pub data: RecordData,
    /// Seconds.
    pub ttl: u32,
}

impl Answer {
    pub fn new(record_type: RecordType, address: impl Into<String>, ttl: u32) -> Self {
        Answer {
            record_type,
            data: RecordData::Text(address.into()),
            ttl,
        }
    }
}

/// A single resolution transport (DoH, DoT or plain DNS).
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn query(&self, host: &str) -> Result<Vec<Answer>>;
}

/// Plain DNS through the operating system resolver. The OS reports no TTL, so
/// every answer carries `ttl`.
#[derive(Debug, Clone)]
pub struct SystemLookup {
    pub ttl: u32,
}

impl SystemLookup {
    pub fn new(ttl: u32) -> Self {
        SystemLookup { ttl }
    }
}

#[async_trait]
impl Lookup for SystemLookup {
    async fn query(&self, host: &str) -> Result<Vec<Answer>> {
        let answers = lookup_host((host, 0))
            .await?
            .map(|addr| {
                let record_type = match addr.ip() {
                    IpAddr::V4(_) => RecordType::A,
                    IpAddr::V6(_) => RecordType::Aaaa,
                };
                Answer::new(record_type, addr.ip().to_string(), self.ttl)
            })
            .collect();
        Ok(answers)
    }
}
