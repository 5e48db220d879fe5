use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use anyhow::{anyhow, bail, Result};
use treebitmap::IpLookupTable;

/// Longest-prefix block filter applied to resolved addresses.
pub struct Blocklist {
    blocklist4: IpLookupTable<Ipv4Addr, String>,
    blocklist6: IpLookupTable<Ipv6Addr, String>,
}

impl fmt::Debug for Blocklist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blocklist")
            .field("v4", &self.blocklist4.len())
            .field("v6", &self.blocklist6.len())
            .finish()
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Blocklist::new(false)
    }
}

impl Blocklist {
    pub fn new(block_local: bool) -> Self {
        let mut blocklist4 = IpLookupTable::new();
        let mut blocklist6 = IpLookupTable::new();
        if block_local {
            for (ip, len, name) in [
                (Ipv4Addr::new(0, 0, 0, 0), 8, "this-network"),
                (Ipv4Addr::new(127, 0, 0, 0), 8, "loopback"),
                (Ipv4Addr::new(10, 0, 0, 0), 8, "local8"),
                (Ipv4Addr::new(100, 64, 0, 0), 10, "local10"),
                (Ipv4Addr::new(169, 254, 0, 0), 16, "link-local"),
                (Ipv4Addr::new(172, 16, 0, 0), 12, "local12"),
                (Ipv4Addr::new(198, 18, 0, 0), 15, "local15"),
                (Ipv4Addr::new(192, 168, 0, 0), 16, "local16"),
                (Ipv4Addr::new(192, 0, 0, 0), 24, "local24"),
            ] {
                blocklist4.insert(ip, len, name.to_string());
            }
            for (ip, len, name) in [
                (Ipv6Addr::LOCALHOST, 128, "loopback"),
                (Ipv6Addr::UNSPECIFIED, 128, "unspecified"),
                (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7, "unique-local"),
                (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10, "link-local"),
            ] {
                blocklist6.insert(ip, len, name.to_string());
            }
        }
        Blocklist {
            blocklist4,
            blocklist6,
        }
    }

    /// Adds a `addr/len` range. A bare address blocks only itself.
    pub fn insert_cidr(&mut self, cidr: &str) -> Result<()> {
        let invalid = || anyhow!("invalid blocked range {}", cidr);
        let (ip, len) = match cidr.split_once('/') {
            Some((ip, len)) => (ip, Some(len.parse::<u32>().map_err(|_| invalid())?)),
            None => (cidr, None),
        };
        match ip.parse::<IpAddr>().map_err(|_| invalid())? {
            IpAddr::V4(ip) => {
                let len = len.unwrap_or(32);
                if len > 32 {
                    bail!("invalid blocked range {}", cidr);
                }
                self.blocklist4.insert(ip, len, cidr.to_string());
            }
            IpAddr::V6(ip) => {
                let len = len.unwrap_or(128);
                if len > 128 {
                    bail!("invalid blocked range {}", cidr);
                }
                self.blocklist6.insert(ip, len, cidr.to_string());
            }
        }
        Ok(())
    }

    pub fn has_match(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(ip) => self.blocklist4.longest_match(ip).is_some(),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(v4) => self.blocklist4.longest_match(v4).is_some(),
                None => self.blocklist6.longest_match(ip).is_some(),
            },
        }
    }

    /// Only literal addresses are checked; hostnames pass.
    pub fn is_blocked(&self, address: &str) -> bool {
        address
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| self.has_match(ip))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_preset() {
        let list = Blocklist::new(true);
        assert!(list.is_blocked("127.0.0.1"));
        assert!(list.is_blocked("192.168.1.20"));
        assert!(list.is_blocked("::1"));
        assert!(list.is_blocked("::ffff:10.1.2.3"));
        assert!(!list.is_blocked("1.1.1.1"));
        assert!(!list.is_blocked("localhost"));
    }

    #[test]
    fn custom_ranges() {
        let mut list = Blocklist::default();
        assert!(!list.is_blocked("203.0.113.9"));
        list.insert_cidr("203.0.113.0/24").unwrap();
        list.insert_cidr("2001:db8::1").unwrap();
        assert!(list.is_blocked("203.0.113.9"));
        assert!(list.is_blocked("2001:db8::1"));
        assert!(!list.is_blocked("2001:db8::2"));
        assert!(list.insert_cidr("10.0.0.0/33").is_err());
        assert!(list.insert_cidr("not-an-ip").is_err());
    }
}
