use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use iprange::IpRange;
use tracing::warn;

use crate::error::ConfigError;

/// A banned network prefix. `expires` is `None` for permanent entries; `id`
/// holds the device row identifier needed to remove the entry later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub net: IpNet,
    pub expires: Option<DateTime<Utc>>,
    pub id: String,
}

impl fmt::Display for BanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expires {
            Some(t) => write!(f, "{{{}, {}, {:?}}}", self.net, t.to_rfc3339(), self.id),
            None => write!(f, "{{{}, permanent, {:?}}}", self.net, self.id),
        }
    }
}

/// Parses `s` as an IP or CIDR prefix. Bare addresses become host-length
/// prefixes; host bits below the mask are truncated with a warning.
pub fn parse_prefix(s: &str) -> Option<IpNet> {
    if let Ok(addr) = s.parse::<IpAddr>() {
        return Some(IpNet::from(addr));
    }
    let net = s.parse::<IpNet>().ok()?;
    let canonical = net.trunc();
    if canonical.addr() != net.addr() {
        warn!(prefix = %s, "prefix has host bits set, truncating");
    }
    Some(canonical)
}

/// Merged v4 + v6 range sets, used for the containment checks: a candidate
/// address is covered when any list prefix contains it, supernets included.
#[derive(Debug, Clone, Default)]
pub struct IpRangeMixed {
    pub v4: IpRange<Ipv4Net>,
    pub v6: IpRange<Ipv6Net>,
}

impl From<&[IpNet]> for IpRangeMixed {
    fn from(nets: &[IpNet]) -> Self {
        let mut v4 = IpRange::new();
        let mut v6 = IpRange::new();
        for net in nets {
            match net {
                IpNet::V4(n) => {
                    v4.add(*n);
                }
                IpNet::V6(n) => {
                    v6.add(*n);
                }
            }
        }
        v4.simplify();
        v6.simplify();
        Self { v4, v6 }
    }
}

impl IpRangeMixed {
    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.v4.contains(&v4),
            IpAddr::V6(v6) => self.v6.contains(&v6),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

/// Immutable post-construction policy: prefixes that must never be banned
/// and prefixes that must always be banned permanently.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    blacklist_nets: Vec<IpNet>,
    whitelist: IpRangeMixed,
    blacklist: IpRangeMixed,
}

impl Policy {
    /// Fails when a whitelist prefix is literally present on the blacklist;
    /// an administrator cannot want both.
    pub fn new(whitelist: Vec<IpNet>, blacklist: Vec<IpNet>) -> Result<Self, ConfigError> {
        for w in &whitelist {
            if blacklist.iter().any(|b| b == w) {
                return Err(ConfigError::Conflict(*w));
            }
        }
        Ok(Self {
            whitelist: IpRangeMixed::from(whitelist.as_slice()),
            blacklist: IpRangeMixed::from(blacklist.as_slice()),
            blacklist_nets: blacklist,
        })
    }

    pub fn is_whitelisted(&self, addr: IpAddr) -> bool {
        self.whitelist.contains(addr)
    }

    pub fn is_blacklisted(&self, addr: IpAddr) -> bool {
        self.blacklist.contains(addr)
    }

    /// The configured permanent entries, in canonical form.
    pub fn blacklist_nets(&self) -> &[IpNet] {
        &self.blacklist_nets
    }
}

/// The live mirror of dynamic bans currently pushed to the device, kept
/// sorted ascending by expiry so the expiry scheduler only ever inspects
/// the head.
#[derive(Debug, Default)]
pub struct Dynlist(Vec<BanEntry>);

impl Dynlist {
    pub fn insert(&mut self, entry: BanEntry) {
        self.0.push(entry);
        self.0.sort_by_key(|e| e.expires);
    }

    pub fn head(&self) -> Option<&BanEntry> {
        self.0.first()
    }

    /// Drops the head if it carries the given row id. Deletes are only ever
    /// issued for the head or for entries that never made it into the list.
    pub fn pop_if_head(&mut self, id: &str) {
        if self.0.first().is_some_and(|e| e.id == id) {
            self.0.remove(0);
        }
    }

    pub fn covers(&self, addr: IpAddr) -> bool {
        self.0.iter().any(|e| e.net.contains(&addr))
    }

    pub fn entries(&self) -> &[BanEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<BanEntry>> for Dynlist {
    fn from(mut entries: Vec<BanEntry>) -> Self {
        entries.sort_by_key(|e| e.expires);
        Self(entries)
    }
}
