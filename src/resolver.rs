//! Name resolution and reverse host mapping.
//!
//! The dispatcher consults a [`Resolver`] for three things: forward lookups
//! of host names, the static hosts table, and mapping fake or redirected
//! addresses back to the host name a client asked for.
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::Mutex;

use log::*;
use regex::Regex;
use serde::*;

use crate::model::{Error, IpCidr, Matcher};

pub trait Resolver: fmt::Debug + Send + Sync {
    /// Resolve `host` to a single address, IPv4 first
    fn resolve_ip(&self, host: &str) -> Result<IpAddr, Error>;
    fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, Error>;
    /// Static hosts table lookup
    fn search_hosts(&self, host: &str) -> Option<IpAddr>;
    fn mapping_enabled(&self) -> bool;
    fn fake_ip_enabled(&self) -> bool;
    fn find_host_by_ip(&self, ip: IpAddr) -> Option<String>;
    /// `ip` lies inside the fake address range
    fn is_fake_ip(&self, ip: IpAddr) -> bool;
    /// `ip` is a fake address currently bound to a host
    fn is_exist_fake_ip(&self, ip: IpAddr) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnhancedMode {
    #[default]
    Normal,
    RedirHost,
    FakeIp,
}

/// Static hosts table.
///
/// Besides exact names it accepts two wildcard forms: `*.lan` matches a
/// single label below `lan`, `+.lan` matches `lan` and any name below it.
#[derive(Debug, Clone, Default)]
pub struct Hosts {
    exact: HashMap<String, IpAddr>,
    wildcard: Vec<(Regex, IpAddr)>,
}

impl Hosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pattern: &str, ip: IpAddr) -> Result<(), Error> {
        let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
        let re = if let Some(base) = pattern.strip_prefix("*.") {
            format!(r"\A[^.]+\.{}\z", regex::escape(base))
        } else if let Some(base) = pattern.strip_prefix("+.") {
            format!(r"\A(.+\.)?{}\z", regex::escape(base))
        } else {
            self.exact.insert(pattern, ip);
            return Ok(());
        };
        let re = Regex::new(&re).map_err(|err| Error::payload(err.to_string()))?;
        self.wildcard.push((re, ip));
        Ok(())
    }

    pub fn search(&self, host: &str) -> Option<IpAddr> {
        if host.is_empty() {
            return None;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if let Some(ip) = self.exact.get(&host) {
            return Some(*ip);
        }
        self.wildcard
            .iter()
            .find(|(re, _)| re.is_match(&host))
            .map(|(_, ip)| *ip)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct FakeIpState {
    offset: u32,
    host_to_ip: HashMap<String, Ipv4Addr>,
    ip_to_host: HashMap<Ipv4Addr, String>,
}

/// Hands out addresses from an IPv4 range in place of real lookups.
///
/// The network address and the gateway (network + 1) are never allocated,
/// nor is the broadcast address. Once the range is exhausted allocation
/// wraps around and the oldest binding of a reused address is dropped.
#[derive(Debug)]
pub struct FakeIpPool {
    cidr: IpCidr,
    min: u32,
    max: u32,
    state: Mutex<FakeIpState>,
}

impl FakeIpPool {
    pub fn new(cidr: IpCidr) -> Result<Self, Error> {
        let network = match cidr.network() {
            IpAddr::V4(addr) => u32::from(addr),
            IpAddr::V6(_) => return Err(Error::payload("fake-ip-range must be IPv4")),
        };
        // network, gateway and broadcast are reserved
        if cidr.size() < 4 {
            return Err(Error::payload(format!("fake-ip-range {} too small", cidr)));
        }
        let last = network + (cidr.size() - 1) as u32;
        Ok(Self {
            cidr,
            min: network + 2,
            max: last - 1,
            state: Mutex::new(FakeIpState::default()),
        })
    }

    pub fn gateway(&self) -> IpAddr {
        match self.cidr.network() {
            IpAddr::V4(addr) => Ipv4Addr::from(u32::from(addr) + 1).into(),
            other => other,
        }
    }

    /// Fake address bound to `host`, allocating one if needed
    pub fn lookup(&self, host: &str) -> Result<IpAddr, Error> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let mut state = self.state.lock()?;
        if let Some(ip) = state.host_to_ip.get(&host) {
            return Ok((*ip).into());
        }
        let span = self.max - self.min + 1;
        let ip = Ipv4Addr::from(self.min + state.offset);
        state.offset = (state.offset + 1) % span;
        if let Some(old) = state.ip_to_host.remove(&ip) {
            debug!("[DNS] fake ip {} recycled from {}", ip, old);
            state.host_to_ip.remove(&old);
        }
        state.ip_to_host.insert(ip, host.clone());
        state.host_to_ip.insert(host, ip);
        Ok(ip.into())
    }

    pub fn lookup_host(&self, ip: IpAddr) -> Option<String> {
        let ip = unmap_v4(ip)?;
        self.state.lock().ok()?.ip_to_host.get(&ip).cloned()
    }

    pub fn exist(&self, ip: IpAddr) -> bool {
        self.lookup_host(ip).is_some()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.cidr.r#match(&ip)
    }
}

fn unmap_v4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// [`Resolver`] on top of the system resolver.
#[derive(Debug, Default)]
pub struct HostMapper {
    hosts: Hosts,
    mode: EnhancedMode,
    fake_ip: Option<FakeIpPool>,
    /// redir-host answers handed to clients: ip -> host
    mappings: Mutex<HashMap<IpAddr, String>>,
}

impl HostMapper {
    pub fn new(hosts: Hosts) -> Self {
        Self {
            hosts,
            ..Default::default()
        }
    }

    pub fn redir_host(hosts: Hosts) -> Self {
        Self {
            hosts,
            mode: EnhancedMode::RedirHost,
            ..Default::default()
        }
    }

    pub fn fake_ip(hosts: Hosts, pool: FakeIpPool) -> Self {
        Self {
            hosts,
            mode: EnhancedMode::FakeIp,
            fake_ip: Some(pool),
            ..Default::default()
        }
    }

    pub fn mode(&self) -> EnhancedMode {
        self.mode
    }

    pub fn fake_ip_pool(&self) -> Option<&FakeIpPool> {
        self.fake_ip.as_ref()
    }

    /// Remember that `ip` was answered for `host`
    pub fn record_mapping(&self, ip: IpAddr, host: &str) -> Result<(), Error> {
        self.mappings.lock()?.insert(ip, host.to_owned());
        Ok(())
    }
}

impl Resolver for HostMapper {
    fn resolve_ip(&self, host: &str) -> Result<IpAddr, Error> {
        let ips = self.lookup_ip(host)?;
        ips.iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| ips.first())
            .copied()
            .ok_or_else(|| Error::DomainNotResolved {
                domain: host.to_owned(),
            })
    }

    fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        if let Some(ip) = self.hosts.search(host) {
            return Ok(vec![ip]);
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let ips: Vec<IpAddr> = (host, 0)
            .to_socket_addrs()
            .map_err(|err| {
                debug!("[DNS] lookup {}: {}", host, err);
                Error::DomainNotResolved {
                    domain: host.to_owned(),
                }
            })?
            .map(|addr| addr.ip())
            .collect();
        if ips.is_empty() {
            return Err(Error::DomainNotResolved {
                domain: host.to_owned(),
            });
        }
        Ok(ips)
    }

    fn search_hosts(&self, host: &str) -> Option<IpAddr> {
        self.hosts.search(host)
    }

    fn mapping_enabled(&self) -> bool {
        self.mode != EnhancedMode::Normal
    }

    fn fake_ip_enabled(&self) -> bool {
        self.mode == EnhancedMode::FakeIp
    }

    fn find_host_by_ip(&self, ip: IpAddr) -> Option<String> {
        match self.mode {
            EnhancedMode::Normal => None,
            EnhancedMode::FakeIp => self.fake_ip.as_ref()?.lookup_host(ip),
            EnhancedMode::RedirHost => self.mappings.lock().ok()?.get(&ip).cloned(),
        }
    }

    fn is_fake_ip(&self, ip: IpAddr) -> bool {
        self.fake_ip.as_ref().map_or(false, |pool| pool.contains(ip))
    }

    fn is_exist_fake_ip(&self, ip: IpAddr) -> bool {
        self.fake_ip.as_ref().map_or(false, |pool| pool.exist(ip))
    }
}
