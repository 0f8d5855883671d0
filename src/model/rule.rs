//! Routing rules.
//!
//! A rule is a predicate over [`Metadata`] paired with the name of the
//! outbound adapter that handles matching flows. Rules are evaluated in
//! order and the first match wins.
//!
//! # Example
//!
//! ```
//! # use switchyard::model::*;
//! let ctx = RuleContext::default();
//! let rule = parse_rule_line("IP-CIDR,192.0.2.0/24,PROXY1", &ctx).unwrap();
//! let mut md = Metadata::new(Network::Tcp, InboundType::Socks5);
//! md.dst_ip = Some("192.0.2.1".parse().unwrap());
//! md.dst_port = 80;
//! assert!(rule.matches(&md));
//! assert_eq!(rule.adapter(), "PROXY1");
//! ```
use std::fmt;
use std::sync::Arc;

use derive_more::Display;
use log::warn;

use crate::model::error::Error;
use crate::model::metadata::*;

const NO_RESOLVE: &str = "no-resolve";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum RuleType {
    #[display(fmt = "Domain")]
    Domain,
    #[display(fmt = "DomainSuffix")]
    DomainSuffix,
    #[display(fmt = "DomainKeyword")]
    DomainKeyword,
    #[display(fmt = "GeoIP")]
    GeoIp,
    #[display(fmt = "IPCIDR")]
    IpCidr,
    #[display(fmt = "SrcIPCIDR")]
    SrcIpCidr,
    #[display(fmt = "SrcPort")]
    SrcPort,
    #[display(fmt = "DstPort")]
    DstPort,
    #[display(fmt = "InboundPort")]
    InboundPort,
    #[display(fmt = "Process")]
    Process,
    #[display(fmt = "ProcessPath")]
    ProcessPath,
    #[display(fmt = "IPSet")]
    IpSet,
    #[display(fmt = "Match")]
    Match,
}

pub trait Matcher {
    type Item;
    fn r#match(&self, t: &Self::Item) -> bool;
}

/// e.g. 192.168.0.0/16
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpCidr {
    addr: IpAddr,
    prefix: u8,
}

impl IpCidr {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, Error> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(Error::payload(format!("{}/{}", addr, prefix)));
        }
        Ok(Self {
            addr: mask(addr, prefix),
            prefix,
        })
    }

    pub fn network(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the range, saturated to u128
    pub fn size(&self) -> u128 {
        let bits = match self.addr {
            IpAddr::V4(_) => 32 - self.prefix as u32,
            IpAddr::V6(_) => 128 - self.prefix as u32,
        };
        1u128.checked_shl(bits).unwrap_or(u128::MAX)
    }
}

fn mask(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(addr) => {
            let bmask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
            Ipv4Addr::from(u32::from(addr) & bmask).into()
        }
        IpAddr::V6(addr) => {
            let bmask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
            Ipv6Addr::from(u128::from(addr) & bmask).into()
        }
    }
}

impl Matcher for IpCidr {
    type Item = IpAddr;

    fn r#match(&self, ip: &IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(*ip),
            IpAddr::V4(_) => *ip,
        };
        match (self.addr, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(ip, self.prefix) == self.addr
            }
            _ => false,
        }
    }
}

impl std::str::FromStr for IpCidr {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or_else(|| Error::payload(s))?;
        let addr: IpAddr = addr.parse().map_err(|_| Error::payload(s))?;
        let prefix: u8 = prefix.parse().map_err(|_| Error::payload(s))?;
        IpCidr::new(addr, prefix)
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Country lookup backing GEOIP rules
pub trait GeoIpDb: fmt::Debug + Send + Sync {
    /// ISO country code of `ip`
    fn country(&self, ip: IpAddr) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoGeoIpDb;

impl GeoIpDb for NoGeoIpDb {
    fn country(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Kernel ipset access backing IPSET rules
pub trait IpSetLookup: fmt::Debug + Send + Sync {
    fn verify(&self, name: &str) -> Result<(), String>;
    fn test(&self, name: &str, ip: IpAddr) -> Result<bool, String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedIpSet;

impl IpSetLookup for UnsupportedIpSet {
    fn verify(&self, _name: &str) -> Result<(), String> {
        Err("not supported on this platform".to_owned())
    }
    fn test(&self, _name: &str, _ip: IpAddr) -> Result<bool, String> {
        Err("not supported on this platform".to_owned())
    }
}

/// Collaborators handed to rules on construction
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub geoip: Arc<dyn GeoIpDb>,
    pub ipset: Arc<dyn IpSetLookup>,
}

impl Default for RuleContext {
    fn default() -> Self {
        Self {
            geoip: Arc::new(NoGeoIpDb),
            ipset: Arc::new(UnsupportedIpSet),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    Src,
    Dst,
    Inbound,
}

#[derive(Debug, Clone)]
pub enum Rule {
    Domain {
        domain: String,
        adapter: String,
    },
    DomainSuffix {
        suffix: String,
        adapter: String,
    },
    DomainKeyword {
        keyword: String,
        adapter: String,
    },
    GeoIp {
        country: String,
        adapter: String,
        no_resolve: bool,
        db: Arc<dyn GeoIpDb>,
    },
    IpCidr {
        cidr: IpCidr,
        adapter: String,
        /// match the source address instead of the destination
        source: bool,
        no_resolve: bool,
    },
    Port {
        port: u16,
        adapter: String,
        port_type: PortType,
    },
    Process {
        process: String,
        adapter: String,
        /// compare the executable name only
        name_only: bool,
    },
    IpSet {
        name: String,
        adapter: String,
        no_resolve: bool,
        lookup: Arc<dyn IpSetLookup>,
    },
    Match {
        adapter: String,
    },
}

impl Rule {
    pub fn domain(domain: &str, adapter: &str) -> Self {
        Rule::Domain {
            domain: domain.to_ascii_lowercase(),
            adapter: adapter.to_owned(),
        }
    }

    pub fn domain_suffix(suffix: &str, adapter: &str) -> Self {
        Rule::DomainSuffix {
            suffix: suffix.to_ascii_lowercase(),
            adapter: adapter.to_owned(),
        }
    }

    pub fn domain_keyword(keyword: &str, adapter: &str) -> Self {
        Rule::DomainKeyword {
            keyword: keyword.to_ascii_lowercase(),
            adapter: adapter.to_owned(),
        }
    }

    pub fn geoip(country: &str, adapter: &str, no_resolve: bool, db: Arc<dyn GeoIpDb>) -> Self {
        Rule::GeoIp {
            country: country.to_owned(),
            adapter: adapter.to_owned(),
            no_resolve,
            db,
        }
    }

    pub fn ip_cidr(cidr: &str, adapter: &str, no_resolve: bool) -> Result<Self, Error> {
        Ok(Rule::IpCidr {
            cidr: cidr.parse()?,
            adapter: adapter.to_owned(),
            source: false,
            no_resolve,
        })
    }

    pub fn src_ip_cidr(cidr: &str, adapter: &str) -> Result<Self, Error> {
        Ok(Rule::IpCidr {
            cidr: cidr.parse()?,
            adapter: adapter.to_owned(),
            source: true,
            no_resolve: true,
        })
    }

    pub fn port(port: &str, adapter: &str, port_type: PortType) -> Result<Self, Error> {
        Ok(Rule::Port {
            port: port.parse().map_err(|_| Error::payload(port))?,
            adapter: adapter.to_owned(),
            port_type,
        })
    }

    pub fn process(process: &str, adapter: &str, name_only: bool) -> Self {
        Rule::Process {
            process: process.to_owned(),
            adapter: adapter.to_owned(),
            name_only,
        }
    }

    pub fn ipset(
        name: &str,
        adapter: &str,
        no_resolve: bool,
        lookup: Arc<dyn IpSetLookup>,
    ) -> Result<Self, Error> {
        lookup.verify(name).map_err(|reason| Error::IpSet {
            name: name.to_owned(),
            reason,
        })?;
        Ok(Rule::IpSet {
            name: name.to_owned(),
            adapter: adapter.to_owned(),
            no_resolve,
            lookup,
        })
    }

    pub fn match_all(adapter: &str) -> Self {
        Rule::Match {
            adapter: adapter.to_owned(),
        }
    }

    pub fn rule_type(&self) -> RuleType {
        use Rule::*;
        match self {
            Domain { .. } => RuleType::Domain,
            DomainSuffix { .. } => RuleType::DomainSuffix,
            DomainKeyword { .. } => RuleType::DomainKeyword,
            GeoIp { .. } => RuleType::GeoIp,
            IpCidr { source: false, .. } => RuleType::IpCidr,
            IpCidr { source: true, .. } => RuleType::SrcIpCidr,
            Port { port_type, .. } => match port_type {
                PortType::Src => RuleType::SrcPort,
                PortType::Dst => RuleType::DstPort,
                PortType::Inbound => RuleType::InboundPort,
            },
            Process {
                name_only: true, ..
            } => RuleType::Process,
            Process {
                name_only: false, ..
            } => RuleType::ProcessPath,
            IpSet { .. } => RuleType::IpSet,
            Match { .. } => RuleType::Match,
        }
    }

    pub fn matches(&self, md: &Metadata) -> bool {
        use Rule::*;
        match self {
            Domain { domain, .. } => !md.host.is_empty() && &md.rule_host() == domain,
            DomainSuffix { suffix, .. } => {
                let host = md.rule_host();
                !host.is_empty()
                    && (&host == suffix
                        || (host.ends_with(suffix.as_str())
                            && host[..host.len() - suffix.len()].ends_with('.')))
            }
            DomainKeyword { keyword, .. } => {
                !md.host.is_empty() && md.rule_host().contains(keyword.as_str())
            }
            GeoIp { country, db, .. } => match md.dst_ip {
                Some(ip) if country.eq_ignore_ascii_case("LAN") => is_lan(ip),
                Some(ip) => db
                    .country(ip)
                    .map(|code| code.eq_ignore_ascii_case(country))
                    .unwrap_or(false),
                None => false,
            },
            IpCidr { cidr, source, .. } => {
                let ip = if *source { md.src_ip } else { md.dst_ip };
                ip.map(|ip| cidr.r#match(&ip)).unwrap_or(false)
            }
            Port {
                port, port_type, ..
            } => match port_type {
                PortType::Src => md.src_port == *port,
                PortType::Dst => md.dst_port == *port,
                PortType::Inbound => md.origin_dst.map(|a| a.port()) == Some(*port),
            },
            Process {
                process, name_only, ..
            } => {
                if md.process_path.is_empty() {
                    return false;
                }
                let target = if *name_only {
                    md.process_path
                        .rsplit(['/', '\\'])
                        .next()
                        .unwrap_or(md.process_path.as_str())
                } else {
                    md.process_path.as_str()
                };
                target.eq_ignore_ascii_case(process)
            }
            IpSet { name, lookup, .. } => match md.dst_ip {
                Some(ip) => lookup.test(name, ip).unwrap_or_else(|err| {
                    warn!("check ipset '{}' failed: {}", name, err);
                    false
                }),
                None => false,
            },
            Match { .. } => true,
        }
    }

    pub fn adapter(&self) -> &str {
        use Rule::*;
        match self {
            Domain { adapter, .. }
            | DomainSuffix { adapter, .. }
            | DomainKeyword { adapter, .. }
            | GeoIp { adapter, .. }
            | IpCidr { adapter, .. }
            | Port { adapter, .. }
            | Process { adapter, .. }
            | IpSet { adapter, .. }
            | Match { adapter } => adapter,
        }
    }

    pub fn payload(&self) -> String {
        use Rule::*;
        match self {
            Domain { domain, .. } => domain.clone(),
            DomainSuffix { suffix, .. } => suffix.clone(),
            DomainKeyword { keyword, .. } => keyword.clone(),
            GeoIp { country, .. } => country.clone(),
            IpCidr { cidr, .. } => cidr.to_string(),
            Port { port, .. } => port.to_string(),
            Process { process, .. } => process.clone(),
            IpSet { name, .. } => name.clone(),
            Match { .. } => String::new(),
        }
    }

    pub fn should_resolve_ip(&self) -> bool {
        use Rule::*;
        match self {
            GeoIp { no_resolve, .. } | IpCidr { no_resolve, .. } | IpSet { no_resolve, .. } => {
                !no_resolve
            }
            _ => false,
        }
    }

    pub fn should_find_process(&self) -> bool {
        matches!(self, Rule::Process { .. })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({}) -> {}", self.rule_type(), self.payload(), self.adapter())
    }
}

fn is_lan(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_link_local()
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_lan(v4.into());
            }
            let first = v6.segments()[0];
            v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                // unique local fc00::/7
                || (first & 0xfe00) == 0xfc00
                // link local fe80::/10
                || (first & 0xffc0) == 0xfe80
        }
    }
}

fn has_no_resolve(params: &[String]) -> bool {
    params.iter().any(|p| p == NO_RESOLVE)
}

/// Build a rule from its configuration tag
pub fn parse_rule(
    tp: &str,
    payload: &str,
    target: &str,
    params: &[String],
    ctx: &RuleContext,
) -> Result<Rule, Error> {
    let rule = match tp {
        "DOMAIN" => Rule::domain(payload, target),
        "DOMAIN-SUFFIX" => Rule::domain_suffix(payload, target),
        "DOMAIN-KEYWORD" => Rule::domain_keyword(payload, target),
        "GEOIP" => Rule::geoip(payload, target, has_no_resolve(params), ctx.geoip.clone()),
        "IP-CIDR" | "IP-CIDR6" => Rule::ip_cidr(payload, target, has_no_resolve(params))?,
        "SRC-IP-CIDR" => Rule::src_ip_cidr(payload, target)?,
        "SRC-PORT" => Rule::port(payload, target, PortType::Src)?,
        "DST-PORT" => Rule::port(payload, target, PortType::Dst)?,
        "INBOUND-PORT" => Rule::port(payload, target, PortType::Inbound)?,
        "PROCESS-NAME" => Rule::process(payload, target, true),
        "PROCESS-PATH" => Rule::process(payload, target, false),
        "IPSET" => Rule::ipset(payload, target, has_no_resolve(params), ctx.ipset.clone())?,
        "MATCH" => Rule::match_all(target),
        _ => return Err(Error::unsupported_rule_type(tp)),
    };
    Ok(rule)
}

/// Parse the `TYPE,payload,target[,params..]` form
///
/// `MATCH` rules carry no payload: `MATCH,target`.
pub fn parse_rule_line(line: &str, ctx: &RuleContext) -> Result<Rule, Error> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let (tp, payload, target, params) = match fields.as_slice() {
        [tp, target] => (*tp, "", *target, vec![]),
        [tp, payload, target] => (*tp, *payload, *target, vec![]),
        [tp, payload, target, params @ ..] => (
            *tp,
            *payload,
            *target,
            params.iter().map(|p| p.to_string()).collect(),
        ),
        _ => {
            return Err(Error::RuleFormat {
                line: line.to_owned(),
            })
        }
    };
    parse_rule(tp, payload, target, &params, ctx)
}
