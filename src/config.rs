use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use serde::*;

use crate::dispatcher::{DispatcherConfig, TunnelMode};
use crate::error::Error;
use crate::inbound::TunnelConfig;
use crate::model::{parse_rule_line, Address, IpAddr, IpCidr, Network, Rule, RuleContext, SocketAddr};
use crate::resolver::{EnhancedMode, FakeIpPool, HostMapper, Hosts};

pub const DEFAULT_FAKE_IP_RANGE: &str = "198.18.0.1/16";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub mode: TunnelMode,
    /// static host table, exact names or `*.`/`+.` patterns
    pub hosts: Vec<(String, IpAddr)>,
    pub enhanced_mode: EnhancedMode,
    /// defaults to [`DEFAULT_FAKE_IP_RANGE`]
    pub fake_ip_range: Option<IpCidr>,
    pub tunnels: Vec<TunnelConfig>,
    /// rule lines, `TYPE,payload,target[,params]`
    pub rules: Vec<String>,
    pub dispatcher: DispatcherConfig,
    pub client_rw_timeout: Option<Duration>,
    pub accept_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            mode: TunnelMode::Rule,
            hosts: vec![],
            enhanced_mode: EnhancedMode::Normal,
            fake_ip_range: None,
            tunnels: vec![],
            rules: vec![],
            dispatcher: DispatcherConfig::default(),
            client_rw_timeout: Some(Duration::from_millis(2000)),
            accept_timeout: Some(Duration::from_secs(3)),
        }
    }
}

impl ServerConfig {
    pub fn with_file(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let raw: RawConfig = serde_yaml::from_reader(file).map_err(Error::config)?;
        raw.try_into()
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let raw: RawConfig = serde_yaml::from_str(yaml).map_err(Error::config)?;
        raw.try_into()
    }

    /// Parse the rule lines
    pub fn parse_rules(&self, ctx: &RuleContext) -> Result<Vec<Rule>, Error> {
        self.rules
            .iter()
            .map(|line| parse_rule_line(line, ctx).map_err(Error::from))
            .collect()
    }

    pub fn build_hosts(&self) -> Result<Hosts, Error> {
        let mut hosts = Hosts::new();
        for (pattern, ip) in &self.hosts {
            hosts.insert(pattern, *ip)?;
        }
        Ok(hosts)
    }

    pub fn build_resolver(&self) -> Result<HostMapper, Error> {
        let hosts = self.build_hosts()?;
        Ok(match self.enhanced_mode {
            EnhancedMode::Normal => HostMapper::new(hosts),
            EnhancedMode::RedirHost => HostMapper::redir_host(hosts),
            EnhancedMode::FakeIp => {
                let range = match self.fake_ip_range {
                    Some(range) => range,
                    None => DEFAULT_FAKE_IP_RANGE.parse()?,
                };
                HostMapper::fake_ip(hosts, FakeIpPool::new(range)?)
            }
        })
    }

    /// Dispatcher settings with the configured mode
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            mode: self.mode,
            ..self.dispatcher.clone()
        }
    }

    pub fn set_mode(&mut self, mode: TunnelMode) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn add_rule(&mut self, line: &str) -> &mut Self {
        self.rules.push(line.to_owned());
        self
    }

    pub fn add_tunnel(&mut self, tunnel: TunnelConfig) -> &mut Self {
        self.tunnels.push(tunnel);
        self
    }

    pub fn set_udp_fallback_match(&mut self, enable: bool) -> &mut Self {
        self.dispatcher.udp_fallback_match = enable;
        self
    }

    pub fn set_client_rw_timeout(&mut self, dur: Option<Duration>) -> &mut Self {
        self.client_rw_timeout = dur;
        self
    }

    pub fn set_accept_timeout(&mut self, dur: Option<Duration>) -> &mut Self {
        self.accept_timeout = dur;
        self
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct RawConfig {
    mode: TunnelMode,
    hosts: BTreeMap<String, IpAddr>,
    dns: RawDns,
    tunnels: Vec<RawTunnel>,
    rules: Vec<String>,
    experimental: RawExperimental,
    tcp_queue_size: Option<usize>,
    udp_queue_size: Option<usize>,
    udp_workers: Option<usize>,
    tcp_timeout_ms: Option<u64>,
    udp_timeout_ms: Option<u64>,
    udp_idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct RawDns {
    enhanced_mode: EnhancedMode,
    fake_ip_range: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct RawExperimental {
    udp_fallback_match: bool,
}

/// `network/network,listen,target[,proxy]` or the mapping form
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTunnel {
    Compact(String),
    Full {
        network: Vec<Network>,
        address: SocketAddr,
        target: String,
        #[serde(default)]
        proxy: Option<String>,
    },
}

impl TryFrom<RawTunnel> for TunnelConfig {
    type Error = Error;

    fn try_from(raw: RawTunnel) -> Result<Self, Error> {
        let (network, address, target, proxy) = match raw {
            RawTunnel::Full {
                network,
                address,
                target,
                proxy,
            } => (network, address, target, proxy),
            RawTunnel::Compact(line) => {
                let fields: Vec<&str> = line.split(',').map(str::trim).collect();
                let (network, address, target, proxy) = match fields.as_slice() {
                    [n, a, t] => (*n, *a, *t, None),
                    [n, a, t, p] => (*n, *a, *t, Some(p.to_string())),
                    _ => return Err(Error::config(format!("invalid tunnel: {}", line))),
                };
                let network = network
                    .split('/')
                    .map(|n| match n {
                        "tcp" => Ok(Network::Tcp),
                        "udp" => Ok(Network::Udp),
                        _ => Err(Error::config(format!("unknown network {} in tunnel: {}", n, line))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let address = address
                    .parse()
                    .map_err(|_| Error::config(format!("invalid tunnel address: {}", address)))?;
                (network, address, target.to_owned(), proxy)
            }
        };
        if network.is_empty() {
            return Err(Error::config(format!("tunnel {} has no network", address)));
        }
        let target: Address = target
            .parse()
            .map_err(|_| Error::config(format!("invalid tunnel target: {}", target)))?;
        Ok(TunnelConfig {
            network,
            address,
            target,
            proxy: proxy.filter(|p| !p.is_empty()),
        })
    }
}

impl TryFrom<RawConfig> for ServerConfig {
    type Error = Error;

    fn try_from(raw: RawConfig) -> Result<Self, Error> {
        let default = ServerConfig::default();
        let mut dispatcher = default.dispatcher.clone();
        if let Some(n) = raw.tcp_queue_size {
            dispatcher.tcp_queue_size = n;
        }
        if let Some(n) = raw.udp_queue_size {
            dispatcher.udp_queue_size = n;
        }
        if let Some(n) = raw.udp_workers {
            if n == 0 {
                return Err(Error::config("udp-workers must be positive"));
            }
            dispatcher.udp_workers = n;
        }
        if let Some(ms) = raw.tcp_timeout_ms {
            dispatcher.tcp_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.udp_timeout_ms {
            dispatcher.udp_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = raw.udp_idle_timeout_secs {
            dispatcher.udp_idle_timeout = Duration::from_secs(secs);
        }
        dispatcher.mode = raw.mode;
        dispatcher.udp_fallback_match = raw.experimental.udp_fallback_match;

        let fake_ip_range = raw
            .dns
            .fake_ip_range
            .map(|range| range.parse::<IpCidr>())
            .transpose()?;

        let config = ServerConfig {
            mode: raw.mode,
            hosts: raw.hosts.into_iter().collect(),
            enhanced_mode: raw.dns.enhanced_mode,
            fake_ip_range,
            tunnels: raw
                .tunnels
                .into_iter()
                .map(TunnelConfig::try_from)
                .collect::<Result<_, _>>()?,
            rules: raw.rules,
            dispatcher,
            ..default
        };
        // fail on bad rules or host patterns at load time
        config.parse_rules(&RuleContext::default())?;
        config.build_resolver()?;
        Ok(config)
    }
}
