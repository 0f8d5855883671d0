//! Connection dispatch.
//!
//! Inbound listeners push accepted connections and datagrams into two
//! bounded queues. The [`Dispatcher`] drains them, decides which outbound
//! adapter serves each flow and relays the traffic.
//!
//! ```text
//!  tcp_in ──> [queue 200] ──> thread per connection ──> relay
//!  udp_in ──> [queue 200] ──> N workers ──> nat table ──> outbound conn
//!                                              │
//!                                              └─ first packet: single-flight dial
//! ```
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use derive_more::Display;
use log::*;
use serde::*;

use crate::adapter::{Chain, Direct, Proxy, ProxyProvider, ProxyRef, DIRECT, GLOBAL};
use crate::context::{ConnContext, PacketAdapter};
use crate::model::{DnsMode, Error, Metadata, Network, Rule};
use crate::nat::{NatTable, SessionConn, SessionLookup};
use crate::pkt_stream::{PacketConn, PacketReply};
use crate::pool::BufferPool;
use crate::process::ProcessFinder;
use crate::relay::relay;
use crate::resolver::Resolver;
use crate::statistic::{Manager, TcpTracker, UdpTracker};
use crate::thread::spawn_thread;

pub const DEFAULT_QUEUE_SIZE: usize = 200;
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MIN_UDP_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    #[display(fmt = "global")]
    Global,
    #[default]
    #[display(fmt = "rule")]
    Rule,
    #[display(fmt = "direct")]
    Direct,
}

/// Runtime settings of a [`Dispatcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub tcp_queue_size: usize,
    pub udp_queue_size: usize,
    pub udp_workers: usize,
    /// dial deadline for TCP flows
    pub tcp_timeout: Duration,
    /// dial deadline for UDP flows
    pub udp_timeout: Duration,
    /// a UDP session without replies for this long is closed
    pub udp_idle_timeout: Duration,
    pub mode: TunnelMode,
    pub udp_fallback_match: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tcp_queue_size: DEFAULT_QUEUE_SIZE,
            udp_queue_size: DEFAULT_QUEUE_SIZE,
            udp_workers: default_udp_workers(),
            tcp_timeout: DEFAULT_TCP_TIMEOUT,
            udp_timeout: DEFAULT_UDP_TIMEOUT,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
            mode: TunnelMode::default(),
            udp_fallback_match: false,
        }
    }
}

pub fn default_udp_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(MIN_UDP_WORKERS)
}

pub type ProxyMap = HashMap<String, ProxyRef>;
pub type ProviderMap = HashMap<String, Arc<dyn ProxyProvider>>;

/// One generation of the routing configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub rules: Arc<Vec<Rule>>,
    pub proxies: Arc<ProxyMap>,
    pub providers: Arc<ProviderMap>,
    pub mode: TunnelMode,
}

impl ConfigSnapshot {
    pub fn new(rules: Vec<Rule>, proxies: ProxyMap, providers: ProviderMap, mode: TunnelMode) -> Self {
        Self {
            rules: Arc::new(rules),
            proxies: Arc::new(proxies),
            providers: Arc::new(providers),
            mode,
        }
    }
}

/// Outcome of resolving a flow to an outbound adapter
#[derive(Debug, Clone)]
pub struct Resolution {
    pub proxy: ProxyRef,
    /// `None` when no rule decided, e.g. the DIRECT fallback
    pub rule: Option<Rule>,
    pub mode: TunnelMode,
}

pub struct Dispatcher {
    settings: DispatcherConfig,
    tcp_tx: Mutex<Option<SyncSender<ConnContext>>>,
    udp_tx: Mutex<Option<SyncSender<PacketAdapter>>>,
    tcp_rx: Mutex<Option<Receiver<ConnContext>>>,
    udp_rx: Mutex<Option<Receiver<PacketAdapter>>>,
    config: RwLock<ConfigSnapshot>,
    nat: Arc<NatTable>,
    resolver: Arc<dyn Resolver>,
    process_finder: Arc<dyn ProcessFinder>,
    stats: Arc<Manager>,
    udp_fallback_match: AtomicBool,
    /// buffers for the return path of UDP sessions
    pool: BufferPool,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .field("nat", &self.nat)
            .field("resolver", &self.resolver)
            .finish()
    }
}

pub struct DispatcherHandle {
    tcp_th: JoinHandle<()>,
    udp_ths: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Wait for the queue loops; they end once every sender is dropped
    pub fn join(self) -> thread::Result<()> {
        let tcp = self.tcp_th.join();
        for th in self.udp_ths {
            th.join()?;
        }
        tcp
    }
}

impl Dispatcher {
    pub fn new(
        settings: DispatcherConfig,
        resolver: Arc<dyn Resolver>,
        process_finder: Arc<dyn ProcessFinder>,
    ) -> Arc<Self> {
        let (tcp_tx, tcp_rx) = mpsc::sync_channel(settings.tcp_queue_size);
        let (udp_tx, udp_rx) = mpsc::sync_channel(settings.udp_queue_size);
        let config = ConfigSnapshot {
            mode: settings.mode,
            ..Default::default()
        };
        Arc::new(Self {
            tcp_tx: Mutex::new(Some(tcp_tx)),
            udp_tx: Mutex::new(Some(udp_tx)),
            tcp_rx: Mutex::new(Some(tcp_rx)),
            udp_rx: Mutex::new(Some(udp_rx)),
            config: RwLock::new(config),
            nat: Arc::new(NatTable::new()),
            resolver,
            process_finder,
            stats: Manager::new(),
            udp_fallback_match: AtomicBool::new(settings.udp_fallback_match),
            pool: BufferPool::default(),
            settings,
        })
    }

    /// Sink for accepted TCP connections; `send` blocks while the queue is full
    pub fn tcp_in(&self) -> Result<SyncSender<ConnContext>, Error> {
        self.tcp_tx
            .lock()?
            .clone()
            .ok_or_else(|| Error::disconnected("tcp queue"))
    }

    /// Sink for UDP packets; producers `try_send` and drop on a full queue
    pub fn udp_in(&self) -> Result<SyncSender<PacketAdapter>, Error> {
        self.udp_tx
            .lock()?
            .clone()
            .ok_or_else(|| Error::disconnected("udp queue"))
    }

    /// Spawn the TCP loop and the UDP workers
    pub fn start(self: &Arc<Self>) -> Result<DispatcherHandle, Error> {
        let tcp_rx = self
            .tcp_rx
            .lock()?
            .take()
            .ok_or_else(|| Error::disconnected("dispatcher already started"))?;
        let udp_rx = self
            .udp_rx
            .lock()?
            .take()
            .ok_or_else(|| Error::disconnected("dispatcher already started"))?;

        let udp_rx = Arc::new(Mutex::new(udp_rx));
        let mut udp_ths = vec![];
        for i in 0..self.settings.udp_workers.max(1) {
            let this = self.clone();
            let rx = udp_rx.clone();
            udp_ths.push(spawn_thread(&format!("udp-worker-{}", i), move || {
                this.process_udp(rx)
            })?);
        }

        let this = self.clone();
        let tcp_th = spawn_thread("tcp-dispatch", move || this.process_tcp(tcp_rx))?;
        info!("dispatcher started with {} udp workers", udp_ths.len());
        Ok(DispatcherHandle { tcp_th, udp_ths })
    }

    /// Drop the dispatcher's own queue senders
    pub fn close(&self) -> Result<(), Error> {
        self.tcp_tx.lock()?.take();
        self.udp_tx.lock()?.take();
        Ok(())
    }

    fn process_tcp(self: Arc<Self>, rx: Receiver<ConnContext>) {
        for ctx in rx {
            let this = self.clone();
            let id = ctx.id;
            if let Err(err) = spawn_thread(&format!("tcp-{}", id), move || this.handle_tcp_conn(ctx)) {
                error!("[TCP] spawn handler for {}: {}", id, err);
            }
        }
        debug!("tcp queue closed");
    }

    fn process_udp(self: Arc<Self>, rx: Arc<Mutex<Receiver<PacketAdapter>>>) {
        loop {
            let pkt = match rx.lock() {
                Ok(rx) => rx.recv(),
                Err(err) => {
                    error!("udp queue poisoned: {}", err);
                    return;
                }
            };
            match pkt {
                Ok(pkt) => self.handle_udp_packet(pkt),
                Err(_) => {
                    debug!("udp queue closed");
                    return;
                }
            }
        }
    }

    fn snapshot(&self) -> Result<ConfigSnapshot, Error> {
        Ok(self.config.read()?.clone())
    }

    pub fn rules(&self) -> Result<Arc<Vec<Rule>>, Error> {
        Ok(self.config.read()?.rules.clone())
    }

    pub fn update_rules(&self, rules: Vec<Rule>) -> Result<(), Error> {
        self.config.write()?.rules = Arc::new(rules);
        Ok(())
    }

    pub fn proxies(&self) -> Result<Arc<ProxyMap>, Error> {
        Ok(self.config.read()?.proxies.clone())
    }

    pub fn providers(&self) -> Result<Arc<ProviderMap>, Error> {
        Ok(self.config.read()?.providers.clone())
    }

    pub fn update_proxies(&self, proxies: ProxyMap, providers: ProviderMap) -> Result<(), Error> {
        let mut config = self.config.write()?;
        config.proxies = Arc::new(proxies);
        config.providers = Arc::new(providers);
        Ok(())
    }

    /// Swap rules, proxies, providers and mode at once
    pub fn reload(&self, snapshot: ConfigSnapshot) -> Result<(), Error> {
        *self.config.write()? = snapshot;
        Ok(())
    }

    pub fn mode(&self) -> Result<TunnelMode, Error> {
        Ok(self.config.read()?.mode)
    }

    pub fn set_mode(&self, mode: TunnelMode) -> Result<(), Error> {
        self.config.write()?.mode = mode;
        info!("tunnel mode: {}", mode);
        Ok(())
    }

    pub fn set_udp_fallback_match(&self, enable: bool) {
        self.udp_fallback_match.store(enable, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &Arc<Manager> {
        &self.stats
    }

    pub fn nat(&self) -> &Arc<NatTable> {
        &self.nat
    }

    /// Normalize the destination of `metadata` before matching.
    ///
    /// Literal IPs given as host move to `dst_ip`. With DNS mapping enabled
    /// a bare destination IP is mapped back to the host it was answered for.
    pub fn pre_handle(&self, metadata: &mut Metadata) -> Result<(), Error> {
        if let Ok(ip) = metadata.host.parse::<IpAddr>() {
            metadata.dst_ip = Some(ip);
            metadata.host.clear();
        }

        let dst_ip = match metadata.dst_ip {
            Some(ip) if self.resolver.mapping_enabled() && metadata.host.is_empty() => ip,
            _ => return Ok(()),
        };
        if let Some(host) = self.resolver.find_host_by_ip(dst_ip) {
            metadata.host = host;
            metadata.dns_mode = DnsMode::Mapping;
            if self.resolver.fake_ip_enabled() {
                metadata.dst_ip = None;
                metadata.dns_mode = DnsMode::FakeIp;
            } else if let Some(ip) = self.resolver.search_hosts(&metadata.host) {
                // redir-host honours the hosts table
                metadata.dst_ip = Some(ip);
            }
        } else if self.resolver.is_fake_ip(dst_ip) {
            return Err(Error::DnsRecordMissing { ip: dst_ip });
        }
        Ok(())
    }

    /// Pick the outbound adapter for `metadata` under the current mode
    pub fn resolve_metadata(&self, metadata: &mut Metadata) -> Result<Resolution, Error> {
        let snapshot = self.snapshot()?;
        let mode = snapshot.mode;
        let lookup = |name: &str| {
            snapshot
                .proxies
                .get(name)
                .cloned()
                .ok_or_else(|| Error::proxy_not_found(name))
        };

        if !metadata.special_proxy.is_empty() {
            let proxy = lookup(&metadata.special_proxy)?;
            return Ok(Resolution {
                proxy,
                rule: None,
                mode,
            });
        }

        match mode {
            TunnelMode::Direct => Ok(Resolution {
                proxy: lookup(DIRECT)?,
                rule: None,
                mode,
            }),
            TunnelMode::Global => Ok(Resolution {
                proxy: lookup(GLOBAL)?,
                rule: None,
                mode,
            }),
            TunnelMode::Rule => Ok(self.match_rules(metadata, &snapshot)),
        }
    }

    /// First matching rule whose adapter is available, else DIRECT.
    ///
    /// The host is resolved at most once, when the first rule that needs
    /// an IP is reached. The same holds for the process lookup.
    pub fn match_rules(&self, metadata: &mut Metadata, snapshot: &ConfigSnapshot) -> Resolution {
        let mut resolved = false;
        let mut process_found = false;

        if let Some(ip) = self.resolver.search_hosts(&metadata.host) {
            metadata.dst_ip = Some(ip);
            resolved = true;
        }

        for rule in snapshot.rules.iter() {
            if !resolved && should_resolve_ip(rule, metadata) {
                match self.resolver.resolve_ip(&metadata.host) {
                    Ok(ip) => {
                        debug!("[DNS] {} --> {}", metadata.host, ip);
                        metadata.dst_ip = Some(ip);
                    }
                    Err(err) => debug!("[DNS] resolve {} error: {}", metadata.host, err),
                }
                resolved = true;
            }

            if !process_found && rule.should_find_process() {
                process_found = true;
                self.find_process(metadata);
            }

            if !rule.matches(metadata) {
                continue;
            }
            let adapter = match snapshot.proxies.get(rule.adapter()) {
                Some(adapter) => adapter,
                None => continue,
            };
            if metadata.network == Network::Udp
                && !adapter.support_udp()
                && self.udp_fallback_match.load(Ordering::Relaxed)
            {
                debug!("[Matcher] {} UDP is not supported, skip match", adapter.name());
                continue;
            }
            return Resolution {
                proxy: adapter.clone(),
                rule: Some(rule.clone()),
                mode: snapshot.mode,
            };
        }

        let proxy = snapshot
            .proxies
            .get(DIRECT)
            .cloned()
            .unwrap_or_else(|| Arc::new(Direct) as ProxyRef);
        Resolution {
            proxy,
            rule: None,
            mode: snapshot.mode,
        }
    }

    fn find_process(&self, metadata: &mut Metadata) {
        let (src_ip, origin_dst) = match (metadata.src_ip, metadata.origin_dst) {
            (Some(src_ip), Some(origin_dst)) => (src_ip, origin_dst),
            _ => return,
        };
        let from = SocketAddr::new(unmap(src_ip), metadata.src_port);
        match self
            .process_finder
            .find_process_path(metadata.network, from, origin_dst)
        {
            Ok(path) => {
                debug!("[Process] {} from process {}", metadata, path);
                metadata.process_path = path;
            }
            Err(err) => debug!("[Process] find process {}: {}", metadata, err),
        }
    }

    /// Serve one TCP connection until either side closes
    pub fn handle_tcp_conn(&self, ctx: ConnContext) {
        let ConnContext {
            id,
            mut metadata,
            conn,
        } = ctx;

        if !metadata.valid() {
            warn!("[Metadata] not valid: {:?}", metadata);
            return;
        }
        if let Err(err) = self.pre_handle(&mut metadata) {
            debug!("[Metadata PreHandle] error: {}", err);
            return;
        }
        let resolution = match self.resolve_metadata(&mut metadata) {
            Ok(resolution) => resolution,
            Err(err) => {
                warn!("[Metadata] parse failed: {}", err);
                return;
            }
        };

        let proxy = &resolution.proxy;
        let (remote, chain) = match proxy.dial(&metadata.pure(), self.settings.tcp_timeout) {
            Ok(remote) => remote,
            Err(err) => {
                log_dial_error("TCP", proxy.name(), resolution.rule.as_ref(), &metadata, &err);
                return;
            }
        };
        let remote = TcpTracker::new(
            remote,
            self.stats.clone(),
            &metadata,
            chain,
            resolution.rule.as_ref(),
        );
        log_decision("TCP", &metadata, &resolution, remote.proxy_chain());
        trace!("[TCP] {} relaying", id);

        if let Err(err) = relay(
            metadata.source_address(),
            metadata.remote_address(),
            conn,
            Box::new(remote),
        ) {
            debug!("[TCP] {} relay ended: {}", id, err);
        }
    }

    /// Forward one UDP packet, creating the session on the first packet of a flow
    pub fn handle_udp_packet(self: &Arc<Self>, mut pkt: PacketAdapter) {
        let mut metadata = pkt.metadata.clone();
        if !metadata.valid() {
            pkt.drop_payload();
            warn!("[Metadata] not valid: {:?}", metadata);
            return;
        }

        // the client asked for a fake ip; replies must appear to come from it
        let fake_addr = metadata
            .dst_ip
            .filter(|ip| self.resolver.is_exist_fake_ip(*ip))
            .map(unmap);

        if let Err(err) = self.pre_handle(&mut metadata) {
            pkt.drop_payload();
            debug!("[Metadata PreHandle] error: {}", err);
            return;
        }

        if !metadata.resolved() {
            match self.resolver.lookup_ip(&metadata.host) {
                Ok(ips) if !ips.is_empty() => metadata.dst_ip = Some(ips[0]),
                Ok(_) => {
                    debug!("[DNS] {} has no address", metadata.host);
                    pkt.drop_payload();
                    return;
                }
                Err(err) => {
                    debug!("[DNS] lookup {} error: {}", metadata.host, err);
                    pkt.drop_payload();
                    return;
                }
            }
        }

        let key = pkt.local_addr().to_string();
        let lock_key = format!("{}-lock", key);
        let lookup = match self.nat.lookup_or_lock(&key, &lock_key) {
            Ok(lookup) => lookup,
            Err(err) => {
                error!("[UDP] nat table: {}", err);
                return;
            }
        };

        match lookup {
            SessionLookup::Established(pc) => {
                self.forward(&pkt, &pc, &metadata);
                pkt.drop_payload();
            }
            SessionLookup::Dialing(lock) => {
                let this = self.clone();
                let spawned = spawn_thread("udp-wait", move || {
                    if let Err(err) = lock.wait() {
                        error!("[UDP] wait for {}: {}", key, err);
                        return;
                    }
                    // one more try, later packets retry on their own
                    if let Ok(Some(pc)) = this.nat.get(&key) {
                        this.forward(&pkt, &pc, &metadata);
                    }
                });
                if let Err(err) = spawned {
                    error!("[UDP] spawn waiter: {}", err);
                }
            }
            SessionLookup::Vacant(lock) => {
                let guard = self.nat.lock_guard(&lock_key, lock);
                let this = self.clone();
                let spawned = spawn_thread("udp-dial", move || {
                    let _guard = guard;
                    this.establish_udp_session(pkt, metadata, key, fake_addr);
                });
                if let Err(err) = spawned {
                    error!("[UDP] spawn dialer: {}", err);
                }
            }
        }
    }

    fn establish_udp_session(
        self: &Arc<Self>,
        pkt: PacketAdapter,
        mut metadata: Metadata,
        key: String,
        fake_addr: Option<IpAddr>,
    ) {
        let resolution = match self.resolve_metadata(&mut metadata) {
            Ok(resolution) => resolution,
            Err(err) => {
                warn!("[UDP] Parse metadata failed: {}", err);
                return;
            }
        };

        let proxy = &resolution.proxy;
        let (raw_pc, chain) = match proxy.listen_packet(&metadata.pure(), self.settings.udp_timeout) {
            Ok(pc) => pc,
            Err(err) => {
                log_dial_error("UDP", proxy.name(), resolution.rule.as_ref(), &metadata, &err);
                return;
            }
        };
        let pc = UdpTracker::new(
            raw_pc,
            self.stats.clone(),
            &metadata,
            chain,
            resolution.rule.as_ref(),
        );
        log_decision("UDP", &metadata, &resolution, pc.proxy_chain());
        let pc: SessionConn = Arc::new(pc);

        // in the table before the return path may remove it
        if let Err(err) = self.nat.set(&key, pc.clone()) {
            error!("[UDP] nat table: {}", err);
            pc.close().ok();
            return;
        }

        let origin_addr = metadata.dst_ip.map(unmap);
        let spawned = {
            let this = self.clone();
            let reply = pkt.reply();
            let pc = pc.clone();
            let key = key.clone();
            spawn_thread("udp-to-local", move || {
                this.handle_udp_to_local(reply, pc, &key, origin_addr, fake_addr)
            })
        };
        if let Err(err) = spawned {
            error!("[UDP] spawn return path for {}: {}", key, err);
            pc.close().ok();
            if let Err(err) = self.nat.delete_if_same(&key, &pc) {
                error!("[UDP] nat table: {}", err);
            }
            return;
        }
        self.forward(&pkt, &pc, &metadata);
    }

    fn forward(&self, pkt: &PacketAdapter, pc: &SessionConn, metadata: &Metadata) {
        let addr = match metadata.udp_addr() {
            Some(addr) => addr,
            None => {
                warn!("[UDP] udp addr invalid: {}", metadata);
                return;
            }
        };
        if let Err(err) = pc.write_to(pkt.data(), addr) {
            debug!("[UDP] write to {}: {}", addr, err);
        }
    }

    /// Copy replies back to the client until the session goes idle
    fn handle_udp_to_local(
        &self,
        reply: Arc<dyn PacketReply>,
        pc: SessionConn,
        key: &str,
        origin_addr: Option<IpAddr>,
        fake_addr: Option<IpAddr>,
    ) {
        let mut buf = self.pool.get();
        if let Err(err) = pc.set_read_timeout(Some(self.settings.udp_idle_timeout)) {
            warn!("[UDP] set idle timeout for {}: {}", key, err);
        }
        loop {
            let (size, mut from) = match pc.read_from(&mut buf) {
                Ok(x) => x,
                Err(err) if err.is_timeout() => {
                    debug!("[UDP] session {} idle, closing", key);
                    break;
                }
                Err(err) => {
                    debug!("[UDP] session {} read: {}", key, err);
                    break;
                }
            };
            if let Some(fake_addr) = fake_addr {
                if Some(unmap(from.ip())) == origin_addr {
                    from.set_ip(fake_addr);
                }
            }
            if let Err(err) = reply.write_back(&buf[..size], from) {
                debug!("[UDP] write back to {}: {}", key, err);
                break;
            }
        }
        pc.close().ok();
        if let Err(err) = self.nat.delete_if_same(key, &pc) {
            error!("[UDP] nat table: {}", err);
        }
    }
}

fn should_resolve_ip(rule: &Rule, metadata: &Metadata) -> bool {
    rule.should_resolve_ip() && !metadata.host.is_empty() && metadata.dst_ip.is_none()
}

fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        ip => ip,
    }
}

fn log_dial_error(tag: &str, proxy: &str, rule: Option<&Rule>, metadata: &Metadata, err: &Error) {
    match rule {
        None => warn!(
            "[{}] dial {} {} --> {} error: {}",
            tag,
            proxy,
            metadata.source_address(),
            metadata.remote_address(),
            err
        ),
        Some(rule) => warn!(
            "[{}] dial {} (match {}/{}) {} --> {} error: {}",
            tag,
            proxy,
            rule.rule_type(),
            rule.payload(),
            metadata.source_address(),
            metadata.remote_address(),
            err
        ),
    }
}

fn log_decision(tag: &str, metadata: &Metadata, resolution: &Resolution, chain: &Chain) {
    let src = metadata.source_address();
    let dst = metadata.remote_address();
    if !metadata.special_proxy.is_empty() {
        info!("[{}] {} --> {} using {}", tag, src, dst, metadata.special_proxy);
    } else if let Some(rule) = &resolution.rule {
        info!(
            "[{}] {} --> {} match {}({}) using {}",
            tag,
            src,
            dst,
            rule.rule_type(),
            rule.payload(),
            chain
        );
    } else if resolution.mode == TunnelMode::Global {
        info!("[{}] {} --> {} using GLOBAL", tag, src, dst);
    } else if resolution.mode == TunnelMode::Direct {
        info!("[{}] {} --> {} using DIRECT", tag, src, dst);
    } else {
        info!("[{}] {} --> {} doesn't match any rule using DIRECT", tag, src, dst);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapter::test::MockProxy;
    use crate::adapter::{Reject, Selector, StaticProvider};
    use crate::byte_stream::test::BufferStream;
    use crate::model::{InboundType, RuleContext};
    use crate::pkt_stream::test::MockReply;
    use crate::process::test::CountingProcessFinder;
    use crate::process::UnsupportedProcessFinder;
    use crate::resolver::test::CountingResolver;
    use std::sync::Barrier;
    use std::time::Instant;

    fn dispatcher_with(resolver: CountingResolver) -> Arc<Dispatcher> {
        let settings = DispatcherConfig {
            udp_workers: 2,
            ..Default::default()
        };
        Dispatcher::new(settings, Arc::new(resolver), Arc::new(UnsupportedProcessFinder))
    }

    fn proxies(list: Vec<ProxyRef>) -> ProxyMap {
        list.into_iter().map(|p| (p.name().to_owned(), p)).collect()
    }

    fn tcp_to(ip: &str, port: u16) -> Metadata {
        let mut md = Metadata::new(Network::Tcp, InboundType::Socks5);
        md.src_ip = Some("10.0.0.2".parse().unwrap());
        md.src_port = 50000;
        md.dst_ip = Some(ip.parse().unwrap());
        md.dst_port = port;
        md
    }

    fn rules(lines: &[&str]) -> Vec<Rule> {
        let ctx = RuleContext::default();
        lines
            .iter()
            .map(|line| crate::model::parse_rule_line(line, &ctx).unwrap())
            .collect()
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn ip_cidr_rule_selects_proxy() {
        let d = dispatcher_with(CountingResolver::default());
        d.update_proxies(
            proxies(vec![Arc::new(MockProxy::new("PROXY1")), Arc::new(Direct)]),
            HashMap::new(),
        )
        .unwrap();
        d.update_rules(rules(&["IP-CIDR,192.0.2.0/24,PROXY1", "MATCH,DIRECT"]))
            .unwrap();

        let mut md = tcp_to("192.0.2.1", 80);
        let res = d.resolve_metadata(&mut md).unwrap();
        assert_eq!(res.proxy.name(), "PROXY1");
        assert_eq!(res.rule.unwrap().payload(), "192.0.2.0/24");
    }

    #[test]
    fn match_rule_falls_through_to_direct() {
        let d = dispatcher_with(CountingResolver::default());
        d.update_proxies(proxies(vec![Arc::new(Direct)]), HashMap::new())
            .unwrap();
        d.update_rules(rules(&["MATCH,DIRECT"])).unwrap();

        let res = d.resolve_metadata(&mut tcp_to("192.0.2.1", 80)).unwrap();
        assert_eq!(res.proxy.name(), DIRECT);
        assert_eq!(res.rule.unwrap().rule_type(), crate::model::RuleType::Match);

        // nothing matches at all: DIRECT without a rule
        d.update_rules(rules(&["DOMAIN,example.com,DIRECT"])).unwrap();
        let res = d.resolve_metadata(&mut tcp_to("192.0.2.1", 80)).unwrap();
        assert_eq!(res.proxy.name(), DIRECT);
        assert!(res.rule.is_none());

        // DIRECT missing from the map still yields a direct adapter
        d.update_proxies(HashMap::new(), HashMap::new()).unwrap();
        let res = d.resolve_metadata(&mut tcp_to("192.0.2.1", 80)).unwrap();
        assert_eq!(res.proxy.name(), DIRECT);
    }

    #[test]
    fn special_proxy_must_exist() {
        let d = dispatcher_with(CountingResolver::default());
        d.update_proxies(proxies(vec![Arc::new(Direct)]), HashMap::new())
            .unwrap();
        let mut md = tcp_to("192.0.2.1", 80);
        md.special_proxy = GLOBAL.to_owned();
        assert!(matches!(
            d.resolve_metadata(&mut md).unwrap_err(),
            Error::ProxyNotFound { .. }
        ));

        md.special_proxy = DIRECT.to_owned();
        let res = d.resolve_metadata(&mut md).unwrap();
        assert_eq!(res.proxy.name(), DIRECT);
        assert!(res.rule.is_none());
    }

    #[test]
    fn stale_adapter_is_skipped() {
        let d = dispatcher_with(CountingResolver::default());
        d.update_proxies(
            proxies(vec![Arc::new(MockProxy::new("PROXY1")), Arc::new(Direct)]),
            HashMap::new(),
        )
        .unwrap();
        d.update_rules(rules(&[
            "IP-CIDR,192.0.2.0/24,GONE",
            "DST-PORT,80,PROXY1",
            "MATCH,DIRECT",
        ]))
        .unwrap();
        let res = d.resolve_metadata(&mut tcp_to("192.0.2.1", 80)).unwrap();
        assert_eq!(res.proxy.name(), "PROXY1");

        // retargeting a rule other than the winner changes nothing
        d.update_rules(rules(&[
            "IP-CIDR,192.0.2.0/24,GONE",
            "DST-PORT,80,PROXY1",
            "MATCH,ALSO-GONE",
        ]))
        .unwrap();
        let res = d.resolve_metadata(&mut tcp_to("192.0.2.1", 80)).unwrap();
        assert_eq!(res.proxy.name(), "PROXY1");
        assert_eq!(res.rule.unwrap().rule_type(), crate::model::RuleType::DstPort);
    }

    #[test]
    fn udp_fallback_match() {
        let d = dispatcher_with(CountingResolver::default());
        d.update_proxies(
            proxies(vec![
                Arc::new(MockProxy::new("TCP-ONLY").without_udp()),
                Arc::new(MockProxy::new("ANY")),
            ]),
            HashMap::new(),
        )
        .unwrap();
        d.update_rules(rules(&["DST-PORT,53,TCP-ONLY", "MATCH,ANY"])).unwrap();

        let mut md = tcp_to("192.0.2.53", 53);
        md.network = Network::Udp;
        assert_eq!(d.resolve_metadata(&mut md.clone()).unwrap().proxy.name(), "TCP-ONLY");

        d.set_udp_fallback_match(true);
        assert_eq!(d.resolve_metadata(&mut md.clone()).unwrap().proxy.name(), "ANY");
        // tcp is unaffected
        md.network = Network::Tcp;
        assert_eq!(d.resolve_metadata(&mut md).unwrap().proxy.name(), "TCP-ONLY");
    }

    #[test]
    fn modes() {
        let d = dispatcher_with(CountingResolver::default());
        let global = Selector::new(GLOBAL, vec![Arc::new(MockProxy::new("PROXY1"))]).unwrap();
        d.update_proxies(
            proxies(vec![Arc::new(Direct), Arc::new(Reject), Arc::new(global)]),
            HashMap::new(),
        )
        .unwrap();
        d.update_rules(rules(&["MATCH,REJECT"])).unwrap();
        assert_eq!(d.mode().unwrap(), TunnelMode::Rule);
        assert_eq!(d.resolve_metadata(&mut tcp_to("192.0.2.1", 80)).unwrap().proxy.name(), "REJECT");

        d.set_mode(TunnelMode::Global).unwrap();
        let res = d.resolve_metadata(&mut tcp_to("192.0.2.1", 80)).unwrap();
        assert_eq!(res.proxy.name(), GLOBAL);
        assert_eq!(res.mode, TunnelMode::Global);
        assert!(res.rule.is_none());

        d.set_mode(TunnelMode::Direct).unwrap();
        assert_eq!(d.resolve_metadata(&mut tcp_to("192.0.2.1", 80)).unwrap().proxy.name(), DIRECT);
    }

    #[test]
    fn resolves_host_at_most_once() {
        let resolver = Arc::new(CountingResolver::new(&[("example.com", "192.0.2.7")]));
        let d = Dispatcher::new(
            DispatcherConfig::default(),
            resolver.clone(),
            Arc::new(UnsupportedProcessFinder),
        );
        d.update_proxies(
            proxies(vec![Arc::new(MockProxy::new("PROXY1")), Arc::new(Direct)]),
            HashMap::new(),
        )
        .unwrap();
        d.update_rules(rules(&[
            "IP-CIDR,198.51.100.0/24,DIRECT",
            "GEOIP,LAN,DIRECT",
            "IP-CIDR,192.0.2.0/24,PROXY1",
        ]))
        .unwrap();

        let mut md = Metadata::new(Network::Tcp, InboundType::Http);
        md.host = "example.com".to_owned();
        md.dst_port = 443;
        let res = d.resolve_metadata(&mut md).unwrap();
        assert_eq!(res.proxy.name(), "PROXY1");
        assert_eq!(md.dst_ip, Some("192.0.2.7".parse().unwrap()));
        assert_eq!(resolver.resolve_calls(), 1);

        // failure is swallowed and not retried by later rules
        let mut md = Metadata::new(Network::Tcp, InboundType::Http);
        md.host = "unknown.example".to_owned();
        let res = d.resolve_metadata(&mut md).unwrap();
        assert_eq!(res.proxy.name(), DIRECT);
        assert!(md.dst_ip.is_none());
        assert_eq!(resolver.resolve_calls(), 2);
    }

    #[test]
    fn hosts_table_suppresses_resolution() {
        let mut resolver = CountingResolver::new(&[("nas.lan", "203.0.113.1")]);
        resolver
            .hosts
            .insert("nas.lan", "192.168.1.10".parse().unwrap())
            .unwrap();
        let resolver = Arc::new(resolver);
        let d = Dispatcher::new(
            DispatcherConfig::default(),
            resolver.clone(),
            Arc::new(UnsupportedProcessFinder),
        );
        d.update_proxies(proxies(vec![Arc::new(MockProxy::new("LAN"))]), HashMap::new())
            .unwrap();
        d.update_rules(rules(&["IP-CIDR,192.168.0.0/16,LAN"])).unwrap();

        let mut md = Metadata::new(Network::Tcp, InboundType::Http);
        md.host = "nas.lan".to_owned();
        assert_eq!(d.resolve_metadata(&mut md).unwrap().proxy.name(), "LAN");
        assert_eq!(resolver.resolve_calls(), 0);
    }

    #[test]
    fn finds_process_at_most_once() {
        let finder = Arc::new(CountingProcessFinder::new("/usr/bin/curl"));
        let d = Dispatcher::new(
            DispatcherConfig::default(),
            Arc::new(CountingResolver::default()),
            finder.clone(),
        );
        d.update_proxies(
            proxies(vec![Arc::new(MockProxy::new("CURL")), Arc::new(Direct)]),
            HashMap::new(),
        )
        .unwrap();
        d.update_rules(rules(&[
            "PROCESS-NAME,wget,DIRECT",
            "PROCESS-PATH,/usr/bin/wget,DIRECT",
            "PROCESS-NAME,curl,CURL",
        ]))
        .unwrap();

        let mut md = tcp_to("192.0.2.1", 80);
        md.origin_dst = Some("192.0.2.1:80".parse().unwrap());
        assert_eq!(d.resolve_metadata(&mut md).unwrap().proxy.name(), "CURL");
        assert_eq!(md.process_path, "/usr/bin/curl");
        assert_eq!(finder.calls(), 1);

        // without an origin destination there is nothing to look up
        let mut md = tcp_to("192.0.2.1", 80);
        assert_eq!(d.resolve_metadata(&mut md).unwrap().proxy.name(), DIRECT);
        assert_eq!(finder.calls(), 1);
    }

    #[test]
    fn pre_handle_literal_host() {
        let d = dispatcher_with(CountingResolver::default());
        let mut md = Metadata::new(Network::Tcp, InboundType::Http);
        md.host = "192.0.2.9".to_owned();
        d.pre_handle(&mut md).unwrap();
        assert!(md.host.is_empty());
        assert_eq!(md.dst_ip, Some("192.0.2.9".parse().unwrap()));
    }

    #[test]
    fn pre_handle_fake_ip() {
        let resolver = CountingResolver::default().with_fake_ip("198.18.0.0/16");
        let fake = resolver.fake_ip.as_ref().unwrap().lookup("video.example").unwrap();
        let d = dispatcher_with(resolver);

        let mut md = tcp_to(&fake.to_string(), 443);
        d.pre_handle(&mut md).unwrap();
        assert_eq!(md.host, "video.example");
        assert_eq!(md.dst_ip, None);
        assert_eq!(md.dns_mode, DnsMode::FakeIp);

        let mut md = tcp_to("198.18.0.5", 80);
        assert!(matches!(
            d.pre_handle(&mut md).unwrap_err(),
            Error::DnsRecordMissing { .. }
        ));

        // outside the fake range nothing happens
        let mut md = tcp_to("192.0.2.1", 80);
        d.pre_handle(&mut md).unwrap();
        assert!(md.host.is_empty());
    }

    #[test]
    fn update_rules_round_trip() {
        let d = dispatcher_with(CountingResolver::default());
        let list = rules(&[
            "DOMAIN-SUFFIX,example.com,PROXY1",
            "SRC-PORT,5353,DIRECT",
            "MATCH,DIRECT",
        ]);
        let expected: Vec<String> = list.iter().map(|r| r.to_string()).collect();
        d.update_rules(list).unwrap();
        let got: Vec<String> = d.rules().unwrap().iter().map(|r| r.to_string()).collect();
        assert_eq!(got, expected);

        let provider: Arc<dyn ProxyProvider> = Arc::new(StaticProvider::new("sub", vec![]));
        let mut providers = ProviderMap::new();
        providers.insert("sub".to_owned(), provider);
        d.update_proxies(proxies(vec![Arc::new(Direct)]), providers).unwrap();
        assert!(d.proxies().unwrap().contains_key(DIRECT));
        assert!(d.providers().unwrap().contains_key("sub"));
    }

    #[test]
    fn config_swap_is_atomic() {
        let d = dispatcher_with(CountingResolver::default());
        let generation = |name: &str| {
            let line = format!("MATCH,{}", name);
            ConfigSnapshot::new(
                rules(&[line.as_str()]),
                proxies(vec![Arc::new(MockProxy::new(name))]),
                HashMap::new(),
                TunnelMode::Rule,
            )
        };
        d.reload(generation("GEN-A")).unwrap();

        let writer = {
            let d = d.clone();
            let (a, b) = (generation("GEN-A"), generation("GEN-B"));
            thread::spawn(move || {
                for i in 0..2000 {
                    d.reload(if i % 2 == 0 { b.clone() } else { a.clone() }).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let d = d.clone();
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let res = d.resolve_metadata(&mut tcp_to("192.0.2.1", 80)).unwrap();
                        // a mixed generation would fall back to DIRECT
                        assert!(res.rule.is_some(), "mixed generation observed");
                        assert!(["GEN-A", "GEN-B"].contains(&res.proxy.name()));
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn tcp_end_to_end() {
        let d = dispatcher_with(CountingResolver::default());
        let remote = BufferStream::with_buffer(b"response".to_vec().into(), vec![].into());
        let proxy = Arc::new(MockProxy::new("PROXY1").with_stream(remote.clone()));
        d.update_proxies(proxies(vec![proxy.clone()]), HashMap::new()).unwrap();
        d.update_rules(rules(&["DST-PORT,80,PROXY1"])).unwrap();

        let client = BufferStream::with_buffer(b"request".to_vec().into(), vec![].into());
        let mut md = tcp_to("192.0.2.1", 80);
        md.host = "www.example.com".to_owned();
        d.handle_tcp_conn(ConnContext::new(md, Box::new(client.clone())));

        assert_eq!(proxy.dials(), 1);
        assert_eq!(remote.written(), b"request");
        assert_eq!(client.written(), b"response");
        assert!(d.stats().is_empty());
        let snapshot = d.stats().snapshot().unwrap();
        assert_eq!(snapshot.upload_total, 7);
        assert_eq!(snapshot.download_total, 8);
    }

    #[test]
    fn tcp_dial_failure_and_invalid_metadata() {
        let d = dispatcher_with(CountingResolver::default());
        let proxy = Arc::new(MockProxy::new("DOWN").failing());
        d.update_proxies(proxies(vec![proxy.clone()]), HashMap::new()).unwrap();
        d.update_rules(rules(&["MATCH,DOWN"])).unwrap();

        let client = BufferStream::with_buffer(b"request".to_vec().into(), vec![].into());
        d.handle_tcp_conn(ConnContext::new(tcp_to("192.0.2.1", 80), Box::new(client.clone())));
        assert_eq!(proxy.dials(), 1);
        assert!(client.written().is_empty());

        let invalid = Metadata::new(Network::Tcp, InboundType::Http);
        d.handle_tcp_conn(ConnContext::new(invalid, Box::new(client)));
        assert_eq!(proxy.dials(), 1);
    }

    #[test]
    fn tcp_stale_fake_ip_is_dropped() {
        let resolver = CountingResolver::default().with_fake_ip("198.18.0.0/16");
        let d = dispatcher_with(resolver);
        let proxy = Arc::new(MockProxy::new("PROXY1"));
        d.update_proxies(proxies(vec![proxy.clone()]), HashMap::new()).unwrap();
        d.update_rules(rules(&["MATCH,PROXY1"])).unwrap();

        let client = BufferStream::with_buffer(b"request".to_vec().into(), vec![].into());
        d.handle_tcp_conn(ConnContext::new(tcp_to("198.18.0.5", 443), Box::new(client.clone())));
        assert_eq!(proxy.dials(), 0);
        assert!(client.written().is_empty());
        assert!(d.stats().is_empty());
    }

    #[test]
    fn tcp_queue_is_drained() {
        let d = dispatcher_with(CountingResolver::default());
        let remote = BufferStream::with_buffer(b"pong".to_vec().into(), vec![].into());
        let proxy = Arc::new(MockProxy::new("PROXY1").with_stream(remote));
        d.update_proxies(proxies(vec![proxy.clone()]), HashMap::new()).unwrap();
        d.update_rules(rules(&["MATCH,PROXY1"])).unwrap();

        let handle = d.start().unwrap();
        assert!(d.start().is_err());
        let tx = d.tcp_in().unwrap();
        let client = BufferStream::with_buffer(b"ping".to_vec().into(), vec![].into());
        tx.send(ConnContext::new(tcp_to("192.0.2.1", 80), Box::new(client.clone())))
            .unwrap();
        wait_until("relay", || client.written() == b"pong");
        assert_eq!(proxy.dials(), 1);

        drop(tx);
        d.close().unwrap();
        assert!(d.tcp_in().is_err());
        handle.join().unwrap();
    }

    fn udp_packet(pool: &BufferPool, client: &Arc<MockReply>, dst: &str, data: &[u8]) -> PacketAdapter {
        let mut md = Metadata::new(Network::Udp, InboundType::Tunnel);
        md.src_ip = Some(client.client.ip());
        md.src_port = client.client.port();
        let dst: SocketAddr = dst.parse().unwrap();
        md.dst_ip = Some(dst.ip());
        md.dst_port = dst.port();
        let mut buf = pool.get();
        buf[..data.len()].copy_from_slice(data);
        buf.truncate(data.len());
        PacketAdapter::new(md, buf, client.clone())
    }

    #[test]
    fn udp_first_packets_dial_once() {
        const N: usize = 8;
        let d = dispatcher_with(CountingResolver::default());
        let proxy = Arc::new(MockProxy::new("PROXY1").with_delay(Duration::from_millis(100)));
        d.update_proxies(proxies(vec![proxy.clone()]), HashMap::new()).unwrap();
        d.update_rules(rules(&["MATCH,PROXY1"])).unwrap();

        let pool = BufferPool::new(64);
        let client = Arc::new(MockReply::new("10.0.0.2:40000".parse().unwrap()));
        let barrier = Arc::new(Barrier::new(N));
        let senders: Vec<_> = (0..N)
            .map(|i| {
                let d = d.clone();
                let pkt = udp_packet(&pool, &client, "192.0.2.53:53", format!("q{}", i).as_bytes());
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    d.handle_udp_packet(pkt);
                })
            })
            .collect();
        for s in senders {
            s.join().unwrap();
        }

        wait_until("all packets handled", || pool.outstanding() == 0);
        assert_eq!(proxy.listens(), 1);
        assert_eq!(d.nat().len().unwrap(), 1);
        assert_eq!(d.nat().lock_count(), 0);
        let sent = proxy.packet_conn.sent();
        assert_eq!(sent.len(), N);
        assert!(sent.iter().all(|(_, to)| *to == "192.0.2.53:53".parse().unwrap()));

        // later packets take the fast path
        d.handle_udp_packet(udp_packet(&pool, &client, "192.0.2.53:53", b"again"));
        assert_eq!(proxy.packet_conn.sent().len(), N + 1);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(proxy.listens(), 1);
    }

    #[test]
    fn udp_dial_failure_leaves_no_session() {
        let d = dispatcher_with(CountingResolver::default());
        let proxy = Arc::new(MockProxy::new("DOWN").failing());
        d.update_proxies(proxies(vec![proxy.clone()]), HashMap::new()).unwrap();
        d.update_rules(rules(&["MATCH,DOWN"])).unwrap();

        let pool = BufferPool::new(64);
        let client = Arc::new(MockReply::new("10.0.0.2:40001".parse().unwrap()));
        d.handle_udp_packet(udp_packet(&pool, &client, "192.0.2.53:53", b"q"));
        wait_until("dial attempt", || pool.outstanding() == 0);
        wait_until("lock release", || d.nat().lock_count() == 0);
        assert!(d.nat().is_empty().unwrap());

        // the next packet tries again from scratch
        d.handle_udp_packet(udp_packet(&pool, &client, "192.0.2.53:53", b"q"));
        wait_until("second dial", || proxy.listens() == 2);
        wait_until("buffers", || pool.outstanding() == 0);
    }

    #[test]
    fn udp_drops_invalid_and_unresolvable() {
        let d = dispatcher_with(CountingResolver::default());
        let pool = BufferPool::new(64);
        let client = Arc::new(MockReply::new("10.0.0.2:40002".parse().unwrap()));

        let mut pkt = udp_packet(&pool, &client, "192.0.2.53:53", b"q");
        pkt.metadata.dst_ip = None;
        d.handle_udp_packet(pkt);
        assert_eq!(pool.outstanding(), 0);

        let mut pkt = udp_packet(&pool, &client, "192.0.2.53:53", b"q");
        pkt.metadata.dst_ip = None;
        pkt.metadata.host = "nowhere.example".to_owned();
        d.handle_udp_packet(pkt);
        assert_eq!(pool.outstanding(), 0);
        assert!(d.nat().is_empty().unwrap());
    }

    #[test]
    fn udp_stale_fake_ip_is_dropped() {
        let resolver = CountingResolver::default().with_fake_ip("198.18.0.0/16");
        let d = dispatcher_with(resolver);
        let proxy = Arc::new(MockProxy::new("PROXY1"));
        d.update_proxies(proxies(vec![proxy.clone()]), HashMap::new()).unwrap();
        d.update_rules(rules(&["MATCH,PROXY1"])).unwrap();

        let pool = BufferPool::new(64);
        let client = Arc::new(MockReply::new("10.0.0.2:40004".parse().unwrap()));
        d.handle_udp_packet(udp_packet(&pool, &client, "198.18.0.5:53", b"q"));
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(proxy.listens(), 0);
        assert!(d.nat().is_empty().unwrap());
        assert_eq!(d.nat().lock_count(), 0);
    }

    #[test]
    fn udp_session_closed_at_once_is_removed() {
        const N: u16 = 200;
        let d = dispatcher_with(CountingResolver::default());
        d.update_proxies(proxies(vec![Arc::new(Reject)]), HashMap::new())
            .unwrap();
        d.update_rules(rules(&["MATCH,REJECT"])).unwrap();

        // every reject session ends on its first read
        let pool = BufferPool::new(64);
        for i in 0..N {
            let client = Arc::new(MockReply::new(SocketAddr::from(([10, 0, 0, 3], 20000 + i))));
            d.handle_udp_packet(udp_packet(&pool, &client, "192.0.2.53:53", b"q"));
        }
        wait_until("dials finished", || {
            pool.outstanding() == 0 && d.nat().lock_count() == 0
        });
        wait_until("sessions removed", || d.nat().is_empty().unwrap());
        wait_until("trackers released", || d.stats().is_empty());

        // the flow starts over with a fresh session
        let client = Arc::new(MockReply::new("10.0.0.3:20000".parse().unwrap()));
        d.handle_udp_packet(udp_packet(&pool, &client, "192.0.2.53:53", b"q"));
        wait_until("second session removed", || {
            pool.outstanding() == 0 && d.nat().is_empty().unwrap() && d.stats().is_empty()
        });
    }

    #[test]
    fn udp_reply_from_fake_ip() {
        let resolver = CountingResolver::new(&[("dns.example", "192.0.2.53")])
            .with_fake_ip("198.18.0.0/16");
        let fake = resolver.fake_ip.as_ref().unwrap().lookup("dns.example").unwrap();
        let settings = DispatcherConfig {
            udp_idle_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let d = Dispatcher::new(settings, Arc::new(resolver), Arc::new(UnsupportedProcessFinder));
        let proxy = Arc::new(MockProxy::new("PROXY1"));
        d.update_proxies(proxies(vec![proxy.clone()]), HashMap::new()).unwrap();
        d.update_rules(rules(&["MATCH,PROXY1"])).unwrap();

        let pool = BufferPool::new(64);
        let client = Arc::new(MockReply::new("10.0.0.2:40003".parse().unwrap()));
        let dst = SocketAddr::new(fake, 53).to_string();
        d.handle_udp_packet(udp_packet(&pool, &client, &dst, b"query"));
        wait_until("forwarded", || proxy.packet_conn.sent().len() == 1);
        assert_eq!(
            proxy.packet_conn.sent()[0].1,
            "192.0.2.53:53".parse().unwrap()
        );

        proxy.packet_conn.push_reply(b"answer", "192.0.2.53:53".parse().unwrap());
        proxy.packet_conn.push_reply(b"other", "192.0.2.99:53".parse().unwrap());
        wait_until("written back", || client.written().len() == 2);
        let written = client.written();
        assert_eq!(written[0], (b"answer".to_vec(), SocketAddr::new(fake, 53)));
        assert_eq!(written[1].1, "192.0.2.99:53".parse().unwrap());

        // idle sessions are evicted
        wait_until("eviction", || d.nat().is_empty().unwrap());
        assert!(proxy.packet_conn.closed.load(Ordering::Acquire));
        wait_until("tracker released", || d.stats().is_empty());
    }
}
