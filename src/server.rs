use std::collections::HashMap;
use std::sync::{
    mpsc::{self, Receiver, SyncSender},
    Arc,
};

use log::*;

use crate::acceptor::{Binder, TcpBinder};
use crate::adapter::{Direct, ProxyRef, Reject, Selector, GLOBAL};
use crate::config::ServerConfig;
use crate::dispatcher::{ConfigSnapshot, Dispatcher, DispatcherHandle, ProviderMap, ProxyMap};
use crate::error::Error;
use crate::inbound::{spawn_tcp_tunnel, spawn_udp_tunnel, ListenerHandle};
use crate::model::{Network, RuleContext};
use crate::pool::BufferPool;
use crate::process::UnsupportedProcessFinder;
use crate::server_command::ServerCommand;

pub struct Server<B> {
    config: ServerConfig,
    tx_cmd: SyncSender<ServerCommand>,
    rx_cmd: Receiver<ServerCommand>,
    /// bind tunnel addresses
    binder: B,
    dispatcher: Arc<Dispatcher>,
    /// buffers for inbound datagrams
    pool: BufferPool,
    rule_ctx: RuleContext,
}

/// DIRECT, REJECT and the GLOBAL group over both
pub fn builtin_proxies() -> Result<ProxyMap, Error> {
    let direct: ProxyRef = Arc::new(Direct);
    let reject: ProxyRef = Arc::new(Reject);
    let global: ProxyRef = Arc::new(Selector::new(GLOBAL, vec![direct.clone(), reject.clone()])?);
    Ok([direct, reject, global]
        .into_iter()
        .map(|p| (p.name().to_owned(), p))
        .collect::<HashMap<_, _>>())
}

/// Rules, adapters and mode of `config` as one generation
pub fn build_snapshot(config: &ServerConfig, ctx: &RuleContext) -> Result<ConfigSnapshot, Error> {
    Ok(ConfigSnapshot::new(
        config.parse_rules(ctx)?,
        builtin_proxies()?,
        ProviderMap::new(),
        config.mode,
    ))
}

impl Server<TcpBinder> {
    pub fn new(config: ServerConfig) -> Result<(Self, SyncSender<ServerCommand>), Error> {
        let binder = TcpBinder::new(config.client_rw_timeout, config.accept_timeout);
        Server::with_binder(config, binder)
    }
}

impl<B> Server<B>
where
    B: Binder,
{
    pub fn with_binder(
        config: ServerConfig,
        binder: B,
    ) -> Result<(Self, SyncSender<ServerCommand>), Error> {
        let rule_ctx = RuleContext::default();
        let resolver = Arc::new(config.build_resolver()?);
        let dispatcher = Dispatcher::new(
            config.dispatcher_config(),
            resolver,
            Arc::new(UnsupportedProcessFinder),
        );
        dispatcher.reload(build_snapshot(&config, &rule_ctx)?)?;

        let (tx, rx) = mpsc::sync_channel(0);
        Ok((
            Self {
                config,
                tx_cmd: tx.clone(),
                rx_cmd: rx,
                binder,
                dispatcher,
                pool: BufferPool::default(),
                rule_ctx,
            },
            tx,
        ))
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Sender for commands to this server
    pub fn command_sender(&self) -> SyncSender<ServerCommand> {
        self.tx_cmd.clone()
    }

    fn spawn_listeners(&self) -> Result<Vec<ListenerHandle>, Error> {
        let mut listeners = vec![];
        for tunnel in &self.config.tunnels {
            for network in &tunnel.network {
                let listener = match network {
                    Network::Tcp => spawn_tcp_tunnel(&self.binder, tunnel, self.dispatcher.tcp_in()?)?,
                    Network::Udp => spawn_udp_tunnel(
                        tunnel,
                        self.dispatcher.udp_in()?,
                        self.pool.clone(),
                        self.config.accept_timeout,
                    )?,
                };
                listeners.push(listener);
            }
        }
        Ok(listeners)
    }

    pub fn serve(&mut self) -> Result<(), Error> {
        let dispatch_handle = self.dispatcher.start()?;
        // dropped handles make the listeners already spawned stop
        let listeners = match self.spawn_listeners() {
            Ok(listeners) => listeners,
            Err(err) => {
                self.dispatcher.close()?;
                return Err(err);
            }
        };

        while let Ok(cmd) = self.rx_cmd.recv() {
            use ServerCommand::*;
            info!("cmd: {:?}", cmd);
            match cmd {
                Terminate => {
                    self.shutdown(listeners, dispatch_handle)?;
                    break;
                }
                Reload(config) => match self.reload(*config) {
                    Ok(()) => info!("config reloaded"),
                    Err(err) => error!("reload failed, keeping current config: {}", err),
                },
            }
        }
        info!("server shutdown");
        Ok(())
    }

    fn shutdown(
        &self,
        listeners: Vec<ListenerHandle>,
        dispatch_handle: DispatcherHandle,
    ) -> Result<(), Error> {
        trace!("stopping listener threads...");
        listeners.iter().for_each(|l| l.stop());
        for listener in listeners {
            let addr = listener.local_addr();
            if listener.join().is_err() {
                error!("listener panic: {}", addr);
            }
        }
        trace!("listener threads are stopped");
        self.dispatcher.close()?;
        if dispatch_handle.join().is_err() {
            error!("dispatcher panic");
        }
        trace!("dispatcher is stopped");
        Ok(())
    }

    fn reload(&mut self, config: ServerConfig) -> Result<(), Error> {
        let snapshot = build_snapshot(&config, &self.rule_ctx)?;
        if config.tunnels != self.config.tunnels
            || config.enhanced_mode != self.config.enhanced_mode
            || config.hosts != self.config.hosts
        {
            warn!("tunnels and dns settings take effect after restart");
        }
        self.dispatcher.reload(snapshot)?;
        self.dispatcher
            .set_udp_fallback_match(config.dispatcher.udp_fallback_match);
        self.config.mode = config.mode;
        self.config.rules = config.rules;
        self.config.dispatcher.udp_fallback_match = config.dispatcher.udp_fallback_match;
        Ok(())
    }
}
