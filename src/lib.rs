//! This crate provides a rule-based connection dispatcher for proxy servers.
//!
//! Inbound front-ends hand every accepted TCP connection and every UDP
//! datagram to a [`Dispatcher`]. The dispatcher decides which outbound
//! adapter serves the flow and relays traffic between the two sides.
//!
//! # Feature
//! ## Tunnel mode
//!
//! * `rule`: the first matching rule picks the adapter, `DIRECT` if none matches
//! * `global`: everything goes through the `GLOBAL` group
//! * `direct`: everything goes through `DIRECT`
//!
//! A flow may carry a special proxy name (a tunnel with a fixed `proxy`),
//! which takes precedence over the mode.
//!
//! ## Rules
//!
//! Rules are written as `TYPE,payload,adapter[,no-resolve]`:
//! `DOMAIN`, `DOMAIN-SUFFIX`, `DOMAIN-KEYWORD`, `GEOIP`, `IP-CIDR`,
//! `IP-CIDR6`, `SRC-IP-CIDR`, `SRC-PORT`, `DST-PORT`, `INBOUND-PORT`,
//! `PROCESS-NAME`, `PROCESS-PATH`, `IPSET` and `MATCH,adapter`.
//!
//! IP based rules resolve the host on demand, at most once per flow.
//!
//! ## UDP
//!
//! UDP flows are keyed by client address. The first packet of a flow dials
//! the outbound packet connection; packets arriving meanwhile wait for that
//! dial instead of starting their own. Idle sessions are closed after
//! `udp-idle-timeout-secs` (60 by default).
//!
//! # Usage
//!
//! ## Server
//!
//! Here is a minimum server example.
//!
//! ```rust
//! use std::{time::Duration, thread};
//! use switchyard::*;
//! let mut config = ServerConfig::default();
//! config
//!     .add_rule("DOMAIN-SUFFIX,ads.example,REJECT")
//!     .add_rule("MATCH,DIRECT");
//! let (mut server, tx) = Server::new(config).unwrap();
//! let th = thread::spawn(move || server.serve());
//! thread::sleep(Duration::from_millis(100));
//! tx.send(ServerCommand::Terminate).unwrap();
//! th.join().unwrap().unwrap();
//! ```
//!
//! ## Dispatcher
//!
//! The dispatcher can be driven without any listener:
//!
//! ```rust
//! use std::sync::Arc;
//! use switchyard::*;
//! use switchyard::adapter::Proxy;
//! use switchyard::model::{parse_rule_line, InboundType, Metadata, Network, RuleContext};
//! use switchyard::process::UnsupportedProcessFinder;
//! use switchyard::resolver::{HostMapper, Hosts};
//!
//! let dispatcher = Dispatcher::new(
//!     DispatcherConfig::default(),
//!     Arc::new(HostMapper::new(Hosts::new())),
//!     Arc::new(UnsupportedProcessFinder),
//! );
//! dispatcher
//!     .update_proxies(builtin_proxies().unwrap(), Default::default())
//!     .unwrap();
//! let ctx = RuleContext::default();
//! dispatcher
//!     .update_rules(vec![
//!         parse_rule_line("IP-CIDR,10.0.0.0/8,REJECT", &ctx).unwrap(),
//!         parse_rule_line("MATCH,DIRECT", &ctx).unwrap(),
//!     ])
//!     .unwrap();
//!
//! let mut md = Metadata::new(Network::Tcp, InboundType::Socks5);
//! md.dst_ip = Some("10.1.2.3".parse().unwrap());
//! md.dst_port = 443;
//! let resolution = dispatcher.resolve_metadata(&mut md).unwrap();
//! assert_eq!(resolution.proxy.name(), "REJECT");
//! ```

pub mod acceptor;
pub mod adapter;
pub mod byte_stream;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod inbound;
pub mod model;
pub mod nat;
pub mod pkt_stream;
pub mod pool;
pub mod process;
pub mod relay;
pub mod resolver;
pub mod server;
pub mod server_command;
pub mod statistic;
mod tcp_listener_ext;
mod thread;

pub use config::*;
pub use dispatcher::*;
pub use server::*;
pub use server_command::*;
