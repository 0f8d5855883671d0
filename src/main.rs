//! A rule-based tunnel server implemented in Rust
//!
//! Switchyardd serves the tunnels of a config file through the switchyard
//! dispatcher. SIGHUP reloads rules and mode from the same file.
//!
use std::io;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::*;

use switchyard as sy;

#[derive(Parser, Debug)]
#[command(name = "switchyardd", version, about)]
struct Opt {
    #[arg(short = 'c', long = "config")]
    /// Set path to config file (format: yaml)
    config: Option<PathBuf>,

    #[arg(short = 'm', long = "mode", value_parser = parse_mode)]
    /// Override the tunnel mode: rule, global or direct
    mode: Option<sy::TunnelMode>,
}

fn parse_mode(s: &str) -> Result<sy::TunnelMode, String> {
    match s {
        "rule" => Ok(sy::TunnelMode::Rule),
        "global" => Ok(sy::TunnelMode::Global),
        "direct" => Ok(sy::TunnelMode::Direct),
        _ => Err(format!("unknown mode: {}", s)),
    }
}

fn load_config(opt: &Opt) -> anyhow::Result<sy::ServerConfig> {
    let mut config = match opt.config {
        Some(ref path) => sy::ServerConfig::with_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => sy::ServerConfig::default(),
    };
    if let Some(mode) = opt.mode {
        config.set_mode(mode);
    }
    Ok(config)
}

fn set_handler(signals: &[i32], handler: impl Fn(i32) + Send + 'static) -> io::Result<()> {
    use signal_hook::iterator::Signals;
    let mut signals = Signals::new(signals)?;
    std::thread::spawn(move || signals.forever().for_each(handler));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    use signal_hook::consts::*;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    println!("switchyardd");
    let opt = Opt::parse();
    debug!("option: {:?}", opt);

    let config = load_config(&opt)?;
    if config.tunnels.is_empty() {
        warn!("no tunnels configured");
    }

    let (mut server, tx) = sy::Server::new(config).context("server config")?;
    {
        let tx = tx.clone();
        set_handler(&[SIGTERM, SIGINT, SIGQUIT], move |_| {
            tx.send(sy::ServerCommand::Terminate).ok();
        })
        .context("setting termination handler")?;
    }
    set_handler(&[SIGHUP], move |_| match load_config(&opt) {
        Ok(config) => {
            tx.send(sy::ServerCommand::Reload(Box::new(config))).ok();
        }
        Err(err) => error!("reload: {:#}", err),
    })
    .context("setting reload handler")?;

    server.serve().context("server error")?;
    Ok(())
}
