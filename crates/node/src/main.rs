mod config;
mod node;

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use config::NodeConfig;
use node::Node;
use tether::{ConnectionQuality, IpAddress, ProtocolType, TrustZone};

#[derive(Parser)]
#[command(name = "tether-node")]
#[command(about = "Listens for or opens tether connections and exchanges echo traffic")]
struct Args {
    #[arg(long, help = "JSON config file; flags override its values")]
    config: Option<PathBuf>,

    #[arg(long, help = "Transport protocol (udp or tcp)")]
    protocol: Option<ProtocolType>,

    #[arg(short, long, help = "Local IP address to bind")]
    bind: Option<String>,

    #[arg(short, long, help = "Local port to bind")]
    port: Option<u16>,

    #[arg(short, long, help = "Remote host:port to connect to")]
    connect: Option<String>,

    #[arg(long, value_parser = parse_trust_zone, help = "external or internal")]
    trust_zone: Option<TrustZone>,

    #[arg(long, help = "Simulated packet loss percentage (0-100)")]
    loss_percent: Option<i32>,

    #[arg(long, help = "Simulated latency in ms")]
    latency_ms: Option<u64>,

    #[arg(long, help = "Simulated latency variance in ms")]
    variance_ms: Option<u64>,

    #[arg(long)]
    mtu: Option<usize>,

    #[arg(short, long)]
    max_connections: Option<usize>,

    #[arg(long, help = "Interval between pings in ms")]
    send_interval_ms: Option<u64>,

    #[arg(long, help = "Stop after this many seconds")]
    duration_secs: Option<u64>,
}

fn parse_trust_zone(s: &str) -> Result<TrustZone, String> {
    match s.to_ascii_lowercase().as_str() {
        "external" => Ok(TrustZone::ExternalClientToServer),
        "internal" => Ok(TrustZone::InternalServerToServer),
        other => Err(format!("unknown trust zone '{}'", other)),
    }
}

fn resolve(target: &str) -> Result<IpAddress> {
    if let Ok(address) = target.parse::<IpAddress>() {
        return Ok(address);
    }
    let Some((host, port)) = target.rsplit_once(':') else {
        bail!("expected host:port, got '{}'", target);
    };
    let port: u16 = port.parse().with_context(|| format!("invalid port in '{}'", target))?;
    IpAddress::resolve(host, port).with_context(|| format!("resolving {}", host))
}

fn build_config(args: &Args) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };

    if args.connect.is_some() {
        config.connect = args.connect.clone();
    }
    if config.connect.is_some() {
        // connectors take an ephemeral port unless told otherwise
        config.transport.listen = false;
        config.transport.bind_address = IpAddress::unspecified(0);
    }

    let transport = &mut config.transport;
    if let Some(protocol) = args.protocol {
        transport.protocol = protocol;
    }
    if let Some(bind) = &args.bind {
        let ip: IpAddr = bind.parse().with_context(|| format!("invalid bind address '{}'", bind))?;
        transport.bind_address = IpAddress::new(ip, transport.bind_address.port());
    }
    if let Some(port) = args.port {
        transport.bind_address = IpAddress::new(transport.bind_address.ip(), port);
    }
    if let Some(trust_zone) = args.trust_zone {
        transport.trust_zone = trust_zone;
    }
    if let Some(mtu) = args.mtu {
        transport.connection.mtu = mtu;
    }
    if let Some(max_connections) = args.max_connections {
        transport.max_connections = max_connections;
    }

    if args.loss_percent.is_some() || args.latency_ms.is_some() || args.variance_ms.is_some() {
        let mut quality = transport.quality.unwrap_or_default();
        if let Some(loss) = args.loss_percent {
            quality.set_loss_percentage(loss);
        }
        if let Some(latency) = args.latency_ms {
            quality.set_latency(Duration::from_millis(latency));
        }
        if let Some(variance) = args.variance_ms {
            quality.set_variance(Duration::from_millis(variance));
        }
        transport.quality = Some(quality).filter(ConnectionQuality::is_degraded);
    }

    if let Some(interval) = args.send_interval_ms {
        config.send_interval_ms = interval;
    }
    if let Some(duration) = args.duration_secs {
        config.duration_secs = Some(duration);
    }

    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = build_config(&args)?;
    let target = config.connect.as_deref().map(resolve).transpose()?;
    if target.is_some() && config.transport.protocol == ProtocolType::Tcp && config.transport.listen {
        log::warn!("TCP node will both listen and connect");
    }

    let transport = tether::bind(config.transport.clone())
        .with_context(|| format!("binding {} transport", config.transport.protocol))?;
    let mut node = Node::new(transport, config, target);
    log::info!("Node started on {}", node.local_address());

    node.run()?;
    log::info!("Node shutting down");
    Ok(())
}
