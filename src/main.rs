//! PeerTunnel CLI
//!
//! Run a portal, expose a local TCP service through a portal, or open a local
//! port that tunnels to a service exposed by another peer.

mod bridge;
mod config;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{parse_peer, NodeFile};
use peertunnel_client::{TransportInstance, TransportPlugin, TunnelConfig, TunnelNode};
use peertunnel_connection::{DuplexStream, PeerConnection, PeerDialer, StreamError};
use peertunnel_control::{InboundCallback, RelayService};
use peertunnel_net::NetNode;
use peertunnel_proto::PeerId;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LISTEN: &str = "0.0.0.0:8008";

const VERSION: &str = env!("PEERTUNNEL_VERSION");

/// PeerTunnel - Reach peers behind NAT through a portal peer
#[derive(Parser, Debug)]
#[command(name = "peertunnel")]
#[command(about = "PeerTunnel - Reach peers behind NAT through a portal peer")]
#[command(version = VERSION)]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct NodeArgs {
    /// YAML config file
    #[arg(short, long, global = true, env = "PEERTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// This node's peer id (generated when not set)
    #[arg(long, global = true, env = "PEERTUNNEL_IDENTITY")]
    identity: Option<PeerId>,

    /// Known peer as <peer id>=<address>, may be repeated
    #[arg(long = "peer", global = true, value_parser = parse_peer)]
    peers: Vec<(PeerId, SocketAddr)>,

    /// Enable tunnel diagnostics
    #[arg(short, long, global = true, env = "PEERTUNNEL_LOGGING")]
    verbose: bool,
}

#[derive(Args, Debug)]
struct PortalArg {
    /// Portal peer id
    #[arg(long, env = "PEERTUNNEL_PORTAL")]
    portal: Option<PeerId>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept peers and relay tunnels between them
    Portal {
        /// Address to accept peers on
        #[arg(long, env = "PEERTUNNEL_LISTEN")]
        listen: Option<SocketAddr>,
    },

    /// Expose a local TCP service through a portal
    #[command(long_about = r#"
Register with a portal and forward every tunnel opened to this node's
instance to a local TCP service. Registration is retried until Ctrl+C.

EXAMPLES:
  peertunnel expose --portal "@abc...=.ed25519" \
    --peer "@abc...=.ed25519=203.0.113.7:8008" \
    --local 127.0.0.1:22
    "#)]
    Expose {
        #[command(flatten)]
        portal: PortalArg,

        /// Local service to forward tunnels to
        #[arg(long, env = "PEERTUNNEL_LOCAL")]
        local: SocketAddr,

        /// Instance number advertised in the tunnel address
        #[arg(long, default_value = "0")]
        instance: u32,
    },

    /// Accept local TCP connections and tunnel each one to an address
    Connect {
        /// Tunnel address, tunnel:<portal>:<target>:<port>
        address: String,

        /// Local address to accept connections on
        #[arg(long, env = "PEERTUNNEL_BIND")]
        bind: SocketAddr,
    },

    /// Print a portal's clock
    Ping {
        #[command(flatten)]
        portal: PortalArg,
    },

    /// Print the peers registered with a portal
    List {
        #[command(flatten)]
        portal: PortalArg,
    },
}

/// Install the log subscriber; `RUST_LOG` overrides the default directive
fn setup_logging(directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Settings after merging the config file with flags
struct Settings {
    identity: PeerId,
    portal: Option<PeerId>,
    listen: Option<SocketAddr>,
    logging: bool,
    peers: Vec<(PeerId, SocketAddr)>,
}

impl Settings {
    fn resolve(args: NodeArgs, file: NodeFile) -> Self {
        let identity = args
            .identity
            .or(file.identity)
            .unwrap_or_else(PeerId::generate);

        let mut peers: Vec<_> = file.peers.into_iter().collect();
        peers.extend(args.peers);

        Self {
            identity,
            portal: file.portal,
            listen: file.listen,
            logging: args.verbose || file.logging,
            peers,
        }
    }

    fn portal(&self, flag: Option<PeerId>) -> Result<PeerId> {
        flag.or_else(|| self.portal.clone())
            .context("No portal configured (use --portal or the config file)")
    }

    fn tunnel_config(&self, portal: Option<&PeerId>) -> Result<TunnelConfig> {
        let mut builder = TunnelConfig::builder().logging(self.logging);
        if let Some(portal) = portal {
            builder = builder.portal(portal.as_str());
        }
        builder.build().context("Invalid tunnel configuration")
    }
}

/// Node with its TCP session layer and tunnel transport
struct Running {
    net: NetNode,
    node: TunnelNode,
}

impl Running {
    async fn start(settings: &Settings, listen: Option<SocketAddr>) -> Result<Self> {
        let relay = Arc::new(RelayService::new(settings.identity.clone()));
        let net = match listen {
            Some(addr) => NetNode::bind(settings.identity.clone(), relay.clone(), addr)
                .await
                .with_context(|| format!("Failed to listen on {}", addr))?,
            None => NetNode::new(settings.identity.clone(), relay.clone()),
        };
        for (peer, addr) in &settings.peers {
            net.add_peer(peer.clone(), *addr).await;
        }
        let node = TunnelNode::new(Arc::new(net.clone()), relay)
            .context("Failed to start tunnel node")?;

        info!("Peer id: {}", settings.identity);
        if let Some(addr) = net.local_addr() {
            info!("Listening on {}", addr);
        }
        Ok(Self { net, node })
    }

    async fn stop(self) {
        self.node.shutdown();
        self.net.shutdown().await;
    }
}

async fn run_portal(settings: Settings, listen: Option<SocketAddr>) -> Result<()> {
    let listen = match listen.or(settings.listen) {
        Some(addr) => addr,
        None => DEFAULT_LISTEN.parse()?,
    };
    let running = Running::start(&settings, Some(listen)).await?;
    println!("{}", running.node.id());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    running.stop().await;
    Ok(())
}

async fn run_expose(
    settings: Settings,
    portal: Option<PeerId>,
    local: SocketAddr,
    instance: u32,
) -> Result<()> {
    let portal = settings.portal(portal)?;
    let running = Running::start(&settings, settings.listen).await?;
    let config = settings.tunnel_config(Some(&portal))?;

    let on_connect: InboundCallback = Arc::new(move |stream: DuplexStream| {
        tokio::spawn(async move {
            match TcpStream::connect(local).await {
                Ok(socket) => bridge::bridge(socket, stream).await,
                Err(e) => {
                    warn!("Failed to connect to local service {}: {}", local, e);
                    let mut stream = stream;
                    stream
                        .abort(StreamError::ConnectFailed(format!(
                            "local service unavailable: {}",
                            e
                        )))
                        .await;
                }
            }
        });
    });

    let transport = running.node.transport().create(config, instance);
    let handle = transport
        .server(on_connect)
        .await
        .context("Failed to start listener")?;
    match transport.stringify() {
        Some(addr) => println!("{}", addr),
        None => bail!("Listener has no address"),
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    handle.close();
    running.stop().await;
    Ok(())
}

async fn run_connect(settings: Settings, address: String, bind: SocketAddr) -> Result<()> {
    let running = Running::start(&settings, settings.listen).await?;
    let transport = running
        .node
        .transport()
        .create(settings.tunnel_config(None)?, 0);
    if transport.parse(&address).is_none() {
        bail!("Not a tunnel address: {}", address);
    }

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Forwarding {} to {}", bind, address);

    let transport: Arc<dyn TransportInstance> = Arc::from(transport);
    loop {
        let accepted = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer_addr)) => {
                debug!("Accepted connection from {}", peer_addr);
                let transport = transport.clone();
                let address = address.clone();
                tokio::spawn(async move {
                    match transport.client(&address).await {
                        Ok(stream) => bridge::bridge(socket, stream).await,
                        Err(e) => error!("Failed to open tunnel for {}: {}", peer_addr, e),
                    }
                });
            }
            Err(e) => error!("Failed to accept connection: {}", e),
        }
    }

    running.stop().await;
    Ok(())
}

async fn run_ping(settings: Settings, portal: Option<PeerId>) -> Result<()> {
    let portal = settings.portal(portal)?;
    let running = Running::start(&settings, None).await?;
    let connection = running
        .net
        .dial(&portal)
        .await
        .with_context(|| format!("Failed to connect to portal {}", portal))?;
    let ts = connection.ping().await.context("Ping failed")?;
    println!("{}", ts);
    running.stop().await;
    Ok(())
}

async fn run_list(settings: Settings, portal: Option<PeerId>) -> Result<()> {
    let portal = settings.portal(portal)?;
    let running = Running::start(&settings, None).await?;
    let connection = running
        .net
        .dial(&portal)
        .await
        .with_context(|| format!("Failed to connect to portal {}", portal))?;
    for peer in connection.list().await.context("List failed")? {
        println!("{}", peer);
    }
    running.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = match &cli.node.config {
        Some(path) => NodeFile::load(path)?,
        None => NodeFile::default(),
    };
    let settings = Settings::resolve(cli.node, file);
    setup_logging(&settings.tunnel_config(None)?.log_directive());

    match cli.command {
        Commands::Portal { listen } => run_portal(settings, listen).await,
        Commands::Expose {
            portal,
            local,
            instance,
        } => run_expose(settings, portal.portal, local, instance).await,
        Commands::Connect { address, bind } => run_connect(settings, address, bind).await,
        Commands::Ping { portal } => run_ping(settings, portal.portal).await,
        Commands::List { portal } => run_list(settings, portal.portal).await,
    }
}
