//! Beacon Node
//!
//! Daemon and command-line interface of a randomness beacon node:
//! - Key pair generation
//! - Running every network found on disk behind HTTP/WebSocket listeners
//! - Triggering setups, resharings and terminations on a running daemon

mod client;
mod config;
mod gateway;

use anyhow::{bail, Context, Result};
use axum::Router;
use beacon_core::clock::{Clock, SystemClock};
use beacon_core::key::KeyPair;
use beacon_core::net::ProtocolClient;
use beacon_core::protocol::{LeaderParams, ProtocolConfig, Registry, SetupRole, V2};
use beacon_core::{Group, NetworkId, ReshareRequest, Server, SetupRequest, DEFAULT_PERIOD, DEFAULT_THRESHOLD};
use clap::{Args, Parser, Subcommand};
use client::{ControlClient, HttpClient};
use config::NodeConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Beacon Node - threshold randomness beacon
#[derive(Parser)]
#[command(name = "beacon-node")]
#[command(about = "Threshold randomness beacon node")]
#[command(version)]
struct Cli {
    /// Root folder of the node: key pair and networks
    #[arg(long, env = "BEACON_FOLDER", default_value = "./beacon", global = true)]
    folder: PathBuf,

    /// Control listener, local only
    #[arg(long, env = "BEACON_CONTROL_LISTEN", default_value = "127.0.0.1:8888", global = true)]
    control: String,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the long-term key pair of this node
    GenerateKeypair {
        /// Address peers reach this node at (host:port)
        #[arg(long)]
        address: String,

        /// Overwrite an existing key pair
        #[arg(long)]
        force: bool,
    },

    /// Run the daemon
    Start {
        /// Listener for peer calls, defaults to the key pair address
        #[arg(long, env = "BEACON_PRIVATE_LISTEN")]
        private_listen: Option<String>,

        /// Extra listener serving the public routes only
        #[arg(long, env = "BEACON_PUBLIC_LISTEN")]
        public_listen: Option<String>,

        /// JSON file with beacon tunables
        #[arg(long)]
        beacon_config: Option<PathBuf>,
    },

    /// Terminate one network, or stop the daemon
    Stop {
        /// Network to terminate, hex encoded; `-` for the legacy network
        #[arg(long)]
        id: Option<String>,
    },

    /// Set up a new network
    Share(ShareArgs),

    /// Reshare a running network, or join it
    Reshare {
        /// Network to reshare, hex encoded
        #[arg(long)]
        id: String,

        /// Leave the network: take part in the resharing only as a dealer
        #[arg(long)]
        leaving: bool,

        #[command(flatten)]
        share: ShareArgs,
    },

    /// Reload the networks found on disk
    Load,

    /// Show the networks run by the daemon
    Status,
}

#[derive(Args)]
struct ShareArgs {
    /// Lead the setup
    #[arg(long, conflicts_with = "connect")]
    leader: bool,

    /// Address of the leader to join
    #[arg(long)]
    connect: Option<String>,

    /// Secret shared by every participant
    #[arg(long, env = "BEACON_SECRET")]
    secret: String,

    /// Number of nodes expected, leader included
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: usize,

    /// Round period in seconds
    #[arg(long, default_value_t = DEFAULT_PERIOD)]
    period: u64,

    /// Seconds between the end of the setup and genesis (or the transition)
    #[arg(long, default_value_t = 30)]
    genesis_delay: u64,

    /// DKG phase timeout in seconds, 0 for the node default
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Protocol version
    #[arg(long, default_value = V2)]
    version: String,
}

impl ShareArgs {
    fn role(&self, leaving: bool) -> Result<SetupRole> {
        if self.leader {
            return Ok(SetupRole::Leader(LeaderParams {
                nodes: self.nodes,
                threshold: self.threshold,
                period: self.period,
                delay: self.genesis_delay,
                dkg_timeout: self.timeout,
            }));
        }
        match &self.connect {
            Some(leader) => Ok(SetupRole::Participant {
                leader: leader.clone(),
                leaving,
            }),
            None => bail!("either --leader or --connect <address> is required"),
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match &cli.command {
        Commands::GenerateKeypair { address, force } => generate_keypair(&cli, address, *force),
        Commands::Start {
            private_listen,
            public_listen,
            beacon_config,
        } => {
            let keypair = KeyPair::load(&cli.folder).context("loading key pair, run generate-keypair first")?;
            let config = NodeConfig {
                folder: cli.folder.clone(),
                private_listen: private_listen
                    .clone()
                    .unwrap_or_else(|| keypair.identity().address.clone()),
                public_listen: public_listen.clone(),
                control_listen: cli.control.clone(),
                beacon: config::load_beacon_config(beacon_config.as_deref())?,
            };
            run_daemon(config, keypair).await
        }
        Commands::Stop { id } => {
            let control = ControlClient::new(&cli.control);
            match id {
                Some(id) => {
                    let id = if id == gateway::EMPTY_ID {
                        NetworkId::empty()
                    } else {
                        NetworkId::from_hex(id)?
                    };
                    control.terminate(&id).await?;
                    println!("network {} terminated", gateway::id_to_path(&id));
                }
                None => {
                    control.shutdown().await?;
                    println!("daemon stopping");
                }
            }
            Ok(())
        }
        Commands::Share(args) => {
            let req = SetupRequest {
                version: args.version.clone(),
                role: args.role(false)?,
                secret: args.secret.clone(),
            };
            info!(version = %req.version, leader = args.leader, "starting setup");
            let group = ControlClient::new(&cli.control).setup(&req).await?;
            print_group(&group);
            Ok(())
        }
        Commands::Reshare { id, leaving, share } => {
            let req = ReshareRequest {
                id: NetworkId::from_hex(id)?,
                role: share.role(*leaving)?,
                secret: share.secret.clone(),
                version: Some(share.version.clone()),
            };
            info!(network = %req.id, leader = share.leader, leaving, "starting resharing");
            let group = ControlClient::new(&cli.control).reshare(&req).await?;
            print_group(&group);
            Ok(())
        }
        Commands::Load => {
            let summary = ControlClient::new(&cli.control).load().await?;
            for id in &summary.loaded {
                println!("loaded {}", id);
            }
            for failure in &summary.errors {
                println!("failed {}: {}", failure.folder, failure.error);
            }
            Ok(())
        }
        Commands::Status => {
            let lines = ControlClient::new(&cli.control).status().await?;
            if lines.is_empty() {
                println!("no network running");
            }
            for line in lines {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

fn generate_keypair(cli: &Cli, address: &str, force: bool) -> Result<()> {
    let path = KeyPair::path(&cli.folder);
    if path.exists() && !force {
        bail!("key pair already exists at {}, use --force to replace it", path.display());
    }
    let keypair = KeyPair::generate(address, &mut rand::rngs::OsRng);
    keypair.save(&cli.folder)?;

    info!(address, path = ?path, "key pair generated");
    println!("Public Key: {}", hex::encode(&keypair.identity().key));
    Ok(())
}

fn print_group(group: &Group) {
    let at = |secs: i64| {
        chrono::DateTime::from_timestamp(secs, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| secs.to_string())
    };
    println!("Network: {}", group.id());
    println!("  Nodes: {}", group.len());
    println!("  Threshold: {}", group.threshold);
    println!("  Period: {}s", group.period);
    println!("  Genesis: {}", at(group.genesis_time));
    if group.transition_time != 0 {
        println!("  Transition: {}", at(group.transition_time));
    }
    if let Ok(public) = group.public_key() {
        println!("  Public Key: {}", hex::encode(public.key()));
    }
}

async fn run_daemon(config: NodeConfig, keypair: KeyPair) -> Result<()> {
    info!(
        address = %keypair.identity().address,
        private = %config.private_listen,
        public = ?config.public_listen,
        control = %config.control_listen,
        "Starting beacon node"
    );

    let client: Arc<dyn ProtocolClient> = Arc::new(HttpClient::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let server = Arc::new(Server::new(
        Registry::standard(),
        ProtocolConfig {
            keypair: Arc::new(keypair),
            client,
            clock,
            beacon: config.beacon.clone(),
            networks_dir: config.networks_dir(),
        },
    ));

    let report = server.load_instances();
    for (folder, e) in &report.errors {
        error!(folder = %folder, error = %e, "network not loaded");
    }
    server.start_all(true).await;

    let shutdown = Arc::new(Notify::new());
    let mut listeners = vec![serve(&config.private_listen, gateway::private_router(server.clone())).await?];
    if let Some(public) = &config.public_listen {
        listeners.push(serve(public, gateway::public_router(server.clone())).await?);
    }
    listeners.push(
        serve(
            &config.control_listen,
            gateway::control_router(server.clone(), shutdown.clone()),
        )
        .await?,
    );
    info!(networks = report.loaded.len(), "beacon node running");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "waiting for ctrl-c failed");
            }
        }
        _ = shutdown.notified() => {}
    }

    info!("Stopping beacon node");
    server.shutdown().await;
    for listener in listeners {
        listener.abort();
    }
    Ok(())
}

async fn serve(address: &str, router: Router) -> Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("binding {}", address))?;
    info!(address, "Listening");
    let address = address.to_string();
    Ok(tokio::spawn(async move {
        let app = router.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, app).await {
            error!(address = %address, error = %e, "listener failed");
        }
    }))
}
