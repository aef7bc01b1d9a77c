use crate::client::PeerNode;
use crate::config::{PeerConfig, TrackerConfig};
use crate::error::Result;
use crate::legacy::{serve_peers, LegacyClient, LegacyServer};
use crate::piece::FileId;
use crate::storage::Repository;
use crate::tracker::{TrackerClient, TrackerServer};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "chunkswarm")]
#[command(about = "Peer-to-peer chunked file distribution", long_about = None)]
pub struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the peer configuration
#[derive(Args)]
struct PeerArgs {
    /// Tracker address
    #[arg(short, long)]
    tracker: Option<SocketAddr>,

    /// Address to accept peer connections on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Repository directory
    #[arg(short, long)]
    repository: Option<PathBuf>,
}

/// Login details for the point-to-point server
#[derive(Args)]
struct LegacyArgs {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:4456")]
    server: SocketAddr,

    /// Username to log in as
    #[arg(short, long)]
    username: String,

    /// Address to answer PING/FETCH on
    #[arg(short, long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tracker
    Tracker {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Share a file from the repository
    Seed {
        /// File name inside the repository
        file: String,

        #[command(flatten)]
        peer: PeerArgs,
    },

    /// Download a file by id
    Download {
        /// File id (hex SHA-1 of the content)
        file_id: String,

        /// Name to store the file under in the repository
        #[arg(short, long)]
        output: String,

        /// Keep seeding after the download completes
        #[arg(long)]
        seed: bool,

        #[command(flatten)]
        peer: PeerArgs,
    },

    /// List the peers of a file
    Peers {
        file_id: String,

        /// Tracker address
        #[arg(short, long)]
        tracker: Option<SocketAddr>,
    },

    /// Seeder and leecher counts per file
    Scrape {
        #[arg(required = true)]
        file_ids: Vec<String>,

        /// Tracker address
        #[arg(short, long)]
        tracker: Option<SocketAddr>,
    },

    /// Run the point-to-point server; reads `discover <user>`, `ping <user>`, `list all` from stdin
    LegacyServer {
        #[arg(short, long, default_value = "127.0.0.1:4456")]
        listen: SocketAddr,
    },

    /// Publish every file of a directory and serve them until interrupted
    LegacyShare {
        dir: PathBuf,

        #[command(flatten)]
        login: LegacyArgs,
    },

    /// Fetch a file from another user into the repository
    LegacyFetch {
        name: String,

        /// Repository directory
        #[arg(short, long, default_value = "./repository")]
        repository: PathBuf,

        #[command(flatten)]
        login: LegacyArgs,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Tracker { listen } => {
                let mut config = self.tracker_config()?;
                if let Some(listen) = listen {
                    config.listen_addr = *listen;
                }
                config.validate()?;

                let server = TrackerServer::new(config);
                let listener = server.bind().await?;
                tokio::select! {
                    result = server.run(listener) => result?,
                    _ = tokio::signal::ctrl_c() => info!("Tracker shutting down"),
                }
            }

            Commands::Seed { file, peer } => {
                let node = PeerNode::new(self.peer_config(peer)?).await?;
                let swarm = node.seed(file).await?;
                println!("Seeding {} as {}", file, swarm.file_id());

                tokio::signal::ctrl_c().await?;
                swarm.stop().await?;
            }

            Commands::Download {
                file_id,
                output,
                seed,
                peer,
            } => {
                let node = PeerNode::new(self.peer_config(peer)?).await?;
                let swarm = node.download(&FileId::from(file_id.as_str()), output).await?;
                println!("Saved {} to {}", file_id, node.repository().dir().join(output).display());

                if *seed {
                    info!("Seeding {} until interrupted", file_id);
                    tokio::signal::ctrl_c().await?;
                }
                swarm.stop().await?;
            }

            Commands::Peers { file_id, tracker } => {
                let mut client = TrackerClient::new(self.tracker_addr(*tracker)?);
                let peers = client.get_peers(&FileId::from(file_id.as_str())).await?;
                if peers.is_empty() {
                    println!("No peers have {}", file_id);
                }
                for (peer_id, member) in peers {
                    println!("{} {} ({} pieces)", peer_id, member.addr, member.pieces_held.len());
                }
            }

            Commands::Scrape { file_ids, tracker } => {
                let mut client = TrackerClient::new(self.tracker_addr(*tracker)?);
                let ids: Vec<FileId> =
                    file_ids.iter().map(|id| FileId::from(id.as_str())).collect();
                let stats = client.scrape(&ids).await?;

                for id in &ids {
                    match stats.get(id) {
                        Some(s) => {
                            println!("{}: {} seeders, {} leechers", id, s.seeders, s.leechers)
                        }
                        None => println!("{}: unknown", id),
                    }
                }
            }

            Commands::LegacyServer { listen } => {
                let server = LegacyServer::new();
                let listener = TcpListener::bind(listen).await?;
                tokio::select! {
                    result = server.run(listener) => result?,
                    _ = legacy_console(&server) => {}
                    _ = tokio::signal::ctrl_c() => info!("Server shutting down"),
                }
            }

            Commands::LegacyShare { dir, login } => {
                let repository = Repository::open(dir).await?;
                let listener = TcpListener::bind(login.listen).await?;
                let port = listener.local_addr()?.port();
                let serving = serve_peers(listener, repository.clone());

                let mut client =
                    LegacyClient::connect(login.server, &login.username, port, repository.clone())
                        .await?;
                for name in repository.list().await? {
                    client.publish(&name).await?;
                }

                tokio::signal::ctrl_c().await?;
                serving.abort();
                client.disconnect().await?;
            }

            Commands::LegacyFetch {
                name,
                repository,
                login,
            } => {
                let repository = Repository::open(repository).await?;
                let listener = TcpListener::bind(login.listen).await?;
                let port = listener.local_addr()?.port();
                let serving = serve_peers(listener, repository.clone());

                let mut client =
                    LegacyClient::connect(login.server, &login.username, port, repository).await?;
                let outcome = client.fetch(name).await;
                serving.abort();
                client.disconnect().await?;

                let received = outcome?;
                println!("Fetched {} ({} bytes)", name, received);
            }
        }

        Ok(())
    }

    fn tracker_config(&self) -> Result<TrackerConfig> {
        match &self.config {
            Some(path) => TrackerConfig::load(path),
            None => Ok(TrackerConfig::default()),
        }
    }

    fn peer_config(&self, args: &PeerArgs) -> Result<PeerConfig> {
        let mut config = match &self.config {
            Some(path) => PeerConfig::load(path)?,
            None => PeerConfig::default(),
        };

        if let Some(tracker) = args.tracker {
            config.tracker_addr = tracker;
        }
        if let Some(listen) = args.listen {
            config.listen_addr = listen;
        }
        if let Some(repository) = &args.repository {
            config.repository_dir = repository.clone();
        }

        config.validate()?;
        Ok(config)
    }

    fn tracker_addr(&self, flag: Option<SocketAddr>) -> Result<SocketAddr> {
        match flag {
            Some(addr) => Ok(addr),
            None => Ok(match &self.config {
                Some(path) => PeerConfig::load(path)?.tracker_addr,
                None => PeerConfig::default().tracker_addr,
            }),
        }
    }
}

/// Operator commands on stdin: `discover <user>`, `ping <user>`, `list all`
async fn legacy_console(server: &LegacyServer) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["discover", user] => {
                println!("Files of current hostname {}:", user);
                println!("{:?}", server.discover(user).await);
            }
            ["ping", user] => match server.ping(user).await {
                Ok(true) => println!("User {} still connecting.", user),
                Ok(false) => println!("User {} has been removed.", user),
                Err(e) => println!("{}", e),
            },
            ["list", "all"] => {
                let users = server.list_all().await;
                if users.is_empty() {
                    println!("No users are currently connected.");
                } else {
                    println!("List of all connected clients:");
                    for user in users {
                        println!("[{}]", user);
                    }
                }
            }
            [] => {}
            _ => warn!("Unknown command: {}", line.trim()),
        }
    }

    // stdin closed; keep serving
    std::future::pending::<()>().await
}
