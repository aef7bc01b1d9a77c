use super::Holder;
use crate::error::{Result, SwarmError};
use crate::storage::Repository;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Control connection of one user to a `LegacyServer`
pub struct LegacyClient {
    username: String,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    repository: Repository,
}

impl std::fmt::Debug for LegacyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyClient")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl LegacyClient {
    /// Log in as `username`, announcing `listen_port` for PING/FETCH.
    /// A taken name fails with `Unavailable`.
    pub async fn connect(
        server: SocketAddr,
        username: &str,
        listen_port: u16,
        repository: Repository,
    ) -> Result<Self> {
        let (reader, writer) = TcpStream::connect(server).await?.into_split();
        let mut client = Self {
            username: username.to_string(),
            lines: BufReader::new(reader).lines(),
            writer,
            repository,
        };

        let answer = client.request(username).await?;
        if !answer.eq_ignore_ascii_case("valid") {
            return Err(SwarmError::Unavailable(format!("Username {} is taken", username)));
        }
        client.send(&listen_port.to_string()).await?;

        info!("Logged in to {} as {}", server, username);
        Ok(client)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Announce a file already in the repository
    pub async fn publish(&mut self, name: &str) -> Result<()> {
        if !self.repository.contains(name).await {
            return Err(SwarmError::NotFound(format!("File not found: {}", name)));
        }

        let answer = self.request(&format!("PUBLISH {}", name)).await?;
        if !answer.eq_ignore_ascii_case("success") {
            return Err(SwarmError::ProtocolError(format!("Unexpected answer {:?}", answer)));
        }
        info!("Publish {} successful", name);
        Ok(())
    }

    /// Users holding `name`; empty when the server answers `none`
    pub async fn lookup(&mut self, name: &str) -> Result<Vec<Holder>> {
        let answer = self.request(&format!("FETCH {}", name)).await?;
        if answer == "none" {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&answer)?)
    }

    pub async fn inform(&mut self, name: &str) -> Result<()> {
        self.send(&format!("INFORM {}", name)).await
    }

    /// Fetch `name` from the first holder that delivers it, then tell the server
    pub async fn fetch(&mut self, name: &str) -> Result<u64> {
        let holders = self.lookup(name).await?;
        if holders.is_empty() {
            return Err(SwarmError::NotFound(format!("No users have {}", name)));
        }

        for holder in holders.iter().filter(|h| h.username() != self.username) {
            match fetch_from(holder.addr(), name, &self.repository).await {
                Ok(received) => {
                    info!("Fetched {} from {} ({} bytes)", name, holder.username(), received);
                    self.inform(name).await?;
                    return Ok(received);
                }
                Err(e) => warn!("Fetch of {} from {} failed: {}", name, holder.username(), e),
            }
        }

        Err(SwarmError::Unavailable(format!("No holder of {} answered", name)))
    }

    pub async fn scrape(&mut self) -> Result<String> {
        self.send("PRINT_SCRAPE").await?;

        let mut report = String::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(report);
            }
            report.push_str(&line);
            report.push('\n');
        }
    }

    pub async fn disconnect(mut self) -> Result<()> {
        self.send("DISCONNECT").await?;
        self.writer.shutdown().await?;
        info!("Disconnected {}", self.username);
        Ok(())
    }

    async fn request(&mut self, line: &str) -> Result<String> {
        self.send(line).await?;
        self.read_line().await
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        self.lines
            .next_line()
            .await?
            .ok_or_else(|| SwarmError::ProtocolError("Server closed the connection".to_string()))
    }
}

/// Ask a peer for `name` and store the byte stream until the peer closes
pub async fn fetch_from(addr: SocketAddr, name: &str, repository: &Repository) -> Result<u64> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(format!("FETCH {}\n", name).as_bytes()).await?;

    let mut file = repository.create(name).await?;
    let received = tokio::io::copy(&mut stream, &mut file).await?;
    file.flush().await?;

    if received == 0 {
        warn!("{} sent an empty stream for {}", addr, name);
    }
    Ok(received)
}

/// Answer PING and FETCH from other users until the task is aborted
pub fn serve_peers(listener: TcpListener, repository: Repository) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };

            let repository = repository.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_request(stream, &repository).await {
                    debug!("Request from {} failed: {}", addr, e);
                }
            });
        }
    })
}

async fn serve_request(stream: TcpStream, repository: &Repository) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let mut stream = reader.into_inner();

    let mut parts = line.split_whitespace();
    match (parts.next().map(str::to_uppercase).as_deref(), parts.next()) {
        (Some("PING"), _) => stream.write_all(b"PONG\n").await?,
        (Some("FETCH"), Some(name)) => {
            let mut file = repository.open_read(name).await?;
            let sent = tokio::io::copy(&mut file, &mut stream).await?;
            debug!("Sent {} ({} bytes)", name, sent);
        }
        _ => debug!("Ignoring request {:?}", line.trim()),
    }

    stream.shutdown().await?;
    Ok(())
}
