use super::{LegacyRegistry, Registration};
use crate::error::{Result, SwarmError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Bound on a direct liveness probe
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Line-oriented point-to-point server: one control connection per user
pub struct LegacyServer {
    registry: Arc<Mutex<LegacyRegistry>>,
}

impl LegacyServer {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(LegacyRegistry::new())),
        }
    }

    pub fn registry(&self) -> Arc<Mutex<LegacyRegistry>> {
        Arc::clone(&self.registry)
    }

    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        info!("Server is waiting for clients on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };

            let registry = self.registry();
            tokio::spawn(async move {
                if let Err(e) = handle_client(registry, stream, addr).await {
                    debug!("Client {} ended: {}", addr, e);
                }
            });
        }
    }

    /// Files held by `username`
    pub async fn discover(&self, username: &str) -> Vec<String> {
        self.registry.lock().await.discover(username)
    }

    pub async fn list_all(&self) -> Vec<String> {
        self.registry.lock().await.list_all()
    }

    /// Probe a user directly. Users that do not answer in time are removed.
    pub async fn ping(&self, username: &str) -> Result<bool> {
        let addr = match self.registry.lock().await.user(username) {
            Some(user) => user.listen_addr(),
            None => {
                return Err(SwarmError::NotFound(format!(
                    "{} is not in the client list",
                    username
                )))
            }
        };

        let alive = probe(addr, PING_TIMEOUT).await;
        if alive {
            info!("User {} still connecting.", username);
        } else {
            self.registry.lock().await.remove(username);
            info!("User {} has been removed.", username);
        }
        Ok(alive)
    }
}

impl Default for LegacyServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Send `PING` to a peer's listen port and wait for `PONG`
pub async fn probe(addr: SocketAddr, limit: Duration) -> bool {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(b"PING\n").await?;

        let mut reply = String::new();
        BufReader::new(&mut stream).read_line(&mut reply).await?;
        Ok::<_, std::io::Error>(reply.trim() == "PONG")
    };

    matches!(timeout(limit, exchange).await, Ok(Ok(true)))
}

async fn handle_client(
    registry: Arc<Mutex<LegacyRegistry>>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let username = login(&registry, &mut lines, &mut writer, addr).await?;
    let result = session(&registry, &username, &mut lines, &mut writer).await;

    // A ping may have evicted us and the name been taken since
    if registry.lock().await.remove_session(&username, addr) {
        info!("User {} has been removed.", username);
    }
    result
}

/// Username handshake: retry until a free name arrives, then read the listen port
async fn login(
    registry: &Mutex<LegacyRegistry>,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
    addr: SocketAddr,
) -> Result<String> {
    let username = loop {
        let name = next_line(lines).await?;
        let name = name.trim();
        let registration = registry.lock().await.register(name, addr);
        send_line(writer, registration.as_str()).await?;
        if registration == Registration::Valid {
            break name.to_string();
        }
        debug!("User {} already exists", name);
    };

    let port = next_line(lines).await;
    let port = match port.and_then(|line| {
        line.trim()
            .parse::<u16>()
            .map_err(|_| SwarmError::ProtocolError(format!("Invalid listen port {:?}", line)))
    }) {
        Ok(port) => port,
        Err(e) => {
            registry.lock().await.remove_session(&username, addr);
            return Err(e);
        }
    };
    registry.lock().await.set_listen_port(&username, port)?;

    info!("User {}, IP: {}, Port: {} connected.", username, addr.ip(), addr.port());
    Ok(username)
}

async fn session(
    registry: &Mutex<LegacyRegistry>,
    username: &str,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
) -> Result<()> {
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let command = match parts.next() {
            Some(command) => command.to_lowercase(),
            None => continue,
        };
        let argument = parts.next();

        match (command.as_str(), argument) {
            ("publish", Some(file)) => {
                registry.lock().await.publish(username, file)?;
                send_line(writer, "Success").await?;
                info!("Client {} uploaded file {}", username, file);
            }
            ("fetch", Some(file)) => {
                let holders = registry.lock().await.fetch(file);
                if holders.is_empty() {
                    send_line(writer, "none").await?;
                } else {
                    send_line(writer, &serde_json::to_string(&holders)?).await?;
                }
            }
            ("inform", Some(file)) => {
                registry.lock().await.inform(username, file)?;
                info!("Client {} fetched file {}", username, file);
            }
            ("print_scrape", _) => {
                let report = registry.lock().await.scrape_report();
                writer.write_all(report.as_bytes()).await?;
            }
            ("disconnect", _) => return Ok(()),
            _ => send_line(writer, "Invalid command").await?,
        }
    }

    Ok(())
}

async fn next_line(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<String> {
    lines
        .next_line()
        .await?
        .ok_or_else(|| SwarmError::ProtocolError("Client disconnected".to_string()))
}

async fn send_line(writer: &mut OwnedWriteHalf, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}
