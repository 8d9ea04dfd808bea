//! Stream socket harvester: line-delimited JSON over TCP or a Unix domain
//! socket.

use std::path::PathBuf;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{Harvester, Sink};
use crate::error::{Error, Result};
use crate::store::LogRecord;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocketHarvesterConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: Option<u16>,
    /// Unix domain socket path; takes precedence over host/port.
    pub path: Option<PathBuf>,
}

/// Accepts connections and reads line-delimited JSON until each peer closes.
/// Malformed lines on one connection do not affect other connections. Stop
/// closes the listener and waits for in-flight connections to wind down.
pub struct SocketHarvester {
    name: String,
    config: SocketHarvesterConfig,
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl SocketHarvester {
    pub fn new(name: String, config: SocketHarvesterConfig) -> Result<Self> {
        if config.port.is_none() && config.path.is_none() {
            return Err(Error::Config(format!(
                "{name}: either 'port' or 'path' must be provided"
            )));
        }
        Ok(Self { name, config })
    }

    async fn bind(&self) -> Result<Listener> {
        if let Some(path) = &self.config.path {
            // A stale socket file from a previous run blocks the bind.
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)?;
            tracing::info!("{}: listening on unix socket {}", self.name, path.display());
            Ok(Listener::Unix(listener))
        } else {
            let port = self.config.port.unwrap_or_default();
            let listener = TcpListener::bind((self.config.host.as_str(), port)).await?;
            tracing::info!("{}: listening on {}:{port}", self.name, self.config.host);
            Ok(Listener::Tcp(listener))
        }
    }
}

#[async_trait::async_trait]
impl Harvester for SocketHarvester {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, sink: Sink, cancel: CancellationToken) {
        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("{}: failed to start listener: {e}", self.name);
                return;
            }
        };

        let mut connections = JoinSet::new();
        loop {
            let accepted: std::io::Result<Box<dyn AsyncRead + Send + Unpin>> = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = async {
                    match &listener {
                        Listener::Tcp(l) => {
                            let (stream, addr) = l.accept().await?;
                            tracing::debug!("{}: new connection from {addr}", self.name);
                            Ok(Box::new(stream) as Box<dyn AsyncRead + Send + Unpin>)
                        }
                        Listener::Unix(l) => {
                            let (stream, _) = l.accept().await?;
                            tracing::debug!("{}: new unix connection", self.name);
                            Ok(Box::new(stream) as Box<dyn AsyncRead + Send + Unpin>)
                        }
                    }
                } => accepted,
            };
            match accepted {
                Ok(stream) => {
                    connections.spawn(handle_connection(
                        self.name.clone(),
                        stream,
                        sink.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    tracing::error!("{}: accept failed: {e}", self.name);
                }
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}
        if let Some(path) = &self.config.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn handle_connection<R: AsyncRead + Send + Unpin>(
    name: String,
    stream: R,
    sink: Sink,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogRecord>(trimmed) {
                    Ok(record) => sink.ingest(record).await,
                    Err(e) => tracing::warn!("{name}: failed to decode line: {e}"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!("{name}: connection error: {e}");
                break;
            }
        }
    }
    tracing::debug!("{name}: connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::Backlog;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tempfile::tempdir;

    fn start(
        config: SocketHarvesterConfig,
        backlog: Arc<Backlog>,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let mut harvester = SocketHarvester::new("socket_test".to_string(), config).unwrap();
        let sink = Sink::new(backlog, "timestamp");
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let task = tokio::spawn(async move {
            harvester.run(sink, child).await;
        });
        (cancel, task)
    }

    async fn wait_for_len(backlog: &Backlog, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while backlog.len() < expected {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn requires_port_or_path() {
        let config = SocketHarvesterConfig { host: default_host(), port: None, path: None };
        assert!(SocketHarvester::new("bad".to_string(), config).is_err());
    }

    #[tokio::test]
    async fn ingests_lines_from_tcp_connection() {
        let backlog = Arc::new(Backlog::new(100));
        let config = SocketHarvesterConfig {
            host: "127.0.0.1".to_string(),
            port: Some(19979),
            path: None,
        };
        let (cancel, task) = start(config, backlog.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut stream = tokio::net::TcpStream::connect("127.0.0.1:19979").await.unwrap();
        stream
            .write_all(b"{\"message\": \"socket log\", \"timestamp\": \"2023-01-01T00:00:00+00:00\"}\n")
            .await
            .unwrap();
        stream.write_all(b"not json at all\n").await.unwrap();
        stream
            .write_all(b"{\"message\": \"second\"}\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        wait_for_len(&backlog, 2).await;
        cancel.cancel();
        task.await.unwrap();

        let drained = backlog.drain(10);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0]["message"], json!("socket log"));
        assert_eq!(drained[1]["message"], json!("second"));
        assert!(drained[1]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn ingests_lines_from_unix_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("harvest.sock");
        let backlog = Arc::new(Backlog::new(100));
        let config = SocketHarvesterConfig {
            host: default_host(),
            port: None,
            path: Some(path.clone()),
        };
        let (cancel, task) = start(config, backlog.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(b"{\"message\": \"unix log\"}\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        wait_for_len(&backlog, 1).await;
        cancel.cancel();
        task.await.unwrap();

        let drained = backlog.drain(10);
        assert_eq!(drained[0]["message"], json!("unix log"));
        // The socket file is cleaned up on stop.
        assert!(!path.exists());
    }
}
