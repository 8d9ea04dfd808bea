//! Tailing file harvester, rotation and truncation aware.

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::sync::CancellationToken;

use super::{pause, Harvester, Sink};
use crate::error::{Error, Result};
use crate::store::LogRecord;

const CHUNK_SIZE: usize = 8192;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
pub struct FileHarvesterConfig {
    pub path: PathBuf,
}

/// Tails an append-only log file. The file is reopened from offset zero when
/// its inode changes (rotation) and the offset is reset when the file
/// shrinks below it (truncation). Lines are parsed as JSON objects; a line
/// that fails to parse is logged and dropped without corrupting the
/// following lines.
pub struct FileHarvester {
    name: String,
    config: FileHarvesterConfig,
    inode: u64,
    offset: u64,
}

impl FileHarvester {
    pub fn new(name: String, config: FileHarvesterConfig) -> Result<Self> {
        if config.path.as_os_str().is_empty() {
            return Err(Error::Config(format!("{name}: 'path' is required")));
        }
        Ok(Self { name, config, inode: 0, offset: 0 })
    }

    async fn process_line(&self, line: &[u8], sink: &Sink) {
        let trimmed = line.strip_suffix(b"\r").unwrap_or(line);
        if trimmed.is_empty() {
            return;
        }
        match serde_json::from_slice::<LogRecord>(trimmed) {
            Ok(record) => sink.ingest(record).await,
            Err(e) => tracing::warn!(
                "{}: failed to decode line: {e}: {}",
                self.name,
                String::from_utf8_lossy(trimmed)
            ),
        }
    }
}

#[async_trait::async_trait]
impl Harvester for FileHarvester {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, sink: Sink, cancel: CancellationToken) {
        let path = self.config.path.clone();

        if !path.exists() {
            tracing::warn!("{}: file {} does not exist, waiting...", self.name, path.display());
            while !path.exists() {
                if pause(&cancel, RETRY_INTERVAL).await {
                    return;
                }
            }
        }
        tracing::info!("{}: tailing {}", self.name, path.display());

        // First open: remember the inode and seek to the end so only new
        // lines are delivered.
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            self.inode = meta.ino();
            self.offset = meta.len();
        }

        'reopen: while !cancel.is_cancelled() {
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(_) => {
                    if pause(&cancel, POLL_INTERVAL).await {
                        return;
                    }
                    continue;
                }
            };
            if meta.ino() != self.inode {
                tracing::info!("{}: file rotated (inode changed), reopening", self.name);
                self.inode = meta.ino();
                self.offset = 0;
            } else if meta.len() < self.offset {
                tracing::warn!("{}: file truncated, resetting offset", self.name);
                self.offset = 0;
            }

            let mut file = match File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    tracing::error!("{}: {e}", self.name);
                    if pause(&cancel, RETRY_INTERVAL).await {
                        return;
                    }
                    continue;
                }
            };
            if let Err(e) = file.seek(SeekFrom::Start(self.offset)).await {
                tracing::error!("{}: seek failed: {e}", self.name);
                if pause(&cancel, RETRY_INTERVAL).await {
                    return;
                }
                continue;
            }

            // Partial trailing line carried across reads within one file
            // session; reset on reopen.
            let mut buffer: Vec<u8> = Vec::new();
            let mut chunk = [0u8; CHUNK_SIZE];
            loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => return,
                    read = file.read(&mut chunk) => match read {
                        Ok(n) => n,
                        Err(e) => {
                            tracing::error!("{}: read failed: {e}", self.name);
                            if pause(&cancel, RETRY_INTERVAL).await {
                                return;
                            }
                            continue 'reopen;
                        }
                    }
                };

                if n == 0 {
                    // EOF: look for rotation or truncation, otherwise wait
                    // for more data.
                    match tokio::fs::metadata(&path).await {
                        Err(_) => continue 'reopen,
                        Ok(meta) if meta.ino() != self.inode => continue 'reopen,
                        Ok(meta) if meta.len() < self.offset => continue 'reopen,
                        Ok(_) => {
                            if pause(&cancel, POLL_INTERVAL).await {
                                return;
                            }
                            continue;
                        }
                    }
                }

                self.offset += n as u64;
                buffer.extend_from_slice(&chunk[..n]);
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    self.process_line(&line[..line.len() - 1], &sink).await;
                }
            }
        }
    }
}
