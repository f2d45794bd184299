//! Sidecar serving loop and background maintenance.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::protocol::{Command, Reply};
use crate::config::RateLimitingConfig;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::quota::QuotaStore;

/// Longest request line accepted, newline excluded.
pub const MAX_LINE_BYTES: usize = 4096;

/// Serves admission queries over a line-oriented byte stream.
pub struct SidecarServer<S: QuotaStore + 'static> {
    /// The gateway answering queries
    gateway: Arc<Gateway<S>>,
    /// Periodic rule reload, if enabled
    reload_interval: Option<Duration>,
    /// Periodic stale-usage purge, if enabled
    gc_interval: Option<Duration>,
    /// Request lines longer than this are answered with an error and skipped
    max_line_bytes: usize,
}

/// One newline-delimited request as read off the wire.
enum Frame {
    /// A complete line, newline stripped
    Line(Vec<u8>),
    /// A line that ran past the length cap; its bytes were discarded
    Oversized,
}

impl<S: QuotaStore + 'static> SidecarServer<S> {
    /// Create a server with no background maintenance.
    pub fn new(gateway: Arc<Gateway<S>>) -> Self {
        Self {
            gateway,
            reload_interval: None,
            gc_interval: None,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    /// Take reload and purge intervals from configuration; zero disables either.
    pub fn with_intervals(mut self, config: &RateLimitingConfig) -> Self {
        self.reload_interval = non_zero_secs(config.reload_interval_secs);
        self.gc_interval = non_zero_secs(config.gc_interval_secs);
        self
    }

    /// Override the request line length cap.
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    /// Answer one request line.
    pub async fn handle_line(&self, line: &str) -> Reply {
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(reason) => {
                warn!(reason = %reason, "Rejected malformed request line");
                return Reply::error(reason);
            }
        };

        match command {
            Command::Decide { api_key, source_ip } => {
                Reply::Decision(self.gateway.decide(&api_key, &source_ip).await)
            }
            Command::Usage { api_key } => match self.gateway.usage(&api_key).await {
                Ok(Some(report)) => Reply::Usage(report),
                Ok(None) => Reply::error("unknown API key"),
                Err(e) => Reply::from(e),
            },
            Command::Reload => match reload_blocking(self.gateway.clone()).await {
                Ok(report) => Reply::Reloaded(report),
                Err(e) => Reply::from(e),
            },
            Command::Health => Reply::Health {
                status: "up",
                generation: self.gateway.snapshot().generation(),
            },
        }
    }

    /// Serve until the input ends or `signal` resolves.
    pub async fn serve_with_shutdown<R, W, F>(self, reader: R, mut writer: W, signal: F) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        let maintenance = self.spawn_maintenance();
        let mut reader = BufReader::new(reader);
        tokio::pin!(signal);

        info!(
            reload_interval = ?self.reload_interval,
            gc_interval = ?self.gc_interval,
            "Sidecar serving admission queries"
        );

        let outcome = loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                frame = next_frame(&mut reader, self.max_line_bytes) => {
                    let reply = match frame {
                        Ok(Some(Frame::Line(bytes))) => match String::from_utf8(bytes) {
                            Ok(line) if line.trim().is_empty() => continue,
                            Ok(line) => self.handle_line(&line).await,
                            Err(_) => {
                                warn!("Rejected request line that is not UTF-8");
                                Reply::error("request line is not valid UTF-8")
                            }
                        },
                        Ok(Some(Frame::Oversized)) => {
                            warn!(max = self.max_line_bytes, "Rejected oversized request line");
                            Reply::error(format!(
                                "request line exceeds {} bytes",
                                self.max_line_bytes
                            ))
                        }
                        Ok(None) => {
                            debug!("Input closed");
                            break Ok(());
                        }
                        Err(e) => break Err(e.into()),
                    };

                    if let Err(e) = write_reply(&mut writer, &reply).await {
                        break Err(e.into());
                    }
                }
            }
        };

        if let Some(handle) = maintenance {
            handle.abort();
        }
        outcome
    }

    fn spawn_maintenance(&self) -> Option<JoinHandle<()>> {
        if self.reload_interval.is_none() && self.gc_interval.is_none() {
            return None;
        }

        let gateway = self.gateway.clone();
        let reload_every = self.reload_interval;
        let gc_every = self.gc_interval;

        Some(tokio::spawn(async move {
            let mut reload_tick = reload_every.map(tokio::time::interval);
            let mut gc_tick = gc_every.map(tokio::time::interval);

            // Both intervals fire immediately; the initial load already happened.
            if let Some(tick) = reload_tick.as_mut() {
                tick.tick().await;
            }
            if let Some(tick) = gc_tick.as_mut() {
                tick.tick().await;
            }

            loop {
                tokio::select! {
                    _ = next_tick(&mut reload_tick) => {
                        // Failures are logged by the coordinator and the old snapshot stays.
                        let _ = reload_blocking(gateway.clone()).await;
                    }
                    _ = next_tick(&mut gc_tick) => {
                        if let Err(e) = gateway.quota().purge_stale().await {
                            error!(error = %e, "Stale usage purge failed");
                        }
                    }
                }
            }
        }))
    }
}

/// Read one `\n`-terminated request, keeping at most `max` bytes of it.
///
/// A final line without a newline still counts. `None` means the input ended.
async fn next_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> std::io::Result<Option<Frame>> {
    let mut line = Vec::new();
    let mut oversized = false;
    let mut seen_any = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if !seen_any {
                return Ok(None);
            }
            break;
        }
        seen_any = true;

        let (take, used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(idx) => (idx, idx + 1, true),
            None => (available.len(), available.len(), false),
        };
        if !oversized {
            if line.len() + take > max {
                oversized = true;
                line = Vec::new();
            } else {
                line.extend_from_slice(&available[..take]);
            }
        }
        reader.consume(used);

        if done {
            break;
        }
    }

    if oversized {
        return Ok(Some(Frame::Oversized));
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(Frame::Line(line)))
}

async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Run a reload off the async worker threads; rule files are read synchronously.
async fn reload_blocking<S: QuotaStore + 'static>(
    gateway: Arc<Gateway<S>>,
) -> Result<crate::reload::ReloadReport> {
    match tokio::task::spawn_blocking(move || gateway.reload()).await {
        Ok(outcome) => outcome,
        Err(e) => Err(std::io::Error::other(e).into()),
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply) -> std::io::Result<()> {
    writer.write_all(reply.to_line().as_bytes()).await?;
    writer.flush().await
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
