//! Stdio-to-TCP connection relay.
//!
//! Connects to a debug server that was usually spawned moments earlier and
//! may not be listening yet, so connection refusals are retried a fixed number
//! of times with a fixed delay. Once connected, bytes are copied both ways
//! between the caller's input/output streams and the socket until either side
//! closes. A lost session is never reconnected.
//!
//! State transitions: Connecting → Bridging → Closed, with
//! Connecting → Retrying → Connecting on failure, and Failed once the retry
//! budget is spent. The stop token moves any non-terminal state to Stopped.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;

/// Port the debug adapter listens on unless told otherwise.
pub const DEFAULT_RELAY_PORT: u16 = 13603;

/// Connection retries after the initial attempt.
pub const DEFAULT_RETRIES: u32 = 10;

/// Fixed delay between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

const PUMP_BUFFER_SIZE: usize = 8192;

/// Relay lifecycle, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// A connection attempt is in flight
    Connecting,
    /// Waiting out the retry delay after a refused connection
    Retrying,
    /// Copying bytes in both directions
    Bridging,
    /// The bridge ended because one side closed
    Closed,
    /// Every connection attempt failed
    Failed,
    /// The caller's stop signal fired
    Stopped,
}

/// How a relay run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Bridge torn down after one side closed
    Closed { sent: u64, received: u64 },
    /// Stop signal received before or during bridging
    Stopped,
}

/// Target and retry budget for one relay run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySession {
    pub target_host: String,
    pub target_port: u16,
    pub remaining_retries: u32,
    pub retry_delay: Duration,
}

impl RelaySession {
    /// Session with the default retry budget and delay.
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            remaining_retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.remaining_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// A once-per-session byte pipe between local streams and a TCP endpoint.
pub struct ConnectionRelay {
    session: RelaySession,
    state_tx: watch::Sender<RelayState>,
}

impl ConnectionRelay {
    pub fn new(session: RelaySession) -> Self {
        let (state_tx, _) = watch::channel(RelayState::Connecting);
        Self { session, state_tx }
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> watch::Receiver<RelayState> {
        self.state_tx.subscribe()
    }

    /// Relay between the process's stdin/stdout and the target.
    pub async fn run_stdio(self, stop: CancellationToken) -> crate::Result<RelayOutcome> {
        self.run(tokio::io::stdin(), tokio::io::stdout(), stop).await
    }

    /// Connect (with retries) and bridge `input` → socket and socket → `output`.
    ///
    /// Returns `RetriesExhausted` if the target never accepted a connection.
    pub async fn run<R, W>(
        mut self,
        input: R,
        output: W,
        stop: CancellationToken,
    ) -> crate::Result<RelayOutcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match self.connect(&stop).await? {
            Some(stream) => Ok(self.bridge(stream, input, output, &stop).await),
            None => Ok(RelayOutcome::Stopped),
        }
    }

    fn set_state(&self, state: RelayState) {
        self.state_tx.send_replace(state);
    }

    async fn connect_once(&self) -> crate::Result<TcpStream> {
        let host = self.session.target_host.as_str();
        let port = self.session.target_port;
        TcpStream::connect((host, port))
            .await
            .map_err(|e| BridgeError::ConnectFailed(host.to_string(), port, e))
    }

    /// Connecting/Retrying loop. `None` means the stop signal fired.
    async fn connect(&mut self, stop: &CancellationToken) -> crate::Result<Option<TcpStream>> {
        let mut attempts: u32 = 0;
        loop {
            self.set_state(RelayState::Connecting);
            attempts += 1;

            let attempt = tokio::select! {
                result = self.connect_once() => result,
                _ = stop.cancelled() => {
                    tracing::info!("relay stopped while connecting");
                    self.set_state(RelayState::Stopped);
                    return Ok(None);
                }
            };

            let err = match attempt {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
                    }
                    tracing::info!(
                        host = %self.session.target_host,
                        port = self.session.target_port,
                        attempts,
                        "relay connected"
                    );
                    return Ok(Some(stream));
                }
                Err(e) => e,
            };

            if self.session.remaining_retries == 0 {
                self.set_state(RelayState::Failed);
                tracing::warn!(attempts, error = %err, "relay giving up");
                let source = match err {
                    BridgeError::ConnectFailed(_, _, source) => source,
                    other => return Err(other),
                };
                return Err(BridgeError::RetriesExhausted {
                    host: self.session.target_host.clone(),
                    port: self.session.target_port,
                    attempts,
                    delay: self.session.retry_delay,
                    source,
                });
            }

            self.session.remaining_retries -= 1;
            self.set_state(RelayState::Retrying);
            tracing::debug!(
                attempt = attempts,
                remaining = self.session.remaining_retries,
                error = %err,
                "connect failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.session.retry_delay) => {}
                _ = stop.cancelled() => {
                    tracing::info!("relay stopped during retry delay");
                    self.set_state(RelayState::Stopped);
                    return Ok(None);
                }
            }
        }
    }

    /// Bridging state. Ends when either direction hits EOF or an error.
    async fn bridge<R, W>(
        &self,
        stream: TcpStream,
        mut input: R,
        mut output: W,
        stop: &CancellationToken,
    ) -> RelayOutcome
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.set_state(RelayState::Bridging);
        let (mut sock_read, mut sock_write) = stream.into_split();
        let mut sent: u64 = 0;
        let mut received: u64 = 0;

        let stopped = tokio::select! {
            result = pump(&mut input, &mut sock_write, &mut sent) => {
                log_pump_end("input", result);
                false
            }
            result = pump(&mut sock_read, &mut output, &mut received) => {
                log_pump_end("socket", result);
                false
            }
            _ = stop.cancelled() => true,
        };

        if stopped {
            tracing::info!(sent, received, "relay stopped while bridging");
            self.set_state(RelayState::Stopped);
            return RelayOutcome::Stopped;
        }

        tracing::info!(sent, received, "relay closed");
        self.set_state(RelayState::Closed);
        RelayOutcome::Closed { sent, received }
    }
}

/// Copy chunks from `reader` to `writer`, flushing each one, until EOF.
async fn pump<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}

fn log_pump_end(side: &str, result: std::io::Result<()>) {
    match result {
        Ok(()) => tracing::debug!(side, "end of stream"),
        Err(e) => tracing::warn!(side, error = %e, "relay stream error"),
    }
}
