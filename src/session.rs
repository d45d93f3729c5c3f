//! One bidirectional forwarding session.
//!
//! A session owns the accepted client-facing socket and the outbound
//! server-facing socket and runs one pipeline per direction: read into a
//! fresh buffer, write to the opposite socket, account the transfer, trace
//! it, optionally delay, then read again. An inactivity watchdog stops the
//! session when no read completes within the configured timeout.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::{DumpMode, Endpoint};
use crate::{dump, lock};

/// Mint a session identifier: eight lowercase hex characters from a
/// uniformly distributed random u32.
pub fn new_session_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Configuration copied into each session by its proxy
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub id: String,
    pub proxy_name: String,
    pub destination: Endpoint,
    pub buffer_size: usize,
    pub client_delay_us: u64,
    pub server_delay_us: u64,
    pub timeout_us: u64,
    pub dump: DumpMode,
}

/// Session lifecycle status. Advances monotonically; `Stopped` is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Ready,
    Running,
    Stopped,
}

/// Counters and time points collected over the session lifetime
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub status: Status,
    pub start_time: Option<SystemTime>,
    pub stop_time: Option<SystemTime>,
    /// Client-to-server bytes delivered to the server socket.
    pub total_tx: u64,
    /// Server-to-client bytes delivered to the client socket.
    pub total_rx: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    fn source(self) -> &'static str {
        match self {
            Direction::ClientToServer => "client",
            Direction::ServerToClient => "server",
        }
    }

    fn target(self) -> &'static str {
        match self {
            Direction::ClientToServer => "server",
            Direction::ServerToClient => "client",
        }
    }
}

type StoppedHandler = Box<dyn FnOnce(&Session) + Send>;

/// A single bidirectional forwarding session.
///
/// The proxy's session map holds the only external strong reference; the
/// stopped handler releases it. Pending pipeline tasks keep the session
/// alive until they observe cancellation.
pub struct Session {
    config: SessionConfig,
    channel: String,
    info: Mutex<SessionInfo>,
    client: Mutex<Option<TcpStream>>,
    on_stopped: Mutex<Option<StoppedHandler>>,
    last_activity: Mutex<tokio::time::Instant>,
    cancel: CancellationToken,
}

impl Session {
    /// Wrap an accepted client connection. No I/O is initiated until
    /// [`Session::start`].
    pub fn new(client: TcpStream, config: SessionConfig, cancel: CancellationToken) -> Arc<Self> {
        let channel = format!("net.tcp_session.{}.{}", config.proxy_name, config.id);
        Arc::new(Self {
            config,
            channel,
            info: Mutex::new(SessionInfo {
                status: Status::Ready,
                start_time: None,
                stop_time: None,
                total_tx: 0,
                total_rx: 0,
            }),
            client: Mutex::new(Some(client)),
            on_stopped: Mutex::new(None),
            last_activity: Mutex::new(tokio::time::Instant::now()),
            cancel,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Snapshot of the session counters and status.
    pub fn info(&self) -> SessionInfo {
        lock(&self.info).clone()
    }

    /// Install the handler fired exactly once when the session stops.
    pub fn set_on_stopped<F>(&self, handler: F)
    where
        F: FnOnce(&Session) + Send + 'static,
    {
        *lock(&self.on_stopped) = Some(Box::new(handler));
    }

    fn span(&self) -> Span {
        info_span!("session", channel = %self.channel)
    }

    /// Begin forwarding: resolve the destination, connect, then run both
    /// pipelines. Fails if the session is not in the ready state.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        {
            let mut info = lock(&self.info);
            if info.status != Status::Ready {
                return Err(io::Error::other("session is not in the ready state"));
            }
            info.status = Status::Running;
            info.start_time = Some(SystemTime::now());
        }
        *lock(&self.last_activity) = tokio::time::Instant::now();

        let session = Arc::clone(self);
        let span = self.span();
        tokio::spawn(async move { session.run().await }.instrument(span));
        Ok(())
    }

    /// Stop the session: cancel all pending operations, close both sockets,
    /// record the stop time and fire the stopped handler. Idempotent.
    pub fn stop(&self) {
        let handler = {
            let mut info = lock(&self.info);
            if info.status == Status::Stopped {
                return;
            }
            info.status = Status::Stopped;
            info.stop_time = Some(SystemTime::now());
            self.cancel.cancel();

            let elapsed = match (info.start_time, info.stop_time) {
                (Some(start), Some(stop)) => stop.duration_since(start).unwrap_or_default(),
                _ => Duration::ZERO,
            };
            self.span().in_scope(|| {
                info!(
                    tx = info.total_tx,
                    rx = info.total_rx,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "session stopped"
                );
            });

            lock(&self.on_stopped).take()
        };

        if let Some(handler) = handler {
            handler(self);
        }
    }

    async fn run(self: Arc<Self>) {
        let client = match lock(&self.client).take() {
            Some(client) => client,
            None => {
                self.stop();
                return;
            }
        };

        if self.config.timeout_us > 0 {
            tokio::spawn(Arc::clone(&self).watchdog().in_current_span());
        }

        debug!(destination = %self.config.destination, "resolving destination");
        let endpoint = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.stop();
                return;
            }
            resolved = self.config.destination.resolve() => match resolved {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    error!(destination = %self.config.destination, error = %e, "resolve failed");
                    self.stop();
                    return;
                }
            }
        };

        debug!(endpoint = %endpoint, "connecting");
        let server = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.stop();
                return;
            }
            connected = TcpStream::connect(endpoint) => match connected {
                Ok(server) => server,
                Err(e) => {
                    error!(endpoint = %endpoint, error = %e, "connect failed");
                    self.stop();
                    return;
                }
            }
        };
        debug!("connected");

        client.set_nodelay(true).ok();
        server.set_nodelay(true).ok();

        let client_addr = peer_label(&client);
        let server_addr = peer_label(&server);

        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = server.into_split();

        let c2s = tokio::spawn(
            Arc::clone(&self)
                .pipeline(
                    Direction::ClientToServer,
                    client_read,
                    server_write,
                    client_addr.clone(),
                    server_addr.clone(),
                )
                .in_current_span(),
        );
        let s2c = tokio::spawn(
            Arc::clone(&self)
                .pipeline(
                    Direction::ServerToClient,
                    server_read,
                    client_write,
                    server_addr,
                    client_addr,
                )
                .in_current_span(),
        );

        let _ = tokio::join!(c2s, s2c);
        self.stop();
    }

    /// One direction of the shuttle: read into a fresh buffer, hand it to
    /// the paired write, account, trace, delay, repeat.
    async fn pipeline(
        self: Arc<Self>,
        direction: Direction,
        mut from: OwnedReadHalf,
        mut to: OwnedWriteHalf,
        from_addr: String,
        to_addr: String,
    ) {
        let delay_us = match direction {
            Direction::ClientToServer => self.config.client_delay_us,
            Direction::ServerToClient => self.config.server_delay_us,
        };

        loop {
            let mut buffer = vec![0u8; self.config.buffer_size];

            let n = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = from.read(&mut buffer) => match result {
                    Ok(0) => {
                        debug!("connection closed - {}", direction.source());
                        break;
                    }
                    Ok(n) => n,
                    Err(_) if self.cancel.is_cancelled() => break,
                    Err(e) => {
                        error!(error = %e, "read from {} failed", direction.source());
                        break;
                    }
                }
            };

            let written = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = to.write_all(&buffer[..n]) => result,
            };
            if let Err(e) = written {
                if !self.cancel.is_cancelled() {
                    error!(error = %e, "write to {} failed", direction.target());
                }
                break;
            }

            {
                let mut info = lock(&self.info);
                if info.status == Status::Stopped {
                    break;
                }
                match direction {
                    Direction::ClientToServer => info.total_tx += n as u64,
                    Direction::ServerToClient => info.total_rx += n as u64,
                }
            }
            *lock(&self.last_activity) = tokio::time::Instant::now();

            debug!(
                "{}=[{}] -> {}=[{}] bytes=[{}]",
                direction.source(),
                from_addr,
                direction.target(),
                to_addr,
                n
            );
            dump::emit(self.config.dump, &buffer[..n]);

            if delay_us > 0 {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_micros(delay_us)) => {}
                }
            }
        }

        self.stop();
    }

    /// Stop the session once no read has completed within the timeout.
    /// Every successful read in either direction rearms the deadline.
    async fn watchdog(self: Arc<Self>) {
        let timeout = Duration::from_micros(self.config.timeout_us);
        loop {
            let deadline = *lock(&self.last_activity) + timeout;
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {
                    let idle_since = *lock(&self.last_activity);
                    if idle_since + timeout <= tokio::time::Instant::now() {
                        warn!(timeout_us = self.config.timeout_us, "inactivity timeout");
                        self.stop();
                        return;
                    }
                }
            }
        }
    }
}

fn peer_label(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .as_ref()
        .map(SocketAddr::to_string)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::net::TcpListener;

    #[test]
    fn session_ids_are_eight_hex_chars() {
        for _ in 0..100 {
            let id = new_session_id();
            assert_eq!(id.len(), 8);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
            assert_eq!(id, id.to_lowercase());
        }
    }

    #[test]
    fn session_ids_are_spread_out() {
        let ids: HashSet<String> = (0..1000).map(|_| new_session_id()).collect();
        // 1000 draws from a 2^32 space collide with negligible probability
        assert!(ids.len() > 990);
    }

    fn test_config(id: &str) -> SessionConfig {
        SessionConfig {
            id: id.to_string(),
            proxy_name: "test".to_string(),
            destination: Endpoint::new("127.0.0.1", "1"),
            buffer_size: 1024,
            client_delay_us: 0,
            server_delay_us: 0,
            timeout_us: 0,
            dump: DumpMode::None,
        }
    }

    async fn accepted_stream() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, _) = listener.accept().await.unwrap();
        connect.await.unwrap();
        stream
    }

    #[tokio::test]
    async fn construction_leaves_the_session_ready() {
        let stream = accepted_stream().await;
        let session = Session::new(stream, test_config("cafe0001"), CancellationToken::new());

        let info = session.info();
        assert_eq!(info.status, Status::Ready);
        assert_eq!(info.total_tx, 0);
        assert_eq!(info.total_rx, 0);
        assert!(info.start_time.is_none());
        assert_eq!(session.id(), "cafe0001");
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let stream = accepted_stream().await;
        let session = Session::new(stream, test_config("cafe0002"), CancellationToken::new());

        session.start().unwrap();
        assert!(session.start().is_err());
        session.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_fires_the_handler_once() {
        let stream = accepted_stream().await;
        let session = Session::new(stream, test_config("cafe0003"), CancellationToken::new());

        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        session.set_on_stopped(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        session.stop();
        session.stop();
        session.stop();

        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(session.info().status, Status::Stopped);
        assert!(session.start().is_err());
    }

    #[tokio::test]
    async fn counters_are_stable_after_stop() {
        let stream = accepted_stream().await;
        let session = Session::new(stream, test_config("cafe0004"), CancellationToken::new());

        session.stop();
        let before = session.info();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after = session.info();

        assert_eq!(before.total_tx, after.total_tx);
        assert_eq!(before.total_rx, after.total_rx);
        assert_eq!(before.stop_time, after.stop_time);
    }
}
