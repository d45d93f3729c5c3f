//! One accept loop bound to a source endpoint, producing sessions.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument, Span};

use crate::config::ProxyConfig;
use crate::lock;
use crate::session::{new_session_id, Session, SessionConfig};

/// Aggregate statistics over all sessions a proxy has produced
#[derive(Clone, Debug, Default)]
pub struct ProxyStats {
    pub total_sessions: u64,
    pub total_tx: u64,
    pub total_rx: u64,
    pub start_time: Option<SystemTime>,
    pub stop_time: Option<SystemTime>,
}

/// Session map and aggregates, guarded together by one mutex.
#[derive(Default)]
struct ProxyState {
    sessions: HashMap<String, Arc<Session>>,
    stats: ProxyStats,
    local_addr: Option<SocketAddr>,
}

/// A named accept loop forwarding every inbound connection to one
/// configured destination.
pub struct Proxy {
    config: ProxyConfig,
    state: Mutex<ProxyState>,
    cancel: CancellationToken,
}

impl Proxy {
    pub fn new(config: ProxyConfig, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(ProxyState::default()),
            cancel,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Address the acceptor is actually bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.state).local_addr
    }

    /// Snapshot of the aggregate statistics.
    pub fn stats(&self) -> ProxyStats {
        lock(&self.state).stats.clone()
    }

    /// Number of live sessions in the session map.
    pub fn session_count(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    fn span(&self) -> Span {
        info_span!("proxy", channel = %format!("net.proxy.{}", self.config.name))
    }

    /// Resolve the source endpoint, bind with address reuse, listen, and
    /// enter the accept loop on a background task.
    pub async fn start(self: &Arc<Self>) -> io::Result<()> {
        let span = self.span();
        let proxy = Arc::clone(self);
        async move {
            lock(&proxy.state).stats.start_time = Some(SystemTime::now());

            info!(
                source = %proxy.config.source,
                destination = %proxy.config.destination,
                "starting"
            );
            info!(
                message_dump = ?proxy.config.dump,
                buffer_size = proxy.config.buffer_size,
                timeout_us = proxy.config.timeout_us,
                client_delay_us = proxy.config.client_delay_us,
                server_delay_us = proxy.config.server_delay_us,
                "configuration"
            );

            let endpoint = proxy.config.source.resolve().await?;
            info!(endpoint = %endpoint, "binding");

            let socket = match endpoint {
                SocketAddr::V4(_) => TcpSocket::new_v4()?,
                SocketAddr::V6(_) => TcpSocket::new_v6()?,
            };
            socket.set_reuseaddr(true)?;
            socket.bind(endpoint)?;
            let listener = socket.listen(1024)?;

            let local_addr = listener.local_addr()?;
            lock(&proxy.state).local_addr = Some(local_addr);
            info!(endpoint = %local_addr, "listening");

            tokio::spawn(
                Arc::clone(&proxy)
                    .accept_loop(listener)
                    .instrument(Span::current()),
            );
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(peer = %peer, "connection accepted");
                        self.add_session(stream);
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
        debug!("accept loop terminated");
    }

    /// Mint an ID, build a session with the proxy configuration copied
    /// through, subscribe to its stop event and start it.
    fn add_session(self: &Arc<Self>, stream: TcpStream) {
        let id = new_session_id();
        let session_config = SessionConfig {
            id: id.clone(),
            proxy_name: self.config.name.clone(),
            destination: self.config.destination.clone(),
            buffer_size: self.config.buffer_size,
            client_delay_us: self.config.client_delay_us,
            server_delay_us: self.config.server_delay_us,
            timeout_us: self.config.timeout_us,
            dump: self.config.dump,
        };

        let session = Session::new(stream, session_config, self.cancel.child_token());

        let proxy = Arc::downgrade(self);
        session.set_on_stopped(move |stopped| {
            if let Some(proxy) = proxy.upgrade() {
                proxy.handle_session_stopped(stopped);
            }
        });

        // An ID collision overwrites the old entry: last writer wins.
        lock(&self.state)
            .sessions
            .insert(id.clone(), Arc::clone(&session));

        match session.start() {
            Ok(()) => info!(session = %id, "session started"),
            Err(e) => {
                error!(session = %id, error = %e, "failed to start session");
                session.stop();
            }
        }
    }

    /// Absorb a stopped session's counters and drop it from the map,
    /// releasing the last strong reference to it.
    fn handle_session_stopped(&self, session: &Session) {
        let session_info = session.info();
        let mut state = lock(&self.state);

        self.span().in_scope(|| {
            info!(session = %session.id(), "removing session");
        });

        state.stats.total_tx += session_info.total_tx;
        state.stats.total_rx += session_info.total_rx;
        state.stats.total_sessions += 1;
        state.sessions.remove(session.id());
    }

    /// Close the acceptor, stop every live session, record the stop time
    /// and log the aggregates.
    pub fn stop(&self) {
        let span = self.span();
        let _guard = span.enter();

        self.cancel.cancel();

        let sessions: Vec<Arc<Session>> =
            lock(&self.state).sessions.values().cloned().collect();
        for session in &sessions {
            session.stop();
        }

        let mut state = lock(&self.state);
        state.stats.stop_time = Some(SystemTime::now());

        let elapsed = match (state.stats.start_time, state.stats.stop_time) {
            (Some(start), Some(stop)) => stop.duration_since(start).unwrap_or_default(),
            _ => Duration::ZERO,
        };
        info!(
            sessions = state.stats.total_sessions,
            tx = state.stats.total_tx,
            rx = state.stats.total_rx,
            elapsed_ms = elapsed.as_millis() as u64,
            "stats"
        );
        debug!("stopped");
    }
}
