//! Shared helpers for the end-to-end proxy tests: an echoing TCP backend,
//! proxy bring-up on an ephemeral port, and polling assertions.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tcptap::config::{DumpMode, Endpoint, ProxyConfig};
use tcptap::proxy::Proxy;

/// A TCP server that echoes every byte back on each accepted connection.
pub struct EchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
}

impl EchoBackend {
    pub async fn spawn() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let conn_count = Arc::clone(&connections);
        let byte_count = Arc::clone(&bytes_received);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                conn_count.fetch_add(1, Ordering::Relaxed);
                let bytes = Arc::clone(&byte_count);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
        })
    }
}

/// Proxy configuration listening on an ephemeral loopback port.
pub fn proxy_config(name: &str, destination: SocketAddr) -> ProxyConfig {
    ProxyConfig {
        name: name.to_string(),
        active: true,
        source: Endpoint::new("127.0.0.1", "0"),
        destination: Endpoint::new(
            destination.ip().to_string(),
            destination.port().to_string(),
        ),
        buffer_size: 4096,
        client_delay_us: 0,
        server_delay_us: 0,
        timeout_us: 0,
        dump: DumpMode::None,
    }
}

/// Start a standalone proxy and return it with its bound address.
pub async fn start_proxy(config: ProxyConfig) -> (Arc<Proxy>, SocketAddr) {
    let proxy = Proxy::new(config, CancellationToken::new());
    proxy.start().await.expect("proxy should start");
    let addr = proxy.local_addr().expect("proxy should be bound");
    (proxy, addr)
}

/// Poll a condition until it holds or a generous deadline passes.
pub async fn wait_until<F>(what: &str, predicate: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
