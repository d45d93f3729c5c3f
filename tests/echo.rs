//! Round-trip forwarding through a live proxy.

mod harness;

use std::sync::atomic::Ordering;

use harness::{proxy_config, start_proxy, wait_until, EchoBackend};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn transparent_echo() {
    let backend = EchoBackend::spawn().await.unwrap();
    let (proxy, addr) = start_proxy(proxy_config("echo", backend.addr)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"hello");

    drop(client);
    wait_until("session to stop", || proxy.stats().total_sessions == 1).await;

    let stats = proxy.stats();
    assert_eq!(stats.total_tx, 5);
    assert_eq!(stats.total_rx, 5);
    assert_eq!(proxy.session_count(), 0);

    proxy.stop();
}

#[tokio::test]
async fn order_is_preserved_per_direction() {
    let backend = EchoBackend::spawn().await.unwrap();
    let (proxy, addr) = start_proxy(proxy_config("ordered", backend.addr)).await;

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

    let client = TcpStream::connect(addr).await.unwrap();
    let (mut read_half, mut write_half) = client.into_split();

    // keep the write half open until the echo is fully drained: closing it
    // early would stop the session before the return bytes arrive
    let to_send = payload.clone();
    let writer = tokio::spawn(async move {
        write_half.write_all(&to_send).await.unwrap();
        write_half
    });

    let mut received = vec![0u8; payload.len()];
    read_half.read_exact(&mut received).await.unwrap();
    drop(writer.await.unwrap());

    assert_eq!(received, payload);

    proxy.stop();
}

#[tokio::test]
async fn concurrent_sessions_aggregate() {
    const CLIENTS: usize = 8;
    const PAYLOAD: usize = 128 * 1024;

    let backend = EchoBackend::spawn().await.unwrap();
    let (proxy, addr) = start_proxy(proxy_config("fanout", backend.addr)).await;

    let mut tasks = Vec::new();
    for seed in 0..CLIENTS {
        tasks.push(tokio::spawn(async move {
            let payload: Vec<u8> = (0..PAYLOAD).map(|i| ((i * 31 + seed) % 256) as u8).collect();

            let client = TcpStream::connect(addr).await.unwrap();
            let (mut read_half, mut write_half) = client.into_split();

            let to_send = payload.clone();
            let writer = tokio::spawn(async move {
                write_half.write_all(&to_send).await.unwrap();
                write_half
            });

            let mut received = vec![0u8; PAYLOAD];
            read_half.read_exact(&mut received).await.unwrap();
            drop(writer.await.unwrap());

            assert_eq!(received, payload, "client {seed} echo mismatch");
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    wait_until("all sessions to stop", || {
        proxy.stats().total_sessions == CLIENTS as u64
    })
    .await;

    let stats = proxy.stats();
    let expected = (CLIENTS * PAYLOAD) as u64;
    assert_eq!(stats.total_tx, expected);
    assert_eq!(stats.total_rx, expected);
    assert_eq!(backend.connections.load(Ordering::Relaxed), CLIENTS as u64);
    assert_eq!(backend.bytes_received.load(Ordering::Relaxed), expected);

    // the session map only ever holds live sessions
    assert_eq!(proxy.session_count(), 0);

    proxy.stop();
}

#[tokio::test]
async fn tiny_buffer_loses_no_data() {
    let backend = EchoBackend::spawn().await.unwrap();
    let mut config = proxy_config("tiny", backend.addr);
    config.buffer_size = 1;
    let (proxy, addr) = start_proxy(config).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"granular").await.unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"granular");

    drop(client);
    wait_until("session to stop", || proxy.stats().total_sessions == 1).await;

    let stats = proxy.stats();
    assert_eq!(stats.total_tx, 8);
    assert_eq!(stats.total_rx, 8);

    proxy.stop();
}
