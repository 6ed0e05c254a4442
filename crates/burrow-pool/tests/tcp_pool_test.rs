//! Integration tests for the TCP connection pool
//!
//! A test "tunnel client" dials the pool's port directly, the same way the
//! operator's agent would.

use burrow_pool::{ConnectionPool, PoolEvent, TcpConnectionPool, TcpPoolConfig};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn config(max_sockets: usize) -> TcpPoolConfig {
    TcpPoolConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        max_sockets,
        probe_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn next_event(events: &mut broadcast::Receiver<PoolEvent>) -> PoolEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for pool event")
        .expect("event channel closed")
}

async fn wait_for_sockets(pool: &TcpConnectionPool, expected: usize) {
    for _ in 0..100 {
        if pool.stats().connected_sockets == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} connected sockets, found {}",
        expected,
        pool.stats().connected_sockets
    );
}

#[tokio::test]
async fn test_online_then_offline_as_sockets_come_and_go() {
    let pool = TcpConnectionPool::new("online-offline", config(4));
    let mut events = pool.subscribe();
    let info = pool.listen().await.unwrap();

    let tunnel = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    assert_eq!(next_event(&mut events).await, PoolEvent::Online);
    wait_for_sockets(&pool, 1).await;

    drop(tunnel);
    assert_eq!(next_event(&mut events).await, PoolEvent::Offline);
    wait_for_sockets(&pool, 0).await;
}

#[tokio::test]
async fn test_connection_relays_bytes_both_ways() {
    let pool = TcpConnectionPool::new("relay", config(4));
    let info = pool.listen().await.unwrap();

    let mut tunnel = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    wait_for_sockets(&pool, 1).await;

    let mut conn = pool.create_connection().await.unwrap();
    conn.write_all(b"ping from relay").await.unwrap();

    let mut buf = [0u8; 15];
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping from relay");

    tunnel.write_all(b"pong").await.unwrap();
    let mut reply = [0u8; 4];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong");

    // Handed-out sockets still count until released.
    assert_eq!(pool.stats().connected_sockets, 1);
    drop(conn);
    wait_for_sockets(&pool, 0).await;
}

#[tokio::test]
async fn test_waiter_is_served_by_next_socket() {
    let pool = Arc::new(TcpConnectionPool::new("waiter", config(4)));
    let info = pool.listen().await.unwrap();

    let pending = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.create_connection().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.stats().waiting_requests, 1);

    let mut tunnel = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    let mut conn = timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    conn.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");
    assert_eq!(pool.stats().waiting_requests, 0);
}

#[tokio::test]
async fn test_sockets_beyond_limit_are_dropped() {
    let pool = TcpConnectionPool::new("limit", config(1));
    let info = pool.listen().await.unwrap();

    let _first = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    wait_for_sockets(&pool, 1).await;

    let mut second = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), second.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "extra socket should be closed by the pool");
    assert_eq!(pool.stats().connected_sockets, 1);
}

#[tokio::test]
async fn test_ping_emits_pong_on_http_response() {
    let pool = TcpConnectionPool::new("probe", config(4));
    let mut events = pool.subscribe();
    let info = pool.listen().await.unwrap();

    let mut tunnel = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    assert_eq!(next_event(&mut events).await, PoolEvent::Online);

    let responder = tokio::spawn(async move {
        let mut buf = vec![0u8; 1024];
        let n = tunnel.read(&mut buf).await.unwrap();
        let request = String::from_utf8_lossy(&buf[..n]).to_string();
        tunnel
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        request
    });

    pool.ping().await;

    let request = responder.await.unwrap();
    assert!(request.starts_with("HEAD / HTTP/1.1\r\n"));
    assert_eq!(next_event(&mut events).await, PoolEvent::Pong);

    // The liveness check used up the only socket, so the pool ends up offline.
    assert_eq!(next_event(&mut events).await, PoolEvent::Offline);
    assert!(events.try_recv().is_err());
    assert_eq!(pool.stats().connected_sockets, 0);
}

#[tokio::test]
async fn test_ping_without_idle_socket_is_silent() {
    let pool = TcpConnectionPool::new("silent", config(4));
    let mut events = pool.subscribe();
    pool.listen().await.unwrap();

    pool.ping().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_ping_with_all_sockets_busy_emits_pong() {
    let pool = TcpConnectionPool::new("busy", config(1));
    let mut events = pool.subscribe();
    let info = pool.listen().await.unwrap();

    let _tunnel = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    assert_eq!(next_event(&mut events).await, PoolEvent::Online);

    let _conn = pool.create_connection().await.unwrap();
    pool.ping().await;
    assert_eq!(next_event(&mut events).await, PoolEvent::Pong);
}

#[tokio::test]
async fn test_abandoned_waiter_is_not_counted() {
    let pool = Arc::new(TcpConnectionPool::new("abandoned", config(4)));
    let info = pool.listen().await.unwrap();

    let pending = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.create_connection().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.stats().waiting_requests, 1);

    pending.abort();
    let _ = pending.await;
    assert_eq!(pool.stats().waiting_requests, 0);

    // The next socket goes to a live request, not the abandoned one.
    let _tunnel = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    let conn = timeout(Duration::from_secs(2), pool.create_connection()).await;
    assert!(conn.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_request_and_socket_always_meet() {
    for round in 0..50 {
        let pool = Arc::new(TcpConnectionPool::new("race", config(4)));
        let info = pool.listen().await.unwrap();

        let request = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.create_connection().await })
        };
        let _tunnel = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();

        let conn = timeout(Duration::from_secs(2), request)
            .await
            .unwrap_or_else(|_| panic!("request stranded in round {}", round));
        assert!(conn.unwrap().is_ok());
    }
}
