//! Relay tests: public requests travel through an in-memory pool to a local
//! hyper service standing in for the operator's application.

mod common;

use burrow_control::{
    read_request_head, ProxyError, RequestHead, Session, SessionConfig, SessionRegistry,
};
use burrow_pool::{ConnectionPool, PoolEvent};
use bytes::Bytes;
use common::{init_tracing, registry, MockPool};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const UPGRADE_HEAD: &[u8] = b"GET /socket?v=2 HTTP/1.1\r\n\
Host: alice.tunnel.test\r\n\
Connection: Upgrade\r\n\
Upgrade: websocket\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
X-Trace-ID: abc-123\r\n\
x-TENANT: Blue Team\r\n\
\r\n";

/// Echoes the request body and mirrors selected request headers
async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let custom = req.headers().get("x-custom").cloned();
    let body = req.into_body().collect().await?.to_bytes();

    let mut response = Response::builder()
        .status(StatusCode::CREATED)
        .header("x-seen-method", method)
        .header("x-seen-path", path)
        .header("x-seen-length", body.len().to_string());
    if let Some(custom) = custom {
        response = response.header("x-custom", custom);
    }
    Ok(response.body(Full::new(body)).unwrap())
}

/// Serve every tunnel connection the pool hands out with [`echo`]
fn serve_local_app(mut tunnels: mpsc::UnboundedReceiver<DuplexStream>) {
    tokio::spawn(async move {
        while let Some(stream) = tunnels.recv().await {
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(echo))
                    .await;
            });
        }
    });
}

/// Registered session with one confirmed pool; keep the registry alive
/// for as long as the session is used
async fn online_session(name: &str) -> (SessionRegistry, Arc<Session>, Arc<MockPool>) {
    let (registry, factory) = registry(false);
    registry.create_session(name).await.unwrap();
    let pool = factory.last_pool();
    pool.emit(PoolEvent::Online);
    let session = registry.get_session(name).unwrap();
    (registry, session, pool)
}

#[tokio::test]
async fn test_no_pools_gives_bad_gateway() {
    let session = Session::new("nobody", SessionConfig::default(), None);
    let response = session
        .handle_request(Request::get("/").body(Empty::<Bytes>::new()).unwrap())
        .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_request_and_response_are_relayed() {
    init_tracing();
    let (_registry, session, pool) = online_session("alice").await;
    serve_local_app(pool.tunnel_side());

    let request = Request::post("/upload?part=1")
        .header("host", "alice.tunnel.test")
        .header("x-custom", "kept")
        .body(Full::new(Bytes::from_static(b"hello tunnel")))
        .unwrap();
    let response = session.handle_request(request).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["x-seen-method"], "POST");
    assert_eq!(response.headers()["x-seen-path"], "/upload");
    assert_eq!(response.headers()["x-custom"], "kept");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hello tunnel");
}

#[tokio::test]
async fn test_large_body_streams_both_ways() {
    let (_registry, session, pool) = online_session("bigfile").await;
    serve_local_app(pool.tunnel_side());

    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let request = Request::put("/blob")
        .header("host", "bigfile.tunnel.test")
        .body(Full::new(Bytes::from(payload.clone())))
        .unwrap();

    let response = timeout(Duration::from_secs(10), session.handle_request(request))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["x-seen-length"], "1048576");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), payload.len());
    assert!(body[..] == payload[..]);
}

#[tokio::test]
async fn test_local_app_hangup_gives_bad_gateway() {
    let (_registry, session, pool) = online_session("hangup").await;
    let mut tunnels = pool.tunnel_side();
    tokio::spawn(async move {
        while let Some(stream) = tunnels.recv().await {
            drop(stream);
        }
    });

    let response = session
        .handle_request(Request::get("/").body(Empty::<Bytes>::new()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_requests_alternate_between_pools() {
    let session = Session::new("shared", SessionConfig::default(), None);
    let first = MockPool::new("shared", 1, false, false);
    let second = MockPool::new("shared", 2, false, false);
    session.attach(first.clone()).unwrap();
    session.attach(second.clone()).unwrap();

    let mut first_side = first.tunnel_side();
    let mut second_side = second.tunnel_side();

    for _ in 0..2 {
        let a = session.next_pool().unwrap().create_connection().await.unwrap();
        let b = session.next_pool().unwrap().create_connection().await.unwrap();
        assert!(first_side.try_recv().is_ok());
        assert!(second_side.try_recv().is_ok());
        drop((a, b));
    }
}

#[tokio::test]
async fn test_upgrade_head_replayed_exactly() {
    init_tracing();
    let (_registry, session, pool) = online_session("alice").await;
    let mut tunnels = pool.tunnel_side();

    let (mut public, relay_side) = tokio::io::duplex(64 * 1024);
    public.write_all(UPGRADE_HEAD).await.unwrap();
    public.write_all(b"early").await.unwrap();

    let relay = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut relay_side = relay_side;
            let read = read_request_head(&mut relay_side, 16 * 1024)
                .await
                .unwrap()
                .unwrap();
            assert!(read.head.is_upgrade());
            let leftover = Bytes::copy_from_slice(read.leftover());
            session.handle_upgrade(read.head, leftover, relay_side).await
        })
    };

    let mut tunnel = timeout(Duration::from_secs(5), tunnels.recv())
        .await
        .unwrap()
        .unwrap();

    let mut replayed = vec![0u8; UPGRADE_HEAD.len() + 5];
    tunnel.read_exact(&mut replayed).await.unwrap();
    assert_eq!(&replayed[..UPGRADE_HEAD.len()], UPGRADE_HEAD);
    assert_eq!(&replayed[UPGRADE_HEAD.len()..], b"early");

    // Bytes flow both ways once the local side answers.
    tunnel
        .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
        .await
        .unwrap();
    let mut answer = vec![0u8; 34];
    public.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer[..], b"HTTP/1.1 101 Switching Protocols\r\n");

    public.write_all(b"frame-from-public").await.unwrap();
    let mut frame = [0u8; 17];
    tunnel.read_exact(&mut frame).await.unwrap();
    assert_eq!(&frame, b"frame-from-public");

    drop(public);
    drop(tunnel);
    let result = timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_upgrade_abandoned_when_public_client_leaves() {
    let (_registry, session, pool) = online_session("leaver").await;
    pool.stall_connections.store(true, Ordering::SeqCst);

    let (public, relay_side) = tokio::io::duplex(1024);
    let (head, _) = RequestHead::parse(UPGRADE_HEAD)
        .unwrap()
        .unwrap();

    let relay = tokio::spawn(async move {
        session.handle_upgrade(head, Bytes::new(), relay_side).await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(public);

    let result = timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
    assert!(matches!(result, Err(ProxyError::ClientGone)));
}

#[tokio::test]
async fn test_upgrade_without_pools_closes_socket() {
    let session = Session::new("nobody", SessionConfig::default(), None);
    let (mut public, relay_side) = tokio::io::duplex(1024);
    let (head, _) = RequestHead::parse(UPGRADE_HEAD)
        .unwrap()
        .unwrap();

    let result = session.handle_upgrade(head, Bytes::new(), relay_side).await;
    assert!(matches!(result, Err(ProxyError::Unavailable(_))));

    let mut buf = [0u8; 1];
    assert_eq!(public.read(&mut buf).await.unwrap(), 0);
}
