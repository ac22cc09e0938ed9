//! End-to-end tests against a running engine on loopback.

use std::net::SocketAddr;
use std::time::Duration;

use focusgate_proxy::{
    Blocklist, EngineConfig, EngineHandle, ProxyEngine, BLOCKED_CONNECT_RESPONSE,
    CONNECT_ESTABLISHED_RESPONSE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start_engine(sites: &[&str]) -> EngineHandle {
    ProxyEngine::new(
        EngineConfig::default().with_port(0),
        Blocklist::build(sites.iter().copied()),
    )
    .start()
    .await
    .expect("Failed to start engine")
}

/// Sends raw bytes to the proxy and reads until it closes the connection.
async fn roundtrip(proxy: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request).await.unwrap();

    let mut response = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut response))
        .await
        .expect("proxy did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Fake origin server that answers one request and returns what it received.
async fn fake_upstream(response: &'static str) -> (SocketAddr, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !received.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        stream.write_all(response.as_bytes()).await.unwrap();
        String::from_utf8_lossy(&received).into_owned()
    });

    (addr, task)
}

/// Echo server for tunnel tests.
async fn echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.into_split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });

    addr
}

/// Returns a loopback port nothing listens on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Reads until `needle` shows up in what was received so far.
async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    timeout(WAIT, async {
        while !String::from_utf8_lossy(&received).contains(needle) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "closed before {:?}", needle);
            received.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("timed out waiting for response");
    String::from_utf8_lossy(&received).into_owned()
}

/// Reads until the proxy closes the connection; a reset counts as closed.
async fn read_until_closed(stream: &mut TcpStream) -> String {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    timeout(WAIT, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await
    .expect("proxy did not close the connection");
    String::from_utf8_lossy(&received).into_owned()
}

/// Opens a keep-alive connection that has already served one request, so a
/// following CONNECT is read by the HTTP server rather than the raw path.
async fn keep_alive_connection(proxy: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET http://sub.example.com/ HTTP/1.1\r\nHost: sub.example.com\r\n\r\n")
        .await
        .unwrap();
    let first = read_until(&mut client, "</html>").await;
    assert!(first.starts_with("HTTP/1.1 403"), "{}", first);
    client
}

async fn open_tunnel(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    client.write_all(request.as_bytes()).await.unwrap();

    let mut established = vec![0u8; CONNECT_ESTABLISHED_RESPONSE.len()];
    timeout(WAIT, client.read_exact(&mut established))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(established, CONNECT_ESTABLISHED_RESPONSE);
    client
}

#[tokio::test]
async fn blocked_plain_request_gets_block_page() {
    let engine = start_engine(&["example.com"]).await;

    let response = roundtrip(
        engine.addr(),
        b"GET http://sub.example.com/watch HTTP/1.1\r\nHost: sub.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 403"), "{}", response);
    assert!(response.contains("text/html"));
    assert!(response.contains("sub.example.com"));
    engine.stop().await;
}

#[tokio::test]
async fn allowed_plain_request_is_relayed() {
    let engine = start_engine(&["example.com"]).await;
    let (upstream, received) = fake_upstream(
        "HTTP/1.1 418 I'm a teapot\r\nContent-Length: 5\r\nConnection: close\r\n\r\nshort",
    )
    .await;

    let request = format!(
        "GET http://{}/brew?cup=1 HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        upstream, upstream
    );
    let response = roundtrip(engine.addr(), request.as_bytes()).await;

    assert!(response.starts_with("HTTP/1.1 418"), "{}", response);
    assert!(response.ends_with("short"));

    let received = timeout(WAIT, received).await.unwrap().unwrap();
    assert!(received.starts_with("GET /brew?cup=1 HTTP/1.1\r\n"), "{}", received);
    engine.stop().await;
}

#[tokio::test]
async fn unreachable_upstream_gets_502() {
    let engine = start_engine(&[]).await;
    let port = closed_port().await;

    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        port, port
    );
    let response = roundtrip(engine.addr(), request.as_bytes()).await;

    assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
    engine.stop().await;
}

#[tokio::test]
async fn malformed_request_gets_400() {
    let engine = start_engine(&[]).await;

    let response = roundtrip(engine.addr(), b"NOT A VALID REQUEST\r\n\r\n").await;

    assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
    engine.stop().await;
}

#[tokio::test]
async fn blocked_connect_gets_raw_403() {
    let engine = start_engine(&["example.com"]).await;

    let response = roundtrip(
        engine.addr(),
        b"CONNECT www.Example.com:443 HTTP/1.1\r\nHost: www.example.com:443\r\n\r\n",
    )
    .await;

    assert_eq!(response.as_bytes(), BLOCKED_CONNECT_RESPONSE);
    engine.stop().await;
}

#[tokio::test]
async fn connect_tunnel_forwards_early_bytes() {
    let engine = start_engine(&["example.com"]).await;
    let upstream = echo_upstream().await;

    let mut client = TcpStream::connect(engine.addr()).await.unwrap();
    let request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\nearly",
        upstream, upstream
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut established = vec![0u8; CONNECT_ESTABLISHED_RESPONSE.len()];
    client.read_exact(&mut established).await.unwrap();
    assert_eq!(established, CONNECT_ESTABLISHED_RESPONSE);

    let mut echoed = [0u8; 5];
    timeout(WAIT, client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"early");

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    timeout(WAIT, client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");

    engine.stop().await;
}

#[tokio::test]
async fn upstream_close_closes_client() {
    let engine = start_engine(&[]).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    let mut client = open_tunnel(engine.addr(), upstream).await;
    let mut rest = Vec::new();
    let read = timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    engine.stop().await;
}

#[tokio::test]
async fn connect_to_unreachable_upstream_drops_client() {
    let engine = start_engine(&[]).await;
    let port = closed_port().await;

    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", port);
    let response = roundtrip(engine.addr(), request.as_bytes()).await;

    assert!(response.is_empty(), "{}", response);
    engine.stop().await;
}

#[tokio::test]
async fn stop_destroys_open_tunnels() {
    let engine = start_engine(&[]).await;
    let upstream = echo_upstream().await;

    let mut client = open_tunnel(engine.addr(), upstream).await;
    assert_eq!(engine.active_connections(), 1);

    let registry = engine.registry().clone();
    let destroyed = engine.stop().await;
    assert_eq!(destroyed, 1);
    assert!(registry.is_empty());

    let mut buf = [0u8; 16];
    let read = timeout(WAIT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn closed_connections_leave_the_registry() {
    let engine = start_engine(&["example.com"]).await;

    for _ in 0..3 {
        roundtrip(
            engine.addr(),
            b"CONNECT example.com:443 HTTP/1.1\r\n\r\n",
        )
        .await;
    }

    // Unregistration runs when the connection task finishes.
    timeout(WAIT, async {
        while engine.active_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(engine.stop().await, 0);
}

#[tokio::test]
async fn upstream_closing_mid_response_ends_the_response() {
    let engine = start_engine(&[]).await;
    let (upstream, _received) =
        fake_upstream("HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nhello").await;

    let mut client = TcpStream::connect(engine.addr()).await.unwrap();
    let request = format!(
        "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        upstream, upstream
    );
    client.write_all(request.as_bytes()).await.unwrap();

    // Headers were already sent, so the body is cut short instead of a 502.
    let response = read_until_closed(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("hello"), "{}", response);
    assert!(!response.contains("502"));

    timeout(WAIT, async {
        while engine.active_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    engine.stop().await;
}

#[tokio::test]
async fn relayed_response_gets_no_added_date_header() {
    let engine = start_engine(&[]).await;
    let (upstream, _received) =
        fake_upstream("HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;

    let request = format!(
        "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        upstream, upstream
    );
    let response = roundtrip(engine.addr(), request.as_bytes()).await;

    assert!(response.starts_with("HTTP/1.1 204"), "{}", response);
    assert!(!response.to_ascii_lowercase().contains("\r\ndate:"), "{}", response);
    engine.stop().await;
}

#[tokio::test]
async fn keep_alive_blocked_connect_closes_connection() {
    let engine = start_engine(&["example.com"]).await;
    let mut client = keep_alive_connection(engine.addr()).await;

    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let response = read_until_closed(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 403"), "{}", response);
    assert!(response.ends_with("Blocked.\r\n"), "{}", response);
    engine.stop().await;
}

#[tokio::test]
async fn keep_alive_connect_opens_tunnel() {
    let engine = start_engine(&["example.com"]).await;
    let upstream = echo_upstream().await;
    let mut client = keep_alive_connection(engine.addr()).await;

    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", upstream, upstream);
    client.write_all(request.as_bytes()).await.unwrap();

    let response = read_until(&mut client, "\r\n\r\n").await;
    assert!(
        response.starts_with("HTTP/1.1 200 Connection Established\r\n"),
        "{}",
        response
    );

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    timeout(WAIT, client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");

    // The tunnel is registered, so stopping the engine closes it.
    engine.stop().await;
    let mut buf = [0u8; 16];
    let read = timeout(WAIT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn keep_alive_connect_to_unreachable_upstream_gets_502() {
    let engine = start_engine(&[]).await;
    let port = closed_port().await;
    let mut client = keep_alive_connection(engine.addr()).await;

    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", port);
    client.write_all(request.as_bytes()).await.unwrap();

    let response = read_until(&mut client, "Bad Gateway").await;
    assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
    engine.stop().await;
}
