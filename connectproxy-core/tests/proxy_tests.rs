use connectproxy_config::{Config, Metrics, Timeouts};
use connectproxy_core::{TrafficTracker, run_proxy};
use connectproxy_core::tunnel::CONNECTION_ESTABLISHED;
use prometheus::{Encoder, Registry, TextEncoder};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn create_test_config(proxy_port: u16) -> Config {
    Config {
        listen_addrs: vec![format!("127.0.0.1:{}", proxy_port)],
        timeouts: Timeouts {
            connect: 2,
            request_head: 2,
            stalled_write: 5,
        },
        metrics: Metrics {
            enabled: false,
            address: "127.0.0.1:0".to_string(),
        },
        outbound: None,
        stats: None,
    }
}

async fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(addr: &str, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_through_proxy_end_to_end() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(&buf).await.unwrap();
    });

    let proxy_port = find_available_port().await;
    let proxy_addr = format!("127.0.0.1:{}", proxy_port);
    let tracker = TrafficTracker::new(16);
    let mut completed = tracker.subscribe();
    let registry = Registry::new();
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let proxy = tokio::spawn(run_proxy(
        create_test_config(proxy_port),
        tracker.clone(),
        Some(registry.clone()),
        shutdown_rx,
    ));
    assert!(wait_for_server(&proxy_addr, 40).await);

    let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
    client
        .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\nping", echo_addr).as_bytes())
        .await
        .unwrap();

    let mut ack = vec![0u8; CONNECTION_ESTABLISHED.len()];
    timeout(WAIT, client.read_exact(&mut ack)).await.unwrap().unwrap();
    assert_eq!(ack, CONNECTION_ESTABLISHED);
    let mut echoed = [0u8; 4];
    timeout(WAIT, client.read_exact(&mut echoed)).await.unwrap().unwrap();
    assert_eq!(&echoed, b"ping");

    let mut rest = Vec::new();
    timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());

    let stats = timeout(WAIT, completed.recv()).await.unwrap().unwrap();
    assert_eq!(stats.method, "CONNECT");
    assert_eq!(stats.port, echo_addr.port());
    assert_eq!(stats.client_upload_bytes, 4);
    assert_eq!(stats.target_download_bytes, 4);
    assert!(!stats.is_http);

    // The observer feeds metrics asynchronously
    let mut text = String::new();
    for _ in 0..40 {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer).unwrap();
        text = String::from_utf8(buffer).unwrap();
        if text.contains("connectproxy_requests_completed_total{kind=\"connect\"} 1") {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(text.contains("connectproxy_requests_completed_total{kind=\"connect\"} 1"));
    assert!(text.contains("connectproxy_bytes_transferred_total{direction=\"upload\"}"));

    shutdown_tx.send(()).unwrap();
    timeout(WAIT, proxy).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_connect_target_gets_400() {
    let proxy_port = find_available_port().await;
    let proxy_addr = format!("127.0.0.1:{}", proxy_port);
    let tracker = TrafficTracker::new(16);
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let proxy = tokio::spawn(run_proxy(
        create_test_config(proxy_port),
        tracker.clone(),
        None,
        shutdown_rx,
    ));
    assert!(wait_for_server(&proxy_addr, 40).await);

    let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
    client
        .write_all(b"CONNECT no-port.example HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    timeout(WAIT, client.read_to_end(&mut response)).await.unwrap().unwrap();
    assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(tracker.active_count(), 0);

    shutdown_tx.send(()).unwrap();
    timeout(WAIT, proxy).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_clears_in_flight_requests() {
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    tokio::spawn(async move {
        // Hold the connection open without answering
        let (_socket, _) = silent.accept().await.unwrap();
        sleep(Duration::from_secs(30)).await;
    });

    let proxy_port = find_available_port().await;
    let proxy_addr = format!("127.0.0.1:{}", proxy_port);
    let tracker = TrafficTracker::new(16);
    let mut completed = tracker.subscribe();
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let proxy = tokio::spawn(run_proxy(
        create_test_config(proxy_port),
        tracker.clone(),
        None,
        shutdown_rx,
    ));
    assert!(wait_for_server(&proxy_addr, 40).await);

    let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", silent_addr).as_bytes())
        .await
        .unwrap();
    let mut ack = vec![0u8; CONNECTION_ESTABLISHED.len()];
    timeout(WAIT, client.read_exact(&mut ack)).await.unwrap().unwrap();
    assert_eq!(tracker.active_count(), 1);

    shutdown_tx.send(()).unwrap();
    timeout(WAIT, proxy).await.unwrap().unwrap().unwrap();
    assert_eq!(tracker.active_count(), 0);

    // Cleared records are dropped, not published
    drop(client);
    sleep(Duration::from_millis(100)).await;
    assert!(completed.try_recv().is_err());
}
