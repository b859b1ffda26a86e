//! Dial-back ordering and failure behavior of the TCP tunnel

use burrow_publisher::{SessionError, TcpTunnel};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

#[tokio::test]
async fn test_token_is_written_before_local_dial() {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_port = broker.local_addr().unwrap().port();
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_port = local.local_addr().unwrap().port();

    let tunnel = TcpTunnel {
        broker_host: "127.0.0.1".to_string(),
        public_port: broker_port,
        hidden_host: "127.0.0.1".to_string(),
        hidden_port: local_port,
    };
    let token = br#"{"tunnelId":"tun-1","serviceId":"svc-1"}"#;
    tokio::spawn(async move {
        let _ = tunnel.run(token).await;
    });

    // The broker side sees the token as the first bytes on the wire
    let (mut broker_side, _) = timeout(Duration::from_secs(2), broker.accept())
        .await
        .unwrap()
        .unwrap();
    let mut received = vec![0u8; token.len()];
    timeout(Duration::from_secs(2), broker_side.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received, token);

    // Only after that does the local service get dialed
    let (mut local_side, _) = timeout(Duration::from_secs(2), local.accept())
        .await
        .unwrap()
        .unwrap();

    // Bytes flow both ways through the established tunnel
    broker_side.write_all(b"request").await.unwrap();
    let mut request = [0u8; 7];
    timeout(Duration::from_secs(2), local_side.read_exact(&mut request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&request, b"request");

    local_side.write_all(b"response").await.unwrap();
    let mut response = [0u8; 8];
    timeout(Duration::from_secs(2), broker_side.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response, b"response");
}

#[tokio::test]
async fn test_local_connect_failure_drops_broker_socket() {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_port = broker.local_addr().unwrap().port();

    // Reserve a port with no listener behind it
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = unused.local_addr().unwrap().port();
    drop(unused);

    let tunnel = TcpTunnel {
        broker_host: "127.0.0.1".to_string(),
        public_port: broker_port,
        hidden_host: "127.0.0.1".to_string(),
        hidden_port: dead_port,
    };
    let token = br#"{"tunnelId":"tun-2","serviceId":"svc-1"}"#;
    let handle = tokio::spawn(async move { tunnel.run(token).await });

    let (mut broker_side, _) = timeout(Duration::from_secs(2), broker.accept())
        .await
        .unwrap()
        .unwrap();
    let mut received = vec![0u8; token.len()];
    timeout(Duration::from_secs(2), broker_side.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();

    let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(SessionError::LocalConnect { .. }) | Err(SessionError::LocalTimeout { .. })
    ));

    // The broker-side socket is gone once the local dial fails
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(2), broker_side.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn test_broker_connect_failure_is_reported() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = unused.local_addr().unwrap().port();
    drop(unused);

    let tunnel = TcpTunnel {
        broker_host: "127.0.0.1".to_string(),
        public_port: dead_port,
        hidden_host: "127.0.0.1".to_string(),
        hidden_port: 1,
    };
    let result = tunnel.run(b"{}").await;
    assert!(matches!(result, Err(SessionError::BrokerConnect { .. })));
}
