//! Integration tests for the connection broker

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

use devicelink::{Config, ConnectionManager, DeviceMessage};

fn peer(addr: &str) -> SocketAddr {
    addr.parse().unwrap()
}

fn channel_handler(
    manager: &ConnectionManager,
    device_id: &str,
    kind: &str,
) -> mpsc::UnboundedReceiver<DeviceMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager.register_device_handler(device_id, kind, move |message| {
        let _ = tx.send(message);
        Ok(())
    });
    rx
}

fn attach_duplex(manager: &ConnectionManager, addr: &str) -> (DuplexStream, String) {
    let (client, server) = tokio::io::duplex(1024);
    let (reader, writer) = tokio::io::split(server);
    let id = manager.attach_stream(peer(addr), reader, writer);
    (client, id)
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<DeviceMessage>) -> DeviceMessage {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("Message not dispatched within timeout")
        .expect("Handler channel closed")
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not met within timeout");
}

/// Writer whose every write fails, as after a peer reset
struct BrokenWriter;

impl AsyncWrite for BrokenWriter {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_fragmented_message_dispatched_once() {
    let manager = ConnectionManager::new(Arc::new(Config::default()));
    let mut rx = channel_handler(&manager, "sort_controller", "E");

    let reader = tokio_test::io::Builder::new()
        .read(b"SE0")
        .read(b"1\n")
        .build();
    manager.attach_stream(peer("10.0.0.5:4000"), reader, tokio::io::sink());

    let message = next_message(&mut rx).await;
    assert_eq!(message.device_tag, 'S');
    assert_eq!(message.content, "01");
    assert_eq!(message.raw.as_deref(), Some("SE01"));

    // The scripted reader hits end of stream after the two reads
    wait_until(|| manager.connections().is_empty()).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_short_message_dropped_connection_kept() {
    let manager = ConnectionManager::new(Arc::new(Config::default()));
    let mut rx = channel_handler(&manager, "S", "E");
    let (mut client, id) = attach_duplex(&manager, "10.0.0.5:4000");

    client.write_all(b"S\n\nSE1\n").await.unwrap();

    let message = next_message(&mut rx).await;
    assert_eq!(message.content, "1");
    assert_eq!(message.raw, None);

    sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    let connections = manager.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].id, id);
}

#[tokio::test]
async fn test_invalid_utf8_does_not_close_connection() {
    let manager = ConnectionManager::new(Arc::new(Config::default()));
    let mut rx = channel_handler(&manager, "env_controller", "E");
    let (mut client, _) = attach_duplex(&manager, "10.0.0.6:4000");

    client.write_all(&[b'H', b'E', 0xff, b'\n']).await.unwrap();
    client.write_all(b"HE-18.5\n").await.unwrap();

    assert_eq!(next_message(&mut rx).await.content, "-18.5");
    assert!(manager.is_device_connected("H"));
}

#[tokio::test]
async fn test_first_identity_is_sticky() {
    let manager = ConnectionManager::new(Arc::new(Config::default()));
    let mut sorter = channel_handler(&manager, "sort_controller", "E");
    let mut env = channel_handler(&manager, "env_controller", "E");
    let (mut client, _) = attach_duplex(&manager, "10.0.0.5:4000");

    client.write_all(b"SEir1\nHE20.5\n").await.unwrap();
    next_message(&mut sorter).await;
    next_message(&mut env).await;

    assert_eq!(manager.get_connected_devices(), vec!["S".to_string()]);
    assert!(manager.is_device_connected("S"));
    assert!(!manager.is_device_connected("H"));
}

#[tokio::test]
async fn test_address_preregistration_wins_over_message_tag() {
    let mut config = Config::default();
    config
        .devices
        .address_mapping
        .insert("127.0.0.1".to_string(), "sort_controller".to_string());
    let manager = ConnectionManager::new(Arc::new(config));
    let mut rx = channel_handler(&manager, "X", "E");

    let (mut client, _) = attach_duplex(&manager, "127.0.0.1:5000");
    assert_eq!(manager.get_connected_devices(), vec!["sort_controller".to_string()]);

    client.write_all(b"XE1\n").await.unwrap();

    let message = next_message(&mut rx).await;
    assert_eq!(message.device_tag, 'X');
    assert_eq!(message.content, "1");
    assert_eq!(manager.get_connected_devices(), vec!["sort_controller".to_string()]);
    assert!(!manager.is_device_connected("X"));
}

#[tokio::test]
async fn test_legacy_alias_handler_receives_message() {
    let manager = ConnectionManager::new(Arc::new(Config::default()));
    let mut rx = channel_handler(&manager, "access_controller", "res");
    let (mut client, _) = attach_duplex(&manager, "10.0.0.7:4000");

    client.write_all(b"GRok\n").await.unwrap();

    let message = next_message(&mut rx).await;
    assert_eq!(message.content, "ok");
    assert_eq!(message.raw, None);
}

#[tokio::test]
async fn test_failing_handler_does_not_stop_read_loop() {
    let manager = ConnectionManager::new(Arc::new(Config::default()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.register_device_handler("S", "E", move |message| {
        if message.content == "boom" {
            panic!("handler failure");
        }
        if message.content == "fail" {
            anyhow::bail!("handler error");
        }
        let _ = tx.send(message);
        Ok(())
    });
    let (mut client, _) = attach_duplex(&manager, "10.0.0.5:4000");

    client.write_all(b"SEboom\nSEfail\nSEok\n").await.unwrap();

    assert_eq!(next_message(&mut rx).await.content, "ok");
    assert_eq!(manager.connections().len(), 1);
}

#[tokio::test]
async fn test_send_appends_single_newline() {
    let manager = ConnectionManager::new(Arc::new(Config::default()));
    let (mut client, _) = attach_duplex(&manager, "10.0.0.5:4000");

    client.write_all(b"SEir1\n").await.unwrap();
    wait_until(|| manager.is_device_connected("S")).await;

    assert!(manager.send_message("S", "SCst").await);
    assert!(manager.send_message("S", "SCst\n").await);

    let mut buf = [0u8; 10];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"SCst\nSCst\n");
}

#[tokio::test]
async fn test_send_to_unconnected_device_fails() {
    let manager = ConnectionManager::new(Arc::new(Config::default()));
    assert!(!manager.send_message("sort_controller", "SCst").await);

    let (mut client, _) = attach_duplex(&manager, "10.0.0.6:4000");
    client.write_all(b"HEtemp\n").await.unwrap();
    wait_until(|| manager.is_device_connected("H")).await;

    assert!(!manager.send_message("sort_controller", "SCst").await);
    assert!(!manager.send_message("env_controller", "HCon").await);
    assert_eq!(manager.connections().len(), 1);
}

#[tokio::test]
async fn test_write_failure_evicts_connection() {
    let mut config = Config::default();
    config
        .devices
        .address_mapping
        .insert("10.0.0.8".to_string(), "access_controller".to_string());
    let manager = ConnectionManager::new(Arc::new(config));

    let (_client, server) = tokio::io::duplex(64);
    manager.attach_stream(peer("10.0.0.8:4000"), server, BrokenWriter);
    assert!(manager.is_device_connected("access_controller"));

    assert!(!manager.send_message("access_controller", "GCopen").await);
    assert!(manager.connections().is_empty());
}

#[tokio::test]
async fn test_evict_twice_is_safe() {
    let manager = ConnectionManager::new(Arc::new(Config::default()));
    let (mut client, id) = attach_duplex(&manager, "10.0.0.5:4000");

    assert!(manager.evict(&id).await);
    assert!(!manager.evict(&id).await);
    assert!(manager.connections().is_empty());

    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap();
    assert_eq!(read.unwrap(), 0);
}

#[tokio::test]
async fn test_disconnect_device() {
    let mut config = Config::default();
    config
        .devices
        .address_mapping
        .insert("10.0.0.9".to_string(), "env_controller".to_string());
    let manager = ConnectionManager::new(Arc::new(config));
    let (_client, _) = attach_duplex(&manager, "10.0.0.9:4000");

    assert!(manager.disconnect_device("env_controller").await);
    assert!(!manager.disconnect_device("env_controller").await);
    assert!(!manager.is_device_connected("env_controller"));
}

#[tokio::test]
async fn test_client_disconnect_releases_device() {
    let manager = ConnectionManager::new(Arc::new(Config::default()));
    let (mut client, _) = attach_duplex(&manager, "10.0.0.5:4000");

    client.write_all(b"GEentry\n").await.unwrap();
    wait_until(|| manager.is_device_connected("G")).await;

    drop(client);
    wait_until(|| manager.connections().is_empty()).await;
    assert!(manager.get_connected_devices().is_empty());
}

#[tokio::test]
async fn test_tcp_lifecycle() {
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
    let manager = ConnectionManager::new(Arc::new(config));
    let mut rx = channel_handler(&manager, "sort_controller", "E");

    assert!(manager.start().await.unwrap());
    assert!(!manager.start().await.unwrap());
    assert!(manager.is_running());
    let addr = manager.local_addr().expect("listener should be bound");

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"SEir1\n").await.unwrap();

    let message = next_message(&mut rx).await;
    assert_eq!(message.content, "ir1");
    wait_until(|| manager.is_device_connected("S")).await;

    let connections = manager.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].id, client.local_addr().unwrap().to_string());

    assert!(manager.send_message("S", "SCst").await);
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"SCst\n");

    manager.stop().await;
    assert!(!manager.is_running());
    assert!(manager.local_addr().is_none());
    assert!(manager.connections().is_empty());

    let mut rest = [0u8; 8];
    let read = timeout(Duration::from_secs(2), client.read(&mut rest)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_restart_after_stop() {
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
    let manager = ConnectionManager::new(Arc::new(config));

    assert!(manager.start().await.unwrap());
    manager.stop().await;
    manager.stop().await;

    assert!(manager.start().await.unwrap());
    assert!(manager.local_addr().is_some());
    manager.stop().await;
}

#[tokio::test]
async fn test_bind_failure_reported() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = Config::default();
    config.server.bind_addr = blocker.local_addr().unwrap();
    let manager = ConnectionManager::new(Arc::new(config));

    assert!(manager.start().await.is_err());
    assert!(!manager.is_running());
}

fn preregistered(ip: &str, device_id: &str) -> ConnectionManager {
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
    config
        .devices
        .address_mapping
        .insert(ip.to_string(), device_id.to_string());
    ConnectionManager::new(Arc::new(config))
}

#[tokio::test]
async fn test_eviction_interrupts_stalled_send() {
    let manager = preregistered("10.0.0.8", "access_controller");

    // The client never reads, so a large write stalls once the pipe fills
    let (_client, server) = tokio::io::duplex(16);
    let (reader, writer) = tokio::io::split(server);
    let id = manager.attach_stream(peer("10.0.0.8:4000"), reader, writer);

    let sender = manager.clone();
    let send = tokio::spawn(async move {
        sender.send_message("access_controller", &"G".repeat(200)).await
    });
    sleep(Duration::from_millis(50)).await;
    assert!(!send.is_finished());

    assert!(manager.evict(&id).await);

    let sent = timeout(Duration::from_secs(2), send)
        .await
        .expect("Send still pending after eviction")
        .unwrap();
    assert!(!sent);
    assert!(manager.connections().is_empty());
}

#[tokio::test]
async fn test_stop_interrupts_stalled_send() {
    let manager = preregistered("10.0.0.8", "access_controller");
    assert!(manager.start().await.unwrap());

    let (_client, server) = tokio::io::duplex(16);
    let (reader, writer) = tokio::io::split(server);
    manager.attach_stream(peer("10.0.0.8:4000"), reader, writer);

    let sender = manager.clone();
    let send = tokio::spawn(async move {
        sender.send_message("access_controller", &"G".repeat(200)).await
    });
    sleep(Duration::from_millis(50)).await;

    timeout(Duration::from_secs(2), manager.stop())
        .await
        .expect("Stop blocked by a stalled send");

    let sent = timeout(Duration::from_secs(2), send)
        .await
        .expect("Send still pending after stop")
        .unwrap();
    assert!(!sent);
}

#[tokio::test]
async fn test_concurrent_sends_write_whole_lines() {
    let manager = preregistered("10.0.0.5", "sort_controller");

    // A small pipe forces each send into several partial writes
    let (mut client, server) = tokio::io::duplex(8);
    let (reader, writer) = tokio::io::split(server);
    manager.attach_stream(peer("10.0.0.5:4000"), reader, writer);

    let commands: Vec<String> = (0..50).map(|i| format!("SCmove{:02}-{}", i, "x".repeat(i % 7))).collect();
    let expected_len: usize = commands.iter().map(|c| c.len() + 1).sum();

    let drain = tokio::spawn(async move {
        let mut wire = vec![0u8; expected_len];
        client.read_exact(&mut wire).await.map(|_| wire)
    });

    let sends: Vec<_> = commands
        .iter()
        .cloned()
        .map(|command| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_message("sort_controller", &command).await })
        })
        .collect();
    for send in sends {
        assert!(send.await.unwrap());
    }

    let wire = timeout(Duration::from_secs(5), drain).await.unwrap().unwrap().unwrap();
    let text = String::from_utf8(wire).unwrap();
    let mut received: Vec<&str> = text.lines().collect();
    let mut expected: Vec<&str> = commands.iter().map(String::as_str).collect();
    received.sort_unstable();
    expected.sort_unstable();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_reconnect_sends_to_earliest_connection() {
    let manager = preregistered("10.0.0.7", "access_controller");

    let (mut first, first_server) = tokio::io::duplex(64);
    let (r, w) = tokio::io::split(first_server);
    manager.attach_stream(peer("10.0.0.7:4001"), r, w);

    let (_second, second_server) = tokio::io::duplex(64);
    let (r, w) = tokio::io::split(second_server);
    manager.attach_stream(peer("10.0.0.7:4002"), r, w);

    for _ in 0..3 {
        assert!(manager.send_message("access_controller", "GCopen").await);
    }

    let mut buf = [0u8; 21];
    timeout(Duration::from_secs(2), first.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"GCopen\nGCopen\nGCopen\n");
}

#[tokio::test]
async fn test_replaced_connection_survives_old_reader() {
    let manager = ConnectionManager::new(Arc::new(Config::default()));

    let (old_client, _) = attach_duplex(&manager, "10.0.0.5:4000");
    let (mut new_client, id) = attach_duplex(&manager, "10.0.0.5:4000");

    // The stale reader sees end of stream after the replacement is in place
    drop(old_client);
    sleep(Duration::from_millis(50)).await;

    let connections = manager.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].id, id);

    new_client.write_all(b"SEir1\n").await.unwrap();
    wait_until(|| manager.is_device_connected("S")).await;
}
