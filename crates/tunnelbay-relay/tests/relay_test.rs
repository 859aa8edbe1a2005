//! End-to-end relay behaviour over in-memory pipes and loopback sockets

use rand::RngCore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tunnelbay_relay::{Relay, RelayConfig, RelayError};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tunnelbay_relay=debug")
        .with_test_writer()
        .try_init();
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Relay-side end and user-side end of a small in-memory pipe
fn pipe() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(4096)
}

async fn read_slowly(mut stream: DuplexStream, len: usize) -> (DuplexStream, Vec<u8>) {
    let mut received = Vec::with_capacity(len);
    let mut buf = [0u8; 3000];
    while received.len() < len {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "stream closed after {} bytes", received.len());
        received.extend_from_slice(&buf[..n]);
        tokio::time::sleep(Duration::from_micros(200)).await;
    }
    (stream, received)
}

#[tokio::test]
async fn test_bulk_transfer_with_slow_reader_is_byte_exact() {
    init_tracing();

    let relay = Relay::spawn(
        RelayConfig {
            chunk_size: 1024,
            ..RelayConfig::default()
        },
        None,
    );

    let (a_relay, a_user) = pipe();
    let (b_relay, b_user) = pipe();
    relay.add_pair(a_relay, b_relay).unwrap();

    const LEN: usize = 1024 * 1024;
    let a_to_b = random_payload(LEN);
    let b_to_a = random_payload(LEN);

    let (mut a_read, mut a_write) = tokio::io::split(a_user);
    let (b_read, mut b_write) = tokio::io::split(b_user);

    let a_sent = a_to_b.clone();
    let writer_a = tokio::spawn(async move {
        a_write.write_all(&a_sent).await.unwrap();
        a_write
    });
    let b_sent = b_to_a.clone();
    let writer_b = tokio::spawn(async move {
        b_write.write_all(&b_sent).await.unwrap();
        b_write
    });

    // b is the slow side
    let b_reader = tokio::spawn(async move {
        let mut b_read = b_read;
        let mut received = Vec::with_capacity(LEN);
        let mut buf = [0u8; 2048];
        while received.len() < LEN {
            let n = b_read.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
            tokio::time::sleep(Duration::from_micros(100)).await;
        }
        received
    });

    let mut at_a = vec![0u8; LEN];
    a_read.read_exact(&mut at_a).await.unwrap();
    let at_b = b_reader.await.unwrap();

    let _a_write = writer_a.await.unwrap();
    let _b_write = writer_b.await.unwrap();

    assert!(at_a == b_to_a, "data from b arrived corrupted");
    assert!(at_b == a_to_b, "data from a arrived corrupted");
    assert_eq!(relay.connection_count(), 2);

    relay.close();
    relay.closed().await;
    assert_eq!(relay.connection_count(), 0);
}

#[tokio::test]
async fn test_many_pairs_share_one_relay() {
    init_tracing();

    let relay = Relay::spawn(RelayConfig::default(), None);
    let mut users = Vec::new();
    for _ in 0..8 {
        let (a_relay, a_user) = pipe();
        let (b_relay, b_user) = pipe();
        relay.add_pair(a_relay, b_relay).unwrap();
        users.push((a_user, b_user));
    }

    let mut tasks = Vec::new();
    for (i, (mut a_user, b_user)) in users.into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            let payload = random_payload(20_000 + i * 1000);
            let expected = payload.clone();
            let reader = tokio::spawn(read_slowly(b_user, expected.len()));
            a_user.write_all(&payload).await.unwrap();
            let (b_user, received) = reader.await.unwrap();
            assert!(received == expected, "pair {} corrupted", i);
            (a_user, b_user)
        }));
    }

    let mut open_ends = Vec::new();
    for task in tasks {
        open_ends.push(task.await.unwrap());
    }
    assert_eq!(relay.connection_count(), 16);
    relay.close();
}

#[tokio::test]
async fn test_idle_relay_fires_callback_once() {
    init_tracing();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let relay = Relay::spawn(
        RelayConfig {
            idle_timeout: Duration::from_millis(150),
            ..RelayConfig::default()
        },
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );

    let (a_relay, mut a_user) = pipe();
    let (b_relay, mut b_user) = pipe();
    relay.add_pair(a_relay, b_relay).unwrap();

    tokio::time::timeout(Duration::from_secs(5), relay.closed())
        .await
        .expect("relay did not close when idle");

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(relay.is_closed());
    assert_eq!(relay.connection_count(), 0);

    let mut buf = [0u8; 4];
    assert_eq!(a_user.read(&mut buf).await.unwrap(), 0);
    assert_eq!(b_user.read(&mut buf).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_traffic_keeps_relay_alive() {
    init_tracing();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let relay = Relay::spawn(
        RelayConfig {
            idle_timeout: Duration::from_millis(300),
            ..RelayConfig::default()
        },
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );

    let (a_relay, mut a_user) = pipe();
    let (b_relay, mut b_user) = pipe();
    relay.add_pair(a_relay, b_relay).unwrap();

    let mut buf = [0u8; 4];
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        a_user.write_all(b"ping").await.unwrap();
        b_user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    assert!(!relay.is_closed());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    relay.close();
}

#[tokio::test]
async fn test_forced_close_skips_callback() {
    init_tracing();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let relay = Relay::spawn(
        RelayConfig {
            idle_timeout: Duration::from_millis(100),
            ..RelayConfig::default()
        },
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );

    let (a_relay, _a_user) = pipe();
    let (b_relay, _b_user) = pipe();
    relay.add_pair(a_relay, b_relay).unwrap();

    relay.close();
    relay.closed().await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    let (c, d) = pipe();
    assert!(matches!(relay.add_pair(c, d), Err(RelayError::Closed)));
}

#[tokio::test]
async fn test_closing_one_side_closes_the_other() {
    init_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut customer = TcpStream::connect(addr).await.unwrap();
    let (customer_side, _) = listener.accept().await.unwrap();
    let mut agent = TcpStream::connect(addr).await.unwrap();
    let (agent_side, _) = listener.accept().await.unwrap();

    let relay = Relay::spawn(RelayConfig::default(), None);
    relay.add_pair(customer_side, agent_side).unwrap();

    customer.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    agent.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    drop(customer);

    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), agent.read_to_end(&mut rest))
        .await
        .expect("peer was not closed")
        .unwrap();
    assert_eq!(n, 0);

    // The relay itself stays up for further pairs
    for _ in 0..50 {
        if relay.connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(relay.connection_count(), 0);
    assert!(!relay.is_closed());
    relay.close();
}

#[tokio::test]
async fn test_stalled_destination_stops_reads() {
    init_tracing();

    const CHUNK: usize = 1024;
    const PIPE: usize = 4096;
    let relay = Relay::spawn(
        RelayConfig {
            chunk_size: CHUNK,
            ..RelayConfig::default()
        },
        None,
    );

    let (a_relay, mut a_user) = tokio::io::duplex(PIPE);
    let (b_relay, mut b_user) = tokio::io::duplex(PIPE);
    relay.add_pair(a_relay, b_relay).unwrap();

    // Nobody reads b_user: the writer must block once every buffer is full
    let payload = random_payload(64 * 1024);
    let mut accepted = 0;
    while accepted < payload.len() {
        let end = (accepted + 512).min(payload.len());
        match tokio::time::timeout(Duration::from_millis(200), a_user.write(&payload[accepted..end]))
            .await
        {
            Ok(Ok(n)) => accepted += n,
            Ok(Err(e)) => panic!("write failed: {e}"),
            Err(_) => break,
        }
    }

    // Destination pipe, one pending chunk, source pipe
    assert!(accepted <= PIPE + CHUNK + PIPE, "accepted {accepted} bytes");
    assert!(accepted >= PIPE, "accepted only {accepted} bytes");

    let mut received = vec![0u8; accepted];
    b_user.read_exact(&mut received).await.unwrap();
    assert_eq!(received, payload[..accepted]);
}

#[tokio::test]
async fn test_emptied_after_last_pair_closes() {
    init_tracing();
    let relay = Relay::spawn(RelayConfig::default(), None);

    let (a_relay, a_user) = pipe();
    let (b_relay, _b_user) = pipe();
    relay.add_pair(a_relay, b_relay).unwrap();
    assert!(relay.same_relay(&relay.clone()));
    assert!(!relay.same_relay(&Relay::spawn(RelayConfig::default(), None)));

    drop(a_user);
    tokio::time::timeout(Duration::from_secs(5), relay.emptied())
        .await
        .unwrap();
    assert_eq!(relay.connection_count(), 0);
    assert!(!relay.is_closed());
}

#[tokio::test]
async fn test_idle_callback_sees_relay_closed() {
    init_tracing();
    let seen_closed = Arc::new(std::sync::Mutex::new(None));
    let slot = seen_closed.clone();
    let handle_slot: Arc<std::sync::Mutex<Option<tunnelbay_relay::RelayHandle>>> =
        Arc::new(std::sync::Mutex::new(None));
    let handle_for_callback = handle_slot.clone();

    let relay = Relay::spawn(
        RelayConfig {
            idle_timeout: Duration::from_millis(100),
            ..RelayConfig::default()
        },
        Some(Box::new(move || {
            let closed = handle_for_callback
                .lock()
                .unwrap()
                .as_ref()
                .map(|relay| relay.is_closed());
            *slot.lock().unwrap() = closed;
        })),
    );
    *handle_slot.lock().unwrap() = Some(relay.clone());

    tokio::time::timeout(Duration::from_secs(5), relay.closed())
        .await
        .unwrap();
    assert_eq!(*seen_closed.lock().unwrap(), Some(true));
}
