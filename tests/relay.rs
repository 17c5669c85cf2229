use std::net::SocketAddr;
use std::time::Duration;

use relay_server::server::registry::ClientRegistry;
use relay_server::{Logger, RelayServer, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const OVERFLOW: &[u8] = b"connections is too much, please waiting...\n";

struct Running {
    addr: SocketAddr,
    registry: ClientRegistry,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

fn test_config(max_connections: usize) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        max_connections,
        mirror_to_stdout: false,
        enable_operator_console: false,
        ..ServerConfig::default()
    }
}

async fn start(config: ServerConfig) -> Running {
    let server = RelayServer::bind(config, Logger).await.expect("bind loopback");
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    let shutdown = server.shutdown_sender();
    let task = tokio::spawn(server.serve());
    Running {
        addr,
        registry,
        shutdown,
        task,
    }
}

async fn wait_for_size(registry: &ClientRegistry, n: usize) {
    timeout(Duration::from_secs(3), async {
        while registry.size().await != n {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("registry never reached size {}", n));
}

async fn connect(running: &Running, expected_size: usize) -> TcpStream {
    let stream = TcpStream::connect(running.addr).await.unwrap();
    wait_for_size(&running.registry, expected_size).await;
    stream
}

async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(Duration::from_secs(3), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for data")
        .unwrap();
    buf
}

async fn assert_silent(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let res = timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
    assert!(res.is_err(), "expected no data, got {:?}", res);
}

#[tokio::test]
async fn two_peer_scenario() {
    let running = start(test_config(10)).await;
    let mut a = connect(&running, 1).await;
    let mut b = connect(&running, 2).await;

    a.write_all(b"hello\n").await.unwrap();
    assert_eq!(read_n(&mut b, 6).await, b"hello\n");
    // The sender gets its own message back
    assert_eq!(read_n(&mut a, 6).await, b"hello\n");

    b.write_all(b"bye\n").await.unwrap();
    wait_for_size(&running.registry, 1).await;
    assert_silent(&mut a).await;

    // B's connection is closed by the server
    let mut rest = Vec::new();
    timeout(Duration::from_secs(3), b.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());

    drop(a);
    wait_for_size(&running.registry, 0).await;
}

#[tokio::test]
async fn reset_peer_is_removed_and_others_keep_talking() {
    let running = start(test_config(10)).await;
    let a = connect(&running, 1).await;
    let mut b = connect(&running, 2).await;

    // Zero linger turns the close into an RST instead of a FIN
    a.set_linger(Some(Duration::ZERO)).unwrap();
    drop(a);
    wait_for_size(&running.registry, 1).await;

    b.write_all(b"after\n").await.unwrap();
    assert_eq!(read_n(&mut b, 6).await, b"after\n");
}

#[tokio::test]
async fn fan_out_reaches_every_peer() {
    let running = start(test_config(10)).await;
    let mut peers = Vec::new();
    for i in 1..=4 {
        peers.push(connect(&running, i).await);
    }

    peers[0].write_all(b"fan-out\n").await.unwrap();
    for peer in peers.iter_mut() {
        assert_eq!(read_n(peer, 8).await, b"fan-out\n");
    }
}

#[tokio::test]
async fn peer_beyond_capacity_gets_the_overflow_notice() {
    let running = start(test_config(2)).await;
    let mut a = connect(&running, 1).await;
    let _b = connect(&running, 2).await;

    let mut c = TcpStream::connect(running.addr).await.unwrap();
    let mut notice = Vec::new();
    timeout(Duration::from_secs(3), c.read_to_end(&mut notice))
        .await
        .expect("rejected peer should be closed")
        .unwrap();

    assert_eq!(notice, OVERFLOW);
    assert_eq!(running.registry.size().await, 2);

    // The rejected peer never shows up in a fan-out
    a.write_all(b"still two\n").await.unwrap();
    assert_eq!(read_n(&mut a, 10).await, b"still two\n");
    assert_eq!(running.registry.snapshot().await.len(), 2);
}

#[tokio::test]
async fn concurrent_connects_never_exceed_capacity() {
    let running = start(test_config(3)).await;

    let mut connects = Vec::new();
    for _ in 0..8 {
        let addr = running.addr;
        connects.push(tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() }));
    }
    let mut streams = Vec::new();
    for c in connects {
        streams.push(c.await.unwrap());
    }

    wait_for_size(&running.registry, 3).await;

    let mut rejected = 0;
    for s in streams.iter_mut() {
        let mut got = Vec::new();
        if let Ok(res) = timeout(Duration::from_millis(500), s.read_to_end(&mut got)).await {
            res.unwrap();
            assert_eq!(got, OVERFLOW);
            rejected += 1;
        }
    }

    assert_eq!(rejected, 5);
    assert_eq!(running.registry.size().await, 3);
}

#[tokio::test]
async fn messages_from_one_peer_stay_in_order() {
    let running = start(test_config(10)).await;
    let mut a = connect(&running, 1).await;
    let mut b = connect(&running, 2).await;

    a.write_all(b"m1\n").await.unwrap();
    a.write_all(b"m2\n").await.unwrap();
    a.write_all(b"m3\n").await.unwrap();

    assert_eq!(read_n(&mut b, 9).await, b"m1\nm2\nm3\n");
}

#[tokio::test]
async fn stalled_peer_does_not_block_the_others() {
    let config = ServerConfig {
        echo_to_sender: false,
        send_timeout_ms: 200,
        outbound_queue_capacity: 1024,
        ..test_config(10)
    };
    let running = start(config).await;
    let mut sender = connect(&running, 1).await;
    let mut reader = connect(&running, 2).await;
    // Connected, but never reads a byte
    let _stalled = connect(&running, 3).await;

    const CHUNK: usize = 1000;
    const COUNT: usize = 512;
    let total = CHUNK * COUNT;

    let collector = tokio::spawn(async move {
        let mut got = 0;
        let mut buf = vec![0u8; 8192];
        while got < total {
            let n = reader.read(&mut buf).await.unwrap();
            assert!(n > 0, "reader was disconnected");
            got += n;
        }
        got
    });

    let payload = vec![b'x'; CHUNK];
    for _ in 0..COUNT {
        sender.write_all(&payload).await.unwrap();
    }

    let got = timeout(Duration::from_secs(10), collector)
        .await
        .expect("responsive peer was held up")
        .unwrap();
    assert_eq!(got, total);
}

#[tokio::test]
async fn bye_inside_a_larger_chunk_is_relayed() {
    let running = start(test_config(10)).await;
    let mut a = connect(&running, 1).await;
    let mut b = connect(&running, 2).await;

    a.write_all(b"bye\nnot really\n").await.unwrap();
    assert_eq!(read_n(&mut b, 15).await, b"bye\nnot really\n");
    assert_eq!(running.registry.size().await, 2);
}

#[tokio::test]
async fn shutdown_closes_everyone() {
    let running = start(test_config(10)).await;
    let mut a = connect(&running, 1).await;
    let mut b = connect(&running, 2).await;

    running.shutdown.send(()).unwrap();
    timeout(Duration::from_secs(3), running.task)
        .await
        .expect("accept loop should stop")
        .unwrap();

    for peer in [&mut a, &mut b] {
        let mut rest = Vec::new();
        timeout(Duration::from_secs(3), peer.read_to_end(&mut rest))
            .await
            .expect("peer should see EOF")
            .unwrap();
    }
    assert_eq!(running.registry.size().await, 0);
}
