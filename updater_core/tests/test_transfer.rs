//! End-to-end tests for the TCP transfer session and receiver.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use updater_core::transfer::protocol::{encode_record, write_frame, write_sentinel};
use updater_core::{AppEvent, ProtocolConfig, TransferReceiver, send_folder};

fn test_cfg() -> ProtocolConfig {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .try_init()
        .ok();

    ProtocolConfig {
        tcp_port: 0,
        connect_grace: Duration::from_millis(10),
        inter_file_delay: Duration::from_millis(1),
        ..ProtocolConfig::default()
    }
}

fn events_channel() -> (mpsc::Sender<AppEvent>, mpsc::Receiver<AppEvent>) {
    mpsc::channel(1024)
}

/// Wait for the receiver side to report a completed stream.
async fn wait_for_completion(rx: &mut mpsc::Receiver<AppEvent>) -> usize {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            if let AppEvent::TransferCompleted { files_sent, .. } = event {
                return files_sent;
            }
        }
        panic!("receiver event channel closed before completion");
    })
    .await
    .expect("receiver did not complete in time")
}

#[tokio::test]
async fn test_session_reproduces_folder() {
    let src = tempfile::tempdir().expect("tempdir");
    fs::write(src.path().join("a.txt"), b"12345").expect("write");
    fs::create_dir_all(src.path().join("b")).expect("mkdir");
    fs::write(src.path().join("b/c.txt"), b"0123456789").expect("write");

    let dest = tempfile::tempdir().expect("tempdir");
    let cfg = test_cfg();
    let receiver = TransferReceiver::bind(&cfg, dest.path()).await.expect("bind");
    let addr = receiver.local_addr().expect("local addr");

    let cancel = CancellationToken::new();
    let (recv_tx, mut recv_rx) = events_channel();
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = receiver.run(recv_tx, run_cancel).await;
    });

    let (send_tx, mut send_rx) = events_channel();
    let outcome = send_folder(&cfg, addr, src.path(), send_tx)
        .await
        .expect("session");

    assert_eq!(outcome.total_files, 2);
    assert_eq!(outcome.files_sent, 2);
    assert_eq!(outcome.files_failed, 0);

    assert_eq!(wait_for_completion(&mut recv_rx).await, 2);
    assert_eq!(fs::read(dest.path().join("a.txt")).expect("a.txt"), b"12345");
    assert_eq!(
        fs::read(dest.path().join("b/c.txt")).expect("b/c.txt"),
        b"0123456789"
    );

    // One progress tick per file, in enumeration order
    let mut progress = Vec::new();
    while let Ok(event) = send_rx.try_recv() {
        if let AppEvent::TransferProgress { file_name, .. } = event {
            progress.push(file_name);
        }
    }
    assert_eq!(progress, vec!["a.txt".to_string(), "b/c.txt".to_string()]);

    cancel.cancel();
}

#[tokio::test]
async fn test_session_byte_count_matches_frames() {
    let src = tempfile::tempdir().expect("tempdir");
    fs::write(src.path().join("a.txt"), b"12345").expect("write");
    fs::create_dir_all(src.path().join("b")).expect("mkdir");
    fs::write(src.path().join("b/c.txt"), b"0123456789").expect("write");

    // Raw byte sink instead of a real receiver
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let sink = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.expect("read");
        buf
    });

    let (send_tx, _send_rx) = events_channel();
    let outcome = send_folder(&test_cfg(), addr, src.path(), send_tx)
        .await
        .expect("session");

    let wire = sink.await.expect("sink");
    let s1 = 1 + 4 + "a.txt".len() + 8 + 5;
    let s2 = 1 + 4 + "b/c.txt".len() + 8 + 10;
    let expected = (4 + s1) + (4 + s2) + 3;

    assert_eq!(wire.len(), expected);
    assert_eq!(outcome.bytes_sent, expected as u64);
    assert_eq!(&wire[wire.len() - 3..], b"EOF");
}

#[tokio::test]
async fn test_empty_folder_sends_only_sentinel() {
    let src = tempfile::tempdir().expect("tempdir");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let sink = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.expect("read");
        buf
    });

    let (send_tx, _send_rx) = events_channel();
    let outcome = send_folder(&test_cfg(), addr, src.path(), send_tx)
        .await
        .expect("session");

    assert_eq!(outcome.total_files, 0);
    assert_eq!(outcome.files_sent, 0);
    assert_eq!(sink.await.expect("sink"), b"EOF");
}

#[tokio::test]
async fn test_connect_failure_is_fatal() {
    // Reserve a TCP port with no listener on it
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("local addr").port()
    };
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

    let src = tempfile::tempdir().expect("tempdir");
    fs::write(src.path().join("a.txt"), b"data").expect("write");

    let (send_tx, mut send_rx) = events_channel();
    let result = send_folder(&test_cfg(), addr, src.path(), send_tx).await;
    assert!(result.is_err(), "connect refusal must fail the session");

    // No frame was attempted
    while let Ok(event) = send_rx.try_recv() {
        assert!(
            !matches!(event, AppEvent::TransferProgress { .. }),
            "no progress should be reported for a failed connect"
        );
    }
}

#[tokio::test]
async fn test_receiver_orders_duplicates_and_rejects_traversal() {
    let dest = tempfile::tempdir().expect("tempdir");
    let cfg = test_cfg();
    let receiver = TransferReceiver::bind(&cfg, dest.path()).await.expect("bind");
    let addr = receiver.local_addr().expect("local addr");

    let cancel = CancellationToken::new();
    let (recv_tx, mut recv_rx) = events_channel();
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = receiver.run(recv_tx, run_cancel).await;
    });

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    write_frame(&mut stream, &encode_record("dup.txt", b"first"))
        .await
        .expect("frame");
    write_frame(&mut stream, &encode_record("../escape.txt", b"evil"))
        .await
        .expect("frame");
    write_frame(&mut stream, &encode_record("dup.txt", b"second"))
        .await
        .expect("frame");
    write_sentinel(&mut stream).await.expect("sentinel");
    drop(stream);

    // dup.txt written twice, the traversal record skipped
    assert_eq!(wait_for_completion(&mut recv_rx).await, 2);
    assert_eq!(fs::read(dest.path().join("dup.txt")).expect("dup"), b"second");
    assert!(!dest.path().join("escape.txt").exists());
    assert!(
        !dest.path().parent().expect("parent").join("escape.txt").exists(),
        "traversal record must not escape the destination"
    );

    cancel.cancel();
}

#[tokio::test]
async fn test_receiver_survives_malformed_stream() {
    let dest = tempfile::tempdir().expect("tempdir");
    let cfg = test_cfg();
    let receiver = TransferReceiver::bind(&cfg, dest.path()).await.expect("bind");
    let addr = receiver.local_addr().expect("local addr");

    let cancel = CancellationToken::new();
    let (recv_tx, mut recv_rx) = events_channel();
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = receiver.run(recv_tx, run_cancel).await;
    });

    // A connection that dies mid-frame does not kill the listener
    {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        use tokio::io::AsyncWriteExt;
        stream
            .write_all(&1000u32.to_be_bytes())
            .await
            .expect("partial header");
        drop(stream);
    }

    // A well-formed stream afterwards still lands
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    write_frame(&mut stream, &encode_record("ok.txt", b"fine"))
        .await
        .expect("frame");
    write_sentinel(&mut stream).await.expect("sentinel");
    drop(stream);

    assert_eq!(wait_for_completion(&mut recv_rx).await, 1);
    assert_eq!(fs::read(dest.path().join("ok.txt")).expect("ok"), b"fine");

    cancel.cancel();
}
