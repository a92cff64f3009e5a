//! Sessions over a real Unix domain socket
#![cfg(unix)]

use speak_stream::protocol::{encode_chunk, encode_end};
use speak_stream::{
    BufferThresholds, MockSink, SpeakError, StreamSession, StreamState, StreamingConfig,
    SynthesisRequest,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

fn config_for(path: &std::path::Path) -> StreamingConfig {
    StreamingConfig::default()
        .with_socket_path(path)
        .with_buffer_duration(2.0)
        .with_thresholds(BufferThresholds::new(0.1, 0.02, 0.05))
        .with_block_size(480)
        .with_write_retry_delay(1)
}

fn fast_sink() -> MockSink {
    MockSink::new().with_speed(20.0).with_latency(Duration::from_millis(2))
}

#[tokio::test]
async fn test_stream_over_unix_socket() {
    let dir = tempfile::tempdir().expect("Should create temp dir");
    let path = dir.path().join("speak.sock");
    let listener = UnixListener::bind(&path).expect("Should bind socket");

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("Should accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut line = String::new();
        BufReader::new(read_half)
            .read_line(&mut line)
            .await
            .expect("Should read request");

        for id in 0..3u32 {
            let frame = encode_chunk(id, 24_000, &[0.25; 3000]).expect("Should encode");
            write_half.write_all(&frame).await.expect("Should write chunk");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        write_half.write_all(&encode_end(3)).await.expect("Should write end");
        line
    });

    let sink = fast_sink();
    let handle = sink.handle();
    let session = StreamSession::new(config_for(&path), Box::new(sink)).expect("Valid config");
    let request = SynthesisRequest::new("Over the socket").with_speed(1.1);

    let result = tokio::time::timeout(Duration::from_secs(10), session.run(&request))
        .await
        .expect("Session should not hang");

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert_eq!(result.total_chunks, 3);
    assert_eq!(result.total_samples, 9000);
    assert_eq!(handle.audible_samples().len(), 9000);

    let line = server.await.expect("Server task");
    let request: serde_json::Value = serde_json::from_str(line.trim_end()).expect("Valid JSON");
    assert_eq!(request["params"]["text"], "Over the socket");
    assert!(request["params"]["speed"].as_f64().is_some());
}

#[tokio::test]
async fn test_missing_socket_is_connection_error() {
    let dir = tempfile::tempdir().expect("Should create temp dir");
    let path = dir.path().join("nobody-listening.sock");

    let sink = fast_sink();
    let handle = sink.handle();
    let session = StreamSession::new(config_for(&path), Box::new(sink)).expect("Valid config");

    let result = session.run(&SynthesisRequest::new("Hello")).await;

    assert!(!result.success);
    assert_eq!(result.final_state, StreamState::Error);
    assert!(matches!(result.error, Some(SpeakError::ConnectionError { .. })));
    assert!(!handle.was_opened());
}

#[tokio::test]
async fn test_empty_text_is_rejected_before_connecting() {
    let dir = tempfile::tempdir().expect("Should create temp dir");
    let path = dir.path().join("speak.sock");
    let listener = UnixListener::bind(&path).expect("Should bind socket");

    let session = StreamSession::new(config_for(&path), Box::new(fast_sink())).expect("Valid config");
    let result = session.run(&SynthesisRequest::new("")).await;

    assert!(matches!(result.error, Some(SpeakError::InvalidInput { .. })));
    assert_eq!(result.final_state, StreamState::Error);

    let accepted = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
    assert!(accepted.is_err(), "No connection should have been made");
}
