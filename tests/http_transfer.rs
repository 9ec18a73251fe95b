// MediaOffline - Offline content pipeline for mobile media clients
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! HTTP executor against a local mock server

mod common;

use httpmock::prelude::*;
use media_offline_core::download::transfer::ResumeState;
use media_offline_core::download::{
    AbortReason, AbortSignal, HttpTransfer, ProgressReporter, TransferExecutor, TransferOutcome,
    TransferRequest,
};
use media_offline_core::file::paths::resume_state_path;
use media_offline_core::{OfflineError, PipelineConfig};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn transfer() -> HttpTransfer {
    HttpTransfer::with_client(reqwest::Client::new(), 0)
}

fn request(url: String, destination: &Path) -> TransferRequest {
    let mut headers = HashMap::new();
    headers.insert("X-Emby-Token".to_string(), "secret".to_string());
    TransferRequest {
        url,
        headers,
        destination: destination.to_path_buf(),
    }
}

/// Read one request head; returned lowercased
async fn read_request(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    String::from_utf8_lossy(&head).to_lowercase()
}

async fn write_head(socket: &mut TcpStream, status: &str, length: usize, extra: &str) {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
        status, length, extra
    );
    socket.write_all(head.as_bytes()).await.unwrap();
}

#[tokio::test]
async fn test_full_download() {
    let server = MockServer::start_async().await;
    let body = common::payload(300_000);
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/Videos/v1/stream")
                .header("x-emby-token", "secret");
            then.status(200).body(&body);
        })
        .await;

    let temp_dir = tempfile::tempdir().unwrap();
    let destination = temp_dir.path().join("nested").join("v1.mp4");
    let (reporter, progress) = ProgressReporter::channel(Duration::ZERO);

    let outcome = transfer()
        .transfer(
            request(server.url("/Videos/v1/stream"), &destination),
            reporter,
            AbortSignal::never(),
        )
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(outcome, TransferOutcome::Completed { bytes_written: 300_000 });
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
    assert_eq!(*progress.borrow(), 300_000);
    assert!(!resume_state_path(&destination).exists());
}

#[tokio::test]
async fn test_resumes_with_range_request() {
    let server = MockServer::start_async().await;
    let body = common::payload(10_000_000);
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/Videos/v2/stream")
                .header("range", "bytes=3000000-");
            then.status(206)
                .header("content-range", "bytes 3000000-9999999/10000000")
                .body(&body[3_000_000..]);
        })
        .await;

    let temp_dir = tempfile::tempdir().unwrap();
    let destination = temp_dir.path().join("v2.mp4");
    tokio::fs::write(&destination, &body[..3_000_000]).await.unwrap();
    let (reporter, progress) = ProgressReporter::channel(Duration::from_millis(10));

    let outcome = transfer()
        .transfer(
            request(server.url("/Videos/v2/stream"), &destination),
            reporter,
            AbortSignal::never(),
        )
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(outcome, TransferOutcome::Completed { bytes_written: 10_000_000 });
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
    assert_eq!(*progress.borrow(), 10_000_000);
    assert!(!resume_state_path(&destination).exists());
}

#[tokio::test]
async fn test_ignored_range_restarts_from_zero() {
    let server = MockServer::start_async().await;
    let body = common::payload(64_000);
    server
        .mock_async(|when, then| {
            when.method(GET).path("/Audio/a1/universal");
            then.status(200).body(&body);
        })
        .await;

    let temp_dir = tempfile::tempdir().unwrap();
    let destination = temp_dir.path().join("a1.mp3");
    tokio::fs::write(&destination, vec![0xAAu8; 10_000]).await.unwrap();
    let (reporter, _progress) = ProgressReporter::channel(Duration::ZERO);

    let outcome = transfer()
        .transfer(
            request(server.url("/Audio/a1/universal"), &destination),
            reporter,
            AbortSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, TransferOutcome::Completed { bytes_written: 64_000 });
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
}

#[tokio::test]
async fn test_unsatisfiable_range_on_complete_file_finishes() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/Items/b1/Download");
            then.status(416);
        })
        .await;

    let temp_dir = tempfile::tempdir().unwrap();
    let destination = temp_dir.path().join("b1.epub");
    tokio::fs::write(&destination, common::payload(5_000)).await.unwrap();

    let url = server.url("/Items/b1/Download");
    let mut state = ResumeState::new(&url);
    state.content_length = Some(5_000);
    state.save(&destination).await.unwrap();

    let (reporter, _progress) = ProgressReporter::channel(Duration::ZERO);
    let outcome = transfer()
        .transfer(request(url, &destination), reporter, AbortSignal::never())
        .await
        .unwrap();

    assert_eq!(outcome, TransferOutcome::Completed { bytes_written: 5_000 });
    assert!(!resume_state_path(&destination).exists());
}

#[tokio::test]
async fn test_http_error_status_fails_transfer() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/Items/missing/Download");
            then.status(404);
        })
        .await;

    let temp_dir = tempfile::tempdir().unwrap();
    let destination = temp_dir.path().join("missing.epub");
    let (reporter, _progress) = ProgressReporter::channel(Duration::ZERO);

    let err = transfer()
        .transfer(
            request(server.url("/Items/missing/Download?api_key=secret"), &destination),
            reporter,
            AbortSignal::never(),
        )
        .await
        .unwrap_err();

    match err {
        OfflineError::TransferFailed { status, url } => {
            assert_eq!(status, 404);
            assert!(!url.contains("secret"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!destination.exists());
}

#[tokio::test]
async fn test_abort_before_request() {
    let temp_dir = tempfile::tempdir().unwrap();
    let destination = temp_dir.path().join("never.mp4");
    let (handle, signal) = AbortSignal::new();
    handle.abort(AbortReason::Pause);

    let (reporter, _progress) = ProgressReporter::channel(Duration::ZERO);
    let outcome = transfer()
        .transfer(
            request("http://127.0.0.1:9/never".to_string(), &destination),
            reporter,
            signal,
        )
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TransferOutcome::Aborted {
            bytes_written: 0,
            reason: AbortReason::Pause,
        }
    );
}

#[tokio::test]
async fn test_slow_steady_body_outlives_idle_window() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/Videos/slow/stream", listener.local_addr().unwrap());
    let body = common::payload(30);
    let served = body.clone();

    // One byte every 100 ms: three seconds in total, never silent for one
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        write_head(&mut socket, "200 OK", served.len(), "").await;
        for byte in &served {
            tokio::time::sleep(Duration::from_millis(100)).await;
            socket.write_all(&[*byte]).await.unwrap();
        }
    });

    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = PipelineConfig::for_root(temp_dir.path());
    config.idle_timeout_secs = 1;
    config.max_retries = 0;
    let destination = temp_dir.path().join("slow.mp4");
    let (reporter, _progress) = ProgressReporter::channel(Duration::ZERO);

    let outcome = HttpTransfer::new(&config)
        .unwrap()
        .transfer(request(url, &destination), reporter, AbortSignal::never())
        .await
        .unwrap();

    assert_eq!(outcome, TransferOutcome::Completed { bytes_written: 30 });
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
}

#[tokio::test]
async fn test_stalled_body_is_a_transient_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/Videos/stall/stream", listener.local_addr().unwrap());
    let body = common::payload(20);

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        write_head(&mut socket, "200 OK", body.len(), "").await;
        socket.write_all(&body[..8]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let temp_dir = tempfile::tempdir().unwrap();
    let destination = temp_dir.path().join("stall.mp4");
    let (reporter, _progress) = ProgressReporter::channel(Duration::ZERO);

    let err = transfer()
        .with_idle_timeout(Duration::from_millis(200))
        .transfer(request(url, &destination), reporter, AbortSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, OfflineError::NetworkError { is_transient: true, .. }));
    assert!(err.is_retryable());
    assert_eq!(tokio::fs::read(&destination).await.unwrap().len(), 8);
    assert_eq!(
        ResumeState::load(&destination).await.unwrap().content_length,
        Some(20)
    );
}

#[tokio::test]
async fn test_stalled_body_resumes_on_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/Videos/retry/stream", listener.local_addr().unwrap());
    let body = common::payload(20);
    let served = body.clone();

    tokio::spawn(async move {
        // First connection goes quiet after 8 bytes and stays open
        let (mut first, _) = listener.accept().await.unwrap();
        read_request(&mut first).await;
        write_head(&mut first, "200 OK", served.len(), "").await;
        first.write_all(&served[..8]).await.unwrap();

        let (mut second, _) = listener.accept().await.unwrap();
        let head = read_request(&mut second).await;
        if head.contains("range: bytes=8-") {
            write_head(&mut second, "206 Partial Content", 12, "Content-Range: bytes 8-19/20\r\n")
                .await;
            second.write_all(&served[8..]).await.unwrap();
        } else {
            write_head(&mut second, "400 Bad Request", 0, "").await;
        }
        drop(first);
    });

    let temp_dir = tempfile::tempdir().unwrap();
    let destination = temp_dir.path().join("retry.mp4");
    let (reporter, _progress) = ProgressReporter::channel(Duration::ZERO);

    let outcome = HttpTransfer::with_client(reqwest::Client::new(), 1)
        .with_retry_delay(Duration::from_millis(10))
        .with_idle_timeout(Duration::from_millis(200))
        .transfer(request(url, &destination), reporter, AbortSignal::never())
        .await
        .unwrap();

    assert_eq!(outcome, TransferOutcome::Completed { bytes_written: 20 });
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
    assert!(!resume_state_path(&destination).exists());
}
