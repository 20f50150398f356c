//! Integration tests for the download engine.
//!
//! These drive the registry against a mock HTTP server: metadata probing,
//! redirect budgets, streaming transfers, byte-range resume, and the state
//! machine around pause/cancel/duplicate starts.

use std::path::PathBuf;
use std::time::Duration;

use downdraft_core::{DownloadRegistry, EngineError};
use downdraft_types::{DownloadState, EngineEvent};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Deterministic body pattern; a prime modulus makes offset bugs visible.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn registry(dir: &TempDir) -> DownloadRegistry {
    DownloadRegistry::new(dir.path().join("data"))
        .await
        .expect("registry should open")
}

async fn wait_for_terminal(
    reg: &DownloadRegistry,
    id: &str,
) -> downdraft_types::DownloadRecord {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let record = reg.status(id).await.expect("record should exist");
            if record.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("download did not reach a terminal state")
}

/// Mount a redirect chain of `redirects` hops ending in a 200 with `body`.
async fn mount_redirect_chain(server: &MockServer, redirects: usize, body: Vec<u8>) {
    for i in 0..redirects {
        Mock::given(path(format!("/hop{i}")))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", format!("/hop{}", i + 1)),
            )
            .mount(server)
            .await;
    }
    Mock::given(path(format!("/hop{redirects}")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(body),
        )
        .mount(server)
        .await;
}

// ==================== Metadata ====================

#[tokio::test]
async fn metadata_reflects_range_and_length_headers() {
    let server = MockServer::start().await;
    Mock::given(path("/files/report"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .insert_header("content-disposition", "attachment; filename=\"report.pdf\"")
                .set_body_bytes(vec![0u8; 2048]),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let reg = registry(&dir).await;

    let meta = reg
        .fetch_metadata(&format!("{}/files/report", server.uri()))
        .await
        .unwrap();

    assert_eq!(meta.file_name, "report.pdf");
    assert_eq!(meta.file_extension, ".pdf");
    assert_eq!(meta.file_size, 2048);
    assert!(meta.supports_resume);
}

#[tokio::test]
async fn metadata_without_range_support_is_not_resumable() {
    let server = MockServer::start().await;
    Mock::given(path("/files/clip.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 512]))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let reg = registry(&dir).await;

    let meta = reg
        .fetch_metadata(&format!("{}/files/clip.mp4", server.uri()))
        .await
        .unwrap();

    assert_eq!(meta.file_name, "clip.mp4");
    assert_eq!(meta.file_extension, ".mp4");
    assert!(!meta.supports_resume);
}

// ==================== Redirects ====================

#[tokio::test]
async fn five_redirects_resolve_six_fail() {
    let server = MockServer::start().await;
    mount_redirect_chain(&server, 5, vec![1u8; 64]).await;

    let dir = TempDir::new().unwrap();
    let reg = registry(&dir).await;

    let meta = reg
        .fetch_metadata(&format!("{}/hop0", server.uri()))
        .await
        .unwrap();
    assert_eq!(meta.file_size, 64);

    let long = MockServer::start().await;
    mount_redirect_chain(&long, 6, vec![1u8; 64]).await;

    let err = reg
        .fetch_metadata(&format!("{}/hop0", long.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TooManyRedirects));
}

#[tokio::test]
async fn redirect_chain_is_followed_during_transfer() {
    let server = MockServer::start().await;
    let body = pattern(4096);
    mount_redirect_chain(&server, 3, body.clone()).await;

    let dir = TempDir::new().unwrap();
    let reg = registry(&dir).await;
    let dest = dir.path().join("hop.bin");

    reg.start("dl-hop", &format!("{}/hop0", server.uri()), dest.clone(), false)
        .await
        .unwrap();

    let record = wait_for_terminal(&reg, "dl-hop").await;
    assert_eq!(record.state, DownloadState::Completed);
    assert_eq!(
        record.final_url.as_deref(),
        Some(format!("{}/hop3", server.uri()).as_str())
    );
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
}

#[tokio::test]
async fn redirect_loop_fails_the_attempt() {
    let server = MockServer::start().await;
    mount_redirect_chain(&server, 6, vec![1u8; 64]).await;

    let dir = TempDir::new().unwrap();
    let reg = registry(&dir).await;

    reg.start(
        "dl-loop",
        &format!("{}/hop0", server.uri()),
        dir.path().join("loop.bin"),
        false,
    )
    .await
    .unwrap();

    let record = wait_for_terminal(&reg, "dl-loop").await;
    assert_eq!(record.state, DownloadState::Error);
    assert!(record.error.unwrap().to_lowercase().contains("redirect"));
}

// ==================== Transfers ====================

#[tokio::test]
async fn download_streams_to_disk_and_completes() {
    let server = MockServer::start().await;
    let body = pattern(100_000);
    Mock::given(path("/data.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(body.clone()),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let reg = registry(&dir).await;
    let dest = dir.path().join("data.bin");

    let mut events = reg.subscribe();
    reg.start("dl-1", &format!("{}/data.bin", server.uri()), dest.clone(), false)
        .await
        .unwrap();

    let record = wait_for_terminal(&reg, "dl-1").await;
    assert_eq!(record.state, DownloadState::Completed);
    assert_eq!(record.total_bytes, 100_000);
    assert_eq!(record.bytes_downloaded, 100_000);
    assert_eq!(record.speed, 0);
    assert!(record.error.is_none());
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);

    // Progress is non-decreasing in bytes for the whole attempt.
    let mut last = 0u64;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::Progress { id, record } = event {
            assert_eq!(id, "dl-1");
            assert!(record.bytes_downloaded >= last);
            last = record.bytes_downloaded;
        }
    }
}

#[tokio::test]
async fn http_error_status_is_captured_into_the_record() {
    let server = MockServer::start().await;
    Mock::given(path("/missing.bin"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let reg = registry(&dir).await;

    reg.start(
        "dl-err",
        &format!("{}/missing.bin", server.uri()),
        dir.path().join("missing.bin"),
        false,
    )
    .await
    .unwrap();

    let record = wait_for_terminal(&reg, "dl-err").await;
    assert_eq!(record.state, DownloadState::Error);
    assert!(record.error.unwrap().contains("500"));
}

#[tokio::test]
async fn duplicate_start_fails_and_leaves_the_first_alone() {
    let server = MockServer::start().await;
    let body = pattern(10_000);
    Mock::given(method("GET"))
        .and(path("/slow.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body.clone())
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let reg = registry(&dir).await;
    let url = format!("{}/slow.bin", server.uri());
    let dest = dir.path().join("slow.bin");

    reg.start("dl-dup", &url, dest.clone(), false).await.unwrap();

    let err = reg
        .start("dl-dup", &url, dir.path().join("other.bin"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateId(_)));

    // The original attempt is unaffected and still finishes.
    let record = wait_for_terminal(&reg, "dl-dup").await;
    assert_eq!(record.state, DownloadState::Completed);
    assert_eq!(record.destination_path, dest);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
}

// ==================== Pause / Resume ====================

#[tokio::test]
async fn pause_midflight_then_resume_completes_cleanly() {
    let server = MockServer::start().await;
    let body = pattern(20_000);
    Mock::given(method("GET"))
        .and(path("/pausable.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body.clone())
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let reg = registry(&dir).await;
    let dest = dir.path().join("pausable.bin");
    let url = format!("{}/pausable.bin", server.uri());

    reg.start("dl-p", &url, dest.clone(), false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let paused = reg.pause("dl-p").await.unwrap();
    assert_eq!(paused.state, DownloadState::Paused);
    assert!(!reg.is_active("dl-p").await);

    // The torn-down transfer must not flip the record to error.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let record = reg.status("dl-p").await.unwrap();
    assert_eq!(record.state, DownloadState::Paused);
    assert!(record.error.is_none());

    // Pausing a paused record is an invalid transition.
    let err = reg.pause("dl-p").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));

    reg.resume("dl-p").await.unwrap();
    let record = wait_for_terminal(&reg, "dl-p").await;
    assert_eq!(record.state, DownloadState::Completed);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
}

/// Serves a full body, or the requested open-ended suffix for ranged GETs.
struct RangeResponder(Vec<u8>);

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.strip_suffix('-'))
            .and_then(|v| v.parse::<usize>().ok());

        match range {
            Some(start) if start < self.0.len() => ResponseTemplate::new(206)
                .insert_header("accept-ranges", "bytes")
                .insert_header(
                    "content-range",
                    format!("bytes {}-{}/{}", start, self.0.len() - 1, self.0.len()),
                )
                .set_body_bytes(self.0[start..].to_vec()),
            _ => ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(self.0.clone()),
        }
    }
}

#[tokio::test]
async fn resume_requests_the_remaining_range_and_yields_identical_bytes() {
    let server = MockServer::start().await;
    let body = pattern(1_000_000);
    Mock::given(path("/large.bin"))
        .respond_with(RangeResponder(body.clone()))
        .mount(&server)
        .await;

    let data_dir = TempDir::new().unwrap();
    let data_path = data_dir.path().join("data");
    tokio::fs::create_dir_all(&data_path).await.unwrap();
    let dest = data_dir.path().join("large.bin");

    // A prior run got to 400,000 bytes and crashed mid-transfer: the
    // snapshot still says "downloading" and the partial file is on disk.
    tokio::fs::write(&dest, &body[..400_000]).await.unwrap();
    let snapshot = serde_json::json!([{
        "id": "dl-big",
        "url": format!("{}/large.bin", server.uri()),
        "destinationPath": dest,
        "startTime": "2026-01-01T00:00:00Z",
        "bytesDownloaded": 400_000u64,
        "totalBytes": 1_000_000u64,
        "state": "downloading",
        "error": null,
        "speed": 0,
        "eta": null,
        "supportsResume": true
    }]);
    tokio::fs::write(
        data_path.join("downloads.json"),
        serde_json::to_vec_pretty(&snapshot).unwrap(),
    )
    .await
    .unwrap();

    let reg = DownloadRegistry::new(data_path).await.unwrap();

    // Crash recovery: the record loads demoted to paused.
    let record = reg.status("dl-big").await.unwrap();
    assert_eq!(record.state, DownloadState::Paused);

    let resumed = reg.resume("dl-big").await.unwrap();
    assert_eq!(resumed.bytes_downloaded, 400_000);

    let record = wait_for_terminal(&reg, "dl-big").await;
    assert_eq!(record.state, DownloadState::Completed);
    assert_eq!(record.total_bytes, 1_000_000);
    assert_eq!(record.bytes_downloaded, 1_000_000);

    // Byte-identical to an uninterrupted download of the same resource.
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);

    // Exactly one ranged request from the pause point was made.
    let requests = server.received_requests().await.unwrap();
    let ranged: Vec<_> = requests
        .iter()
        .filter(|r| r.method.as_str() == "GET")
        .collect();
    assert_eq!(ranged.len(), 1);
    assert_eq!(
        ranged[0].headers.get("range").unwrap().to_str().unwrap(),
        "bytes=400000-"
    );
}

// ==================== Cancel ====================

#[tokio::test]
async fn cancel_reaches_cancelled_and_deletes_the_partial_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/doomed.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(pattern(50_000))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let reg = registry(&dir).await;
    let dest = dir.path().join("doomed.bin");

    reg.start(
        "dl-c",
        &format!("{}/doomed.bin", server.uri()),
        dest.clone(),
        false,
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let record = reg.cancel("dl-c").await.unwrap();
    assert_eq!(record.state, DownloadState::Cancelled);
    assert!(!reg.is_active("dl-c").await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(reg.status("dl-c").await.unwrap().state, DownloadState::Cancelled);
    assert!(!dest.exists());
}

// ==================== Persistence across restarts ====================

#[tokio::test]
async fn registry_restores_records_across_restart() {
    let server = MockServer::start().await;
    let body = pattern(8_192);
    Mock::given(path("/keep.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(body),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let data_dir: PathBuf = dir.path().join("data");

    {
        let reg = DownloadRegistry::new(data_dir.clone()).await.unwrap();
        reg.start(
            "dl-keep",
            &format!("{}/keep.bin", server.uri()),
            dir.path().join("keep.bin"),
            false,
        )
        .await
        .unwrap();
        wait_for_terminal(&reg, "dl-keep").await;
        reg.flush().await.unwrap();
    }

    let reg = DownloadRegistry::new(data_dir).await.unwrap();
    let record = reg.status("dl-keep").await.unwrap();
    assert_eq!(record.state, DownloadState::Completed);
    assert_eq!(record.total_bytes, 8_192);
}
