mod support;

use orgreg_storage::{ByteRange, FetchError, HttpClientConfig, HttpFetcher, RetryDisposition};
use tempfile::tempdir;

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig::default()).expect("fetcher")
}

fn payload() -> Vec<u8> {
    (0..1_000u32).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn probe_reports_size_and_range_support() {
    let server = support::spawn(payload(), true).await;
    let probe = fetcher().probe(&server.url).await.expect("probe");
    assert_eq!(probe.status, 206);
    assert_eq!(probe.total_bytes, Some(1_000));
    assert_eq!(probe.ranged_size(), Some(1_000));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn probe_without_range_support_has_no_ranged_size() {
    let server = support::spawn(payload(), false).await;
    let probe = fetcher().probe(&server.url).await.expect("probe");
    assert_eq!(probe.status, 200);
    assert!(!probe.accepts_ranges);
    assert_eq!(probe.ranged_size(), None);
}

#[tokio::test]
async fn ranged_fetch_writes_exact_slice() {
    let server = support::spawn(payload(), true).await;
    let dir = tempdir().expect("tempdir");
    let dest = dir.path().join("chunks").join("chunk_1");
    let range = ByteRange { start: 300, end: 599 };

    let written = fetcher()
        .fetch_range_to_file(&server.url, range, &dest)
        .await
        .expect("fetch");
    assert_eq!(written, 300);
    assert_eq!(std::fs::read(&dest).expect("read"), payload()[300..600].to_vec());

    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("chunks"))
        .expect("read dir")
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn ranged_fetch_rejects_full_response() {
    let server = support::spawn(payload(), false).await;
    let dir = tempdir().expect("tempdir");
    let dest = dir.path().join("chunk_0");

    let err = fetcher()
        .fetch_range_to_file(&server.url, ByteRange { start: 0, end: 99 }, &dest)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FetchError::UnexpectedStatus {
            expected: 206,
            status: 200,
            ..
        }
    ));
    assert!(!dest.exists());
}

#[tokio::test]
async fn full_fetch_streams_whole_body() {
    let server = support::spawn(payload(), true).await;
    let dir = tempdir().expect("tempdir");
    let dest = dir.path().join("dataset-full.zip");

    let written = fetcher().fetch_to_file(&server.url, &dest).await.expect("fetch");
    assert_eq!(written, 1_000);
    assert_eq!(std::fs::read(&dest).expect("read"), payload());
}

#[tokio::test]
async fn missing_resource_is_not_retryable() {
    let server = support::spawn(payload(), true).await;
    let dir = tempdir().expect("tempdir");
    let url = format!("{}/missing.zip", server.base);

    let err = fetcher()
        .fetch_to_file(&url, &dir.path().join("x.zip"))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
}
