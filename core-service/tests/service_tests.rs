//! Cache service integration tests
//!
//! Boot the façade over injected bridges and drive it the way a playback
//! layer would.

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{
    FileSystemAccess, HttpClient, HttpRequest, NetworkChangeStream, NetworkInfo, NetworkMonitor,
    NetworkType, ResponseHead, StreamingResponse,
};
use bytes::Bytes;
use core_runtime::events::{CacheEvent, PrefetchEvent};
use core_service::{
    CacheError, CacheService, CacheSettings, CoreConfig, CoreError, EnqueueOutcome, PrefetchState,
};
use futures::stream;
use mockall::mock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const URL: &str = "https://cdn.example.com/v/intro.mp4";
const LEN: usize = 32 * 1024;

mock! {
    Network {}

    #[async_trait]
    impl NetworkMonitor for Network {
        async fn get_network_info(&self) -> BridgeResult<NetworkInfo>;
        async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>>;
    }
}

/// Serves `LEN` bytes of `i % 251` with range support.
struct StaticOrigin;

#[async_trait]
impl HttpClient for StaticOrigin {
    async fn send(&self, request: HttpRequest) -> BridgeResult<StreamingResponse> {
        let data: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
        let (start, end) = match request.range {
            Some((start, end)) => (start as usize, end.map_or(LEN, |e| (e as usize).min(LEN))),
            None => (0, LEN),
        };
        let head = ResponseHead::new(206, request.url.clone())
            .with_header("Content-Type", "video/mp4")
            .with_header("Content-Range", format!("bytes {}-{}/{}", start, end - 1, LEN));
        let body = Bytes::copy_from_slice(&data[start..end]);
        Ok(StreamingResponse {
            head,
            body: Box::pin(stream::iter(vec![Ok(body)])),
        })
    }
}

struct FixedDisk {
    available: AtomicU64,
}

#[async_trait]
impl FileSystemAccess for FixedDisk {
    async fn get_cache_directory(&self) -> BridgeResult<PathBuf> {
        Ok(std::env::temp_dir())
    }

    async fn create_dir_all(&self, path: &Path) -> BridgeResult<()> {
        Ok(tokio::fs::create_dir_all(path).await?)
    }

    async fn available_space(&self, _path: &Path) -> BridgeResult<u64> {
        Ok(self.available.load(Ordering::SeqCst))
    }

    async fn total_space(&self, _path: &Path) -> BridgeResult<u64> {
        Ok(u64::MAX)
    }
}

fn network(metered: bool) -> Arc<dyn NetworkMonitor> {
    let mut network = MockNetwork::new();
    network.expect_get_network_info().returning(move || {
        Ok(if metered {
            NetworkInfo::metered(NetworkType::Cellular)
        } else {
            NetworkInfo::unmetered(NetworkType::WiFi)
        })
    });
    network
        .expect_subscribe_changes()
        .returning(|| Err(bridge_traits::BridgeError::NotAvailable("changes".into())));
    Arc::new(network)
}

async fn service(metered: bool, available: u64) -> (TempDir, CacheService) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = CoreConfig::builder()
        .cache_dir(dir.path().join("media"))
        .http_client(Arc::new(StaticOrigin))
        .file_system(Arc::new(FixedDisk {
            available: AtomicU64::new(available),
        }))
        .network_monitor(network(metered))
        .settings(CacheSettings {
            min_free_disk_bytes: 1024 * 1024,
            ..CacheSettings::default()
        })
        .build()
        .expect("Failed to build config");
    let service = CacheService::new(config)
        .await
        .expect("Failed to start cache service");
    (dir, service)
}

async fn wait_finished(rx: &mut tokio::sync::broadcast::Receiver<CacheEvent>) -> u64 {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(CacheEvent::Prefetch(PrefetchEvent::Finished { cached_bytes, .. })) => {
                    return cached_bytes
                }
                Ok(CacheEvent::Prefetch(PrefetchEvent::Failed { message, .. })) => {
                    panic!("prefetch failed: {}", message)
                }
                Ok(_) => {}
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await
    .expect("prefetch never finished")
}

#[tokio::test]
async fn test_prefetch_then_play() {
    let (_dir, service) = service(false, u64::MAX).await;
    let mut rx = service.subscribe_events();

    let outcome = service.prefetch(URL, Some(4096), None).await.unwrap();
    assert_eq!(outcome, EnqueueOutcome::Queued);
    assert_eq!(wait_finished(&mut rx).await, 4096);

    let key = service.key_for_url(URL).unwrap();
    assert_eq!(service.prefetch_state(&key), Some(PrefetchState::Finished));
    let info = service.cache_info(&key);
    assert!(info.has_cache);
    assert!(!info.is_complete);
    assert_eq!(info.total_length, Some(LEN as u64));
    assert_eq!(service.metadata(&key).await.unwrap().cached_length, 4096);

    let session = service.open_session(URL).unwrap();
    assert!(matches!(
        session.prefetch_hit(),
        core_cache::PrefetchHit::Hit { size: 4096 }
    ));
    assert_eq!(session.read(0, 4096).await.unwrap().len(), 4096);
    drop(session);

    service.shutdown().await;
}

#[tokio::test]
async fn test_prefetch_default_size_is_whole_resource() {
    let (_dir, service) = service(false, u64::MAX).await;
    let mut rx = service.subscribe_events();

    service.prefetch(URL, None, Some("feed")).await.unwrap();
    assert_eq!(wait_finished(&mut rx).await, LEN as u64);
    let key = service.key_for_url(URL).unwrap();
    assert!(service.cache_info(&key).is_complete);
    assert_eq!(service.total_size(), LEN as u64);
    assert!(service.has_enough_cache_for(&key, Duration::ZERO, 0.0));

    let report = service.clear();
    assert_eq!(report.deleted, 1);
    assert!(!service.has_cache(&key));
    service.shutdown().await;
}

#[tokio::test]
async fn test_prefetch_refused_when_disk_is_full() {
    let (_dir, service) = service(false, 4096).await;

    let err = service.prefetch(URL, None, None).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Cache(CacheError::InsufficientDiskSpace { available: 4096, .. })
    ));
    assert_eq!(err.cache_code(), Some(6100));
    assert_eq!(service.pending_prefetches(), 0);
    assert!(!service.has_enough_free_disk_size().await.unwrap());
    assert_eq!(service.free_file_system_size_mb().await.unwrap(), 0);
    service.shutdown().await;
}

#[tokio::test]
async fn test_metered_toggle_releases_queue() {
    let (_dir, service) = service(true, u64::MAX).await;
    let mut rx = service.subscribe_events();
    assert!(!service.prefetch_on_metered());
    assert!(service.is_metered().await);

    service.prefetch(URL, Some(1024), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.pending_prefetches(), 1);

    service.set_prefetch_on_metered(true);
    assert!(service.prefetch_on_metered());
    assert_eq!(wait_finished(&mut rx).await, 1024);
    assert_eq!(service.pending_prefetches(), 0);
    service.shutdown().await;
}

#[tokio::test]
async fn test_cancel_and_clear_prefetches() {
    let (_dir, service) = service(true, u64::MAX).await;
    service.prefetch("https://cdn.example.com/a.mp4", Some(10), Some("row")).await.unwrap();
    service.prefetch("https://cdn.example.com/b.mp4", Some(10), Some("row")).await.unwrap();
    service.prefetch("https://cdn.example.com/c.mp4", Some(10), None).await.unwrap();
    service.prefetch("https://cdn.example.com/d.mp4", Some(10), None).await.unwrap();
    service.prefetch("https://cdn.example.com/e.mp4", Some(10), Some("")).await.unwrap();

    assert_eq!(service.cancel_prefetch_group("row"), 2);
    assert_eq!(service.cancel_prefetch_group(core_cache::DEFAULT_GROUP), 3);
    assert_eq!(service.pending_prefetches(), 0);

    service.prefetch("https://cdn.example.com/c.mp4", Some(20), None).await.unwrap();
    service.prefetch("https://cdn.example.com/d.mp4", Some(20), None).await.unwrap();
    let c = service.key_for_url("https://cdn.example.com/c.mp4").unwrap();
    assert_eq!(service.cancel_prefetch(&c), 1);
    assert_eq!(service.pending_prefetches(), 1);
    service.clear_prefetches();
    assert_eq!(service.pending_prefetches(), 0);
    assert_eq!(service.cancel_all_prefetches(), 0);
    service.shutdown().await;
}

#[tokio::test]
async fn test_log_tail_without_log_file() {
    let (_dir, service) = service(false, u64::MAX).await;
    assert_eq!(service.log_tail(1024).unwrap(), "");
    assert!(service.logging_config().file_log_dir.is_none());

    service.update_settings(|s| s.file_log_enabled = true);
    let config = service.logging_config();
    assert!(config.file_log_dir.unwrap().ends_with("logs"));
    service.shutdown().await;
}
