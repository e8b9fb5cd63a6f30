//! Shared fakes for the cache integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{
    BridgeError, ByteStream, Clock, FileSystemAccess, HttpClient, HttpRequest, ManualClock,
    NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkType, ResponseHead,
    StreamingResponse,
};
use bytes::Bytes;
use core_cache::{CacheStore, FetchContext};
use core_runtime::config::{CacheSettings, SharedSettings};
use core_runtime::events::EventBus;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const URL: &str = "https://cdn.example.com/videos/clip.mp4?token=secret";

/// Deterministic resource content: byte `i` is `i % 251`.
pub fn resource(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

// ============================================================================
// Origin server
// ============================================================================

/// What the origin does with the next requests.
#[derive(Debug, Clone, Default)]
pub struct OriginBehavior {
    /// Answer every request with this status and an empty body.
    pub status: Option<u16>,
    /// Ignore `Range` and send the whole resource with `200`.
    pub ignore_range: bool,
    /// Send `Content-Range: bytes a-b/*`, or no `Content-Length` on `200`.
    pub hide_total: bool,
    /// Serve at most this many bytes per ranged reply.
    pub cap: Option<u64>,
    /// Start the body here instead of at the requested offset.
    pub shift_start: Option<u64>,
    /// Fail the body with a transport error after this many bytes.
    pub fail_after: Option<u64>,
    /// Stop sending after this many bytes without ending the body.
    pub stall_after: Option<u64>,
    /// Refuse to connect.
    pub refuse: bool,
}

/// In-memory HTTP origin serving one resource with range support.
pub struct Origin {
    data: Bytes,
    mime_type: Option<String>,
    chunk_size: usize,
    behavior: Mutex<OriginBehavior>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl Origin {
    pub fn new(data: Bytes) -> Arc<Self> {
        Arc::new(Self {
            data,
            mime_type: Some("video/mp4".to_string()),
            chunk_size: 16 * 1024,
            behavior: Mutex::new(OriginBehavior::default()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behavior(&self, behavior: OriginBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Requested `(start, end)` spans in order.
    pub fn ranges(&self) -> Vec<(u64, Option<u64>)> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.range.unwrap_or((0, None)))
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn body(&self, slice: Bytes, behavior: &OriginBehavior) -> ByteStream {
        let mut sent = 0u64;
        let mut chunks: Vec<BridgeResult<Bytes>> = Vec::new();
        let limit = behavior
            .fail_after
            .or(behavior.stall_after)
            .unwrap_or(u64::MAX);
        for chunk in slice.chunks(self.chunk_size) {
            if sent >= limit {
                break;
            }
            let take = (limit - sent).min(chunk.len() as u64) as usize;
            chunks.push(Ok(Bytes::copy_from_slice(&chunk[..take])));
            sent += take as u64;
        }
        if behavior.fail_after.is_some() {
            chunks.push(Err(BridgeError::Transport("connection reset".into())));
        }
        let body = stream::iter(chunks);
        if behavior.stall_after.is_some() {
            Box::pin(body.chain(stream::pending()))
        } else {
            Box::pin(body)
        }
    }
}

#[async_trait]
impl HttpClient for Origin {
    async fn send(&self, request: HttpRequest) -> BridgeResult<StreamingResponse> {
        self.requests.lock().push(request.clone());
        let behavior = self.behavior.lock().clone();
        if behavior.refuse {
            return Err(BridgeError::Transport("connection refused".into()));
        }

        let total = self.data.len() as u64;
        let mut head = ResponseHead::new(200, request.url.clone());
        if let Some(mime) = &self.mime_type {
            head = head.with_header("Content-Type", mime.clone());
        }
        if let Some(status) = behavior.status {
            return Ok(StreamingResponse {
                head: ResponseHead::new(status, request.url.clone()),
                body: Box::pin(stream::empty()),
            });
        }

        let (start, end) = match request.range {
            Some((start, end)) if !behavior.ignore_range => (start, end.unwrap_or(total).min(total)),
            _ => {
                if !behavior.hide_total {
                    head = head.with_header("Content-Length", total.to_string());
                }
                let body = self.body(self.data.clone(), &behavior);
                return Ok(StreamingResponse { head, body });
            }
        };
        if start >= total {
            return Ok(StreamingResponse {
                head: ResponseHead::new(416, request.url.clone())
                    .with_header("Content-Range", format!("bytes */{}", total)),
                body: Box::pin(stream::empty()),
            });
        }

        let start = behavior.shift_start.unwrap_or(start);
        let end = behavior.cap.map_or(end, |cap| end.min(start + cap));
        let total_text = if behavior.hide_total {
            "*".to_string()
        } else {
            total.to_string()
        };
        head.status = 206;
        head = head
            .with_header("Content-Range", format!("bytes {}-{}/{}", start, end - 1, total_text))
            .with_header("Content-Length", (end - start).to_string());
        let body = self.body(self.data.slice(start as usize..end as usize), &behavior);
        Ok(StreamingResponse { head, body })
    }
}

// ============================================================================
// Host capabilities
// ============================================================================

pub struct FakeFileSystem {
    root: PathBuf,
    available: AtomicU64,
}

impl FakeFileSystem {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            available: AtomicU64::new(64 * 1024 * 1024 * 1024),
        })
    }

    pub fn set_available(&self, bytes: u64) {
        self.available.store(bytes, Ordering::SeqCst);
    }
}

#[async_trait]
impl FileSystemAccess for FakeFileSystem {
    async fn get_cache_directory(&self) -> BridgeResult<PathBuf> {
        Ok(self.root.clone())
    }

    async fn create_dir_all(&self, path: &Path) -> BridgeResult<()> {
        Ok(tokio::fs::create_dir_all(path).await?)
    }

    async fn available_space(&self, _path: &Path) -> BridgeResult<u64> {
        Ok(self.available.load(Ordering::SeqCst))
    }

    async fn total_space(&self, _path: &Path) -> BridgeResult<u64> {
        Ok(128 * 1024 * 1024 * 1024)
    }
}

/// Network whose metered flag can be flipped, announcing each flip.
#[derive(Default)]
pub struct SwitchableNetwork {
    metered: AtomicBool,
    listeners: Mutex<Vec<mpsc::UnboundedSender<NetworkInfo>>>,
}

impl SwitchableNetwork {
    pub fn new(metered: bool) -> Arc<Self> {
        let network = Self::default();
        network.metered.store(metered, Ordering::SeqCst);
        Arc::new(network)
    }

    fn info(&self) -> NetworkInfo {
        if self.metered.load(Ordering::SeqCst) {
            NetworkInfo::metered(NetworkType::Cellular)
        } else {
            NetworkInfo::unmetered(NetworkType::WiFi)
        }
    }

    pub fn set_metered(&self, metered: bool) {
        self.metered.store(metered, Ordering::SeqCst);
        let info = self.info();
        self.listeners
            .lock()
            .retain(|listener| listener.send(info.clone()).is_ok());
    }
}

struct ChannelChanges(mpsc::UnboundedReceiver<NetworkInfo>);

#[async_trait]
impl NetworkChangeStream for ChannelChanges {
    async fn next(&mut self) -> Option<NetworkInfo> {
        self.0.recv().await
    }
}

#[async_trait]
impl NetworkMonitor for SwitchableNetwork {
    async fn get_network_info(&self) -> BridgeResult<NetworkInfo> {
        Ok(self.info())
    }

    async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        Ok(Box::new(ChannelChanges(rx)))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub settings: SharedSettings,
    pub events: EventBus,
    pub store: Arc<CacheStore>,
    pub origin: Arc<Origin>,
    pub fs: Arc<FakeFileSystem>,
}

impl Harness {
    pub async fn new(resource_len: usize) -> Self {
        Self::with_settings(resource_len, CacheSettings::default()).await
    }

    pub async fn with_settings(resource_len: usize, settings: CacheSettings) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let settings = SharedSettings::new(settings);
        let events = EventBus::default();
        let store = open_store(dir.path(), &clock, &settings, &events).await;
        let fs = FakeFileSystem::new(dir.path());
        Self {
            dir,
            clock,
            settings,
            events,
            store,
            origin: Origin::new(resource(resource_len)),
            fs,
        }
    }

    pub fn ctx(&self) -> FetchContext {
        FetchContext::new(self.store.clone(), self.origin.clone(), self.fs.clone())
    }

    /// Reopen the store over the same directory, as after a restart.
    pub async fn reopen(&mut self) {
        self.store = open_store(self.dir.path(), &self.clock, &self.settings, &self.events).await;
    }
}

pub async fn open_store(
    root: &Path,
    clock: &Arc<ManualClock>,
    settings: &SharedSettings,
    events: &EventBus,
) -> Arc<CacheStore> {
    let clock: Arc<dyn Clock> = clock.clone();
    CacheStore::open(root, clock, settings.clone(), events.clone())
        .await
        .expect("Failed to open cache store")
}
