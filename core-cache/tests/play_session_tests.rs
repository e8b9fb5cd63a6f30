//! Play session tests

mod common;

use common::{resource, Harness, OriginBehavior, URL};
use core_cache::{
    CacheKey, FetchState, PlaySession, PrefetchHit, PrefetchHitRecorder, RequestRange,
    PLAYBACK_PRIORITY,
};
use core_runtime::events::{CacheEvent, ReportEvent};
use core_runtime::hooks::ReportLabel;
use std::collections::BTreeMap;
use tokio::sync::broadcast::Receiver;

const LEN: usize = 200 * 1024;

fn hits(h: &Harness) -> PrefetchHitRecorder {
    PrefetchHitRecorder::new(h.clock.clone(), h.settings.clone())
}

fn reports(rx: &mut Receiver<CacheEvent>) -> Vec<(ReportLabel, BTreeMap<String, String>)> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CacheEvent::Report(ReportEvent { label, extra, .. }) = event {
            out.push((label, extra));
        }
    }
    out
}

#[tokio::test]
async fn test_session_reads_what_it_fetches() {
    let h = Harness::new(LEN).await;
    let hits = hits(&h);
    let mut rx = h.events.subscribe();

    let mut session = PlaySession::open(h.ctx(), &hits, URL).unwrap();
    assert_eq!(session.prefetch_hit(), PrefetchHit::Miss);
    assert_eq!(session.key(), &CacheKey::for_url(URL, &h.settings).unwrap());

    let reports = reports(&mut rx);
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].0, ReportLabel::CachedSizeWhenPlay);
    assert_eq!(reports[0].1["cached_length"], "0");
    assert_eq!(reports[0].1["total_length"], "unknown");
    assert_eq!(reports[1].0, ReportLabel::CachePlayCdnUrl);
    assert_eq!(reports[1].1["url"], "https://cdn.example.com/videos/clip.mp4");

    session.request(RequestRange::whole(), PLAYBACK_PRIORITY);
    let bytes = session.read_when_available(150 * 1024, 1000).await.unwrap();
    assert_eq!(&bytes[..], &resource(LEN)[150 * 1024..150 * 1024 + 1000]);

    while session.active().map(|a| a.state()) != Some(FetchState::Completed) {
        if session.next_event().await.is_none() {
            break;
        }
    }
    assert_eq!(session.read_sync(0, 10).unwrap().len(), 10);

    let summary = session.finish().await.unwrap();
    assert!(summary.is_complete);
    assert_eq!(summary.cached_bytes, LEN as u64);
    assert_eq!(
        h.store.snapshot(&summary.key).unwrap().origin_url.as_deref(),
        Some(URL)
    );
}

#[tokio::test]
async fn test_complete_entry_skips_cdn_report() {
    let h = Harness::new(LEN).await;
    let key = CacheKey::new("clip").unwrap();
    h.store
        .write_range(&key, 0, &resource(LEN), Some("video/mp4"), Some(LEN as u64))
        .await
        .unwrap();
    let hits = hits(&h);
    hits.record_prefetch(&key, LEN as u64);
    let mut rx = h.events.subscribe();

    let session = PlaySession::open_with_key(h.ctx(), &hits, key, URL).unwrap();
    assert_eq!(session.prefetch_hit(), PrefetchHit::Hit { size: LEN as u64 });

    let reports = reports(&mut rx);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].1["complete"], "true");
    assert_eq!(session.read(0, 100).await.unwrap(), resource(100));
    assert_eq!(h.origin.request_count(), 0);
}

#[tokio::test]
async fn test_seek_replaces_active_fetch() {
    let h = Harness::new(LEN).await;
    h.origin.set_behavior(OriginBehavior {
        stall_after: Some(1000),
        ..OriginBehavior::default()
    });
    let hits = hits(&h);
    let key = CacheKey::new("clip").unwrap();
    let mut session = PlaySession::open_with_key(h.ctx(), &hits, key.clone(), URL).unwrap();

    session.request(RequestRange::new(0, None), PLAYBACK_PRIORITY);
    session.request(RequestRange::new(100 * 1024, None), PLAYBACK_PRIORITY);
    assert_eq!(session.active().unwrap().state(), FetchState::Idle);

    session.cancel();
    assert!(session.active().is_none());
    // Closing stops fetching; only the session's own use remains until drop.
    drop(session);
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while h.store.delete_manager().use_count(&key) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("fetch tasks kept the key in use");
}

#[tokio::test]
async fn test_session_defers_deletion_until_closed() {
    let h = Harness::new(LEN).await;
    let key = CacheKey::new("clip").unwrap();
    h.store
        .write_range(&key, 0, &resource(1000), None, Some(LEN as u64))
        .await
        .unwrap();
    let hits = hits(&h);
    let session = PlaySession::open_with_key(h.ctx(), &hits, key.clone(), URL).unwrap();

    let report = h.store.clear();
    assert_eq!(report.deferred, 1);
    assert_eq!(session.read(0, 1000).await.unwrap().len(), 1000);

    drop(session);
    assert!(!h.store.has_cache(&key));
}
