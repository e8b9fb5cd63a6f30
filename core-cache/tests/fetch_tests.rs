//! Range fetch integration tests
//!
//! Every test runs a real task against the in-memory origin and checks both
//! what went over the wire and what ended up in the store.

mod common;

use bridge_traits::{HttpRequest, ResponseHead};
use common::{resource, Harness, OriginBehavior, URL};
use core_cache::{
    ByteRange, CacheError, CacheKey, DataOrigin, FetchEvent, FetchHandle, FetchOutcome,
    FetchState, RangeFetchTask, RequestRange, PLAYBACK_PRIORITY,
};
use core_runtime::config::CacheSettings;
use core_runtime::events::{CacheEvent, ReportEvent};
use core_runtime::hooks::{CdnRequestObserver, Observers, ReportLabel};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const LEN: usize = 300 * 1024;

fn key() -> CacheKey {
    CacheKey::new("clip").expect("valid key")
}

fn start(h: &Harness, range: RequestRange) -> FetchHandle {
    RangeFetchTask::new(h.ctx(), key(), URL).start(range, PLAYBACK_PRIORITY)
}

/// Read events up to and including the terminal one.
async fn collect(handle: &mut FetchHandle) -> Vec<FetchEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        let terminal = matches!(
            event,
            FetchEvent::Completed | FetchEvent::Failed(_) | FetchEvent::Canceled
        );
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

fn network_ranges(events: &[FetchEvent]) -> Vec<ByteRange> {
    events
        .iter()
        .filter_map(|e| match e {
            FetchEvent::DataAvailable {
                range,
                origin: DataOrigin::Network,
            } => Some(*range),
            _ => None,
        })
        .collect()
}

async fn wait_for_requests(h: &Harness, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.origin.request_count() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("origin never saw the request");
}

#[tokio::test]
async fn test_fetch_whole_resource_into_empty_cache() {
    let h = Harness::new(LEN).await;
    let mut handle = start(&h, RequestRange::whole());
    let events = collect(&mut handle).await;

    assert!(matches!(
        events.first(),
        Some(FetchEvent::Response {
            total_length: Some(total),
            mime_type: Some(_),
        }) if *total == LEN as u64
    ));
    assert!(matches!(events.last(), Some(FetchEvent::Completed)));

    let written = network_ranges(&events);
    assert_eq!(written.len(), 2, "body is flushed in write-sized chunks");
    assert_eq!(written[0], ByteRange::new(0, 256 * 1024));
    assert_eq!(written[1], ByteRange::new(256 * 1024, LEN as u64));

    assert_eq!(h.origin.ranges(), vec![(0, None)]);
    assert_eq!(h.origin.requests()[0].priority, PLAYBACK_PRIORITY);
    assert!(h.store.is_complete(&key()));
    let bytes = h.store.read_range(&key(), 0, LEN as u64).await.unwrap();
    assert_eq!(bytes, resource(LEN));
    assert_eq!(handle.state(), FetchState::Completed);
}

#[tokio::test]
async fn test_only_gaps_are_requested() {
    let h = Harness::new(LEN).await;
    let data = resource(LEN);
    h.store
        .write_range(&key(), 100_000, &data[100_000..200_000], None, Some(LEN as u64))
        .await
        .unwrap();

    let mut handle = start(&h, RequestRange::whole());
    let events = collect(&mut handle).await;

    assert_eq!(
        h.origin.ranges(),
        vec![(0, Some(100_000)), (200_000, Some(LEN as u64))]
    );
    assert!(events.iter().any(|e| matches!(
        e,
        FetchEvent::DataAvailable {
            range,
            origin: DataOrigin::Cache,
        } if *range == ByteRange::new(100_000, 200_000)
    )));
    assert_eq!(
        h.store.read_range(&key(), 0, LEN as u64).await.unwrap(),
        data
    );
}

#[tokio::test]
async fn test_cached_range_needs_no_request() {
    let h = Harness::new(LEN).await;
    let data = resource(LEN);
    h.store
        .write_range(&key(), 0, &data[..1000], Some("video/mp4"), Some(LEN as u64))
        .await
        .unwrap();

    let handle = start(&h, RequestRange::new(10, Some(900)));
    match handle.wait().await {
        FetchOutcome::Completed { network_bytes } => assert_eq!(network_bytes, 0),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(h.origin.request_count(), 0);
}

#[tokio::test]
async fn test_full_response_skips_cached_prefix() {
    let h = Harness::new(LEN).await;
    let data = resource(LEN);
    h.store
        .write_range(&key(), 0, &data[..1000], None, Some(LEN as u64))
        .await
        .unwrap();
    h.origin.set_behavior(OriginBehavior {
        ignore_range: true,
        ..OriginBehavior::default()
    });

    let mut handle = start(&h, RequestRange::whole());
    let events = collect(&mut handle).await;

    assert!(matches!(events.last(), Some(FetchEvent::Completed)));
    assert_eq!(h.origin.ranges(), vec![(1000, Some(LEN as u64))]);
    assert_eq!(network_ranges(&events)[0].start, 1000);
    assert_eq!(
        h.store.read_range(&key(), 0, LEN as u64).await.unwrap(),
        data
    );
}

#[tokio::test]
async fn test_error_status_fails_and_reports() {
    let h = Harness::new(LEN).await;
    let mut rx = h.events.subscribe();
    h.origin.set_behavior(OriginBehavior {
        status: Some(503),
        ..OriginBehavior::default()
    });

    let handle = start(&h, RequestRange::whole());
    let error = match handle.wait().await {
        FetchOutcome::Failed(error) => error,
        other => panic!("unexpected outcome {:?}", other),
    };
    match error.as_ref() {
        CacheError::BadResponse { status, url } => {
            assert_eq!(*status, 503);
            assert!(!url.contains("secret"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(error.code(), 5005);
    assert!(error.is_transient());
    assert!(!h.store.has_cache(&key()));

    let mut server_errors = 0;
    while let Ok(event) = rx.try_recv() {
        if let CacheEvent::Report(ReportEvent { label, extra, .. }) = event {
            if label == ReportLabel::ServerError {
                assert_eq!(extra.get("status").map(String::as_str), Some("503"));
                server_errors += 1;
            }
        }
    }
    assert_eq!(server_errors, 1);
}

#[tokio::test]
async fn test_response_starting_past_gap_is_rejected() {
    let h = Harness::new(LEN).await;
    h.origin.set_behavior(OriginBehavior {
        shift_start: Some(512),
        ..OriginBehavior::default()
    });

    let outcome = start(&h, RequestRange::new(0, Some(4096))).wait().await;
    assert!(matches!(
        outcome,
        FetchOutcome::Failed(ref e) if matches!(e.as_ref(), CacheError::BadResponse { status: 206, .. })
    ));
    assert!(h.store.cached_ranges(&key()).is_empty());
}

#[tokio::test]
async fn test_transport_failure_keeps_received_bytes() {
    let h = Harness::new(LEN).await;
    h.origin.set_behavior(OriginBehavior {
        fail_after: Some(40_000),
        ..OriginBehavior::default()
    });

    let outcome = start(&h, RequestRange::whole()).wait().await;
    match outcome {
        FetchOutcome::Failed(error) => assert!(error.is_network_error()),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(
        h.store.cached_ranges(&key()).as_slice(),
        &[ByteRange::new(0, 40_000)]
    );

    // A retry asks only for what is still missing.
    h.origin.set_behavior(OriginBehavior::default());
    let outcome = start(&h, RequestRange::whole()).wait().await;
    assert!(matches!(outcome, FetchOutcome::Completed { network_bytes } if network_bytes == LEN as u64 - 40_000));
    assert_eq!(h.origin.ranges()[1], (40_000, Some(LEN as u64)));
    assert!(h.store.is_complete(&key()));
}

#[tokio::test]
async fn test_cancel_stops_without_writing() {
    let h = Harness::new(LEN).await;
    h.origin.set_behavior(OriginBehavior {
        stall_after: Some(20_000),
        ..OriginBehavior::default()
    });

    let mut handle = start(&h, RequestRange::whole());
    wait_for_requests(&h, 1).await;
    assert_eq!(handle.state(), FetchState::Running);

    // The running task holds the entry.
    let outcome = h.store.delete_manager().mark_for_deletion(&key()).unwrap();
    assert!(matches!(outcome, core_cache::DeletionOutcome::Deferred { .. }));

    handle.cancel();
    let events = collect(&mut handle).await;
    assert!(matches!(events.last(), Some(FetchEvent::Canceled)));
    assert_eq!(handle.state(), FetchState::Canceled);
    assert!(network_ranges(&events).is_empty());
    assert!(h.store.cached_ranges(&key()).is_empty());

    // Released by the task, so the deferred deletion ran.
    assert!(!h.store.delete_manager().is_pending_delete(&key()));
    assert_eq!(h.store.delete_manager().use_count(&key()), 0);
}

#[tokio::test]
async fn test_low_disk_space_refuses_network_fetch() {
    let h = Harness::with_settings(
        LEN,
        CacheSettings {
            min_free_disk_bytes: 1024 * 1024,
            ..CacheSettings::default()
        },
    )
    .await;
    let data = resource(LEN);
    h.store
        .write_range(&key(), 0, &data[..1000], None, Some(LEN as u64))
        .await
        .unwrap();
    h.fs.set_available(1024);

    // Cached bytes are still served.
    let outcome = start(&h, RequestRange::new(0, Some(1000))).wait().await;
    assert!(matches!(outcome, FetchOutcome::Completed { network_bytes: 0 }));

    let outcome = start(&h, RequestRange::whole()).wait().await;
    match outcome {
        FetchOutcome::Failed(error) => assert!(matches!(
            error.as_ref(),
            CacheError::InsufficientDiskSpace {
                available: 1024,
                required: 1048576,
            }
        )),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(h.origin.request_count(), 0);
}

#[tokio::test]
async fn test_unknown_length_learned_from_body_end() {
    let h = Harness::new(LEN).await;
    h.origin.set_behavior(OriginBehavior {
        ignore_range: true,
        hide_total: true,
        ..OriginBehavior::default()
    });

    let outcome = start(&h, RequestRange::whole()).wait().await;
    assert!(matches!(outcome, FetchOutcome::Completed { .. }));
    let meta = h.store.snapshot(&key()).unwrap();
    assert_eq!(meta.total_length, Some(LEN as u64));
    assert!(meta.is_complete());
    assert_eq!(h.origin.request_count(), 1);
}

#[tokio::test]
async fn test_partial_reply_without_total_continues_past_its_end() {
    let h = Harness::new(LEN).await;
    h.origin.set_behavior(OriginBehavior {
        hide_total: true,
        ..OriginBehavior::default()
    });

    let outcome = start(&h, RequestRange::whole()).wait().await;
    assert!(matches!(outcome, FetchOutcome::Completed { .. }));
    assert_eq!(
        h.origin.ranges(),
        vec![(0, None), (LEN as u64, None)],
        "the length comes from the unsatisfiable follow-up"
    );
    let meta = h.store.snapshot(&key()).unwrap();
    assert_eq!(meta.total_length, Some(LEN as u64));
    assert!(meta.is_complete());
}

#[tokio::test]
async fn test_capped_replies_do_not_truncate_the_resource() {
    let h = Harness::new(1000).await;
    h.origin.set_behavior(OriginBehavior {
        hide_total: true,
        cap: Some(100),
        ..OriginBehavior::default()
    });

    let mut handle = start(&h, RequestRange::whole());
    let events = collect(&mut handle).await;
    assert!(matches!(events.last(), Some(FetchEvent::Completed)));

    let starts: Vec<u64> = h.origin.ranges().iter().map(|(start, _)| *start).collect();
    assert_eq!(starts, (0..=10).map(|i| i * 100).collect::<Vec<_>>());
    let meta = h.store.snapshot(&key()).unwrap();
    assert_eq!(meta.total_length, Some(1000));
    assert_eq!(
        meta.cached_ranges.iter().copied().collect::<Vec<_>>(),
        vec![ByteRange::new(0, 1000)]
    );
    assert!(meta.is_complete());
    let bytes = h.store.read_range(&key(), 0, 1000).await.unwrap();
    assert_eq!(bytes, resource(1000));
}

#[tokio::test]
async fn test_unsatisfiable_range_past_uncached_data_fails() {
    let h = Harness::new(1000).await;
    let outcome = start(&h, RequestRange::new(2000, None)).wait().await;
    assert!(matches!(
        outcome,
        FetchOutcome::Failed(ref e)
            if matches!(e.as_ref(), CacheError::BadResponse { status: 416, .. })
    ));
    assert!(h
        .store
        .snapshot(&key())
        .map_or(true, |meta| meta.total_length.is_none()));
}

#[tokio::test]
async fn test_capped_replies_with_known_total_fill_a_bounded_range() {
    let h = Harness::new(1000).await;
    h.origin.set_behavior(OriginBehavior {
        cap: Some(300),
        ..OriginBehavior::default()
    });

    let outcome = start(&h, RequestRange::new(0, Some(700))).wait().await;
    assert!(matches!(outcome, FetchOutcome::Completed { .. }));
    assert_eq!(
        h.origin.ranges(),
        vec![(0, Some(700)), (300, Some(700)), (600, Some(700))]
    );
    let meta = h.store.snapshot(&key()).unwrap();
    assert_eq!(meta.total_length, Some(1000));
    assert_eq!(meta.cached_bytes(), 700);
}

#[tokio::test]
async fn test_invalid_request_range_fails() {
    let h = Harness::new(LEN).await;
    let outcome = start(&h, RequestRange::new(100, Some(10))).wait().await;
    assert!(matches!(
        outcome,
        FetchOutcome::Failed(ref e) if matches!(e.as_ref(), CacheError::InvalidRange(_))
    ));
    assert_eq!(h.origin.request_count(), 0);
}

#[derive(Default)]
struct CdnLog {
    sent: Mutex<Vec<(Option<(u64, Option<u64>)>, bool)>>,
    responses: Mutex<Vec<u16>>,
}

impl CdnRequestObserver for CdnLog {
    fn will_send(&self, request: &HttpRequest, is_redirect: bool) {
        self.sent.lock().push((request.range, is_redirect));
    }

    fn did_receive_response(&self, _request: &HttpRequest, head: &ResponseHead) {
        self.responses.lock().push(head.status);
    }
}

#[tokio::test]
async fn test_cdn_observer_sees_every_request() {
    let log = Arc::new(CdnLog::default());
    let observer: Arc<dyn CdnRequestObserver> = log.clone();
    let h = Harness::with_settings(
        LEN,
        CacheSettings {
            observers: Observers::default().with_cdn_observer(&observer),
            ..CacheSettings::default()
        },
    )
    .await;
    let data = resource(LEN);
    h.store
        .write_range(&key(), 1000, &data[1000..2000], None, Some(LEN as u64))
        .await
        .unwrap();

    let outcome = start(&h, RequestRange::new(0, Some(3000))).wait().await;
    assert!(matches!(outcome, FetchOutcome::Completed { network_bytes: 2000 }));

    assert_eq!(
        *log.sent.lock(),
        vec![(Some((0, Some(1000))), false), (Some((2000, Some(3000))), false)]
    );
    assert_eq!(*log.responses.lock(), vec![206, 206]);
}
