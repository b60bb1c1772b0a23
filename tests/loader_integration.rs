//! Integration tests for the page loader against a mock gallery site.
//!
//! These tests verify resolution, lazy and out-of-order page loads, request
//! coalescing, cancellation, restart and the shared caches.

use std::sync::Arc;
use std::time::Duration;

use gallery_core::cache::PageCacheStore;
use gallery_core::gallery::{FavoriteStatusEvent, GalleryRef};
use gallery_core::loader::{
    LoaderError, LoaderServices, LoaderState, PageLoader, PageState, decoded_cache_key,
    raw_cache_key,
};
use gallery_core::net::HttpClient;
use gallery_core::source::{DirectoryArchiveLookup, Quality, SourceError};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::fixtures::{
    GID, TITLE, TOKEN, framed_png, image_path, mount_gallery,
    mount_original_viewer, mount_pages, options, original_path, page_png, png, services,
    services_with, viewer_path, write_gallery_zip,
};
use support::socket_guard::start_mock_server_or_skip;

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        mock_server
    }};
}

fn remote() -> GalleryRef {
    GalleryRef::remote(GID, TOKEN)
}

async fn ready_loader(services: LoaderServices) -> PageLoader {
    let loader = PageLoader::new(remote(), None, services);
    loader.start();
    assert!(loader.await_ready().await, "loader failed: {:?}", loader.last_error());
    loader
}

// ==================== Resolution ====================

#[tokio::test]
async fn test_resolve_reports_size_and_caches_detail() {
    let server = require_mock_server!();
    mount_gallery(&server, GID, TOKEN, 10).await;
    let cache = TempDir::new().unwrap();
    let services = services(cache.path(), &server.uri()).await;
    let metadata = Arc::clone(services.caches.metadata());

    let loader = PageLoader::new(remote(), Some(42), services);
    assert_eq!(loader.state(), LoaderState::Idle);
    assert_eq!(loader.size(), None);

    loader.start();
    loader.start();
    assert!(loader.await_ready().await);

    assert_eq!(loader.size(), Some(10));
    assert_eq!(loader.start_page(), 9, "start page clamps into range");
    let detail = loader.detail().unwrap();
    assert_eq!(detail.title, TITLE);
    assert_eq!(detail.pages, 10);
    assert!(Arc::ptr_eq(&metadata.get(GID).unwrap(), &detail));
    for index in 0..10 {
        assert!(matches!(loader.page_state(index), Some(PageState::NotRequested)));
    }
    assert_eq!(loader.outstanding_tasks(), 0);
}

#[tokio::test]
async fn test_resolve_failure_moves_loader_to_failed() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path(format!("/g/{GID}/{TOKEN}/")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let cache = TempDir::new().unwrap();
    let loader = PageLoader::new(remote(), None, services(cache.path(), &server.uri()).await);

    loader.start();
    assert!(!loader.await_ready().await);
    assert_eq!(loader.state(), LoaderState::Failed);
    assert!(matches!(
        loader.last_error().as_deref(),
        Some(LoaderError::Resolve { .. })
    ));
    assert!(matches!(loader.request_page(0).await, Err(LoaderError::NotReady)));
}

#[tokio::test]
async fn test_requests_before_ready_and_out_of_bounds_are_rejected() {
    let server = require_mock_server!();
    mount_gallery(&server, GID, TOKEN, 10).await;
    let cache = TempDir::new().unwrap();
    let loader = PageLoader::new(remote(), None, services(cache.path(), &server.uri()).await);

    assert!(matches!(loader.request_page(0).await, Err(LoaderError::NotReady)));
    assert!(matches!(loader.prefetch(0), Err(LoaderError::NotReady)));

    loader.start();
    assert!(loader.await_ready().await);
    assert!(matches!(
        loader.request_page(10).await,
        Err(LoaderError::OutOfBounds { index: 10, size: 10 })
    ));
    assert!(loader.page_state(10).is_none());
}

// ==================== Page loads ====================

#[tokio::test]
async fn test_out_of_order_request_loads_only_that_page() {
    let server = require_mock_server!();
    mount_gallery(&server, GID, TOKEN, 10).await;
    let cache = TempDir::new().unwrap();
    let loader = ready_loader(services(cache.path(), &server.uri()).await).await;

    let page = loader.request_page(8).await.unwrap();
    assert_eq!(page.index, 8);
    assert_eq!(page.bytes.as_ref(), page_png(9).as_slice());
    assert_eq!(page.mime_type, "image/png");
    assert_eq!(page.dimensions, Some((17, 8)));
    assert!(!page.from_cache);

    let entry = loader.page_entry(8).unwrap();
    assert_eq!(entry.original_size, Some(page_png(9).len() as u64));
    assert_eq!(loader.image_filename(8).as_deref(), Some("009.png"));
    for index in (0..10).filter(|i| *i != 8) {
        assert!(matches!(loader.page_state(index), Some(PageState::NotRequested)));
    }
}

#[tokio::test]
async fn test_concurrent_requests_share_one_fetch() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path(image_path(GID, 1)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(page_png(1))
                .set_delay(Duration::from_millis(200)),
        )
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_gallery(&server, GID, TOKEN, 3).await;
    let cache = TempDir::new().unwrap();
    let loader = ready_loader(services(cache.path(), &server.uri()).await).await;

    let mut events = loader.subscribe_pages();
    let (a, b, c) = tokio::join!(
        loader.request_page(0),
        loader.request_page(0),
        loader.request_page(0)
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert_eq!(a.bytes, b.bytes);
    assert_eq!(b.bytes, c.bytes);

    let first = events.recv().await.unwrap();
    assert_eq!(first.index, 0);
    assert!(matches!(first.state, PageState::Loading));
    let second = events.recv().await.unwrap();
    assert!(matches!(second.state, PageState::Loaded(_)));

    // A finished page is served without another fetch.
    assert_eq!(loader.request_page(0).await.unwrap().bytes, a.bytes);
}

#[tokio::test]
async fn test_failed_page_does_not_affect_siblings_and_can_be_retried() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path(image_path(GID, 2)))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(1)
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_gallery(&server, GID, TOKEN, 3).await;
    let cache = TempDir::new().unwrap();
    let loader = ready_loader(services(cache.path(), &server.uri()).await).await;

    let error = loader.request_page(1).await.unwrap_err();
    assert!(matches!(error, LoaderError::Page(ref page) if page.index() == 1));
    assert!(matches!(loader.page_state(1), Some(PageState::LoadFailed(_))));
    assert!(
        matches!(loader.request_page(1).await, Err(LoaderError::Page(_))),
        "a failed page stays failed until retried"
    );

    assert!(loader.request_page(0).await.is_ok());
    assert!(loader.request_page(2).await.is_ok());

    let page = loader.retry_page(1, false).await.unwrap();
    assert_eq!(page.bytes.as_ref(), page_png(2).as_slice());
    assert!(matches!(loader.page_state(1), Some(PageState::Loaded(_))));
}

#[tokio::test]
async fn test_retry_sends_mirror_skip_key() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path(image_path(GID, 1)))
        .respond_with(ResponseTemplate::new(404))
        .with_priority(1)
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(viewer_path(GID, 1)))
        .and(wiremock::matchers::query_param("nl", "1-mirror"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            support::fixtures::viewer_html(&format!("{}{}", server.uri(), image_path(GID, 1)), "1-next"),
        ))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_gallery(&server, GID, TOKEN, 2).await;
    let cache = TempDir::new().unwrap();
    let loader = ready_loader(services(cache.path(), &server.uri()).await).await;

    assert!(loader.request_page(0).await.is_err());
    assert!(loader.retry_page(0, false).await.is_ok());
}

// ==================== Quality and decode settings ====================

#[tokio::test]
async fn test_retry_under_original_preference_keeps_original_bytes() {
    let server = require_mock_server!();
    let original = png(64, 48, [10, 20, 30, 255]);
    Mock::given(method("GET"))
        .and(path(original_path(GID, 1)))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(1)
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(original_path(GID, 1)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(original.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(image_path(GID, 1)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(page_png(1)))
        .with_priority(1)
        .expect(0)
        .mount(&server)
        .await;
    mount_original_viewer(&server, GID, 1).await;
    mount_pages(&server, GID, TOKEN, 1).await;
    let cache = TempDir::new().unwrap();
    let mut options = options(&server.uri());
    options.quality = Quality::Original;
    let shared = services_with(cache.path(), options).await;

    let first = ready_loader(shared.clone()).await;
    assert!(first.request_page(0).await.is_err());
    let page = first.retry_page(0, false).await.unwrap();
    assert_eq!(page.bytes.as_ref(), original.as_slice());
    tokio::time::sleep(Duration::from_millis(100)).await;
    first.stop().await;

    let scope = remote().cache_scope();
    let cached = shared.caches.images().get(&raw_cache_key(&scope, 0, Quality::Original)).await;
    assert_eq!(cached.as_deref(), Some(original.as_slice()));

    let second = ready_loader(shared).await;
    let again = second.request_page(0).await.unwrap();
    assert!(again.from_cache);
    assert_eq!(again.bytes.as_ref(), original.as_slice());
}

#[tokio::test]
async fn test_retry_upgrades_loaded_page_to_original() {
    let server = require_mock_server!();
    let original = png(64, 48, [10, 20, 30, 255]);
    Mock::given(method("GET"))
        .and(path(original_path(GID, 1)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(original.clone()))
        .expect(1)
        .mount(&server)
        .await;
    mount_original_viewer(&server, GID, 1).await;
    mount_gallery(&server, GID, TOKEN, 2).await;
    let cache = TempDir::new().unwrap();
    let shared = services(cache.path(), &server.uri()).await;
    let loader = ready_loader(shared.clone()).await;

    let resized = loader.request_page(0).await.unwrap();
    assert_eq!(resized.bytes.as_ref(), page_png(1).as_slice());
    assert!(matches!(loader.page_state(0), Some(PageState::Loaded(_))));

    let upgraded = loader.retry_page(0, true).await.unwrap();
    assert_eq!(upgraded.bytes.as_ref(), original.as_slice());
    assert!(!upgraded.from_cache);
    assert!(matches!(
        loader.page_state(0),
        Some(PageState::Loaded(ref page)) if page.bytes.as_ref() == original.as_slice()
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let images = shared.caches.images();
    let scope = remote().cache_scope();
    assert!(images.contains(&raw_cache_key(&scope, 0, Quality::Original)).await);
    assert!(images.contains(&raw_cache_key(&scope, 0, Quality::Resized)).await);
}

#[tokio::test]
async fn test_toggling_crop_drops_cropped_entry_and_serves_uncropped_page() {
    let server = require_mock_server!();
    mount_pages(&server, GID, TOKEN, 1).await;
    let framed = framed_png(20, 30, 4);
    Mock::given(method("GET"))
        .and(path(image_path(GID, 1)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(framed.clone()))
        .expect(1)
        .mount(&server)
        .await;
    let cache = TempDir::new().unwrap();
    let mut options = options(&server.uri());
    options.decode.crop_borders = true;
    let shared = services_with(cache.path(), options).await;
    let loader = ready_loader(shared.clone()).await;

    let cropped = loader.request_page(0).await.unwrap();
    assert_eq!(cropped.dimensions, Some((12, 22)));
    assert_eq!(cropped.mime_type, "image/png");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let images = shared.caches.images();
    let scope = remote().cache_scope();
    let cropped_key = decoded_cache_key(&scope, 0, Quality::Resized, true);
    assert!(images.contains(&cropped_key).await);

    loader.set_crop_borders(false).await;
    assert!(matches!(loader.page_state(0), Some(PageState::NotRequested)));
    assert!(!images.contains(&cropped_key).await);
    assert!(images.contains(&raw_cache_key(&scope, 0, Quality::Resized)).await);

    assert!(loader.await_ready().await);
    let plain = loader.request_page(0).await.unwrap();
    assert!(plain.from_cache);
    assert_eq!(plain.bytes.as_ref(), framed.as_slice());
    let decoded = image::load_from_memory(&plain.bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (20, 30));
}

// ==================== Cancellation ====================

#[tokio::test]
async fn test_stop_interrupts_waiters_and_leaves_no_tasks() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path(image_path(GID, 1)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(page_png(1))
                .set_delay(Duration::from_secs(10)),
        )
        .with_priority(1)
        .mount(&server)
        .await;
    mount_gallery(&server, GID, TOKEN, 3).await;
    let cache = TempDir::new().unwrap();
    let loader = ready_loader(services(cache.path(), &server.uri()).await).await;

    loader.prefetch(0).unwrap();
    let waiter = tokio::spawn({
        let loader = loader.clone();
        async move { loader.request_page(0).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(loader.page_state(0), Some(PageState::Loading)));

    loader.stop().await;
    assert_eq!(loader.outstanding_tasks(), 0);
    assert_eq!(loader.state(), LoaderState::Stopped);
    assert!(loader.source().is_none());
    assert!(matches!(
        waiter.await.unwrap(),
        Err(LoaderError::Interrupted { index: 0 })
    ));

    // Stopping twice is harmless and start() no longer does anything.
    loader.stop().await;
    loader.start();
    assert_eq!(loader.state(), LoaderState::Stopped);
    assert!(matches!(loader.request_page(1).await, Err(LoaderError::NotReady)));
}

#[tokio::test]
async fn test_restart_resets_pages_and_reloads() {
    let server = require_mock_server!();
    mount_pages(&server, GID, TOKEN, 5).await;
    Mock::given(method("GET"))
        .and(path(image_path(GID, 3)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(page_png(3)))
        .expect(1)
        .mount(&server)
        .await;
    let cache = TempDir::new().unwrap();
    let loader = ready_loader(services(cache.path(), &server.uri()).await).await;

    let first = loader.request_page(2).await.unwrap();
    assert!(!first.from_cache);
    // Let the cache write land.
    tokio::time::sleep(Duration::from_millis(100)).await;

    loader.restart().await;
    assert!(matches!(loader.page_state(2), Some(PageState::NotRequested)));

    assert!(loader.await_ready().await);
    let again = loader.request_page(2).await.unwrap();
    assert_eq!(again.bytes, first.bytes);
    assert!(again.from_cache, "raw bytes survive a restart");
}

#[tokio::test]
async fn test_restart_interrupts_pending_request() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path(image_path(GID, 1)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(page_png(1))
                .set_delay(Duration::from_secs(10)),
        )
        .with_priority(1)
        .mount(&server)
        .await;
    mount_gallery(&server, GID, TOKEN, 2).await;
    let cache = TempDir::new().unwrap();
    let loader = ready_loader(services(cache.path(), &server.uri()).await).await;

    let waiter = tokio::spawn({
        let loader = loader.clone();
        async move { loader.request_page(0).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    loader.restart().await;
    assert!(matches!(
        waiter.await.unwrap(),
        Err(LoaderError::Interrupted { index: 0 })
    ));
    assert!(loader.await_ready().await);
    assert_eq!(loader.size(), Some(2));
}

// ==================== Shared caches ====================

#[tokio::test]
async fn test_second_loader_reads_pages_from_disk_cache() {
    let server = require_mock_server!();
    mount_pages(&server, GID, TOKEN, 2).await;
    Mock::given(method("GET"))
        .and(path(image_path(GID, 1)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(page_png(1)))
        .expect(1)
        .mount(&server)
        .await;
    let cache = TempDir::new().unwrap();
    let shared = services(cache.path(), &server.uri()).await;

    let first = ready_loader(shared.clone()).await;
    first.request_page(0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    first.stop().await;

    let second = ready_loader(shared).await;
    let page = second.request_page(0).await.unwrap();
    assert!(page.from_cache);
    assert_eq!(page.bytes.as_ref(), page_png(1).as_slice());
}

#[tokio::test]
async fn test_favorite_events_patch_cached_detail() {
    let server = require_mock_server!();
    mount_gallery(&server, GID, TOKEN, 2).await;
    let cache = TempDir::new().unwrap();
    let store: PageCacheStore = support::fixtures::open_store(cache.path()).await;
    let services = LoaderServices::new(HttpClient::new(), store.clone())
        .with_options(options(&server.uri()));
    let loader = ready_loader(services).await;

    let (events, receiver) = tokio::sync::broadcast::channel(4);
    let listener = store.metadata().subscribe(receiver);
    events
        .send(FavoriteStatusEvent {
            gid: GID,
            slot: Some(3),
        })
        .unwrap();
    drop(events);
    listener.await.unwrap();

    assert_eq!(loader.detail().unwrap().favorite_slot(), Some(3));
}

#[tokio::test]
async fn test_downloaded_archive_replaces_remote_source() {
    let dir = TempDir::new().unwrap();
    let pages = write_gallery_zip(&dir.path().join(format!("{GID}-fixture.zip")), None);
    let cache = TempDir::new().unwrap();
    // Nothing listens here; every page must come from the archive.
    let services = services(cache.path(), "http://127.0.0.1:9")
        .await
        .with_archives(Arc::new(DirectoryArchiveLookup::new(dir.path())));

    let loader = ready_loader(services).await;
    assert_eq!(loader.size(), Some(3));
    assert_eq!(loader.source().unwrap().kind(), "archive");
    let page = loader.request_page(2).await.unwrap();
    assert_eq!(page.bytes.as_ref(), pages[2].as_slice());
    assert_eq!(loader.image_filename(2).as_deref(), Some("10.png"));
}

#[tokio::test]
async fn test_missing_archive_fails_resolution() {
    let cache = TempDir::new().unwrap();
    let loader = PageLoader::new(
        GalleryRef::archive(cache.path().join("missing.zip")),
        None,
        services(cache.path(), "http://127.0.0.1:9").await,
    );
    loader.start();
    assert!(!loader.await_ready().await);
    let error = loader.last_error().unwrap();
    assert!(matches!(
        &*error,
        LoaderError::Resolve {
            source: SourceError::Io { .. },
            ..
        }
    ));
}
