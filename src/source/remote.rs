//! Remote gallery source: listing pages, viewer pages, image bytes.
//!
//! Resolution walks the gallery listing (`/g/{gid}/{token}/?p=N`) until every
//! page link is known. Each page fetch then loads the page's viewer
//! (`/s/{ptoken}/{gid}-{page}`) for its image URL and downloads the image.
//! Image URLs are remembered per page; [`RemoteSource::retry_page`] bypasses
//! them and passes the server's mirror-skip key back.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use regex::Regex;
use tracing::{debug, info, instrument};
use url::Url;

use super::{PageData, Quality, ResolvedGallery, SourceError};
use crate::cache::MetadataCache;
use crate::gallery::GalleryDetail;
use crate::net::{HttpClient, RetryPolicy, with_retry};

fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"(?s)<h1 id="gn">(.*?)</h1>"#));
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r#"id="ta_([^"]+)""#));
static LENGTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"Length:</td><td class="gdt2">(\d+) pages?"#)
});
static PAGE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"href="([^"]*/s/([0-9a-z]+)/(\d+)-(\d+))""#)
});
static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"<img id="img" src="([^"]+)""#));
static SKIP_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"onclick="return nl\('([^']+)'\)""#));
static ORIGINAL_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"href="([^"]+/fullimg[^"]*)""#));

/// What is known about one page's viewer.
#[derive(Debug, Clone, Default)]
struct PageLink {
    viewer_url: String,
    image_url: Option<String>,
    original_url: Option<String>,
    skip_key: Option<String>,
}

/// Parsed viewer page.
#[derive(Debug, Clone)]
struct Viewer {
    image_url: String,
    original_url: Option<String>,
    skip_key: Option<String>,
}

impl Viewer {
    fn url_for(&self, quality: Quality) -> &str {
        match (quality, &self.original_url) {
            (Quality::Original, Some(original)) => original,
            _ => &self.image_url,
        }
    }
}

/// Gallery hosted on the remote site.
#[derive(Debug)]
pub struct RemoteSource {
    client: HttpClient,
    base_url: String,
    gid: u64,
    token: String,
    metadata: Arc<MetadataCache>,
    retry: RetryPolicy,
    pages: Mutex<Vec<PageLink>>,
}

impl RemoteSource {
    /// Creates a source for gallery `gid`/`token` on `base_url`.
    pub fn new(
        client: HttpClient,
        base_url: impl Into<String>,
        gid: u64,
        token: impl Into<String>,
        metadata: Arc<MetadataCache>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            gid,
            token: token.into(),
            metadata,
            retry: RetryPolicy::default(),
            pages: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the retry policy used for every request.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Gallery id.
    #[must_use]
    pub fn gid(&self) -> u64 {
        self.gid
    }

    fn listing_url(&self, listing: usize) -> String {
        format!(
            "{}/g/{}/{}/?p={listing}",
            self.base_url, self.gid, self.token
        )
    }

    fn pages(&self) -> MutexGuard<'_, Vec<PageLink>> {
        // A poisoned lock only means another fetch panicked mid-update; the
        // links are still usable.
        self.pages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn link(&self, index: usize) -> Result<PageLink, SourceError> {
        let pages = self.pages();
        pages
            .get(index)
            .cloned()
            .ok_or(SourceError::PageOutOfRange {
                index,
                size: pages.len(),
            })
    }

    async fn get_text(&self, url: &str) -> Result<String, SourceError> {
        let client = &self.client;
        Ok(with_retry(&self.retry, || client.get_text(url)).await?)
    }

    /// Walks the listing until every page link is known.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Fetch`] when a listing page cannot be loaded and
    /// [`SourceError::Parse`] when it lacks the title, the page count, or links.
    #[instrument(skip(self), fields(gid = self.gid))]
    pub async fn resolve(&self) -> Result<ResolvedGallery, SourceError> {
        let cached = self.metadata.get(self.gid);
        let mut total = cached.as_ref().map(|detail| detail.pages);
        let mut title = None;
        let mut tags = Vec::new();
        let mut links: BTreeMap<usize, String> = BTreeMap::new();

        let mut listing = 0;
        loop {
            let url = self.listing_url(listing);
            let html = self.get_text(&url).await?;

            if listing == 0 {
                title = Some(parse_title(&html).ok_or_else(|| {
                    SourceError::parse(&url, "gallery title not found")
                })?);
                tags = parse_tags(&html);
                if total.is_none() {
                    total = Some(parse_length(&html).ok_or_else(|| {
                        SourceError::parse(&url, "page count not found")
                    })?);
                }
            }
            let expected = total.unwrap_or(0);

            let before = links.len();
            for (page, viewer_url) in parse_page_links(&html, self.gid) {
                links.entry(page).or_insert(viewer_url);
            }
            debug!(listing, known = links.len(), expected, "parsed listing page");

            if links.len() >= expected {
                break;
            }
            if links.len() == before {
                return Err(SourceError::parse(
                    &url,
                    format!("listing ended after {} of {expected} page links", links.len()),
                ));
            }
            listing += 1;
        }

        let total = total.unwrap_or(0);
        let mut pages = Vec::with_capacity(total);
        for page in 1..=total {
            let viewer_url = links.remove(&page).ok_or_else(|| {
                SourceError::parse(self.listing_url(0), format!("no link for page {page}"))
            })?;
            pages.push(PageLink {
                viewer_url,
                ..PageLink::default()
            });
        }
        *self.pages() = pages;

        let detail = match cached {
            Some(detail) if detail.pages == total => detail,
            _ => {
                let detail = Arc::new(GalleryDetail::new(
                    self.gid,
                    self.token.clone(),
                    title.unwrap_or_default(),
                    tags,
                    total,
                ));
                self.metadata.put(self.gid, Arc::clone(&detail));
                detail
            }
        };
        info!(gid = self.gid, pages = total, title = %detail.title, "gallery resolved");

        Ok(ResolvedGallery {
            pages: total,
            filenames: vec![None; total],
            detail: Some(detail),
        })
    }

    /// Loads and parses the viewer for page `index`, remembering its URLs.
    async fn viewer(&self, index: usize, skip_key: Option<&str>) -> Result<Viewer, SourceError> {
        let link = self.link(index)?;
        let url = match skip_key {
            Some(key) => format!("{}?nl={key}", link.viewer_url),
            None => link.viewer_url,
        };
        let html = self.get_text(&url).await?;
        let viewer = parse_viewer(&html).ok_or_else(|| SourceError::parse(&url, "image not found"))?;

        if let Some(link) = self.pages().get_mut(index) {
            link.image_url = Some(viewer.image_url.clone());
            link.original_url.clone_from(&viewer.original_url);
            link.skip_key.clone_from(&viewer.skip_key);
        }
        Ok(viewer)
    }

    async fn download(&self, url: &str) -> Result<PageData, SourceError> {
        let client = &self.client;
        let bytes = with_retry(&self.retry, || client.get_bytes(url)).await?;
        debug!(url, len = bytes.len(), "downloaded image");
        Ok(PageData::single(bytes, filename_from_url(url)))
    }

    /// Fetches page `index`, reusing a remembered image URL when there is one.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::PageOutOfRange`] before resolution or past the
    /// end, otherwise the fetch or parse failure for this page.
    #[instrument(skip(self), fields(gid = self.gid))]
    pub async fn fetch_page(&self, index: usize, quality: Quality) -> Result<PageData, SourceError> {
        let link = self.link(index)?;
        let remembered = match quality {
            Quality::Original => link.original_url.or(link.image_url),
            Quality::Resized => link.image_url,
        };
        let url = match remembered {
            Some(url) => url,
            None => self.viewer(index, None).await?.url_for(quality).to_string(),
        };
        self.download(&url).await
    }

    /// Fetches page `index` again through a fresh viewer request.
    ///
    /// The last seen mirror-skip key is sent so the server picks another
    /// image host.
    ///
    /// # Errors
    ///
    /// Same as [`RemoteSource::fetch_page`].
    #[instrument(skip(self), fields(gid = self.gid))]
    pub async fn retry_page(&self, index: usize, quality: Quality) -> Result<PageData, SourceError> {
        let link = self.link(index)?;
        let viewer = self.viewer(index, link.skip_key.as_deref()).await?;
        self.download(viewer.url_for(quality)).await
    }
}

/// Last non-empty path segment of `url`.
#[must_use]
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

fn unescape(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn parse_title(html: &str) -> Option<String> {
    TITLE_RE
        .captures(html)
        .map(|caps| unescape(caps[1].trim()))
        .filter(|title| !title.is_empty())
}

fn parse_tags(html: &str) -> Vec<String> {
    TAG_RE
        .captures_iter(html)
        .map(|caps| caps[1].replace('_', " "))
        .collect()
}

fn parse_length(html: &str) -> Option<usize> {
    LENGTH_RE.captures(html)?[1].parse().ok()
}

/// Returns `(1-based page, viewer URL)` for every link of gallery `gid`.
fn parse_page_links(html: &str, gid: u64) -> Vec<(usize, String)> {
    PAGE_LINK_RE
        .captures_iter(html)
        .filter(|caps| caps[3].parse::<u64>().ok() == Some(gid))
        .filter_map(|caps| Some((caps[4].parse().ok()?, unescape(&caps[1]))))
        .collect()
}

fn parse_viewer(html: &str) -> Option<Viewer> {
    let image_url = unescape(&IMAGE_RE.captures(html)?[1]);
    Some(Viewer {
        image_url,
        original_url: ORIGINAL_RE.captures(html).map(|caps| unescape(&caps[1])),
        skip_key: SKIP_KEY_RE.captures(html).map(|caps| caps[1].to_string()),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const VIEWER_HTML: &str = r##"<div id="i3"><a onclick="return load_image(2, 'bb')">
        <img id="img" src="https://img.example.org/h/abc/keystamp=1;fileindex=2/01.jpg" /></a></div>
        <a href="#" id="loadfail" onclick="return nl('43-77')">Reload broken image</a>
        <a href="https://example.org/fullimg/1/1/xyz/01.png">Download original</a>"##;

    fn listing_html(base: &str, title: &str, total: usize, pages: std::ops::RangeInclusive<usize>) -> String {
        let links: String = pages
            .map(|page| format!(r#"<a href="{base}/s/ab{page:02}/1-{page}"><img></a>"#))
            .collect();
        format!(
            r#"<h1 id="gn">{title}</h1><div id="taglist"><a id="ta_artist:some_one">x</a>
            <a id="ta_female:glasses">y</a></div>
            <tr><td class="gdt1">Length:</td><td class="gdt2">{total} pages</td></tr>
            <div id="gdt">{links}</div>"#
        )
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2), 2.0)
    }

    fn source(server: &MockServer, metadata: Arc<MetadataCache>) -> RemoteSource {
        RemoteSource::new(HttpClient::new(), server.uri(), 1, "abc", metadata)
            .with_retry_policy(fast_retry())
    }

    #[test]
    fn test_parse_title_and_tags() {
        let html = listing_html("https://e.org", "My &amp; Title", 3, 1..=3);
        assert_eq!(parse_title(&html).unwrap(), "My & Title");
        assert_eq!(parse_tags(&html), vec!["artist:some one", "female:glasses"]);
        assert_eq!(parse_length(&html), Some(3));
    }

    #[test]
    fn test_parse_page_links_filters_other_galleries() {
        let html = r#"<a href="https://e.org/s/aa/1-1"></a><a href="https://e.org/s/bb/2-1"></a>"#;
        assert_eq!(
            parse_page_links(html, 1),
            vec![(1, "https://e.org/s/aa/1-1".to_string())]
        );
    }

    #[test]
    fn test_parse_viewer() {
        let viewer = parse_viewer(VIEWER_HTML).unwrap();
        assert_eq!(
            viewer.image_url,
            "https://img.example.org/h/abc/keystamp=1;fileindex=2/01.jpg"
        );
        assert_eq!(viewer.skip_key.as_deref(), Some("43-77"));
        assert_eq!(
            viewer.url_for(Quality::Original),
            "https://example.org/fullimg/1/1/xyz/01.png"
        );
        assert!(parse_viewer("<html></html>").is_none());
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://img.example.org/h/abc/001.webp").as_deref(),
            Some("001.webp")
        );
        assert_eq!(
            filename_from_url("https://img.example.org/h/abc/002.png/").as_deref(),
            Some("002.png")
        );
        assert_eq!(filename_from_url("not a url"), None);
    }

    #[tokio::test]
    async fn test_resolve_walks_listing_pages() {
        let server = MockServer::start().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/g/1/abc/"))
            .and(query_param("p", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing_html(&base, "Title", 5, 1..=3)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/g/1/abc/"))
            .and(query_param("p", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing_html(&base, "Title", 5, 4..=5)))
            .expect(1)
            .mount(&server)
            .await;

        let metadata = Arc::new(MetadataCache::new(25));
        let source = source(&server, Arc::clone(&metadata));
        let resolved = source.resolve().await.unwrap();

        assert_eq!(resolved.pages, 5);
        assert_eq!(resolved.filenames, vec![None; 5]);
        let cached = metadata.get(1).unwrap();
        assert_eq!(cached.title, "Title");
        assert_eq!(cached.pages, 5);
        assert_eq!(source.link(4).unwrap().viewer_url, format!("{base}/s/ab05/1-5"));
    }

    #[tokio::test]
    async fn test_resolve_missing_links_is_parse_error() {
        let server = MockServer::start().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/g/1/abc/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing_html(&base, "Title", 4, 1..=2)))
            .mount(&server)
            .await;

        let source = source(&server, Arc::new(MetadataCache::new(25)));
        assert!(matches!(
            source.resolve().await,
            Err(SourceError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_keeps_cached_detail() {
        let server = MockServer::start().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/g/1/abc/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing_html(&base, "Title", 2, 1..=2)))
            .mount(&server)
            .await;

        let metadata = Arc::new(MetadataCache::new(25));
        let detail = Arc::new(GalleryDetail::new(1, "abc", "Cached", Vec::new(), 2));
        detail.set_favorite_slot(Some(3));
        metadata.put(1, Arc::clone(&detail));

        let resolved = source(&server, Arc::clone(&metadata)).resolve().await.unwrap();
        assert!(Arc::ptr_eq(resolved.detail.as_ref().unwrap(), &detail));
        assert_eq!(metadata.get(1).unwrap().favorite_slot(), Some(3));
    }

    #[tokio::test]
    async fn test_fetch_page_before_resolve_is_out_of_range() {
        let server = MockServer::start().await;
        let source = source(&server, Arc::new(MetadataCache::new(25)));
        assert!(matches!(
            source.fetch_page(0, Quality::Resized).await,
            Err(SourceError::PageOutOfRange { index: 0, size: 0 })
        ));
    }

    #[tokio::test]
    async fn test_fetch_and_retry_page() {
        let server = MockServer::start().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/g/1/abc/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing_html(&base, "Title", 1, 1..=1)))
            .mount(&server)
            .await;
        let viewer = format!(
            r#"<img id="img" src="{base}/img/first/001.jpg" /><a onclick="return nl('k-1')">x</a>"#
        );
        Mock::given(method("GET"))
            .and(path("/s/ab01/1-1"))
            .and(query_param("nl", "k-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!(r#"<img id="img" src="{base}/img/second/001.jpg" />"#)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/s/ab01/1-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(viewer))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/img/first/001.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"first".to_vec()))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/img/second/001.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"second".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let source = source(&server, Arc::new(MetadataCache::new(25)));
        source.resolve().await.unwrap();

        let page = source.fetch_page(0, Quality::Resized).await.unwrap();
        assert_eq!(page.parts[0].as_ref(), b"first");
        assert_eq!(page.filename.as_deref(), Some("001.jpg"));

        // Remembered image URL, no second viewer request.
        source.fetch_page(0, Quality::Resized).await.unwrap();

        let retried = source.retry_page(0, Quality::Resized).await.unwrap();
        assert_eq!(retried.parts[0].as_ref(), b"second");
    }

    #[tokio::test]
    async fn test_missing_image_is_fetch_error() {
        let server = MockServer::start().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/g/1/abc/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing_html(&base, "Title", 1, 1..=1)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/s/ab01/1-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!(r#"<img id="img" src="{base}/img/gone.jpg" />"#)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/img/gone.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let source = source(&server, Arc::new(MetadataCache::new(25)));
        source.resolve().await.unwrap();
        assert!(matches!(
            source.fetch_page(0, Quality::Resized).await,
            Err(SourceError::Fetch(crate::net::FetchError::HttpStatus { status: 404, .. }))
        ));
    }
}
