//! Gallery, image and archive fixtures.

use std::fs::File;
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::Duration;

use gallery_core::cache::{CacheBudget, PageCacheStore};
use gallery_core::loader::{LoaderOptions, LoaderServices};
use gallery_core::net::{HttpClient, RetryPolicy};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;
use zip::{AesMode, ZipWriter};

pub const GID: u64 = 1;
pub const TOKEN: &str = "abc";
pub const TITLE: &str = "Fixture Gallery";

/// Encodes a solid-colour PNG.
pub fn png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba(rgba));
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

fn framed(width: u32, height: u32, margin: u32) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
        let inside = x >= margin && y >= margin && x < width - margin && y < height - margin;
        if inside { Rgba([0, 0, 0, 255]) } else { Rgba([255, 255, 255, 255]) }
    }))
}

/// Black page inside a white `margin`-pixel frame.
pub fn framed_png(width: u32, height: u32, margin: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    framed(width, height, margin)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// JPEG rendition of [`framed_png`].
pub fn framed_jpeg(width: u32, height: u32, margin: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(framed(width, height, margin).to_rgb8())
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
        .unwrap();
    buf
}

/// Distinct PNG for 1-based page `page`.
pub fn page_png(page: usize) -> Vec<u8> {
    let shade = u8::try_from(page * 20 % 256).unwrap();
    png(8 + u32::try_from(page).unwrap(), 8, [shade, 40, 200, 255])
}

pub fn viewer_path(gid: u64, page: usize) -> String {
    format!("/s/p{page:03}/{gid}-{page}")
}

pub fn image_path(gid: u64, page: usize) -> String {
    format!("/img/{gid}/{page:03}.png")
}

pub fn listing_html(base: &str, gid: u64, title: &str, total: usize) -> String {
    let links: String = (1..=total)
        .map(|page| format!(r#"<a href="{base}{}"><img></a>"#, viewer_path(gid, page)))
        .collect();
    format!(
        r#"<html><h1 id="gn">{title}</h1>
        <div id="taglist"><a id="ta_language:english">english</a></div>
        <table><tr><td class="gdt1">Length:</td><td class="gdt2">{total} pages</td></tr></table>
        <div id="gdt">{links}</div></html>"#
    )
}

pub fn viewer_html(image_url: &str, skip_key: &str) -> String {
    format!(
        r##"<div id="i3"><img id="img" src="{image_url}" /></div>
        <a href="#" id="loadfail" onclick="return nl('{skip_key}')">Reload broken image</a>"##
    )
}

pub fn original_path(gid: u64, page: usize) -> String {
    format!("/fullimg/{gid}/{page}/original.png")
}

/// Viewer that also links the full-size original.
pub fn viewer_html_with_original(image_url: &str, original_url: &str, skip_key: &str) -> String {
    format!(
        r#"{}<a href="{original_url}">Download original source</a>"#,
        viewer_html(image_url, skip_key)
    )
}

/// Overrides the viewer of 1-based page `page` with one linking an original.
pub async fn mount_original_viewer(server: &MockServer, gid: u64, page: usize) {
    let base = server.uri();
    let html = viewer_html_with_original(
        &format!("{base}{}", image_path(gid, page)),
        &format!("{base}{}", original_path(gid, page)),
        &format!("{page}-mirror"),
    );
    Mock::given(method("GET"))
        .and(path(viewer_path(gid, page)))
        .respond_with(ResponseTemplate::new(200).set_body_string(html))
        .with_priority(1)
        .mount(server)
        .await;
}

/// Mounts the listing and every viewer of a `total`-page gallery.
pub async fn mount_pages(server: &MockServer, gid: u64, token: &str, total: usize) {
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path(format!("/g/{gid}/{token}/")))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_html(&base, gid, TITLE, total)))
        .mount(server)
        .await;
    for page in 1..=total {
        let image_url = format!("{base}{}", image_path(gid, page));
        Mock::given(method("GET"))
            .and(path(viewer_path(gid, page)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(viewer_html(&image_url, &format!("{page}-mirror"))),
            )
            .mount(server)
            .await;
    }
}

/// Mounts the image of 1-based page `page`.
pub async fn mount_image(server: &MockServer, gid: u64, page: usize, bytes: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(image_path(gid, page)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(bytes),
        )
        .mount(server)
        .await;
}

/// Mounts listing, viewers and images of a `total`-page gallery.
pub async fn mount_gallery(server: &MockServer, gid: u64, token: &str, total: usize) {
    mount_pages(server, gid, token, total).await;
    for page in 1..=total {
        mount_image(server, gid, page, page_png(page)).await;
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2), 2.0)
}

pub fn options(base_url: &str) -> LoaderOptions {
    LoaderOptions {
        base_url: base_url.to_string(),
        retry: fast_retry(),
        ..LoaderOptions::default()
    }
}

pub async fn open_store(cache_dir: &Path) -> PageCacheStore {
    PageCacheStore::open(cache_dir, CacheBudget::default())
        .await
        .unwrap()
}

pub async fn services(cache_dir: &Path, base_url: &str) -> LoaderServices {
    services_with(cache_dir, options(base_url)).await
}

pub async fn services_with(cache_dir: &Path, options: LoaderOptions) -> LoaderServices {
    LoaderServices::new(HttpClient::new(), open_store(cache_dir).await).with_options(options)
}

/// Writes a ZIP with `entries`, encrypting every entry when `passphrase` is set.
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])], passphrase: Option<&str>) {
    let mut writer = ZipWriter::new(File::create(path).unwrap());
    let mut options = SimpleFileOptions::default();
    if let Some(passphrase) = passphrase {
        options = options.with_aes_encryption(AesMode::Aes256, passphrase);
    }
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
}

/// Three-page archive whose entries sort naturally as 1, 2, 10.
pub fn write_gallery_zip(path: &Path, passphrase: Option<&str>) -> Vec<Vec<u8>> {
    let pages = vec![page_png(1), page_png(2), page_png(10)];
    write_zip(
        path,
        &[
            ("10.png", pages[2].as_slice()),
            ("notes.txt", b"not an image".as_slice()),
            ("1.png", pages[0].as_slice()),
            ("2.png", pages[1].as_slice()),
        ],
        passphrase,
    );
    pages
}
