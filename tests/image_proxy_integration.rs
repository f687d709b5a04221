mod support;

use anyhow::Result;
use image::GenericImageView;
use pictee::proxy::negotiate::OutputFormat;

use support::origin::{PHOTO_HEIGHT, PHOTO_WIDTH};
use support::*;

fn img_path(dims: &str, origin_url: &str) -> String {
    format!("/img/sig/{dims}/{origin_url}")
}

fn header<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

#[tokio::test]
async fn health_and_demo_page() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let proxy = ProxyHarness::spawn(&origin).await?;
    let client = http_client()?;

    let health = client.get(proxy.url("/")).send().await?;
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await?, "HEALTHY");

    let demo = client.get(proxy.url("/img")).send().await?;
    assert_eq!(demo.status(), 200);
    assert!(header(&demo, "content-type").unwrap_or_default().starts_with("text/html"));
    let html = demo.text().await?;
    assert!(html.contains(r#"http-equiv="Accept-CH""#), "{html}");
    assert!(html.contains(&format!("/img/s/-/{}", origin.prefix())), "{html}");
    Ok(())
}

#[tokio::test]
async fn original_format_without_dimensions_passes_through() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let proxy = ProxyHarness::spawn(&origin).await?;
    let url = origin.url("photo.png");

    let response = http_client()?
        .get(proxy.url(&img_path("-", &url)))
        .header("DPR", "2")
        .header("Accept", "text/html")
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "content-type"), Some("image/png"));
    assert_eq!(header(&response, "accept-ch"), Some("Width, DPR"));
    assert_eq!(
        header(&response, "cache-control"),
        Some("public, s-maxage=8640000")
    );
    assert_eq!(header(&response, "vary"), Some("Accept, DPR, Width"));
    assert!(header(&response, "img-cache").is_none());
    let body = response.bytes().await?;
    assert_eq!(&body, origin.photo());

    let key = key_for(&url, None, None, OutputFormat::Original);
    wait_for_entry(&proxy.cache, &key).await?;
    Ok(())
}

#[tokio::test]
async fn webp_miss_then_hit_serves_identical_bytes() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let proxy = ProxyHarness::spawn(&origin).await?;
    let client = http_client()?;
    let url = origin.url("photo.png");
    let path = img_path("300-0", &url);

    let miss = client
        .get(proxy.url(&path))
        .header("DPR", "2")
        .header("Accept", "image/webp,*/*")
        .send()
        .await?;
    assert_eq!(miss.status(), 200);
    assert_eq!(header(&miss, "content-type"), Some("image/webp"));
    assert!(header(&miss, "img-cache").is_none());
    let miss_body = miss.bytes().await?;
    let decoded = image::load_from_memory(&miss_body)?;
    assert_eq!(decoded.dimensions(), (600, 300));
    assert_eq!(origin.requests(), 1);

    let key = key_for(&url, Some(600), None, OutputFormat::Webp);
    assert_ne!(key, key_for(&url, None, None, OutputFormat::Original));
    wait_for_entry(&proxy.cache, &key).await?;

    let hit = client
        .get(proxy.url(&path))
        .header("DPR", "2")
        .header("Accept", "image/webp,*/*")
        .send()
        .await?;
    assert_eq!(hit.status(), 200);
    assert_eq!(header(&hit, "img-cache"), Some("HIT"));
    assert_eq!(header(&hit, "content-type"), Some("image/webp"));
    assert_eq!(header(&hit, "accept-ch"), Some("Width, DPR"));
    assert_eq!(
        header(&hit, "content-length"),
        Some(miss_body.len().to_string().as_str())
    );
    let hit_body = hit.bytes().await?;
    assert_eq!(hit_body, miss_body);
    assert_eq!(origin.requests(), 1);
    Ok(())
}

#[tokio::test]
async fn width_hint_overrides_path_and_dpr() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let proxy = ProxyHarness::spawn(&origin).await?;
    let url = origin.url("photo.png");

    let response = http_client()?
        .get(proxy.url(&img_path("300-", &url)))
        .header("Width", "200")
        .header("DPR", "3")
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "content-type"), Some("image/png"));
    let decoded = image::load_from_memory(&response.bytes().await?)?;
    assert_eq!(decoded.dimensions(), (200, 100));

    let key = key_for(&url, Some(200), None, OutputFormat::Original);
    wait_for_entry(&proxy.cache, &key).await?;
    Ok(())
}

#[tokio::test]
async fn larger_bounds_never_enlarge() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let proxy = ProxyHarness::spawn(&origin).await?;
    let url = origin.url("photo.png");

    let response = http_client()?
        .get(proxy.url(&img_path("-2000", &url)))
        .header("Accept", "image/webp")
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let decoded = image::load_from_memory(&response.bytes().await?)?;
    assert_eq!(decoded.dimensions(), (PHOTO_WIDTH, PHOTO_HEIGHT));
    Ok(())
}

#[tokio::test]
async fn origin_outside_allow_list_is_rejected_without_egress() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let proxy = ProxyHarness::spawn(&origin).await?;

    let response = http_client()?
        .get(proxy.url(&img_path("-", "http://evil.example/a.jpg")))
        .send()
        .await?;
    assert_eq!(response.status(), 400);
    assert_eq!(header(&response, "accept-ch"), Some("Width, DPR"));
    assert_eq!(origin.requests(), 0);
    assert!(dir_entries(&proxy.entries_dir())?.is_empty());
    assert!(dir_entries(&proxy.staging_dir())?.is_empty());
    Ok(())
}

#[tokio::test]
async fn origin_error_status_is_reported_as_bad_request() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let proxy = ProxyHarness::spawn(&origin).await?;

    let response = http_client()?
        .get(proxy.url(&img_path("100-", &origin.url("missing.png"))))
        .send()
        .await?;
    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await?, "Unexpected status: 404");
    assert_eq!(origin.requests(), 1);
    assert!(dir_entries(&proxy.entries_dir())?.is_empty());
    Ok(())
}

#[tokio::test]
async fn undecodable_origin_body_is_a_server_error_and_not_cached() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let proxy = ProxyHarness::spawn(&origin).await?;
    let url = origin.url("broken.png");

    let response = http_client()?
        .get(proxy.url(&img_path("100-", &url)))
        .send()
        .await?;
    assert_eq!(response.status(), 500);

    wait_for_empty_dir(&proxy.staging_dir()).await?;
    let key = key_for(&url, Some(100), None, OutputFormat::Original);
    assert!(!proxy.cache.exists(&key).await);
    assert!(dir_entries(&proxy.entries_dir())?.is_empty());
    Ok(())
}

#[tokio::test]
async fn unreachable_origin_is_a_server_error() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let unreachable = std::net::TcpListener::bind("127.0.0.1:0")?;
    let dead_prefix = format!("http://{}/", unreachable.local_addr()?);
    drop(unreachable);
    let prefix = dead_prefix.clone();
    let proxy = ProxyHarness::spawn_with(&origin, move |settings| {
        settings.origin_prefix = prefix;
    })
    .await?;

    let response = http_client()?
        .get(proxy.url(&img_path("-", &format!("{dead_prefix}a.png"))))
        .send()
        .await?;
    assert_eq!(response.status(), 500);
    assert!(dir_entries(&proxy.entries_dir())?.is_empty());
    Ok(())
}

#[tokio::test]
async fn malformed_dimensions_are_not_routed() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let proxy = ProxyHarness::spawn(&origin).await?;

    let response = http_client()?
        .get(proxy.url(&img_path("wide-", &origin.url("photo.png"))))
        .send()
        .await?;
    assert_eq!(response.status(), 404);
    assert_eq!(origin.requests(), 0);
    Ok(())
}

#[tokio::test]
async fn query_string_is_forwarded_to_origin() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let proxy = ProxyHarness::spawn(&origin).await?;

    let response = http_client()?
        .get(proxy.url(&format!(
            "{}?v=2",
            img_path("-", &origin.url("photo.png"))
        )))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    assert_eq!(origin.seen(), vec!["/photo.png?v=2".to_string()]);

    let key = key_for(
        &origin.url("photo.png?v=2"),
        None,
        None,
        OutputFormat::Original,
    );
    wait_for_entry(&proxy.cache, &key).await?;
    Ok(())
}

#[tokio::test]
async fn client_disconnect_still_commits_entry() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let proxy = ProxyHarness::spawn_with(&origin, |settings| {
        settings.client_buffer_chunks = 1;
    })
    .await?;
    let url = origin.url("noise.png");

    let mut stream = proxy.connect().await?;
    let head = send_raw_get(
        &mut stream,
        &img_path("-", &url),
        &[("Accept", "image/webp"), ("Connection", "close")],
    )
    .await?;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    drop(stream);

    let key = key_for(&url, None, None, OutputFormat::Webp);
    wait_for_entry(&proxy.cache, &key).await?;
    wait_for_empty_dir(&proxy.staging_dir()).await?;

    let hit = http_client()?
        .get(proxy.url(&img_path("-", &url)))
        .header("Accept", "image/webp")
        .send()
        .await?;
    assert_eq!(header(&hit, "img-cache"), Some("HIT"));
    let decoded = image::load_from_memory(&hit.bytes().await?)?;
    assert_eq!(decoded.dimensions(), (512, 512));
    assert_eq!(origin.requests(), 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_misses_both_succeed() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let proxy = ProxyHarness::spawn(&origin).await?;
    let client = http_client()?;
    let url = origin.url("photo.png");
    let target = proxy.url(&img_path("100-", &url));

    let (a, b) = tokio::join!(
        client.get(&target).header("Accept", "image/webp").send(),
        client.get(&target).header("Accept", "image/webp").send()
    );
    let (a, b) = (a?.bytes().await?, b?.bytes().await?);
    assert_eq!(a, b);

    let key = key_for(&url, Some(100), None, OutputFormat::Webp);
    wait_for_entry(&proxy.cache, &key).await?;
    wait_for_empty_dir(&proxy.staging_dir()).await?;
    assert_eq!(std::fs::read(proxy.cache.payload_path(&key))?, a.to_vec());
    Ok(())
}

#[tokio::test]
async fn corrupt_entry_fails_loudly() -> Result<()> {
    let origin = OriginFixture::spawn().await?;
    let proxy = ProxyHarness::spawn(&origin).await?;
    let client = http_client()?;
    let url = origin.url("photo.png");
    let path = img_path("50-", &url);

    let first = client.get(proxy.url(&path)).send().await?;
    assert_eq!(first.status(), 200);
    let key = key_for(&url, Some(50), None, OutputFormat::Original);
    wait_for_entry(&proxy.cache, &key).await?;
    std::fs::remove_file(proxy.cache.metadata_path(&key))?;

    let second = client.get(proxy.url(&path)).send().await?;
    assert_eq!(second.status(), 500);
    assert_eq!(origin.requests(), 1);
    Ok(())
}
