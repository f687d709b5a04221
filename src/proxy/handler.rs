use std::net::SocketAddr;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::response::{Html, IntoResponse, Response};
use futures::future;
use futures::stream::{self, StreamExt};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Uri};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::AppContext;
use super::cache::{CacheKey, CachedEntry, EntryMetadata};
use super::error::ProxyError;
use super::negotiate::{ClientSignals, OutputFormat};
use super::origin::FALLBACK_CONTENT_TYPE;
use super::tee::{StageTarget, spawn_tee};
use super::transform::TransformParams;
use crate::logging::AccessLogBuilder;
use crate::metrics;

const ACCEPT_CH: HeaderName = HeaderName::from_static("accept-ch");
const IMG_CACHE: HeaderName = HeaderName::from_static("img-cache");
const WIDTH_HINT: HeaderName = HeaderName::from_static("width");
const DPR_HINT: HeaderName = HeaderName::from_static("dpr");

const ACCEPT_CH_VALUE: &str = "Width, DPR";
const CACHE_CONTROL_VALUE: &str = "public, s-maxage=8640000";
const VARY_VALUE: &str = "Accept, DPR, Width";
const HIT_VALUE: &str = "HIT";

const DEMO_IMAGE_PATH: &str = "journal/photos/roll1/000031-8.jpg";

pub(super) async fn health() -> &'static str {
    "HEALTHY"
}

pub(super) async fn demo_page(State(app): State<AppContext>) -> Html<String> {
    Html(demo_page_html(app.negotiator.origin_prefix()))
}

fn demo_page_html(origin_prefix: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
  <head>
    <meta http-equiv="Accept-CH" content="DPR, Width">
  </head>
  <body>
    <img width="500px" sizes="500px" src="/img/s/-/{origin_prefix}{DEMO_IMAGE_PATH}" />
  </body>
</html>
"#
    )
}

/// Per-request state the access log and failure logs need.
struct ImageRequest {
    url: String,
    key: Option<CacheKey>,
    lookup: Option<&'static str>,
}

pub(super) async fn serve_image(
    State(app): State<AppContext>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((_signature, dims, url)): Path<(String, String, String)>,
    RawQuery(query): RawQuery,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();
    let url = match query {
        Some(query) if !query.is_empty() => format!("{url}?{query}"),
        _ => url,
    };
    let mut request = ImageRequest {
        url,
        key: None,
        lookup: None,
    };

    let result = match split_dims(&dims) {
        Some((width, height)) => respond(&app, &mut request, width, height, &headers).await,
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    };

    let mut log = AccessLogBuilder::new(Some(peer))
        .method("GET")
        .path(uri.path())
        .origin_url(request.url.as_str());
    let mut response = match result {
        Ok(response) => response,
        Err(err) => {
            report_failure(&err, &request);
            log = log
                .error_reason(err.reason())
                .error_detail(err.to_string());
            err.into_response()
        }
    };
    response
        .headers_mut()
        .insert(ACCEPT_CH, HeaderValue::from_static(ACCEPT_CH_VALUE));

    if let Some(key) = &request.key {
        log = log.cache_key(key.file_stem());
    }
    if let Some(lookup) = request.lookup {
        log = log.cache_lookup(lookup);
    }
    log.status(response.status())
        .elapsed(started.elapsed())
        .log();
    response
}

async fn respond(
    app: &AppContext,
    request: &mut ImageRequest,
    path_width: &str,
    path_height: &str,
    headers: &HeaderMap,
) -> Result<Response, ProxyError> {
    let signals = ClientSignals {
        path_width,
        path_height,
        width_hint: header_str(headers, &WIDTH_HINT),
        dpr: header_str(headers, &DPR_HINT),
        accept: header_str(headers, &header::ACCEPT),
    };
    let params = app.negotiator.negotiate(&request.url, &signals)?;
    let key = CacheKey::derive(&request.url, &params);
    request.key = Some(key.clone());

    if app.cache.exists(&key).await {
        request.lookup = Some("hit");
        metrics::record_cache_lookup(true);
        let entry = app
            .cache
            .read(&key)
            .await
            .inspect_err(|_| metrics::record_cache_read_error())?;
        return Ok(hit_response(entry, params.format));
    }
    request.lookup = Some("miss");
    metrics::record_cache_lookup(false);

    let origin = app
        .fetcher
        .fetch(&request.url)
        .await
        .inspect_err(|err| metrics::record_origin_error(err.kind()))?;
    let content_type = params.format.content_type(&origin.content_type);
    let output = app
        .transformer
        .transform(origin.body, TransformParams::from(&params));

    let target = match app.cache.stage().await {
        Ok(staged) => Some(StageTarget {
            store: app.cache.clone(),
            staged,
            key: key.clone(),
            metadata: EntryMetadata::new(origin.content_type),
        }),
        Err(err) => {
            warn!(
                url = %request.url,
                key = %key,
                stage = "cache_write",
                error = ?err,
                "failed to stage cache entry; serving uncached"
            );
            metrics::record_cache_discard("stage");
            None
        }
    };

    let mut client = spawn_tee(
        output,
        target,
        request.url.clone(),
        app.settings.client_buffer_chunks,
    )
    .client;

    // Nothing is sent until the transform has produced its first chunk, so a
    // failure before that still gets a clean status.
    let body = match client.next().await {
        Some(Ok(first)) => Body::from_stream(stream::once(future::ready(Ok(first))).chain(client)),
        Some(Err(err)) => return Err(ProxyError::Transform(err)),
        None => Body::empty(),
    };

    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type_value(&content_type));
    apply_cache_headers(headers);
    Ok(response)
}

fn hit_response(entry: CachedEntry, format: OutputFormat) -> Response {
    let content_type = format.content_type(&entry.metadata.content_type);
    let mut response = Body::from_stream(ReaderStream::new(entry.file)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type_value(&content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(entry.content_length));
    headers.insert(IMG_CACHE, HeaderValue::from_static(HIT_VALUE));
    apply_cache_headers(headers);
    response
}

fn apply_cache_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CACHE_CONTROL_VALUE),
    );
    headers.insert(header::VARY, HeaderValue::from_static(VARY_VALUE));
}

fn content_type_value(content_type: &str) -> HeaderValue {
    HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_CONTENT_TYPE))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Splits a `{width}-{height}` segment where both sides are optional digit
/// runs.
fn split_dims(dims: &str) -> Option<(&str, &str)> {
    let (width, height) = dims.split_once('-')?;
    let digits = |value: &str| value.bytes().all(|b| b.is_ascii_digit());
    (digits(width) && digits(height)).then_some((width, height))
}

fn report_failure(err: &ProxyError, request: &ImageRequest) {
    let key = request.key.as_ref().map(|key| key.file_stem());
    match err {
        ProxyError::InvalidOrigin(_) => {
            debug!(url = %request.url, error = %err, "rejected origin outside allow-list")
        }
        ProxyError::OriginStatus(status) => {
            info!(
                url = %request.url,
                key,
                stage = "origin",
                status,
                "origin returned unexpected status"
            )
        }
        ProxyError::OriginFetch(fetch) => warn!(
            url = %request.url,
            key,
            stage = "origin",
            kind = fetch.kind(),
            error = %fetch,
            "origin fetch failed"
        ),
        // Already logged where the transform stream failed.
        ProxyError::Transform(_) => {}
        ProxyError::CacheRead(read) => warn!(
            url = %request.url,
            key,
            stage = "cache_read",
            error = %read,
            "cached entry unreadable"
        ),
    }
}
