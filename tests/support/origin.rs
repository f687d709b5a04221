use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const PHOTO_WIDTH: u32 = 800;
pub const PHOTO_HEIGHT: u32 = 400;

#[derive(Clone)]
struct OriginState {
    photo: Bytes,
    noise: Bytes,
    requests: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<String>>>,
}

/// Origin image server. Serves:
///
/// * `/photo.png`: a smooth 800x400 PNG
/// * `/noise.png`: a large noisy PNG whose WebP output spans many chunks
/// * `/broken.png`: `image/png` bytes that are not an image
/// * anything else: 404
pub struct OriginFixture {
    addr: SocketAddr,
    state: OriginState,
    handle: JoinHandle<()>,
}

impl OriginFixture {
    pub async fn spawn() -> Result<Self> {
        let state = OriginState {
            photo: gradient_png(PHOTO_WIDTH, PHOTO_HEIGHT)?,
            noise: noise_png(512, 512)?,
            requests: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let app = Router::new()
            .fallback(serve_origin)
            .with_state(state.clone());
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self {
            addr,
            state,
            handle,
        })
    }

    /// Allow-list prefix covering every fixture path.
    pub fn prefix(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.prefix())
    }

    pub fn photo(&self) -> &Bytes {
        &self.state.photo
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Path and query of every request received so far.
    pub fn seen(&self) -> Vec<String> {
        self.state.seen.lock().unwrap().clone()
    }
}

impl Drop for OriginFixture {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_origin(State(state): State<OriginState>, uri: Uri) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let seen = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    state.seen.lock().unwrap().push(seen);

    let png = |body: Bytes| ([(header::CONTENT_TYPE, "image/png")], body).into_response();
    match uri.path() {
        "/photo.png" => png(state.photo.clone()),
        "/noise.png" => png(state.noise.clone()),
        "/broken.png" => png(Bytes::from_static(b"this is not a png at all")),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn gradient_png(width: u32, height: u32) -> Result<Bytes> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    encode_png(&image)
}

fn noise_png(width: u32, height: u32) -> Result<Bytes> {
    let mut seed: u32 = 0x9e37_79b9;
    let image = RgbImage::from_fn(width, height, |_, _| {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        let [r, g, b, _] = seed.to_le_bytes();
        Rgb([r, g, b])
    });
    encode_png(&image)
}

fn encode_png(image: &RgbImage) -> Result<Bytes> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(Bytes::from(buffer.into_inner()))
}
