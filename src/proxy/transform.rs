use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use thiserror::Error;

use super::negotiate::{EffectiveParameters, OutputFormat};
use super::origin::ByteStream;

pub type TransformStream = BoxStream<'static, Result<Bytes, TransformError>>;

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_MAX_INPUT_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformParams {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub format: OutputFormat,
}

impl From<&EffectiveParameters> for TransformParams {
    fn from(params: &EffectiveParameters) -> Self {
        Self {
            max_width: params.width,
            max_height: params.height,
            format: params.format,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransformError {
    #[error("origin body failed: {0}")]
    Input(String),
    #[error("origin body exceeds {0} bytes")]
    InputTooLarge(usize),
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
    #[error("transform task failed: {0}")]
    Task(String),
}

impl TransformError {
    /// Which side of the pipeline broke, for log tagging.
    pub fn stage(&self) -> &'static str {
        match self {
            TransformError::Input(_) => "origin",
            _ => "transform",
        }
    }
}

/// Converts a streamed origin body into a streamed output body.
///
/// Errors appear in-band. An implementation may yield any number of chunks
/// before an error; the caller decides what that means for the client.
pub trait Transformer: Send + Sync {
    fn transform(&self, input: ByteStream, params: TransformParams) -> TransformStream;
}

/// Resizes with `image`, keeping the aspect ratio and never enlarging.
///
/// The body is buffered because the decoders need the whole image; codec
/// work runs on the blocking pool and the result is emitted in fixed-size
/// chunks.
#[derive(Debug, Clone)]
pub struct ImageTransformer {
    chunk_size: usize,
    max_input_bytes: usize,
}

impl Default for ImageTransformer {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
        }
    }
}

impl ImageTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_input_bytes(mut self, max_input_bytes: usize) -> Self {
        self.max_input_bytes = max_input_bytes;
        self
    }
}

impl Transformer for ImageTransformer {
    fn transform(&self, input: ByteStream, params: TransformParams) -> TransformStream {
        let chunk_size = self.chunk_size;
        let max_input_bytes = self.max_input_bytes;
        stream::once(async move {
            let source = collect_input(input, max_input_bytes).await?;
            tokio::task::spawn_blocking(move || render(source, params))
                .await
                .map_err(|err| TransformError::Task(err.to_string()))?
        })
        .map(move |rendered| match rendered {
            Ok(output) => {
                let chunks = split_chunks(output, chunk_size).into_iter().map(Ok);
                stream::iter(chunks).left_stream()
            }
            Err(err) => stream::once(future::ready(Err(err))).right_stream(),
        })
        .flatten()
        .boxed()
    }
}

async fn collect_input(mut input: ByteStream, limit: usize) -> Result<Bytes, TransformError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = input.next().await {
        let chunk = chunk.map_err(|err| TransformError::Input(err.to_string()))?;
        if buffer.len() + chunk.len() > limit {
            return Err(TransformError::InputTooLarge(limit));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

fn render(source: Bytes, params: TransformParams) -> Result<Bytes, TransformError> {
    let format = image::guess_format(&source).map_err(decode_error)?;
    let mut decoder = ImageReader::with_format(Cursor::new(&source[..]), format)
        .into_decoder()
        .map_err(decode_error)?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let (width, height) = oriented_dimensions(decoder.dimensions(), orientation);
    let target = fit_within(width, height, params.max_width, params.max_height);

    if target == (width, height)
        && orientation == Orientation::NoTransforms
        && params.format == OutputFormat::Original
    {
        return Ok(source.clone());
    }

    let mut image = DynamicImage::from_decoder(decoder).map_err(decode_error)?;
    image.apply_orientation(orientation);
    if target != (width, height) {
        image = image.resize_exact(target.0, target.1, FilterType::Lanczos3);
    }

    match params.format {
        OutputFormat::Webp => encode_webp(image),
        OutputFormat::Original => encode_as(image, format),
    }
}

fn encode_webp(image: DynamicImage) -> Result<Bytes, TransformError> {
    // The lossless encoder only takes 8-bit RGB(A).
    let image = if image.color().has_alpha() {
        DynamicImage::ImageRgba8(image.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8())
    };
    let mut buffer = Vec::new();
    let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut buffer);
    image.write_with_encoder(encoder).map_err(encode_error)?;
    Ok(Bytes::from(buffer))
}

fn encode_as(image: DynamicImage, format: ImageFormat) -> Result<Bytes, TransformError> {
    let image = if format == ImageFormat::Jpeg && image.color().has_alpha() {
        DynamicImage::ImageRgb8(image.to_rgb8())
    } else {
        image
    };
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, format).map_err(encode_error)?;
    Ok(Bytes::from(buffer.into_inner()))
}

fn oriented_dimensions((width, height): (u32, u32), orientation: Orientation) -> (u32, u32) {
    match orientation {
        Orientation::Rotate90
        | Orientation::Rotate270
        | Orientation::Rotate90FlipH
        | Orientation::Rotate270FlipH => (height, width),
        _ => (width, height),
    }
}

/// Largest size within the bounds that keeps the aspect ratio, capped at the
/// source size.
pub(crate) fn fit_within(
    width: u32,
    height: u32,
    max_width: Option<u32>,
    max_height: Option<u32>,
) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }
    let mut scale = 1.0_f64;
    if let Some(max_width) = max_width {
        scale = scale.min(f64::from(max_width) / f64::from(width));
    }
    if let Some(max_height) = max_height {
        scale = scale.min(f64::from(max_height) / f64::from(height));
    }
    if scale >= 1.0 {
        return (width, height);
    }
    let scaled = |side: u32| (f64::from(side) * scale).round().max(1.0) as u32;
    (scaled(width), scaled(height))
}

fn split_chunks(output: Bytes, chunk_size: usize) -> Vec<Bytes> {
    (0..output.len())
        .step_by(chunk_size)
        .map(|start| output.slice(start..(start + chunk_size).min(output.len())))
        .collect()
}

fn decode_error(err: impl std::fmt::Display) -> TransformError {
    TransformError::Decode(err.to_string())
}

fn encode_error(err: impl std::fmt::Display) -> TransformError {
    TransformError::Encode(err.to_string())
}
