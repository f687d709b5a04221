//! Turns request signals (path dimensions, client hints, `Accept`) into the
//! canonical parameters used for both the cache key and the transform.

use thiserror::Error;

pub const WEBP_CONTENT_TYPE: &str = "image/webp";

const DEFAULT_DPR: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    /// Keep the origin's encoding; the response mirrors the origin content type.
    Original,
    Webp,
}

impl OutputFormat {
    pub fn key_token(self) -> &'static str {
        match self {
            OutputFormat::Original => "original",
            OutputFormat::Webp => "webp",
        }
    }

    /// Content type served to the client given what the origin reported.
    pub fn content_type(self, origin_content_type: &str) -> String {
        match self {
            OutputFormat::Original => origin_content_type.to_string(),
            OutputFormat::Webp => WEBP_CONTENT_TYPE.to_string(),
        }
    }
}

/// At most one of `width`/`height` is set: an explicit width always wins and
/// the other dimension follows from the aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectiveParameters {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: OutputFormat,
}

/// Raw request inputs. Empty path dimensions mean "unspecified".
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientSignals<'a> {
    pub path_width: &'a str,
    pub path_height: &'a str,
    pub width_hint: Option<&'a str>,
    pub dpr: Option<&'a str>,
    pub accept: Option<&'a str>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("origin url {url:?} is outside the allowed prefix")]
pub struct InvalidOrigin {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct Negotiator {
    origin_prefix: String,
}

impl Negotiator {
    pub fn new(origin_prefix: impl Into<String>) -> Self {
        Self {
            origin_prefix: origin_prefix.into(),
        }
    }

    pub fn origin_prefix(&self) -> &str {
        &self.origin_prefix
    }

    pub fn check_origin(&self, url: &str) -> Result<(), InvalidOrigin> {
        if url.starts_with(&self.origin_prefix) {
            Ok(())
        } else {
            Err(InvalidOrigin {
                url: url.to_string(),
            })
        }
    }

    pub fn negotiate(
        &self,
        url: &str,
        signals: &ClientSignals<'_>,
    ) -> Result<EffectiveParameters, InvalidOrigin> {
        self.check_origin(url)?;

        let format = if signals
            .accept
            .is_some_and(|accept| accept.contains(WEBP_CONTENT_TYPE))
        {
            OutputFormat::Webp
        } else {
            OutputFormat::Original
        };

        if let Some(width) = signals.width_hint.and_then(parse_positive) {
            return Ok(EffectiveParameters {
                width: to_dimension(width),
                height: None,
                format,
            });
        }

        let dpr = parse_dpr(signals.dpr);
        let path_width = parse_path_dimension(signals.path_width);
        let path_height = parse_path_dimension(signals.path_height);

        // A width that resolves to unset gives way to the height.
        let (width, height) = match path_width.and_then(|width| to_dimension(width * dpr)) {
            Some(width) => (Some(width), None),
            None => (None, path_height.and_then(|height| to_dimension(height * dpr))),
        };

        Ok(EffectiveParameters {
            width,
            height,
            format,
        })
    }
}

fn parse_positive(value: &str) -> Option<f64> {
    let value = value.trim().parse::<f64>().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}

fn parse_dpr(value: Option<&str>) -> f64 {
    value.and_then(parse_positive).unwrap_or(DEFAULT_DPR)
}

fn parse_path_dimension(value: &str) -> Option<f64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse::<f64>().ok()
}

fn to_dimension(value: f64) -> Option<u32> {
    let rounded = value.round();
    if !rounded.is_finite() || rounded < 1.0 {
        None
    } else if rounded >= u32::MAX as f64 {
        Some(u32::MAX)
    } else {
        Some(rounded as u32)
    }
}
