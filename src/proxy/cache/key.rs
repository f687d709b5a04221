use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::proxy::negotiate::EffectiveParameters;

/// Longest canonical key used verbatim as a file name; leaves room for the
/// `.json` sidecar suffix under the usual 255 byte limit.
pub(super) const MAX_STEM_LEN: usize = 200;
const HASHED_STEM_SUFFIX: &str = ".b3";
const DELIMITER: char = '.';
const UNSET_DIMENSION: &str = "_";

/// Identifies one transformed variant of one origin image.
///
/// The canonical form is `base64url(url).width.height.format`. The URL-safe
/// alphabet never produces `.`, so distinct tuples can't collide through
/// delimiter ambiguity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    canonical: String,
    stem: String,
}

impl CacheKey {
    pub fn derive(url: &str, params: &EffectiveParameters) -> Self {
        let canonical = format!(
            "{url}{DELIMITER}{width}{DELIMITER}{height}{DELIMITER}{format}",
            url = URL_SAFE_NO_PAD.encode(url.as_bytes()),
            width = dimension_token(params.width),
            height = dimension_token(params.height),
            format = params.format.key_token(),
        );
        Self::from_canonical(canonical)
    }

    fn from_canonical(canonical: String) -> Self {
        let stem = if canonical.len() <= MAX_STEM_LEN {
            canonical.clone()
        } else {
            format!(
                "{}{HASHED_STEM_SUFFIX}",
                blake3::hash(canonical.as_bytes()).to_hex()
            )
        };
        Self { canonical, stem }
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// File name of the payload inside the entries directory.
    pub fn file_stem(&self) -> &str {
        &self.stem
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stem)
    }
}

fn dimension_token(value: Option<u32>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => UNSET_DIMENSION.to_string(),
    }
}
