//! `Range` header parsing and content-type inference for the stream bridge.

use regex::Regex;
use std::sync::LazyLock;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

static RANGE_SPEC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d*)\s*-\s*(\d*)\s*$").unwrap());

/// An inclusive byte range already clamped to the file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// Not a `bytes=` range we can parse.
    Malformed,
    /// Well-formed, but no byte of it lies inside the file.
    Unsatisfiable,
}

/// Parse a `Range` header value against a file of `total` bytes.
///
/// Supports `bytes=start-end`, `bytes=start-` and `bytes=-suffix`. Only the
/// first range of a multi-range request is honoured.
pub fn parse_range(value: &str, total: u64) -> Result<ByteRange, RangeError> {
    let (unit, ranges) = value.split_once('=').ok_or(RangeError::Malformed)?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Err(RangeError::Malformed);
    }

    let first = ranges.split(',').next().unwrap_or_default();
    let caps = RANGE_SPEC.captures(first).ok_or(RangeError::Malformed)?;
    let start = parse_bound(&caps[1])?;
    let end = parse_bound(&caps[2])?;

    match (start, end) {
        (None, None) => Err(RangeError::Malformed),
        (None, Some(suffix)) => {
            if suffix == 0 || total == 0 {
                return Err(RangeError::Unsatisfiable);
            }
            Ok(ByteRange {
                start: total.saturating_sub(suffix),
                end: total - 1,
            })
        }
        (Some(start), end) => {
            if start >= total {
                return Err(RangeError::Unsatisfiable);
            }
            let end = match end {
                Some(end) if end < start => return Err(RangeError::Unsatisfiable),
                Some(end) => end.min(total - 1),
                None => total - 1,
            };
            Ok(ByteRange { start, end })
        }
    }
}

fn parse_bound(text: &str) -> Result<Option<u64>, RangeError> {
    if text.is_empty() {
        return Ok(None);
    }
    text.parse().map(Some).map_err(|_| RangeError::Malformed)
}

/// MIME type from the device path's extension.
pub fn content_type_for(path: &str) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(FALLBACK_CONTENT_TYPE)
        .to_string()
}
