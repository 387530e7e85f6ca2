//! Core data models for the audio relay

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Represents an inclusive byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Starting byte position (inclusive)
    pub start: u64,
    /// Ending byte position (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Create a new ByteRange
    ///
    /// # Returns
    /// * `Ok(ByteRange)` if start <= end
    /// * `Err(RelayError::InvalidRange)` otherwise
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(RelayError::InvalidRange(format!(
                "start ({}) must be <= end ({})",
                start, end
            )));
        }
        Ok(ByteRange { start, end })
    }

    /// Get the size of this byte range in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Convert this ByteRange to an upstream Range header value ("bytes=start-end")
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// Format a Content-Range header value ("bytes start-end/total")
    pub fn to_content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// A client Range request before it is checked against the resource length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: u64,
    /// `None` for open-ended requests (`bytes=500-`)
    pub end: Option<u64>,
}

impl RangeRequest {
    /// Parse a client Range header of the form `bytes=<start>-[<end>]`
    pub fn from_header(header: &str) -> Result<Self> {
        let header = header.trim();

        let range_part = header.strip_prefix("bytes=").ok_or_else(|| {
            RelayError::InvalidRange(format!(
                "Range header must start with 'bytes=', got: {}",
                header
            ))
        })?;

        let (start, end) = range_part.split_once('-').ok_or_else(|| {
            RelayError::InvalidRange(format!(
                "Invalid range format, expected 'start-[end]', got: {}",
                range_part
            ))
        })?;

        let start = start
            .trim()
            .parse::<u64>()
            .map_err(|e| RelayError::InvalidRange(format!("Invalid start value: {}", e)))?;

        let end = match end.trim() {
            "" => None,
            value => Some(
                value
                    .parse::<u64>()
                    .map_err(|e| RelayError::InvalidRange(format!("Invalid end value: {}", e)))?,
            ),
        };

        Ok(RangeRequest { start, end })
    }

    /// Whether the client left the end of the range open
    pub fn is_open_ended(&self) -> bool {
        self.end.is_none()
    }

    /// Check the request against the resource length
    ///
    /// An absent end defaults to the last byte of the resource. Rejected when
    /// `start >= total`, `end >= total` or `start > end`.
    pub fn resolve(&self, total: u64) -> Result<ByteRange> {
        let end = self.end.unwrap_or_else(|| total.saturating_sub(1));
        if total == 0 || self.start >= total || end >= total || self.start > end {
            return Err(RelayError::UnsatisfiableRange {
                start: self.start,
                end,
                total,
            });
        }
        Ok(ByteRange {
            start: self.start,
            end,
        })
    }
}

/// Resolved, time-limited upstream fetch information for one identifier
///
/// Immutable once created; re-resolution produces a new descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    pub source_url: String,
    pub total_length: u64,
    pub content_type: String,
    pub upstream_headers: HashMap<String, String>,
    pub expires_at: SystemTime,
}

impl SourceDescriptor {
    /// Create a descriptor that expires `ttl` from now
    pub fn new(
        source_url: impl Into<String>,
        total_length: u64,
        content_type: impl Into<String>,
        upstream_headers: HashMap<String, String>,
        ttl: Duration,
    ) -> Self {
        SourceDescriptor {
            source_url: source_url.into(),
            total_length,
            content_type: content_type.into(),
            upstream_headers,
            expires_at: SystemTime::now() + ttl,
        }
    }

    /// Whether the descriptor is still usable at `now`
    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        self.expires_at > now
    }

    /// Last byte offset of the resource
    pub fn last_byte(&self) -> u64 {
        self.total_length.saturating_sub(1)
    }
}

/// One candidate format reported by the extractor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractorFormat {
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    /// Average audio bitrate in kbit/s
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub filesize_approx: Option<f64>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
}

impl ExtractorFormat {
    /// Audio-only: no video codec (absent or "none") and an audio stream present
    pub fn is_audio_only(&self) -> bool {
        let no_video = match self.vcodec.as_deref() {
            None => true,
            Some(codec) => codec.eq_ignore_ascii_case("none"),
        };
        let has_audio = match self.acodec.as_deref() {
            Some(codec) => !codec.eq_ignore_ascii_case("none"),
            None => self.abr.is_some(),
        };
        no_video && has_audio && self.url.is_some()
    }

    /// Audio bitrate used for ranking, 0 when unknown
    pub fn audio_bitrate(&self) -> f64 {
        self.abr.unwrap_or(0.0)
    }

    /// Exact byte size, falling back to the extractor's approximation
    pub fn byte_length(&self) -> Option<u64> {
        self.filesize
            .or_else(|| self.filesize_approx.map(|size| size.round() as u64))
    }
}

/// Structured extractor output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractorOutput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub formats: Vec<ExtractorFormat>,
}

impl ExtractorOutput {
    /// Pick the audio-only format with the highest bitrate; ties keep the first seen
    pub fn best_audio_format(&self) -> Option<&ExtractorFormat> {
        let mut best: Option<&ExtractorFormat> = None;
        for format in self.formats.iter().filter(|f| f.is_audio_only()) {
            match best {
                Some(current) if format.audio_bitrate() <= current.audio_bitrate() => {}
                _ => best = Some(format),
            }
        }
        best
    }
}

/// Map a container extension to a normalized audio content type
pub fn content_type_for_extension(ext: Option<&str>) -> &'static str {
    match ext.map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("webm") => "audio/webm",
        Some("mp3") => "audio/mpeg",
        Some("ogg") | Some("opus") => "audio/ogg",
        Some("aac") => "audio/aac",
        _ => "audio/webm",
    }
}
