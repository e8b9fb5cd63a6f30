//! Persistent per-entry metadata record.

use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::range_set::{ByteRange, RangeSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const METADATA_VERSION: u32 = 1;

/// What is known about one cached resource.
///
/// Invariant: every cached range ends at or before `total_length` once the
/// length is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryMetadata {
    pub version: u32,
    pub key: CacheKey,
    pub total_length: Option<u64>,
    pub mime_type: Option<String>,
    pub cached_ranges: RangeSet,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    /// URL the data was last fetched from
    #[serde(default)]
    pub origin_url: Option<String>,
}

impl CacheEntryMetadata {
    pub fn new(key: CacheKey, now: DateTime<Utc>) -> Self {
        Self {
            version: METADATA_VERSION,
            key,
            total_length: None,
            mime_type: None,
            cached_ranges: RangeSet::new(),
            created_at: now,
            last_access_at: now,
            origin_url: None,
        }
    }

    pub fn cached_bytes(&self) -> u64 {
        self.cached_ranges.covered_len()
    }

    pub fn is_complete(&self) -> bool {
        self.total_length
            .is_some_and(|total| self.cached_ranges.is_complete(total))
    }

    /// Record a newly learned length or MIME type.
    ///
    /// A length that differs from the one already recorded means the resource
    /// changed upstream; that is refused rather than mixing two versions.
    pub fn apply_info(&mut self, mime_type: Option<&str>, total_length: Option<u64>) -> Result<bool> {
        let mut changed = false;
        if let Some(reported) = total_length {
            match self.total_length {
                Some(cached) if cached != reported => {
                    return Err(CacheError::LengthMismatch {
                        key: self.key.to_string(),
                        cached,
                        reported,
                    });
                }
                Some(_) => {}
                None => {
                    if self.cached_ranges.max_end().is_some_and(|end| end > reported) {
                        return Err(CacheError::LengthMismatch {
                            key: self.key.to_string(),
                            cached: self.cached_ranges.max_end().unwrap_or_default(),
                            reported,
                        });
                    }
                    self.total_length = Some(reported);
                    changed = true;
                }
            }
        }
        if let Some(mime) = mime_type {
            if self.mime_type.as_deref() != Some(mime) {
                self.mime_type = Some(mime.to_string());
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Mark `range` as cached. The range must fit inside a known length.
    pub fn apply_range(&mut self, range: ByteRange) -> Result<()> {
        if let Some(total) = self.total_length {
            if range.end > total {
                return Err(CacheError::InvalidRange(format!(
                    "{} exceeds total length {} of {}",
                    range, total, self.key
                )));
            }
        }
        self.cached_ranges.insert(range);
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.version > METADATA_VERSION {
            return Err(format!("unsupported version {}", self.version));
        }
        if let (Some(total), Some(end)) = (self.total_length, self.cached_ranges.max_end()) {
            if end > total {
                return Err(format!("cached range ends at {} past total {}", end, total));
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CacheError::Internal(format!("encode metadata: {}", e)))
    }

    /// Parse and validate a record read from disk.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        let meta: Self = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        meta.validate()?;
        Ok(meta)
    }
}
