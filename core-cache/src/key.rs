//! Cache keys and the file names derived from them.

use crate::error::{CacheError, Result};
use core_runtime::config::{default_cache_key, SharedSettings};
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_PLAIN_STEM_LEN: usize = 128;

/// Stable identifier of one cached resource. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        Ok(Self(key))
    }

    /// Key for a source URL under the configured key mapper.
    pub fn for_url(url: &str, settings: &SharedSettings) -> Result<Self> {
        Self::new(settings.cache_key_for(url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base name of the entry's files inside the cache root.
    ///
    /// Keys that are already file-name safe are used as-is; anything else
    /// (custom mappers often return URLs) is hashed.
    pub fn file_stem(&self) -> String {
        let plain = self.0.len() <= MAX_PLAIN_STEM_LEN
            && !self.0.starts_with('.')
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        if plain {
            self.0.clone()
        } else {
            default_cache_key(&self.0)
        }
    }

    pub fn meta_file_name(&self) -> String {
        format!("{}.{}", self.file_stem(), META_EXTENSION)
    }

    pub fn data_file_name(&self) -> String {
        format!("{}.{}", self.file_stem(), DATA_EXTENSION)
    }

    pub fn meta_tmp_file_name(&self) -> String {
        format!("{}.{}", self.file_stem(), META_TMP_EXTENSION)
    }
}

pub(crate) const META_EXTENSION: &str = "meta";
pub(crate) const DATA_EXTENSION: &str = "data";
pub(crate) const META_TMP_EXTENSION: &str = "meta.tmp";

impl TryFrom<String> for CacheKey {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
