//! Startup scan of the cache root.
//!
//! Leftover temporary metadata is removed, every record is validated against
//! its data file, and data files nobody owns are deleted.

use super::data_file::remove_if_exists;
use super::metadata::CacheEntryMetadata;
use crate::key::{CacheKey, DATA_EXTENSION, META_EXTENSION, META_TMP_EXTENSION};
use crate::report::{extra, report};
use core_runtime::config::SharedSettings;
use core_runtime::events::EventBus;
use core_runtime::hooks::ReportLabel;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub loaded: usize,
    pub removed_tmp: usize,
    pub corrupted: usize,
    pub orphans: usize,
}

pub(crate) async fn scan(
    root: &Path,
    settings: &SharedSettings,
    events: &EventBus,
) -> io::Result<(HashMap<CacheKey, CacheEntryMetadata>, RecoveryReport)> {
    let mut report_out = RecoveryReport::default();
    let mut meta_stems = Vec::new();
    let mut data_stems = HashSet::new();

    let mut dir = fs::read_dir(root).await?;
    while let Some(entry) = dir.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.strip_suffix(&format!(".{}", META_TMP_EXTENSION)).is_some() {
            remove_if_exists(&entry.path())?;
            report_out.removed_tmp += 1;
        } else if let Some(stem) = name.strip_suffix(&format!(".{}", META_EXTENSION)) {
            meta_stems.push(stem.to_string());
        } else if let Some(stem) = name.strip_suffix(&format!(".{}", DATA_EXTENSION)) {
            data_stems.insert(stem.to_string());
        }
    }

    let mut entries = HashMap::new();
    let mut owned_stems = HashSet::new();
    for stem in meta_stems {
        let meta_path = root.join(format!("{}.{}", stem, META_EXTENSION));
        let data_path = root.join(format!("{}.{}", stem, DATA_EXTENSION));

        let meta = match load_record(&meta_path, &stem).await {
            Ok(meta) => meta,
            Err(reason) => {
                warn!(file = %meta_path.display(), %reason, "Discarding corrupted cache metadata");
                report(
                    settings,
                    events,
                    ReportLabel::MetaDataCorrupted,
                    &stem,
                    extra!("reason" => reason),
                );
                remove_if_exists(&meta_path)?;
                remove_if_exists(&data_path)?;
                data_stems.remove(&stem);
                report_out.corrupted += 1;
                continue;
            }
        };

        if let Some(needed) = meta.cached_ranges.max_end() {
            let actual = match fs::metadata(&data_path).await {
                Ok(m) => Some(m.len()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(e),
            };
            if actual.map_or(true, |len| len < needed) {
                warn!(key = %meta.key, needed, ?actual, "Data file shorter than its metadata claims");
                report(
                    settings,
                    events,
                    ReportLabel::CacheDataCorrupted,
                    meta.key.as_str(),
                    extra!(
                        "expected_len" => needed,
                        "actual_len" => actual.map_or_else(|| "missing".to_string(), |l| l.to_string()),
                    ),
                );
                remove_if_exists(&meta_path)?;
                remove_if_exists(&data_path)?;
                data_stems.remove(&stem);
                report_out.corrupted += 1;
                continue;
            }
        }

        owned_stems.insert(stem);
        entries.insert(meta.key.clone(), meta);
    }

    for stem in data_stems.difference(&owned_stems) {
        remove_if_exists(&root.join(format!("{}.{}", stem, DATA_EXTENSION)))?;
        report_out.orphans += 1;
    }

    report_out.loaded = entries.len();
    info!(
        root = %root.display(),
        loaded = report_out.loaded,
        removed_tmp = report_out.removed_tmp,
        corrupted = report_out.corrupted,
        orphans = report_out.orphans,
        "Cache store recovered"
    );
    Ok((entries, report_out))
}

async fn load_record(path: &Path, stem: &str) -> Result<CacheEntryMetadata, String> {
    let bytes = fs::read(path).await.map_err(|e| e.to_string())?;
    let meta = CacheEntryMetadata::decode(&bytes)?;
    if meta.key.file_stem() != stem {
        return Err(format!("record for {} stored under {}", meta.key, stem));
    }
    Ok(meta)
}
