//! The legacy flat-file tracker: one JSON object mapping URL hash to entry.
//!
//! Early files only carry `media_id` and `downloaded_at` per entry (and the
//! `media_id` there is the saved file name). Later files add the source URL,
//! path, kind, platform and search term. Both shapes load.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::MediaTracker;
use super::models::{MediaFilter, MediaKind, MediaRecord, NewMedia, Platform, TrackerStats};
use crate::config::write_atomic;
use crate::errors::{Result, TaggrabError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonEntry {
    media_id: String,
    downloaded_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    media_type: Option<MediaKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    search_term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
}

/// Accepts RFC 3339 as well as the naive ISO timestamps older files wrote.
fn parse_timestamp(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.and_utc();
    }
    DateTime::<Utc>::UNIX_EPOCH
}

impl JsonEntry {
    fn to_record(&self, id: i64, hash: &str) -> MediaRecord {
        let file_path = self.file_path.clone().unwrap_or_else(|| self.media_id.clone());
        MediaRecord {
            id,
            url_hash: hash.to_string(),
            media_id: self.media_id.clone(),
            source_url: self.source_url.clone().unwrap_or_default(),
            kind: self.media_type.unwrap_or_else(|| MediaKind::from_path(&file_path)),
            file_path,
            platform: self.platform.unwrap_or(Platform::Instagram),
            search_term: self.search_term.clone().unwrap_or_default(),
            size_bytes: self.size_bytes.unwrap_or(0),
            sha256: self.sha256.clone(),
            downloaded_at: parse_timestamp(&self.downloaded_at),
        }
    }
}

pub struct JsonTracker {
    path: PathBuf,
    // Insertion order is kept alongside the map so ids stay stable.
    order: Vec<String>,
    entries: BTreeMap<String, JsonEntry>,
}

fn load_entries(path: &Path) -> BTreeMap<String, JsonEntry> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read media tracker, starting empty");
            return BTreeMap::new();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt media tracker, starting empty");
            BTreeMap::new()
        }
    }
}

impl JsonTracker {
    pub fn open(path: &Path) -> Self {
        let entries = load_entries(path);
        let mut order: Vec<String> = entries.keys().cloned().collect();
        order.sort_by_key(|hash| parse_timestamp(&entries[hash].downloaded_at));
        debug!(path = %path.display(), entries = entries.len(), "loaded json tracker");
        Self {
            path: path.to_path_buf(),
            order,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn save(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.entries)?;
        write_atomic(&self.path, &data)
    }

    fn records(&self) -> impl DoubleEndedIterator<Item = MediaRecord> + '_ {
        self.order
            .iter()
            .enumerate()
            .map(|(i, hash)| self.entries[hash].to_record(i as i64 + 1, hash))
    }
}

impl MediaTracker for JsonTracker {
    fn record(&mut self, media: NewMedia) -> Result<MediaRecord> {
        if self.entries.contains_key(&media.url_hash) {
            return Err(TaggrabError::Duplicate(media.url_hash));
        }
        let entry = JsonEntry {
            media_id: media.media_id,
            downloaded_at: Utc::now().to_rfc3339(),
            source_url: Some(media.source_url),
            file_path: Some(media.file_path),
            media_type: Some(media.kind),
            platform: Some(media.platform),
            search_term: Some(media.search_term),
            size_bytes: Some(media.size_bytes),
            sha256: media.sha256,
        };
        let record = entry.to_record(self.order.len() as i64 + 1, &media.url_hash);
        self.entries.insert(media.url_hash.clone(), entry);
        self.order.push(media.url_hash.clone());
        if let Err(e) = self.save() {
            self.entries.remove(&media.url_hash);
            self.order.pop();
            return Err(e);
        }
        Ok(record)
    }

    fn find_by_hash(&self, hash: &str) -> Result<Option<MediaRecord>> {
        let Some(entry) = self.entries.get(hash) else {
            return Ok(None);
        };
        let id = self.order.iter().position(|h| h == hash).map_or(0, |i| i as i64 + 1);
        Ok(Some(entry.to_record(id, hash)))
    }

    fn find_by_media_id(&self, platform: Platform, media_id: &str) -> Result<Option<MediaRecord>> {
        Ok(self
            .records()
            .find(|r| r.platform == platform && r.media_id == media_id))
    }

    fn list(&self, filter: MediaFilter) -> Result<Vec<MediaRecord>> {
        Ok(self
            .records()
            .rev()
            .filter(|r| filter.matches(r))
            .skip(filter.offset.max(0) as usize)
            .take(filter.effective_limit() as usize)
            .collect())
    }

    fn stats(&self) -> Result<TrackerStats> {
        let mut stats = TrackerStats::default();
        for r in self.records() {
            stats.total += 1;
            match r.kind {
                MediaKind::Photo => stats.photos += 1,
                MediaKind::Video => stats.videos += 1,
            }
            match r.platform {
                Platform::Instagram => stats.instagram += 1,
                Platform::TikTok => stats.tiktok += 1,
            }
            stats.total_size += r.size_bytes;
            stats.oldest = Some(stats.oldest.map_or(r.downloaded_at, |o| o.min(r.downloaded_at)));
            stats.newest = Some(stats.newest.map_or(r.downloaded_at, |n| n.max(r.downloaded_at)));
        }
        Ok(stats)
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

/// Copy every entry of a legacy JSON file into `tracker`, leaving hashes it
/// already holds alone.
pub fn import_into(json_path: &Path, tracker: &mut dyn MediaTracker) -> Result<ImportReport> {
    if !json_path.exists() {
        return Err(TaggrabError::NotFound(format!(
            "legacy tracker {} does not exist",
            json_path.display()
        )));
    }
    let source = JsonTracker::open(json_path);
    let mut report = ImportReport::default();
    for record in source.records() {
        if tracker.find_by_hash(&record.url_hash)?.is_some() {
            report.skipped += 1;
            continue;
        }
        let new = NewMedia {
            url_hash: record.url_hash,
            media_id: record.media_id,
            source_url: record.source_url,
            file_path: record.file_path,
            kind: record.kind,
            platform: record.platform,
            search_term: record.search_term,
            size_bytes: record.size_bytes,
            sha256: record.sha256,
        };
        match tracker.record(new) {
            Ok(_) => report.imported += 1,
            Err(TaggrabError::Duplicate(_)) => report.skipped += 1,
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}
