use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    TikTok,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::TikTok => "tiktok",
        }
    }

    pub fn parse(s: &str) -> Option<Platform> {
        match s.to_ascii_lowercase().as_str() {
            "instagram" | "ig" => Some(Platform::Instagram),
            "tiktok" | "tt" => Some(Platform::TikTok),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<MediaKind> {
        match s.to_ascii_lowercase().as_str() {
            "photo" | "image" => Some(MediaKind::Photo),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    /// Default file extension, leading dot included.
    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::Photo => ".jpg",
            MediaKind::Video => ".mp4",
        }
    }

    /// Guess from a file name; anything not recognisably video is a photo.
    pub fn from_path(path: &str) -> MediaKind {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("mp4" | "mov" | "webm" | "m4v") => MediaKind::Video,
            _ => MediaKind::Photo,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaRecord {
    pub id: i64,
    pub url_hash: String,
    pub media_id: String,
    pub source_url: String,
    pub file_path: String,
    pub kind: MediaKind,
    pub platform: Platform,
    pub search_term: String,
    pub size_bytes: i64,
    pub sha256: Option<String>,
    pub downloaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMedia {
    pub url_hash: String,
    pub media_id: String,
    pub source_url: String,
    pub file_path: String,
    pub kind: MediaKind,
    pub platform: Platform,
    pub search_term: String,
    pub size_bytes: i64,
    pub sha256: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct TrackerStats {
    pub total: i64,
    pub photos: i64,
    pub videos: i64,
    pub instagram: i64,
    pub tiktok: i64,
    pub total_size: i64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone)]
pub struct MediaFilter {
    pub platform: Option<Platform>,
    pub kind: Option<MediaKind>,
    pub search_term: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl MediaFilter {
    pub fn effective_limit(&self) -> i64 {
        if self.limit <= 0 { 50 } else { self.limit }
    }

    pub fn matches(&self, record: &MediaRecord) -> bool {
        self.platform.is_none_or(|p| p == record.platform)
            && self.kind.is_none_or(|k| k == record.kind)
            && self
                .search_term
                .as_deref()
                .is_none_or(|t| t == record.search_term)
    }
}
