pub mod json;
pub mod models;
pub mod schema;
pub mod sqlite;

use crate::errors::Result;
use crate::hash::url_hash;
use models::{MediaFilter, MediaRecord, NewMedia, Platform, TrackerStats};

/// Deduplication store of downloaded media, keyed by the MD5 of the source URL.
///
/// Records are append-only: nothing here updates or removes an entry.
pub trait MediaTracker {
    /// Fails with `Duplicate` if the URL hash is already recorded.
    fn record(&mut self, media: NewMedia) -> Result<MediaRecord>;
    fn find_by_hash(&self, hash: &str) -> Result<Option<MediaRecord>>;
    fn find_by_media_id(&self, platform: Platform, media_id: &str) -> Result<Option<MediaRecord>>;
    fn list(&self, filter: MediaFilter) -> Result<Vec<MediaRecord>>;
    fn stats(&self) -> Result<TrackerStats>;

    /// A hit on either the URL hash or the platform's media id counts.
    fn is_downloaded(&self, platform: Platform, media_id: &str, url: &str) -> Result<bool> {
        if self.find_by_hash(&url_hash(url))?.is_some() {
            return Ok(true);
        }
        if media_id.is_empty() {
            return Ok(false);
        }
        Ok(self.find_by_media_id(platform, media_id)?.is_some())
    }
}

impl<T: MediaTracker + ?Sized> MediaTracker for Box<T> {
    fn record(&mut self, media: NewMedia) -> Result<MediaRecord> {
        (**self).record(media)
    }

    fn find_by_hash(&self, hash: &str) -> Result<Option<MediaRecord>> {
        (**self).find_by_hash(hash)
    }

    fn find_by_media_id(&self, platform: Platform, media_id: &str) -> Result<Option<MediaRecord>> {
        (**self).find_by_media_id(platform, media_id)
    }

    fn list(&self, filter: MediaFilter) -> Result<Vec<MediaRecord>> {
        (**self).list(filter)
    }

    fn stats(&self) -> Result<TrackerStats> {
        (**self).stats()
    }
}
