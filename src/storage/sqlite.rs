use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, ErrorCode, Row, params};

use super::MediaTracker;
use super::models::{MediaFilter, MediaKind, MediaRecord, NewMedia, Platform, TrackerStats};
use super::schema;
use crate::errors::{Result, TaggrabError};

const BASE_SELECT: &str = "
    SELECT id, url_hash, media_id, source_url, file_path, media_kind, platform,
           search_term, size_bytes, sha256, downloaded_at
    FROM downloaded_media
";

pub struct SqliteTracker {
    conn: Connection,
}

fn row_to_record(row: &Row) -> rusqlite::Result<MediaRecord> {
    let kind_str: String = row.get(5)?;
    let platform_str: String = row.get(6)?;
    Ok(MediaRecord {
        id: row.get(0)?,
        url_hash: row.get(1)?,
        media_id: row.get(2)?,
        source_url: row.get(3)?,
        file_path: row.get(4)?,
        kind: MediaKind::parse(&kind_str).unwrap_or(MediaKind::Photo),
        platform: Platform::parse(&platform_str).unwrap_or(Platform::Instagram),
        search_term: row.get(7)?,
        size_bytes: row.get(8)?,
        sha256: row.get(9)?,
        downloaded_at: row.get(10)?,
    })
}

impl SqliteTracker {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute(schema::CREATE_MEDIA_TABLE, [])?;
        conn.execute(schema::CREATE_INDEX_MEDIA_ID, [])?;
        conn.execute(schema::CREATE_INDEX_SEARCH_TERM, [])?;
        conn.execute(schema::CREATE_INDEX_DOWNLOADED_AT, [])?;
        Ok(Self { conn })
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::new(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::new(conn)
    }

    #[cfg(test)]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn get_by_id(&self, id: i64) -> Result<MediaRecord> {
        let sql = format!("{} WHERE id = ?", BASE_SELECT);
        self.conn
            .query_row(&sql, params![id], row_to_record)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    TaggrabError::NotFound(format!("Media record {} not found", id))
                }
                other => TaggrabError::Storage(other),
            })
    }

    fn find_one(&self, sql: &str, params: &[&dyn rusqlite::types::ToSql]) -> Result<Option<MediaRecord>> {
        match self.conn.query_row(sql, params, row_to_record) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(TaggrabError::Storage(e)),
        }
    }
}

impl MediaTracker for SqliteTracker {
    fn record(&mut self, media: NewMedia) -> Result<MediaRecord> {
        let now = Utc::now();
        let inserted = self.conn.execute(
            "INSERT INTO downloaded_media (url_hash, media_id, source_url, file_path, media_kind,
                                           platform, search_term, size_bytes, sha256, downloaded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                media.url_hash,
                media.media_id,
                media.source_url,
                media.file_path,
                media.kind.as_str(),
                media.platform.as_str(),
                media.search_term,
                media.size_bytes,
                media.sha256,
                now,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(TaggrabError::Duplicate(media.url_hash));
            }
            Err(e) => return Err(e.into()),
        }
        let id = self.conn.last_insert_rowid();
        self.get_by_id(id)
    }

    fn find_by_hash(&self, hash: &str) -> Result<Option<MediaRecord>> {
        let sql = format!("{} WHERE url_hash = ?", BASE_SELECT);
        self.find_one(&sql, params![hash])
    }

    fn find_by_media_id(&self, platform: Platform, media_id: &str) -> Result<Option<MediaRecord>> {
        let sql = format!(
            "{} WHERE platform = ? AND media_id = ? ORDER BY id LIMIT 1",
            BASE_SELECT
        );
        self.find_one(&sql, params![platform.as_str(), media_id])
    }

    fn list(&self, filter: MediaFilter) -> Result<Vec<MediaRecord>> {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(platform) = filter.platform {
            conditions.push("platform = ?");
            param_values.push(Box::new(platform.as_str()));
        }
        if let Some(kind) = filter.kind {
            conditions.push("media_kind = ?");
            param_values.push(Box::new(kind.as_str()));
        }
        if let Some(ref term) = filter.search_term {
            conditions.push("search_term = ?");
            param_values.push(Box::new(term.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "{} {} ORDER BY id DESC LIMIT ? OFFSET ?",
            BASE_SELECT, where_clause
        );

        param_values.push(Box::new(filter.effective_limit()));
        param_values.push(Box::new(filter.offset));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(param_refs.as_slice(), row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn stats(&self) -> Result<TrackerStats> {
        self.conn
            .query_row(
                "SELECT
                    COUNT(*),
                    COUNT(CASE WHEN media_kind = 'photo' THEN 1 END),
                    COUNT(CASE WHEN media_kind = 'video' THEN 1 END),
                    COUNT(CASE WHEN platform = 'instagram' THEN 1 END),
                    COUNT(CASE WHEN platform = 'tiktok' THEN 1 END),
                    COALESCE(SUM(size_bytes), 0),
                    MIN(downloaded_at),
                    MAX(downloaded_at)
                 FROM downloaded_media",
                [],
                |row| {
                    Ok(TrackerStats {
                        total: row.get(0)?,
                        photos: row.get(1)?,
                        videos: row.get(2)?,
                        instagram: row.get(3)?,
                        tiktok: row.get(4)?,
                        total_size: row.get(5)?,
                        oldest: row.get(6)?,
                        newest: row.get(7)?,
                    })
                },
            )
            .map_err(TaggrabError::Storage)
    }
}
