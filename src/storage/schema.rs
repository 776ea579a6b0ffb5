pub const CREATE_MEDIA_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS downloaded_media (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url_hash TEXT NOT NULL UNIQUE,
        media_id TEXT NOT NULL,
        source_url TEXT NOT NULL,
        file_path TEXT NOT NULL,
        media_kind TEXT NOT NULL,
        platform TEXT NOT NULL,
        search_term TEXT NOT NULL,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        sha256 TEXT,
        downloaded_at TEXT NOT NULL
    )
";

pub const CREATE_INDEX_MEDIA_ID: &str =
    "CREATE INDEX IF NOT EXISTS idx_media_platform_media_id ON downloaded_media(platform, media_id)";

pub const CREATE_INDEX_SEARCH_TERM: &str =
    "CREATE INDEX IF NOT EXISTS idx_media_search_term ON downloaded_media(search_term)";

pub const CREATE_INDEX_DOWNLOADED_AT: &str =
    "CREATE INDEX IF NOT EXISTS idx_media_downloaded_at ON downloaded_media(downloaded_at)";
