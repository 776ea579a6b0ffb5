use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaggrabError {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Login failed: {0}")]
    Login(String),

    #[error("No results: {0}")]
    NoResults(String),

    #[error("Already recorded: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl From<ureq::Error> for TaggrabError {
    fn from(e: ureq::Error) -> Self {
        TaggrabError::Http(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TaggrabError>;
