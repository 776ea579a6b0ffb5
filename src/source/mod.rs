pub mod instagram;
pub mod tiktok;

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::errors::{Result, TaggrabError};
use crate::storage::models::{MediaKind, Platform};

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One search hit. `url` is `None` when the platform withheld a download link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub media_id: String,
    pub kind: MediaKind,
    pub url: Option<String>,
    pub platform: Platform,
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub session_id: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("session_id", &self.session_id.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn has_password_login(&self) -> bool {
        matches!((&self.username, &self.password), (Some(u), Some(p)) if !u.trim().is_empty() && !p.trim().is_empty())
    }

    pub fn session(&self) -> Option<&str> {
        self.session_id.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// A platform that can be searched by hashtag or keyword.
pub trait MediaSource {
    fn platform(&self) -> Platform;

    /// A failed login ends the run.
    fn login(&mut self, credentials: &Credentials) -> Result<()>;

    fn search(&mut self, term: &str, limit: usize) -> Result<Vec<Candidate>>;

    /// Best effort; errors are swallowed.
    fn logout(&mut self);
}

impl<T: MediaSource + ?Sized> MediaSource for Box<T> {
    fn platform(&self) -> Platform {
        (**self).platform()
    }

    fn login(&mut self, credentials: &Credentials) -> Result<()> {
        (**self).login(credentials)
    }

    fn search(&mut self, term: &str, limit: usize) -> Result<Vec<Candidate>> {
        (**self).search(term, limit)
    }

    fn logout(&mut self) {
        (**self).logout()
    }
}

pub fn for_platform(platform: Platform) -> Box<dyn MediaSource + Send> {
    match platform {
        Platform::Instagram => Box::new(instagram::InstagramSource::new()),
        Platform::TikTok => Box::new(tiktok::TikTokSource::new()),
    }
}

/// Trim and drop leading `#`s; an empty term is rejected.
pub fn normalize_term(raw: &str) -> Result<String> {
    let term = raw.trim().trim_start_matches('#').trim();
    if term.is_empty() {
        return Err(TaggrabError::InvalidInput("search term is required".into()));
    }
    Ok(term.to_string())
}

pub(crate) fn build_agent() -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(HTTP_TIMEOUT))
        .user_agent(BROWSER_USER_AGENT)
        .build();
    config.into()
}

pub(crate) fn read_body(response: &mut ureq::http::Response<ureq::Body>) -> Result<String> {
    response
        .body_mut()
        .read_to_string()
        .map_err(|e| TaggrabError::Http(e.to_string()))
}
