//! TikTok has no usable public search API, so the tag page HTML is scraped.
//! The page embeds its state as JSON in a script tag; items are read from that.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{Candidate, Credentials, MediaSource, build_agent, read_body};
use crate::errors::{Result, TaggrabError};
use crate::storage::models::{MediaKind, Platform};

const BASE_URL: &str = "https://www.tiktok.com";

static STATE_RE: OnceLock<Regex> = OnceLock::new();

fn state_regex() -> &'static Regex {
    STATE_RE.get_or_init(|| {
        Regex::new(
            r#"(?s)<script[^>]*id="(?:__UNIVERSAL_DATA_FOR_REHYDRATION__|SIGI_STATE)"[^>]*>(?P<json>.*?)</script>"#,
        )
        .expect("valid tiktok state regex")
    })
}

pub struct TikTokSource {
    agent: ureq::Agent,
    base_url: String,
    session_id: Option<String>,
}

impl Default for TikTokSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TikTokSource {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            agent: build_agent(),
            base_url: base_url.trim_end_matches('/').to_string(),
            session_id: None,
        }
    }

    fn tag_url(&self, term: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| TaggrabError::InvalidInput(format!("bad base url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| TaggrabError::InvalidInput("base url cannot take a path".into()))?
            .pop_if_empty()
            .push("tag")
            .push(term);
        Ok(url)
    }
}

impl MediaSource for TikTokSource {
    fn platform(&self) -> Platform {
        Platform::TikTok
    }

    // Tag pages are public; a session cookie only widens what is served.
    fn login(&mut self, credentials: &Credentials) -> Result<()> {
        self.session_id = credentials.session().map(String::from);
        Ok(())
    }

    fn search(&mut self, term: &str, limit: usize) -> Result<Vec<Candidate>> {
        let url = self.tag_url(term)?;
        let mut request = self.agent.get(url.as_str());
        if let Some(session) = &self.session_id {
            request = request.header("Cookie", format!("sessionid={}", session));
        }
        let mut response = request.call()?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(TaggrabError::Http(format!("tag page failed (status={})", status)));
        }
        let html = read_body(&mut response)?;
        let candidates = parse_tag_page(&html, limit);
        debug!(term, found = candidates.len(), "tiktok tag scrape");
        Ok(candidates)
    }

    fn logout(&mut self) {
        self.session_id = None;
    }
}

// Items sit under `itemList` in the rehydration blob and under `ItemModule`
// (keyed by id) in the older SIGI state.
fn collect_items<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match (key.as_str(), child) {
                    ("itemList", Value::Array(items)) => out.extend(items.iter()),
                    ("ItemModule", Value::Object(items)) => out.extend(items.values()),
                    _ => collect_items(child, out),
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_items(v, out)),
        _ => {}
    }
}

fn item_entry(item: &Value) -> Option<(String, Option<String>)> {
    let video = item.get("video");
    let id = video
        .and_then(|v| v.get("id"))
        .or_else(|| item.get("id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())?;
    let url = video
        .and_then(|v| v.get("playAddr"))
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .map(String::from);
    Some((id.to_string(), url))
}

/// Extract `(video id, play address)` pairs from a tag page.
pub fn parse_tag_page(html: &str, limit: usize) -> Vec<Candidate> {
    let mut items = Vec::new();
    let states: Vec<Value> = state_regex()
        .captures_iter(html)
        .filter_map(|caps| serde_json::from_str(caps.name("json")?.as_str()).ok())
        .collect();
    for state in &states {
        collect_items(state, &mut items);
    }

    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter_map(item_entry)
        .filter(|(id, _)| seen.insert(id.clone()))
        .take(limit)
        .map(|(media_id, url)| Candidate {
            media_id,
            kind: MediaKind::Video,
            url,
            platform: Platform::TikTok,
        })
        .collect()
}
