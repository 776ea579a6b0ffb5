use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Candidate, Credentials, MediaSource, build_agent, read_body};
use crate::errors::{Result, TaggrabError};
use crate::storage::models::{MediaKind, Platform};

const BASE_URL: &str = "https://www.instagram.com";
const APP_ID: &str = "936619743392459";

const MEDIA_TYPE_PHOTO: i64 = 1;
const MEDIA_TYPE_VIDEO: i64 = 2;
const MEDIA_TYPE_CAROUSEL: i64 = 8;

#[derive(Default)]
struct Session {
    session_id: String,
    csrf_token: Option<String>,
}

impl Session {
    fn cookie_header(&self) -> String {
        match &self.csrf_token {
            Some(csrf) => format!("sessionid={}; csrftoken={}", self.session_id, csrf),
            None => format!("sessionid={}", self.session_id),
        }
    }
}

pub struct InstagramSource {
    agent: ureq::Agent,
    base_url: String,
    session: Option<Session>,
}

impl Default for InstagramSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InstagramSource {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            agent: build_agent(),
            base_url: base_url.trim_end_matches('/').to_string(),
            session: None,
        }
    }

    fn login_with_password(&self, username: &str, password: &str) -> Result<Session> {
        let login_page = format!("{}/accounts/login/", self.base_url);
        let response = self.agent.get(login_page.as_str()).call()?;
        let csrf = set_cookie_value(&response, "csrftoken")
            .ok_or_else(|| TaggrabError::Login("no csrf token issued".into()))?;

        let enc_password = format!(
            "#PWD_INSTAGRAM_BROWSER:0:{}:{}",
            chrono::Utc::now().timestamp(),
            password
        );
        let mut response = self
            .agent
            .post(format!("{}/api/v1/web/accounts/login/ajax/", self.base_url))
            .header("X-CSRFToken", csrf.as_str())
            .header("X-IG-App-ID", APP_ID)
            .header("X-Requested-With", "XMLHttpRequest")
            .header("Referer", login_page.as_str())
            .header("Cookie", format!("csrftoken={}", csrf))
            .send_form([
                ("username", username),
                ("enc_password", enc_password.as_str()),
                ("queryParams", "{}"),
                ("optIntoOneTap", "false"),
            ])?;

        let session_id = set_cookie_value(&response, "sessionid");
        let csrf_token = set_cookie_value(&response, "csrftoken").or(Some(csrf));
        let body = read_body(&mut response)?;
        let json: Value = serde_json::from_str(&body)
            .map_err(|e| TaggrabError::Login(format!("unexpected login response: {}", e)))?;

        if json.get("authenticated").and_then(Value::as_bool) != Some(true) {
            let reason = json
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("credentials rejected");
            return Err(TaggrabError::Login(reason.to_string()));
        }
        let session_id = session_id
            .ok_or_else(|| TaggrabError::Login("authenticated but no session cookie".into()))?;
        Ok(Session {
            session_id,
            csrf_token,
        })
    }

    fn verify_session(&self, session: &Session) -> Result<()> {
        let mut response = self
            .agent
            .get(format!("{}/api/v1/accounts/current_user/", self.base_url))
            .query("edit", "true")
            .header("X-IG-App-ID", APP_ID)
            .header("Cookie", session.cookie_header())
            .call()?;
        if response.status().as_u16() != 200 {
            return Err(TaggrabError::Login(format!(
                "session rejected (status={})",
                response.status()
            )));
        }
        let body = read_body(&mut response)?;
        let json: Value = serde_json::from_str(&body)
            .map_err(|_| TaggrabError::Login("session rejected".into()))?;
        if json.get("user").is_none() {
            return Err(TaggrabError::Login("session rejected".into()));
        }
        Ok(())
    }
}

impl MediaSource for InstagramSource {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    fn login(&mut self, credentials: &Credentials) -> Result<()> {
        let session = if let Some(session_id) = credentials.session() {
            let session = Session {
                session_id: session_id.to_string(),
                csrf_token: None,
            };
            self.verify_session(&session)?;
            session
        } else if credentials.has_password_login() {
            let username = credentials.username.as_deref().unwrap_or_default().trim();
            let password = credentials.password.as_deref().unwrap_or_default();
            self.login_with_password(username, password)?
        } else {
            return Err(TaggrabError::Login(
                "username and password, or a session id, are required".into(),
            ));
        };
        info!("logged in to instagram");
        self.session = Some(session);
        Ok(())
    }

    fn search(&mut self, term: &str, limit: usize) -> Result<Vec<Candidate>> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| TaggrabError::Login("not logged in".into()))?;
        let mut response = self
            .agent
            .get(format!("{}/api/v1/tags/web_info/", self.base_url))
            .query("tag_name", term)
            .header("X-IG-App-ID", APP_ID)
            .header("Cookie", session.cookie_header())
            .call()?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(TaggrabError::Http(format!("tag search failed (status={})", status)));
        }
        let body = read_body(&mut response)?;
        let json: Value = serde_json::from_str(&body)?;
        let candidates = parse_tag_medias(&json, limit);
        debug!(term, found = candidates.len(), "instagram tag search");
        Ok(candidates)
    }

    fn logout(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let mut request = self
            .agent
            .post(format!("{}/api/v1/web/accounts/logout/ajax/", self.base_url))
            .header("X-IG-App-ID", APP_ID)
            .header("Cookie", session.cookie_header());
        if let Some(csrf) = &session.csrf_token {
            request = request.header("X-CSRFToken", csrf.as_str());
        }
        if let Err(e) = request.send_empty() {
            warn!(error = %e, "instagram logout failed");
        }
    }
}

fn set_cookie_value(response: &ureq::http::Response<ureq::Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| {
            let pair = cookie.split(';').next()?;
            let (key, value) = pair.split_once('=')?;
            (key.trim() == name && !value.is_empty()).then(|| value.trim().to_string())
        })
}

fn id_string(media: &Value) -> Option<String> {
    match media.get("pk").or_else(|| media.get("id"))? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn best_image_url(media: &Value) -> Option<String> {
    media
        .pointer("/image_versions2/candidates")?
        .as_array()?
        .iter()
        .max_by_key(|c| c.get("width").and_then(Value::as_i64).unwrap_or(0))?
        .get("url")?
        .as_str()
        .map(String::from)
}

fn first_video_url(media: &Value) -> Option<String> {
    media
        .get("video_versions")?
        .as_array()?
        .first()?
        .get("url")?
        .as_str()
        .map(String::from)
}

fn push_media(media: &Value, out: &mut Vec<Candidate>) {
    let Some(media_id) = id_string(media) else {
        return;
    };
    match media.get("media_type").and_then(Value::as_i64) {
        Some(MEDIA_TYPE_PHOTO) => out.push(Candidate {
            media_id,
            kind: MediaKind::Photo,
            url: best_image_url(media),
            platform: Platform::Instagram,
        }),
        Some(MEDIA_TYPE_VIDEO) => out.push(Candidate {
            media_id,
            kind: MediaKind::Video,
            url: first_video_url(media),
            platform: Platform::Instagram,
        }),
        Some(MEDIA_TYPE_CAROUSEL) => {
            if let Some(children) = media.get("carousel_media").and_then(Value::as_array) {
                for child in children {
                    push_media(child, out);
                }
            }
        }
        _ => {}
    }
}

/// Pull candidates out of a tag `web_info` response, top posts first.
pub fn parse_tag_medias(json: &Value, limit: usize) -> Vec<Candidate> {
    let mut all = Vec::new();
    for section_key in ["top", "recent"] {
        let sections = json
            .pointer(&format!("/data/{}/sections", section_key))
            .and_then(Value::as_array);
        for section in sections.into_iter().flatten() {
            let medias = section
                .pointer("/layout_content/medias")
                .and_then(Value::as_array);
            for item in medias.into_iter().flatten() {
                if let Some(media) = item.get("media") {
                    push_media(media, &mut all);
                }
            }
        }
    }

    let mut seen = HashSet::new();
    all.retain(|c| seen.insert(c.media_id.clone()));
    all.truncate(limit);
    all
}
