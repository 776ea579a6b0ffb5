use std::io::Read;
use std::time::Duration;

use url::Url;

use crate::errors::{Result, TaggrabError};
use crate::source::BROWSER_USER_AGENT;
use crate::storage::models::MediaKind;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

const MEDIA_EXTS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".heic", ".mp4", ".mov", ".webm"];

pub struct Download {
    pub reader: Box<dyn Read>,
    pub content_length: Option<u64>,
}

/// Opens a byte stream for a media URL.
pub trait Fetcher: Send {
    fn open(&self, url: &str) -> Result<Download>;
}

pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::with_timeouts(CONNECT_TIMEOUT, RESPONSE_TIMEOUT)
    }

    /// Only connecting and waiting for the response head are bounded. A body
    /// may stream for as long as it takes; the worker cancels between chunks.
    pub fn with_timeouts(connect: Duration, response: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(Some(connect))
            .timeout_recv_response(Some(response))
            .user_agent(BROWSER_USER_AGENT)
            .build();
        Self { agent: config.into() }
    }
}

impl Fetcher for HttpFetcher {
    fn open(&self, url: &str) -> Result<Download> {
        let response = self.agent.get(url).call()?;
        let status = response.status();
        if status.as_u16() != 200 {
            return Err(TaggrabError::Http(format!("download failed: {} (status={})", url, status)));
        }
        let content_length = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        Ok(Download {
            reader: Box::new(response.into_body().into_reader()),
            content_length,
        })
    }
}

/// Extension for the saved file, preferring whatever the URL path carries.
pub fn guess_extension(url: &str, kind: MediaKind) -> String {
    if let Ok(parsed) = Url::parse(url) {
        let path = parsed.path().to_ascii_lowercase();
        for ext in MEDIA_EXTS {
            if path.ends_with(ext) {
                return (*ext).to_string();
            }
        }
    }
    kind.extension().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    // Serves one response whose body arrives in slow chunks.
    fn slow_server(chunks: usize, chunk_len: usize, gap: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            loop {
                line.clear();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                chunks * chunk_len
            )
            .unwrap();
            stream.flush().unwrap();
            for _ in 0..chunks {
                thread::sleep(gap);
                stream.write_all(&vec![b'x'; chunk_len]).unwrap();
                stream.flush().unwrap();
            }
        });
        format!("http://{}/v/slow.mp4", addr)
    }

    #[test]
    fn test_slow_body_outlives_response_timeout() {
        let url = slow_server(6, 1024, Duration::from_millis(150));
        let fetcher = HttpFetcher::with_timeouts(Duration::from_secs(5), Duration::from_millis(300));
        let mut download = fetcher.open(&url).unwrap();
        assert_eq!(download.content_length, Some(6 * 1024));

        let mut body = Vec::new();
        download.reader.read_to_end(&mut body).unwrap();
        assert_eq!(body.len(), 6 * 1024);
    }

    #[test]
    fn test_guess_extension_from_path() {
        assert_eq!(
            guess_extension("https://cdn.example.com/v/t51/abc.webp?stp=dst-jpg", MediaKind::Photo),
            ".webp"
        );
        assert_eq!(guess_extension("https://cdn.example.com/clip.MOV", MediaKind::Video), ".mov");
    }

    #[test]
    fn test_guess_extension_falls_back_to_kind() {
        assert_eq!(guess_extension("https://cdn.example.com/media/123", MediaKind::Photo), ".jpg");
        assert_eq!(guess_extension("not a url", MediaKind::Video), ".mp4");
    }
}
