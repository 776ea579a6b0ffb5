use md5::Md5;
use sha2::{Digest, Sha256};

/// Dedup key for a media item: lowercase hex MD5 of its source URL.
pub fn url_hash(url: &str) -> String {
    hex::encode(Md5::digest(url.as_bytes()))
}

/// SHA-256 over a stream of chunks, fed as the file is written.
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

pub fn hash_content(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
