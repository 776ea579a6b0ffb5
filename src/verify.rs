use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::errors::Result;
use crate::hash::ContentHasher;
use crate::storage::MediaTracker;
use crate::storage::models::{MediaFilter, MediaRecord};

const PAGE_SIZE: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Problem {
    Missing,
    SizeMismatch,
    ChecksumMismatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub url_hash: String,
    pub file_path: String,
    pub problem: Problem,
}

#[derive(Debug, Default, Serialize)]
pub struct VerifyReport {
    pub checked: usize,
    pub ok: usize,
    pub findings: Vec<Finding>,
}

fn check_file(record: &MediaRecord) -> Result<Option<Problem>> {
    let mut file = match File::open(Path::new(&record.file_path)) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Some(Problem::Missing)),
        Err(e) => return Err(e.into()),
    };
    // Entries migrated from the oldest JSON files carry no size or checksum.
    if record.size_bytes > 0 && file.metadata()?.len() != record.size_bytes as u64 {
        return Ok(Some(Problem::SizeMismatch));
    }
    let Some(expected) = record.sha256.as_deref() else {
        return Ok(None);
    };
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    if hasher.finish().eq_ignore_ascii_case(expected) {
        Ok(None)
    } else {
        Ok(Some(Problem::ChecksumMismatch))
    }
}

/// Check every recorded file against disk. Nothing in the tracker changes.
pub fn verify_all(tracker: &dyn MediaTracker) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let mut offset = 0;
    loop {
        let page = tracker.list(MediaFilter {
            limit: PAGE_SIZE,
            offset,
            ..Default::default()
        })?;
        for record in &page {
            report.checked += 1;
            match check_file(record)? {
                None => report.ok += 1,
                Some(problem) => {
                    debug!(path = %record.file_path, ?problem, "verification problem");
                    report.findings.push(Finding {
                        url_hash: record.url_hash.clone(),
                        file_path: record.file_path.clone(),
                        problem,
                    });
                }
            }
        }
        if (page.len() as i64) < PAGE_SIZE {
            break;
        }
        offset += PAGE_SIZE;
    }
    Ok(report)
}
