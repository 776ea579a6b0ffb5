use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use taggrab::config::{AppPaths, Settings};
use taggrab::errors::{Result, TaggrabError};
use taggrab::fetch::HttpFetcher;
use taggrab::progress::{self, LogWriterFactory};
use taggrab::source::{self, Credentials};
use taggrab::storage::MediaTracker;
use taggrab::storage::json::{JsonTracker, import_into};
use taggrab::storage::models::{MediaFilter, MediaKind, MediaRecord, Platform};
use taggrab::storage::sqlite::SqliteTracker;
use taggrab::verify::verify_all;
use taggrab::worker::{self, DownloadJob, Event, MediaSelection, Summary};

#[derive(Parser)]
#[command(name = "taggrab", version, about = "Download Instagram and TikTok media by hashtag")]
struct Cli {
    /// Output results as JSON
    #[arg(short = 'j', long = "json", global = true)]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory (defaults to ~/.taggrab)
    #[arg(long, global = true, env = "TAGGRAB_HOME")]
    home: Option<PathBuf>,

    /// Which store tracks downloaded media
    #[arg(long, global = true, value_enum, default_value = "sqlite")]
    tracker: TrackerBackend,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum TrackerBackend {
    Sqlite,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Search a hashtag and download media not fetched before
    Download {
        /// Hashtag or keyword (a leading # is optional)
        term: String,

        /// instagram or tiktok
        #[arg(short, long)]
        platform: Option<String>,

        /// Download directory (remembered for next time)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Maximum number of results to fetch
        #[arg(short, long)]
        limit: Option<usize>,

        /// Skip photos
        #[arg(long)]
        no_photos: bool,

        /// Skip videos
        #[arg(long)]
        no_videos: bool,

        /// Seconds to wait between downloads
        #[arg(long)]
        delay: Option<u64>,

        /// Search attempts before giving up
        #[arg(long, default_value = "3")]
        retries: u32,

        #[arg(long, env = "TAGGRAB_IG_USERNAME")]
        username: Option<String>,

        #[arg(long, env = "TAGGRAB_IG_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Session cookie to reuse instead of a password login
        #[arg(long, env = "TAGGRAB_SESSION", hide_env_values = true)]
        session: Option<String>,
    },

    /// List downloaded media
    List {
        #[arg(short, long)]
        platform: Option<String>,

        /// photo or video
        #[arg(short, long)]
        kind: Option<String>,

        /// Only media found under this search term
        #[arg(short, long)]
        term: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: i64,

        #[arg(short, long, default_value = "0")]
        offset: i64,
    },

    /// Show one record by URL hash or media id
    Show {
        key: String,
    },

    /// Show tracker statistics
    Stats,

    /// Check recorded files still exist and match their checksums
    Verify,

    /// Copy a legacy downloaded_media.json into the SQLite tracker
    Import {
        /// Path to the JSON file (defaults to the one in the data directory)
        path: Option<PathBuf>,
    },

    /// Show or change remembered settings
    Settings {
        #[arg(short, long)]
        dir: Option<PathBuf>,

        #[arg(short, long)]
        platform: Option<String>,

        #[arg(long)]
        delay: Option<u64>,

        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[derive(Serialize)]
struct StatusResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<Summary>,
}

fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(LogWriterFactory))
        .with(filter)
        .init();

    if let Err(e) = run(cli) {
        if json {
            eprintln!("{}", serde_json::json!({"error": e.to_string()}));
        } else {
            eprintln!("error: {}", e);
        }
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let paths = match cli.home {
        Some(ref home) => AppPaths::from_base(home.clone()),
        None => AppPaths::new()?,
    };
    let json = cli.json;
    let backend = cli.tracker;

    match cli.command {
        Commands::Download {
            term,
            platform,
            dir,
            limit,
            no_photos,
            no_videos,
            delay,
            retries,
            username,
            password,
            session,
        } => {
            let mut settings = Settings::load(&paths.settings_file);
            let platform = match platform {
                Some(p) => parse_platform(&p)?,
                None => settings.platform,
            };
            let download_dir = dir.or_else(|| settings.download_dir.clone()).ok_or_else(|| {
                TaggrabError::InvalidInput("a download directory is required (--dir)".into())
            })?;

            let mut job = DownloadJob::new(&term, download_dir.clone())?;
            job.limit = limit.unwrap_or(settings.limit);
            job.delay = Duration::from_secs(delay.unwrap_or(settings.delay_secs));
            job.search_attempts = retries;
            job.selection = MediaSelection {
                photos: !no_photos,
                videos: !no_videos,
            };
            job.credentials = Credentials {
                username,
                password,
                session_id: session,
            };
            job.validate()?;
            if platform == Platform::Instagram
                && !job.credentials.has_password_login()
                && job.credentials.session().is_none()
            {
                return Err(TaggrabError::InvalidInput(
                    "instagram needs --username and --password, or --session".into(),
                ));
            }

            settings.download_dir = Some(download_dir);
            settings.platform = platform;

            cmd_download(&paths, backend, job, platform, settings, json)
        }
        Commands::List {
            platform,
            kind,
            term,
            limit,
            offset,
        } => {
            let filter = MediaFilter {
                platform: platform.as_deref().map(parse_platform).transpose()?,
                kind: kind.as_deref().map(parse_kind).transpose()?,
                search_term: term.map(|t| t.trim().trim_start_matches('#').to_string()),
                limit,
                offset,
            };
            cmd_list(&paths, backend, filter, json)
        }
        Commands::Show { key } => cmd_show(&paths, backend, &key, json),
        Commands::Stats => cmd_stats(&paths, backend, json),
        Commands::Verify => cmd_verify(&paths, backend, json),
        Commands::Import { path } => cmd_import(&paths, path, json),
        Commands::Settings {
            dir,
            platform,
            delay,
            limit,
        } => cmd_settings(&paths, dir, platform, delay, limit, json),
    }
}

fn parse_platform(s: &str) -> Result<Platform> {
    Platform::parse(s)
        .ok_or_else(|| TaggrabError::InvalidInput(format!("unknown platform '{}'", s)))
}

fn parse_kind(s: &str) -> Result<MediaKind> {
    MediaKind::parse(s).ok_or_else(|| TaggrabError::InvalidInput(format!("unknown media kind '{}'", s)))
}

fn open_tracker(paths: &AppPaths, backend: TrackerBackend) -> Result<Box<dyn MediaTracker + Send>> {
    paths.ensure_base_dir()?;
    Ok(match backend {
        TrackerBackend::Sqlite => Box::new(SqliteTracker::open(&paths.db_path)?),
        TrackerBackend::Json => Box::new(JsonTracker::open(&paths.json_tracker_path)),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn cmd_download(
    paths: &AppPaths,
    backend: TrackerBackend,
    job: DownloadJob,
    platform: Platform,
    settings: Settings,
    json: bool,
) -> Result<()> {
    let tracker = open_tracker(paths, backend)?;
    let limit = job.limit as u64;
    let term = job.term.clone();
    let handle = worker::spawn(job, source::for_platform(platform), HttpFetcher::new(), tracker)?;

    let cancel = handle.cancel_token();
    if let Err(e) = ctrlc::set_handler(move || cancel.cancel()) {
        warn!(error = %e, "could not install Ctrl-C handler");
    }

    let bar = (!json).then(|| progress::download_bar(limit, &format!("#{}", term)));
    for event in handle.events() {
        if json {
            print_json(&event)?;
            continue;
        }
        let Some(ref pb) = bar else { continue };
        match event {
            Event::Status { message } => pb.set_message(message),
            Event::Found { total } => {
                pb.set_length(total as u64);
                pb.set_message(format!("#{}: {} found", term, total));
            }
            Event::Downloaded { count, path, .. } => {
                pb.inc(1);
                progress::println(format!("Downloaded media {}: {}", count, path));
            }
            Event::Skipped { media_id, .. } => {
                pb.inc(1);
                progress::println(format!("Already downloaded: {}", media_id));
            }
            Event::ItemFailed { media_id, error } => {
                pb.inc(1);
                progress::println(format!("Failed {}: {}", media_id, error));
            }
            Event::Finished { .. } => pb.finish_and_clear(),
        }
    }
    if let Some(pb) = bar {
        pb.finish_and_clear();
    }

    let summary = remember_after_run(handle.join(), &settings, &paths.settings_file)?;
    let message = if summary.cancelled {
        format!(
            "Download stopped: {} media downloaded, {} skipped.",
            summary.downloaded, summary.skipped
        )
    } else {
        format!(
            "{} media downloaded, {} skipped.",
            summary.downloaded, summary.skipped
        )
    };
    if json {
        print_json(&StatusResponse {
            success: true,
            message,
            summary: Some(summary),
        })
    } else {
        println!("{}", message);
        Ok(())
    }
}

/// Choices are only remembered once a run has gone through login and search.
fn remember_after_run(run: Result<Summary>, settings: &Settings, path: &Path) -> Result<Summary> {
    let summary = run?;
    if let Err(e) = settings.save(path) {
        warn!(error = %e, "could not save settings");
    }
    Ok(summary)
}

fn cmd_list(paths: &AppPaths, backend: TrackerBackend, filter: MediaFilter, json: bool) -> Result<()> {
    let tracker = open_tracker(paths, backend)?;
    let records = tracker.list(filter)?;

    if json {
        return print_json(&records);
    }

    if records.is_empty() {
        println!("No downloaded media found.");
        return Ok(());
    }

    for record in &records {
        print_record_row(record);
    }
    Ok(())
}

fn cmd_show(paths: &AppPaths, backend: TrackerBackend, key: &str, json: bool) -> Result<()> {
    let tracker = open_tracker(paths, backend)?;
    let mut found = tracker.find_by_hash(&key.to_ascii_lowercase())?;
    if found.is_none() {
        for platform in [Platform::Instagram, Platform::TikTok] {
            found = tracker.find_by_media_id(platform, key)?;
            if found.is_some() {
                break;
            }
        }
    }
    let record = found.ok_or_else(|| TaggrabError::NotFound(format!("no record for '{}'", key)))?;

    if json {
        return print_json(&record);
    }

    print_record_detail(&record);
    Ok(())
}

fn cmd_stats(paths: &AppPaths, backend: TrackerBackend, json: bool) -> Result<()> {
    let tracker = open_tracker(paths, backend)?;
    let stats = tracker.stats()?;

    if json {
        return print_json(&stats);
    }

    println!("Download Statistics");
    println!("───────────────────");
    println!("Total media:  {}", stats.total);
    println!("  Photos:     {}", stats.photos);
    println!("  Videos:     {}", stats.videos);
    println!("  Instagram:  {}", stats.instagram);
    println!("  TikTok:     {}", stats.tiktok);
    println!("Total size:   {}", format_bytes(stats.total_size));
    if let Some(oldest) = stats.oldest {
        println!("Oldest:       {}", oldest.format("%Y-%m-%d %H:%M"));
    }
    if let Some(newest) = stats.newest {
        println!("Newest:       {}", newest.format("%Y-%m-%d %H:%M"));
    }
    Ok(())
}

fn cmd_verify(paths: &AppPaths, backend: TrackerBackend, json: bool) -> Result<()> {
    let tracker = open_tracker(paths, backend)?;
    let report = verify_all(tracker.as_ref())?;

    if json {
        return print_json(&report);
    }

    for finding in &report.findings {
        let problem = match finding.problem {
            taggrab::verify::Problem::Missing => "missing",
            taggrab::verify::Problem::SizeMismatch => "size differs",
            taggrab::verify::Problem::ChecksumMismatch => "checksum differs",
        };
        println!("{:<16} {}", problem, finding.file_path);
    }
    println!(
        "Checked {} file(s): {} ok, {} with problems.",
        report.checked,
        report.ok,
        report.findings.len()
    );
    Ok(())
}

fn cmd_import(paths: &AppPaths, path: Option<PathBuf>, json: bool) -> Result<()> {
    let source = path.unwrap_or_else(|| paths.json_tracker_path.clone());
    let mut tracker = open_tracker(paths, TrackerBackend::Sqlite)?;
    let report = import_into(&source, tracker.as_mut())?;

    if json {
        return print_json(&report);
    }
    println!(
        "Imported {} record(s) from {}, {} already present.",
        report.imported,
        source.display(),
        report.skipped
    );
    Ok(())
}

fn cmd_settings(
    paths: &AppPaths,
    dir: Option<PathBuf>,
    platform: Option<String>,
    delay: Option<u64>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let mut settings = Settings::load(&paths.settings_file);
    let changing = dir.is_some() || platform.is_some() || delay.is_some() || limit.is_some();

    if let Some(dir) = dir {
        settings.download_dir = Some(dir);
    }
    if let Some(p) = platform {
        settings.platform = parse_platform(&p)?;
    }
    if let Some(d) = delay {
        settings.delay_secs = d;
    }
    if let Some(l) = limit {
        if l == 0 {
            return Err(TaggrabError::InvalidInput("limit must be at least 1".into()));
        }
        settings.limit = l;
    }
    if changing {
        settings.save(&paths.settings_file)?;
    }

    if json {
        return print_json(&settings);
    }
    println!(
        "Download dir: {}",
        settings
            .download_dir
            .as_deref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "(not set)".into())
    );
    println!("Platform:     {}", settings.platform.as_str());
    println!("Delay:        {}s", settings.delay_secs);
    println!("Limit:        {}", settings.limit);
    Ok(())
}

fn print_record_row(record: &MediaRecord) {
    let kind = match record.kind {
        MediaKind::Photo => "P",
        MediaKind::Video => "V",
    };
    let platform = match record.platform {
        Platform::Instagram => "ig",
        Platform::TikTok => "tt",
    };
    let age = format_age(record.downloaded_at);
    println!(
        "{:>5} {} {} {:>5}  #{:<16} {}",
        record.id, kind, platform, age, record.search_term, record.file_path
    );
}

fn print_record_detail(record: &MediaRecord) {
    println!("ID:         {}", record.id);
    println!("Hash:       {}", record.url_hash);
    println!("Media ID:   {}", record.media_id);
    println!("Platform:   {}", record.platform.as_str());
    println!("Kind:       {}", record.kind.as_str());
    println!("Term:       #{}", record.search_term);
    println!("Downloaded: {}", record.downloaded_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Size:       {}", format_bytes(record.size_bytes));
    println!("File:       {}", record.file_path);
    println!("Source:     {}", record.source_url);
    if let Some(ref sha) = record.sha256 {
        println!("SHA-256:    {}", sha);
    }
}

fn format_age(dt: chrono::DateTime<Utc>) -> String {
    let dur = Utc::now() - dt;
    if dur.num_seconds() < 60 {
        "now".to_string()
    } else if dur.num_minutes() < 60 {
        format!("{}m", dur.num_minutes())
    } else if dur.num_hours() < 24 {
        format!("{}h", dur.num_hours())
    } else {
        format!("{}d", dur.num_days())
    }
}

fn format_bytes(bytes: i64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chosen() -> Settings {
        Settings {
            download_dir: Some(PathBuf::from("/data/tags")),
            platform: Platform::TikTok,
            ..Settings::default()
        }
    }

    #[test]
    fn test_failed_run_leaves_settings_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let run = Err(TaggrabError::Login("bad password".into()));
        assert!(remember_after_run(run, &chosen(), &path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_finished_run_saves_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let summary = remember_after_run(Ok(Summary::default()), &chosen(), &path).unwrap();
        assert_eq!(summary.downloaded, 0);
        assert_eq!(Settings::load(&path), chosen());
    }
}
