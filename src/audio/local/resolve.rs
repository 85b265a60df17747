//! Query classification and yt-dlp lookups for the local pipeline.

use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    audio::song::Song,
    config::DirectConfig,
    error::{MusicError, MusicResult},
};

const YTDLP_TIMEOUT: Duration = Duration::from_secs(30);
const JSON_PREVIEW_LEN: usize = 500;

const DIRECT_AUDIO_EXTENSIONS: &[&str] = &[
    ".mp3", ".m4a", ".aac", ".ogg", ".opus", ".flac", ".wav", ".webm", ".m3u8", ".pls", ".m3u",
    ".mpd",
];

/// Proveedor elegido por prefijo en la búsqueda
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    YouTube,
    SoundCloud,
    Bandcamp,
    /// Sin prefijo: búsqueda en SoundCloud
    Default,
}

/// Splits `yt:`, `sc:` or `bc:` off the query (case-insensitive).
pub fn split_provider_prefix(query: &str) -> (Provider, &str) {
    let trimmed = query.trim();
    for (prefix, provider) in [
        ("yt:", Provider::YouTube),
        ("sc:", Provider::SoundCloud),
        ("bc:", Provider::Bandcamp),
    ] {
        let matches = trimmed
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
        if matches {
            return (provider, trimmed[prefix.len()..].trim());
        }
    }
    (Provider::Default, trimmed)
}

pub fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Radio streams and plain audio files skip yt-dlp entirely.
pub fn looks_like_direct_audio_url(raw: &str) -> bool {
    let Ok(parsed) = Url::parse(raw) else {
        return false;
    };
    let path = parsed.path().to_lowercase();
    if DIRECT_AUDIO_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return true;
    }
    let lower = raw.to_lowercase();
    lower.contains("icecast") || lower.contains("stream")
}

pub fn derive_title_from_url(raw: &str) -> String {
    const FALLBACK: &str = "Direct stream";

    let Ok(parsed) = Url::parse(raw) else {
        return FALLBACK.to_string();
    };
    let segment = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|s| {
            urlencoding::decode(s)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| s.to_string())
        })
        .unwrap_or_default();

    let segment = segment.trim();
    if segment.is_empty() || segment == "." {
        FALLBACK.to_string()
    } else {
        segment.to_string()
    }
}

/// What a query turns into before touching the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Playable as is, no yt-dlp round trip.
    Direct(Song),
    /// Argument for yt-dlp (`scsearch5:...`, `ytsearch1:...` or a page URL).
    YtDlp(String),
}

pub fn classify_query(query: &str) -> MusicResult<Lookup> {
    let q = query.trim();
    if q.is_empty() {
        return Err(MusicError::EmptyQuery);
    }

    if is_http_url(q) && looks_like_direct_audio_url(q) {
        return Ok(Lookup::Direct(Song::new(derive_title_from_url(q), q, q)));
    }

    let (provider, term) = split_provider_prefix(q);

    if provider == Provider::Bandcamp {
        if !is_http_url(term) {
            return Err(MusicError::BandcampUrlRequired);
        }
        return Ok(Lookup::YtDlp(term.to_string()));
    }

    if is_http_url(q) {
        return Ok(Lookup::YtDlp(q.to_string()));
    }

    if term.is_empty() {
        return Err(MusicError::MissingSearchTerm);
    }

    let search = match provider {
        Provider::YouTube => format!("ytsearch1:{}", term),
        _ => format!("scsearch5:{}", term),
    };
    Ok(Lookup::YtDlp(search))
}

fn is_soundcloud(target: &str) -> bool {
    target.starts_with("scsearch") || target.contains("soundcloud.com")
}

/// yt-dlp arguments for one lookup, target last.
pub fn ytdlp_args(target: &str) -> Vec<String> {
    let mut args: Vec<String> = ["--no-playlist", "--dump-json", "--no-warnings", "--no-check-certificates"]
        .into_iter()
        .map(String::from)
        .collect();

    if is_soundcloud(target) {
        args.extend(["-f", "http_mp3_128/http_mp3_64/bestaudio/best"].map(String::from));
    } else {
        args.extend(
            [
                "-f",
                "bestaudio/best",
                "--format-sort",
                "proto:https,ext:m4a:mp3:opus:ogg,aext:m4a:mp3:opus:ogg,acodec:opus:aac",
                "--extractor-args",
                "youtube:player_client=android",
                "--extractor-args",
                "youtube:player_skip=webpage,configs,js",
            ]
            .map(String::from),
        );
    }

    args.push(target.to_string());
    args
}

/// Rejects SoundCloud's 30-second preview clips.
#[derive(Debug, Clone)]
pub struct PreviewFilter {
    pub min_duration: u64,
    pub url_pattern: Regex,
}

impl PreviewFilter {
    pub fn from_config(config: &DirectConfig) -> MusicResult<Self> {
        let url_pattern = Regex::new(&config.preview_url_pattern).map_err(|e| {
            MusicError::Config(format!("PREVIEW_URL_PATTERN inválido: {}", e))
        })?;
        Ok(Self {
            min_duration: config.preview_min_duration,
            url_pattern,
        })
    }

    /// A duration of 0 means unknown and never counts as short.
    pub fn rejects(&self, duration_secs: u64, stream_url: &str) -> bool {
        let too_short = duration_secs > 0 && duration_secs < self.min_duration;
        too_short || self.url_pattern.is_match(&stream_url.to_lowercase())
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    webpage_url: String,
    #[serde(default)]
    duration: Option<f64>,
}

/// Parses `--dump-json` output into a [`Song`]. Searches print one JSON
/// object per line; the first candidate that passes `filter` wins. `filter`
/// is applied only for SoundCloud lookups.
pub fn song_from_ytdlp_output(stdout: &str, filter: Option<&PreviewFilter>) -> MusicResult<Song> {
    let output = stdout.trim();
    if output.is_empty() {
        return Err(MusicError::Resolution("yt-dlp no devolvió datos".to_string()));
    }

    let mut rejected = None;
    for candidate in serde_json::Deserializer::from_str(output).into_iter::<YtDlpInfo>() {
        let info = candidate.map_err(|e| invalid_json(output, e))?;
        match song_from_info(info, filter) {
            Ok(song) => return Ok(song),
            Err(e) => {
                debug!("⏭️ Resultado descartado: {}", e);
                rejected = Some(e);
            }
        }
    }

    Err(rejected.unwrap_or_else(|| MusicError::Resolution("yt-dlp no devolvió datos".to_string())))
}

fn invalid_json(output: &str, e: serde_json::Error) -> MusicError {
    let preview: String = output.chars().take(JSON_PREVIEW_LEN).collect();
    let ellipsis = if output.chars().count() > JSON_PREVIEW_LEN { "..." } else { "" };
    MusicError::Resolution(format!(
        "JSON de yt-dlp inválido: {} (salida: {}{})",
        e, preview, ellipsis
    ))
}

fn song_from_info(info: YtDlpInfo, filter: Option<&PreviewFilter>) -> MusicResult<Song> {
    let duration = info.duration.filter(|d| d.is_finite() && *d > 0.0).unwrap_or(0.0) as u64;

    if let Some(filter) = filter {
        if filter.rejects(duration, &info.url) {
            return Err(MusicError::PreviewStream(duration));
        }
    }

    if info.url.is_empty() {
        return Err(MusicError::Resolution(format!(
            "yt-dlp no devolvió un stream para \"{}\"",
            info.title
        )));
    }

    let page = if info.webpage_url.is_empty() {
        info.url.clone()
    } else {
        info.webpage_url
    };

    Ok(Song::new(info.title, page, info.url).with_duration(duration))
}

/// Runs yt-dlp for one target and turns its output into a [`Song`]. A failed
/// run is reported as a resolution error carrying yt-dlp's stderr.
pub async fn resolve_with_ytdlp(
    ytdlp_path: &str,
    target: &str,
    filter: &PreviewFilter,
) -> MusicResult<Song> {
    debug!("🔍 yt-dlp: {}", target);

    let mut cmd = Command::new(ytdlp_path);
    cmd.args(ytdlp_args(target)).kill_on_drop(true);

    let output = tokio::time::timeout(YTDLP_TIMEOUT, cmd.output())
        .await
        .map_err(|_| {
            MusicError::Resolution(format!("yt-dlp no respondió en {}s", YTDLP_TIMEOUT.as_secs()))
        })??;

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        let detail = if stderr.is_empty() {
            output.status.to_string()
        } else {
            stderr
        };
        warn!("⚠️ yt-dlp falló para {}: {}", target, detail);
        return Err(MusicError::Resolution(format!("yt-dlp falló: {}", detail)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        return Err(MusicError::Resolution(format!(
            "yt-dlp no devolvió datos (stderr: {})",
            stderr
        )));
    }

    let filter = is_soundcloud(target).then_some(filter);
    let song = song_from_ytdlp_output(&stdout, filter)?;
    info!("✅ Resuelto: {} ({}s)", song.title, song.duration_secs);
    Ok(song)
}
