use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

use crate::error::MusicError;

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Música
    pub music: MusicConfig,
}

/// Which playback engine the process runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// yt-dlp + ffmpeg in this process.
    Direct,
    /// Remote Lavalink v4 node.
    Lavalink,
}

impl FromStr for BackendKind {
    type Err = MusicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "direct" => Ok(BackendKind::Direct),
            "lavalink" => Ok(BackendKind::Lavalink),
            other => Err(MusicError::Config(format!(
                "backend de música desconocido: {:?} (usa \"direct\" o \"lavalink\")",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MusicConfig {
    pub enabled: bool,
    pub backend: BackendKind,
    pub max_queue_size: usize,
    pub max_song_duration: u64, // En segundos, 0 = sin límite
    pub default_volume: u8,
    pub idle_disconnect: Duration,

    pub direct: DirectConfig,
    pub lavalink: LavalinkConfig,
}

#[derive(Debug, Clone)]
pub struct DirectConfig {
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
    /// Results shorter than this are treated as SoundCloud preview clips.
    pub preview_min_duration: u64,
    pub preview_url_pattern: String,
}

#[derive(Debug, Clone)]
pub struct LavalinkConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub secure: bool,
    pub client_name: String,
}

impl LavalinkConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn websocket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = MusicConfig::default();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN").context("DISCORD_TOKEN no definido")?,
            application_id: std::env::var("APPLICATION_ID")
                .context("APPLICATION_ID no definido")?
                .parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            music: MusicConfig {
                enabled: env_or("MUSIC_ENABLED", defaults.enabled)?,
                backend: match std::env::var("MUSIC_BACKEND") {
                    Ok(val) if !val.trim().is_empty() => val.parse()?,
                    _ => defaults.backend,
                },
                max_queue_size: env_or("MAX_QUEUE_SIZE", defaults.max_queue_size)?,
                max_song_duration: env_or("MAX_SONG_DURATION", defaults.max_song_duration)?,
                default_volume: env_or("DEFAULT_VOLUME", defaults.default_volume)?,
                idle_disconnect: match std::env::var("IDLE_DISCONNECT") {
                    Ok(val) if !val.trim().is_empty() => humantime::parse_duration(val.trim())
                        .context("IDLE_DISCONNECT inválido (ejemplo: 2m, 90s)")?,
                    _ => defaults.idle_disconnect,
                },

                direct: DirectConfig {
                    ytdlp_path: env_or("YTDLP_PATH", defaults.direct.ytdlp_path)?,
                    ffmpeg_path: env_or("FFMPEG_PATH", defaults.direct.ffmpeg_path)?,
                    preview_min_duration: env_or(
                        "PREVIEW_MIN_DURATION",
                        defaults.direct.preview_min_duration,
                    )?,
                    preview_url_pattern: env_or(
                        "PREVIEW_URL_PATTERN",
                        defaults.direct.preview_url_pattern,
                    )?,
                },

                lavalink: LavalinkConfig {
                    host: env_or("LAVALINK_HOST", defaults.lavalink.host)?,
                    port: env_or("LAVALINK_PORT", defaults.lavalink.port)?,
                    password: env_or("LAVALINK_PASSWORD", defaults.lavalink.password)?,
                    secure: env_or("LAVALINK_SECURE", defaults.lavalink.secure)?,
                    client_name: env_or("LAVALINK_CLIENT_NAME", defaults.lavalink.client_name)?,
                },
            },
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Max queue size must be greater than 0
    /// - Default volume must be between 0 and 100
    /// - The preview URL pattern must be a valid regex
    pub fn validate(&self) -> Result<()> {
        let music = &self.music;

        if music.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if music.default_volume > 100 {
            anyhow::bail!("Default volume must be between 0 and 100, got: {}", music.default_volume);
        }

        regex::Regex::new(&music.direct.preview_url_pattern)
            .with_context(|| format!("PREVIEW_URL_PATTERN inválido: {}", music.direct.preview_url_pattern))?;

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes tokens and the Lavalink password.
    pub fn summary(&self) -> String {
        let music = &self.music;
        let backend = match music.backend {
            BackendKind::Direct => format!(
                "direct (yt-dlp: {}, ffmpeg: {})",
                music.direct.ytdlp_path, music.direct.ffmpeg_path
            ),
            BackendKind::Lavalink => format!("lavalink ({})", music.lavalink.base_url()),
        };

        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Music: enabled={}, backend={}\n  \
            Limits: {} queue, {}s max duration, {}% default volume, idle {}",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            music.enabled,
            backend,
            music.max_queue_size,
            music.max_song_duration,
            music.default_volume,
            humantime::format_duration(music.idle_disconnect),
        )
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val
            .trim()
            .parse()
            .with_context(|| format!("{} tiene un valor inválido: {}", key, val)),
        _ => Ok(default),
    }
}

/// Default music settings.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Direct,
            max_queue_size: 100,
            max_song_duration: 0,
            default_volume: 50,
            idle_disconnect: Duration::from_secs(120),

            direct: DirectConfig {
                ytdlp_path: "yt-dlp".to_string(),
                ffmpeg_path: "ffmpeg".to_string(),
                preview_min_duration: 45,
                preview_url_pattern: r"cf-preview-media\.sndcdn\.com".to_string(),
            },

            lavalink: LavalinkConfig {
                host: "localhost".to_string(),
                port: 2333,
                password: "youshallnotpass".to_string(),
                secure: false,
                client_name: format!("guild-jukebox/{}", env!("CARGO_PKG_VERSION")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            discord_token: "token".to_string(),
            application_id: 1,
            guild_id: None,
            music: MusicConfig::default(),
        }
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("direct".parse::<BackendKind>().unwrap(), BackendKind::Direct);
        assert_eq!(" Lavalink ".parse::<BackendKind>().unwrap(), BackendKind::Lavalink);
        assert!(matches!("ffmpeg".parse::<BackendKind>(), Err(MusicError::Config(_))));
    }

    #[test]
    fn test_lavalink_urls() {
        let mut lavalink = MusicConfig::default().lavalink;
        assert_eq!(lavalink.base_url(), "http://localhost:2333");
        assert_eq!(lavalink.websocket_url(), "ws://localhost:2333/v4/websocket");

        lavalink.secure = true;
        lavalink.host = "node.example".to_string();
        assert_eq!(lavalink.base_url(), "https://node.example:2333");
        assert_eq!(lavalink.websocket_url(), "wss://node.example:2333/v4/websocket");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(config().validate().is_ok());

        let mut cfg = config();
        cfg.music.max_queue_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.music.default_volume = 150;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.music.direct.preview_url_pattern = "(".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_summary_hides_secrets() {
        let mut cfg = config();
        cfg.music.backend = BackendKind::Lavalink;
        let summary = cfg.summary();
        assert!(summary.contains("lavalink (http://localhost:2333)"));
        assert!(!summary.contains("youshallnotpass"));
        assert!(!summary.contains("token"));
    }
}
