//! # Local Pipeline Backend
//!
//! Resolves queries with yt-dlp and transcodes them with ffmpeg into Opus
//! frames that are paced onto the voice connection from this process.
//!
//! Pause is real: the pacer stops pulling frames and ffmpeg blocks on its
//! output pipe until playback resumes. Volume is baked into the ffmpeg filter,
//! so a change applies from the next track.

pub mod pipeline;
pub mod resolve;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use std::{process::Child, sync::Arc};
use tokio::{process::Command, sync::watch};
use tracing::{debug, error, info, warn};

use self::{
    pipeline::{PaceOutcome, DEMUX_BUFFER},
    resolve::{Lookup, PreviewFilter},
};
use crate::{
    audio::{
        backend::{Backend, PlayRequest},
        song::Song,
    },
    config::DirectConfig,
    error::{MusicError, MusicResult},
    voice::JoinMode,
};

/// The transcoder and pause switch of the song currently playing in a guild.
struct ActiveStream {
    transcoder: Mutex<Option<Child>>,
    paused: watch::Sender<bool>,
}

impl ActiveStream {
    fn new(transcoder: Child, paused: watch::Sender<bool>) -> Self {
        Self {
            transcoder: Mutex::new(Some(transcoder)),
            paused,
        }
    }

    /// Kills ffmpeg if it is still running and reaps it on the blocking pool.
    /// Later calls are no-ops.
    async fn kill(&self) {
        let Some(mut child) = self.transcoder.lock().take() else {
            return;
        };
        // Ok(None): sigue corriendo
        if let Ok(None) = child.try_wait() {
            if let Err(e) = child.kill() {
                warn!("⚠️ No se pudo terminar ffmpeg: {}", e);
            }
        }
        match tokio::task::spawn_blocking(move || child.wait()).await {
            Ok(Ok(status)) => debug!("ffmpeg terminó: {}", status),
            Ok(Err(e)) => warn!("⚠️ No se pudo esperar a ffmpeg: {}", e),
            Err(e) => warn!("⚠️ La tarea de espera de ffmpeg falló: {}", e),
        }
    }
}

pub struct LocalPipelineBackend {
    ytdlp_path: String,
    ffmpeg_path: String,
    preview_filter: PreviewFilter,
    active: DashMap<GuildId, Arc<ActiveStream>>,
}

impl LocalPipelineBackend {
    /// Fails with a configuration error when either binary is missing.
    pub async fn new(config: &DirectConfig) -> MusicResult<Self> {
        verify_binaries(config).await?;

        Ok(Self {
            ytdlp_path: config.ytdlp_path.clone(),
            ffmpeg_path: config.ffmpeg_path.clone(),
            preview_filter: PreviewFilter::from_config(config)?,
            active: DashMap::new(),
        })
    }

    async fn stream_url(&self, song: &Song) -> MusicResult<String> {
        if !song.track.is_empty() {
            return Ok(song.track.clone());
        }
        info!("🔄 Sin URL de stream para {}, resolviendo de nuevo...", song.title);
        Ok(self.resolve(&song.url).await?.track)
    }
}

/// Checks that yt-dlp and ffmpeg can be executed.
pub async fn verify_binaries(config: &DirectConfig) -> MusicResult<()> {
    verify_binary(&config.ytdlp_path, "--version", "pip install yt-dlp").await?;
    verify_binary(&config.ffmpeg_path, "-version", "sudo apt install ffmpeg").await
}

async fn verify_binary(path: &str, version_flag: &str, hint: &str) -> MusicResult<()> {
    match Command::new(path).arg(version_flag).output().await {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            let first_line = version.lines().next().unwrap_or_default();
            info!("✅ {} disponible: {}", path, first_line.trim());
            Ok(())
        }
        Ok(output) => {
            error!("❌ {} no funciona ({}). Instala con: {}", path, output.status, hint);
            Err(MusicError::Config(format!("{} salió con {}", path, output.status)))
        }
        Err(e) => {
            error!("❌ {} no encontrado. Instala con: {}", path, hint);
            Err(MusicError::Config(format!("{} no encontrado: {}", path, e)))
        }
    }
}

#[async_trait]
impl Backend for LocalPipelineBackend {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn join_mode(&self) -> JoinMode {
        JoinMode::Media
    }

    async fn resolve(&self, query: &str) -> MusicResult<Song> {
        match resolve::classify_query(query)? {
            Lookup::Direct(song) => {
                debug!("📻 URL directa: {}", song.url);
                Ok(song)
            }
            Lookup::YtDlp(target) => {
                resolve::resolve_with_ytdlp(&self.ytdlp_path, &target, &self.preview_filter).await
            }
        }
    }

    async fn play(&self, request: PlayRequest) -> MusicResult<()> {
        let guild_id = request.guild_id();
        let PlayRequest {
            connection,
            song,
            volume,
            cancel,
        } = request;

        let stream_url = self.stream_url(&song).await?;
        if cancel.is_cancelled() {
            return Ok(());
        }

        let mut child = pipeline::spawn_transcoder(&self.ffmpeg_path, &stream_url, volume)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (paused_tx, paused_rx) = watch::channel(false);
        let stream = Arc::new(ActiveStream::new(child, paused_tx));

        let Some(stdout) = stdout else {
            stream.kill().await;
            return Err(MusicError::Subprocess {
                tool: "ffmpeg".to_string(),
                detail: "sin stdout".to_string(),
            });
        };

        if let Some(previous) = self.active.insert(guild_id, stream.clone()) {
            previous.kill().await;
        }

        if let Some(stderr) = stderr {
            tokio::task::spawn_blocking(move || pipeline::drain_stderr(stderr));
        }

        let (frames_tx, frames_rx) = flume::bounded::<Bytes>(DEMUX_BUFFER);
        let demux = tokio::task::spawn_blocking(move || pipeline::demux_opus(stdout, frames_tx));

        info!("🎵 Reproduciendo en guild {}: {}", guild_id, song.title);

        let (outcome, stats) = match connection.set_speaking(true).await {
            Ok(()) => {
                let result =
                    pipeline::pace_frames(frames_rx, connection.as_ref(), &cancel, paused_rx).await;
                if let Err(e) = connection.set_speaking(false).await {
                    debug!("set_speaking(false) falló: {}", e);
                }
                result
            }
            Err(e) => {
                drop(frames_rx);
                stream.kill().await;
                self.active.remove_if(&guild_id, |_, current| Arc::ptr_eq(current, &stream));
                return Err(e);
            }
        };

        // El receptor ya se soltó dentro de pace_frames; matar ffmpeg desbloquea el demuxer
        stream.kill().await;
        self.active.remove_if(&guild_id, |_, current| Arc::ptr_eq(current, &stream));

        let demuxed = match demux.await {
            Ok(result) => result,
            Err(e) => Err(MusicError::Subprocess {
                tool: "ffmpeg".to_string(),
                detail: format!("la tarea de demux falló: {}", e),
            }),
        };

        debug!(
            "📊 Guild {}: {} frames enviados, {} descartados",
            guild_id, stats.sent, stats.dropped
        );

        match outcome {
            PaceOutcome::Cancelled => {
                info!("⏹️ Reproducción detenida en guild {}", guild_id);
                Ok(())
            }
            PaceOutcome::ConnectionLost => Err(MusicError::Voice(
                "la conexión de voz dejó de aceptar audio".to_string(),
            )),
            PaceOutcome::Finished => {
                demuxed?;
                info!("✅ Terminó en guild {}: {}", guild_id, song.title);
                Ok(())
            }
        }
    }

    async fn stop(&self, guild_id: GuildId) {
        if let Some((_, stream)) = self.active.remove(&guild_id) {
            stream.kill().await;
        }
    }

    async fn set_volume(&self, guild_id: GuildId, volume: u8) -> MusicResult<()> {
        debug!("🔊 Volumen {} en guild {} (aplica desde la siguiente canción)", volume, guild_id);
        Ok(())
    }

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> MusicResult<()> {
        if let Some(stream) = self.active.get(&guild_id) {
            stream.paused.send_replace(paused);
            debug!("⏯️ Guild {} pausado={}", guild_id, paused);
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let streams: Vec<Arc<ActiveStream>> = self.active.iter().map(|e| e.value().clone()).collect();
        self.active.clear();
        for stream in streams {
            stream.kill().await;
        }
    }
}
