//! # Remote Node Backend
//!
//! Drives a Lavalink v4 node: tracks are loaded and played over REST, and a
//! persistent control WebSocket carries the session id plus track events.
//! The node speaks the voice protocol itself; this backend only forwards the
//! voice credentials captured in the [`VoiceSessionCache`].
//!
//! Completion is event-driven (TrackEnd for our track) with a REST poll as a
//! fallback for missed events.

pub mod link;
pub mod rest;
pub mod socket;

use async_trait::async_trait;
use dashmap::DashSet;
use serde::Deserialize;
use serenity::model::id::{GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::{
    link::{truncate, NodeLink, TrackSignal, TrackWatch},
    rest::{HttpNodeRest, NodeRest, NodeTrack, PlayerUpdate, RawLoadResult},
    socket::{NodeConnector, WsNodeConnector},
};
use crate::{
    audio::{
        backend::{Backend, PlayRequest},
        song::Song,
    },
    config::LavalinkConfig,
    error::{MusicError, MusicResult},
    voice::{JoinMode, VoiceSessionCache},
};

const STARTUP_ATTEMPTS: u32 = 15;
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(2);
const VOICE_WAIT: Duration = Duration::from_secs(8);
const VOICE_RETRY_WAIT: Duration = Duration::from_secs(5);
const POLL_GRACE: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Consecutive failed polls tolerated before the song is given up.
const MAX_POLL_FAILURES: u32 = 3;

pub struct RemoteNodeBackend {
    rest: Arc<dyn NodeRest>,
    link: Arc<NodeLink>,
    voice: Arc<VoiceSessionCache>,
    /// Guilds with a node player bound to voice.
    bound: DashSet<GuildId>,
}

impl RemoteNodeBackend {
    /// Waits for the node to answer, then opens the control socket.
    pub async fn connect(
        config: &LavalinkConfig,
        voice: Arc<VoiceSessionCache>,
        user_id: UserId,
    ) -> MusicResult<Self> {
        info!("🎼 Conectando con Lavalink en {}", config.base_url());
        let rest = Arc::new(HttpNodeRest::new(config)?);
        let connector = Arc::new(WsNodeConnector::new(config, user_id));
        Self::with_parts(rest, connector, voice).await
    }

    pub async fn with_parts(
        rest: Arc<dyn NodeRest>,
        connector: Arc<dyn NodeConnector>,
        voice: Arc<VoiceSessionCache>,
    ) -> MusicResult<Self> {
        wait_for_node(rest.as_ref()).await?;

        let link = NodeLink::new(connector);
        link.ensure_session().await?;

        Ok(Self {
            rest,
            link,
            voice,
            bound: DashSet::new(),
        })
    }

    /// Binds the node's player for `guild_id` to the platform voice
    /// credentials. A stale session gets one forced reconnect and one retry.
    /// Returns the session id the bind succeeded with.
    pub(crate) async fn bind_voice(&self, guild_id: GuildId) -> MusicResult<String> {
        let session = self.link.ensure_session().await?;
        let credentials = self.voice.wait_ready(guild_id, VOICE_WAIT).await?;

        debug!(
            "🎫 Voz capturada: token={}, endpoint={}, sessionId={}",
            truncate(&credentials.token, 8),
            credentials.endpoint,
            truncate(&credentials.session_id, 12)
        );

        let err = match self
            .rest
            .update_player(&session, guild_id, &PlayerUpdate::voice(&credentials))
            .await
        {
            Ok(()) => return Ok(session),
            Err(e) if e.is_session_stale() => e,
            Err(e) => return Err(e),
        };

        warn!("⚠️ Sesión del nodo obsoleta ({}), reconectando y reintentando...", err);
        let fresh = self.link.reconnect(&session).await?;
        info!("🔁 Nueva sesión {}, reintentando actualización de voz", truncate(&fresh, 12));

        let credentials = self
            .voice
            .wait_ready(guild_id, VOICE_RETRY_WAIT)
            .await
            .unwrap_or(credentials);

        self.rest
            .update_player(&fresh, guild_id, &PlayerUpdate::voice(&credentials))
            .await?;
        Ok(fresh)
    }

    async fn destroy(&self, guild_id: GuildId) {
        self.bound.remove(&guild_id);
        if let Some(session) = self.link.session_id() {
            if let Err(e) = self.rest.destroy_player(&session, guild_id).await {
                warn!("⚠️ No se pudo destruir el player de guild {}: {}", guild_id, e);
            }
        }
    }

    async fn start_and_wait(
        &self,
        guild_id: GuildId,
        song: &Song,
        volume: u8,
        cancel: &CancellationToken,
        watch: &mut TrackWatch,
    ) -> MusicResult<()> {
        let session = self.bind_voice(guild_id).await?;
        if cancel.is_cancelled() {
            return Ok(());
        }

        self.rest
            .update_player(&session, guild_id, &PlayerUpdate::start(&song.track, volume))
            .await?;
        self.bound.insert(guild_id);
        info!(
            "🎵 Pista iniciada: {} (session={}, guild={})",
            song.title,
            truncate(&session, 12),
            guild_id
        );

        self.await_completion(guild_id, &song.track, cancel, watch).await
    }

    /// Waits for our track to end. A `finished` TrackEnd only counts after
    /// this play saw its own TrackStart; `stopped` and `cleanup` ends belong to
    /// a player torn down earlier and are left to the poll.
    async fn await_completion(
        &self,
        guild_id: GuildId,
        encoded: &str,
        cancel: &CancellationToken,
        watch: &mut TrackWatch,
    ) -> MusicResult<()> {
        let mut poll = interval_at(Instant::now() + POLL_GRACE, POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;
        let mut started = false;
        let mut poll_failures = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.destroy(guild_id).await;
                    return Ok(());
                }
                signal = watch.signals.recv(), if events_open => match signal {
                    Some(TrackSignal::Started { encoded: begun }) if begun == encoded => started = true,
                    Some(TrackSignal::Ended { encoded: ended, reason }) if ended == encoded => {
                        match reason.as_str() {
                            "loadFailed" => {
                                self.bound.remove(&guild_id);
                                return Err(MusicError::TrackFailed("el nodo no pudo cargar la pista".to_string()));
                            }
                            "finished" if started => {
                                debug!("Fin de pista por evento en guild {}", guild_id);
                                self.bound.remove(&guild_id);
                                return Ok(());
                            }
                            _ => debug!("TrackEnd ignorado en guild {} (reason={}, started={})", guild_id, reason, started),
                        }
                    }
                    Some(TrackSignal::Failed { encoded: failed, message }) if failed == encoded => {
                        self.bound.remove(&guild_id);
                        return Err(MusicError::TrackFailed(message));
                    }
                    Some(_) => {}
                    None => events_open = false,
                },
                _ = poll.tick() => {
                    let Some(session) = self.link.session_id() else {
                        warn!("⚠️ Sesión perdida durante la reproducción en guild {}", guild_id);
                        self.bound.remove(&guild_id);
                        return Err(MusicError::NoSession);
                    };
                    let player = match self.rest.get_player(&session, guild_id).await {
                        Ok(player) => {
                            poll_failures = 0;
                            player
                        }
                        Err(e) => {
                            poll_failures += 1;
                            if poll_failures >= MAX_POLL_FAILURES {
                                warn!("❌ El nodo no responde en guild {}, abandonando la pista: {}", guild_id, e);
                                self.destroy(guild_id).await;
                                return Err(e);
                            }
                            warn!(
                                "⚠️ Consulta al nodo falló en guild {} ({}/{}): {}",
                                guild_id, poll_failures, MAX_POLL_FAILURES, e
                            );
                            continue;
                        }
                    };
                    match player {
                        Some(player) if player.track.is_some() => {}
                        Some(player) => {
                            info!(
                                "✅ Pista terminada en guild {} (connected={})",
                                guild_id, player.state.connected
                            );
                            self.bound.remove(&guild_id);
                            return Ok(());
                        }
                        None => {
                            info!("✅ Player no encontrado en guild {}, se da por terminada", guild_id);
                            self.bound.remove(&guild_id);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// PATCH for an already bound guild; no session or no player is a no-op.
    async fn patch_bound(&self, guild_id: GuildId, update: PlayerUpdate) -> MusicResult<()> {
        if !self.bound.contains(&guild_id) {
            return Ok(());
        }
        let Some(session) = self.link.session_id() else {
            return Ok(());
        };
        self.rest.update_player(&session, guild_id, &update).await
    }
}

async fn wait_for_node(rest: &dyn NodeRest) -> MusicResult<()> {
    let mut last_error = None;
    for attempt in 1..=STARTUP_ATTEMPTS {
        match rest.version().await {
            Ok(version) => {
                info!("✅ Lavalink disponible (versión {})", version.trim());
                return Ok(());
            }
            Err(e) => {
                warn!("⏳ Esperando a Lavalink (intento {}/{}): {}", attempt, STARTUP_ATTEMPTS, e);
                last_error = Some(e);
            }
        }
        if attempt < STARTUP_ATTEMPTS {
            tokio::time::sleep(STARTUP_RETRY_DELAY).await;
        }
    }
    Err(MusicError::Config(format!(
        "Lavalink no respondió tras {} intentos: {}",
        STARTUP_ATTEMPTS,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn is_http(s: &str) -> bool {
    let lower = s.trim().to_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn track_to_song(track: NodeTrack) -> Song {
    let duration = if track.info.is_stream {
        0
    } else {
        track.info.length / 1000
    };
    Song::new(track.info.title, track.info.uri.unwrap_or_default(), track.encoded).with_duration(duration)
}

#[derive(Deserialize)]
struct PlaylistData {
    #[serde(default)]
    tracks: Vec<NodeTrack>,
}

#[derive(Deserialize)]
struct LoadError {
    #[serde(default)]
    message: Option<String>,
}

/// Interprets a `/v4/loadtracks` result. List types yield their first track.
pub fn song_from_load_result(result: RawLoadResult, query: &str) -> MusicResult<Song> {
    let first = |tracks: Vec<NodeTrack>| {
        tracks
            .into_iter()
            .next()
            .map(track_to_song)
            .ok_or_else(|| MusicError::NoResults(query.to_string()))
    };

    match result.load_type.as_str() {
        "track" => Ok(track_to_song(serde_json::from_value(result.data)?)),
        "search" => first(serde_json::from_value(result.data)?),
        "playlist" => first(serde_json::from_value::<PlaylistData>(result.data)?.tracks),
        "empty" => Err(MusicError::NoResults(query.to_string())),
        "error" => {
            let detail = serde_json::from_value::<LoadError>(result.data)
                .ok()
                .and_then(|e| e.message)
                .unwrap_or_else(|| "el nodo no pudo cargar la pista".to_string());
            Err(MusicError::Resolution(detail))
        }
        other => Err(MusicError::Resolution(format!("loadType desconocido: {}", other))),
    }
}

#[async_trait]
impl Backend for RemoteNodeBackend {
    fn name(&self) -> &'static str {
        "lavalink"
    }

    fn join_mode(&self) -> JoinMode {
        JoinMode::SignallingOnly
    }

    async fn resolve(&self, query: &str) -> MusicResult<Song> {
        let q = query.trim();
        if q.is_empty() {
            return Err(MusicError::EmptyQuery);
        }

        let identifier = if is_http(q) {
            q.to_string()
        } else {
            format!("ytsearch:{}", q)
        };

        let result = self.rest.load_tracks(&identifier).await?;
        song_from_load_result(result, q)
    }

    async fn play(&self, request: PlayRequest) -> MusicResult<()> {
        let guild_id = request.guild_id();
        let PlayRequest {
            song,
            volume,
            cancel,
            ..
        } = request;

        if song.track.is_empty() {
            return Err(MusicError::Resolution(format!(
                "\"{}\" no tiene pista codificada",
                song.title
            )));
        }

        // Se registra antes del PATCH para no perder un TrackEnd temprano
        let mut watch = self.link.watch(guild_id);
        let result = self
            .start_and_wait(guild_id, &song, volume, &cancel, &mut watch)
            .await;
        self.link.unwatch(guild_id, &watch);
        result
    }

    async fn set_volume(&self, guild_id: GuildId, volume: u8) -> MusicResult<()> {
        self.patch_bound(guild_id, PlayerUpdate::volume(volume)).await
    }

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> MusicResult<()> {
        self.patch_bound(guild_id, PlayerUpdate::paused(paused)).await
    }

    async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.bound.iter().map(|g| *g).collect();
        for guild_id in guilds {
            self.destroy(guild_id).await;
        }
        self.link.shutdown();
        info!("👋 Backend Lavalink cerrado");
    }
}
