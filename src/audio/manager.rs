use dashmap::DashMap;
use serenity::{
    model::id::{GuildId, UserId},
    prelude::TypeMapKey,
};
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::{
    audio::{
        backend::Backend, lavalink::RemoteNodeBackend, local::LocalPipelineBackend,
        player::GuildPlayer, song::Song,
    },
    config::{BackendKind, MusicConfig},
    error::MusicResult,
    voice::{VoiceGateway, VoiceSessionCache},
};

/// Owns the backend and the lazily created per-guild players.
pub struct MusicManager {
    backend: Arc<dyn Backend>,
    gateway: Arc<dyn VoiceGateway>,
    voice_cache: Arc<VoiceSessionCache>,
    players: DashMap<GuildId, Arc<GuildPlayer>>,
    max_queue_size: usize,
    max_song_duration: u64,
    default_volume: u8,
    idle_grace: Duration,
}

impl MusicManager {
    /// Builds the configured backend. A backend that cannot start is a
    /// configuration error.
    pub async fn new(
        config: &MusicConfig,
        gateway: Arc<dyn VoiceGateway>,
        voice_cache: Arc<VoiceSessionCache>,
        bot_user_id: UserId,
    ) -> MusicResult<Self> {
        let backend: Arc<dyn Backend> = match config.backend {
            BackendKind::Direct => {
                let backend = LocalPipelineBackend::new(&config.direct).await?;
                info!(
                    "🎶 Backend directo (yt-dlp: {}, ffmpeg: {})",
                    config.direct.ytdlp_path, config.direct.ffmpeg_path
                );
                Arc::new(backend)
            }
            BackendKind::Lavalink => {
                let backend =
                    RemoteNodeBackend::connect(&config.lavalink, voice_cache.clone(), bot_user_id).await?;
                info!(
                    "🎶 Backend Lavalink ({}:{})",
                    config.lavalink.host, config.lavalink.port
                );
                Arc::new(backend)
            }
        };

        Ok(Self::with_backend(config, backend, gateway, voice_cache))
    }

    pub fn with_backend(
        config: &MusicConfig,
        backend: Arc<dyn Backend>,
        gateway: Arc<dyn VoiceGateway>,
        voice_cache: Arc<VoiceSessionCache>,
    ) -> Self {
        Self {
            backend,
            gateway,
            voice_cache,
            players: DashMap::new(),
            max_queue_size: config.max_queue_size,
            max_song_duration: config.max_song_duration,
            default_volume: config.default_volume,
            idle_grace: config.idle_disconnect,
        }
    }

    pub async fn resolve(&self, query: &str) -> MusicResult<Song> {
        self.backend.resolve(query).await
    }

    /// Player of the guild, created on first use.
    pub fn player(&self, guild_id: GuildId) -> Arc<GuildPlayer> {
        self.players
            .entry(guild_id)
            .or_insert_with(|| {
                GuildPlayer::new(
                    guild_id,
                    self.backend.clone(),
                    self.gateway.clone(),
                    self.voice_cache.clone(),
                    self.default_volume,
                    self.idle_grace,
                )
            })
            .clone()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Seconds; 0 means no limit.
    pub fn max_song_duration(&self) -> u64 {
        self.max_song_duration
    }

    /// Stops every player, then the backend.
    pub async fn shutdown(&self) {
        let players: Vec<Arc<GuildPlayer>> = self.players.iter().map(|p| p.value().clone()).collect();
        info!("🛑 Deteniendo {} reproductores", players.len());
        for player in players {
            player.stop().await;
        }
        self.backend.shutdown().await;
    }
}

impl TypeMapKey for MusicManager {
    type Value = Arc<MusicManager>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::backend::PlayRequest,
        voice::{testing::StubGateway, JoinMode},
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct EchoBackend {
        shut_down: AtomicBool,
    }

    #[async_trait]
    impl Backend for EchoBackend {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn join_mode(&self) -> JoinMode {
            JoinMode::SignallingOnly
        }

        async fn resolve(&self, query: &str) -> MusicResult<Song> {
            Ok(Song::new(query, query, query))
        }

        async fn play(&self, request: PlayRequest) -> MusicResult<()> {
            request.cancel.cancelled().await;
            Ok(())
        }

        async fn set_volume(&self, _guild_id: GuildId, _volume: u8) -> MusicResult<()> {
            Ok(())
        }

        async fn set_paused(&self, _guild_id: GuildId, _paused: bool) -> MusicResult<()> {
            Ok(())
        }

        async fn shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    fn manager(backend: Arc<EchoBackend>) -> MusicManager {
        let mut config = MusicConfig::default();
        config.max_queue_size = 7;
        config.default_volume = 35;
        MusicManager::with_backend(
            &config,
            backend,
            Arc::new(StubGateway::default()),
            Arc::new(VoiceSessionCache::new()),
        )
    }

    #[tokio::test]
    async fn test_players_are_created_once_per_guild() {
        let manager = manager(Arc::new(EchoBackend::default()));
        let a = manager.player(GuildId::new(1));
        let again = manager.player(GuildId::new(1));
        let b = manager.player(GuildId::new(2));

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.snapshot().volume, 35);
        assert_eq!(manager.max_queue_size(), 7);
        assert_eq!(manager.backend_name(), "echo");
    }

    #[tokio::test]
    async fn test_shutdown_stops_players_and_backend() {
        let backend = Arc::new(EchoBackend::default());
        let manager = manager(backend.clone());
        let player = manager.player(GuildId::new(1));
        player.join_channel(serenity::model::id::ChannelId::new(5)).await.unwrap();
        player.enqueue(manager.resolve("a").await.unwrap(), 7).unwrap();
        assert!(player.start_if_idle());
        assert!(player.is_playing());

        manager.shutdown().await;
        assert!(!player.is_playing());
        assert!(!player.snapshot().connected);
        assert!(backend.shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unknown_binaries_fail_construction() {
        let mut config = MusicConfig::default();
        config.direct.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
        config.direct.ytdlp_path = "/nonexistent/yt-dlp".to_string();

        let result = MusicManager::new(
            &config,
            Arc::new(StubGateway::default()),
            Arc::new(VoiceSessionCache::new()),
            UserId::new(1),
        )
        .await;
        assert!(matches!(result, Err(crate::error::MusicError::Config(_))));
    }
}
