use async_trait::async_trait;
use serenity::model::id::GuildId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{
    audio::song::Song,
    error::MusicResult,
    voice::{JoinMode, VoiceConnection},
};

/// Everything a backend needs to play one song in one guild.
pub struct PlayRequest {
    pub connection: Arc<dyn VoiceConnection>,
    pub song: Song,
    pub volume: u8,
    /// Cooperative stop flag. Once cancelled, `play` must wind down and return.
    pub cancel: CancellationToken,
}

impl PlayRequest {
    pub fn guild_id(&self) -> GuildId {
        self.connection.guild_id()
    }
}

/// A playback engine shared by every guild player in the process.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short identifier shown to users ("direct", "lavalink").
    fn name(&self) -> &'static str;

    /// How the guild player should join voice for this backend.
    fn join_mode(&self) -> JoinMode;

    async fn resolve(&self, query: &str) -> MusicResult<Song>;

    /// Plays the song to completion. Returns exactly once: when the track
    /// ends, fails, or the request's token is cancelled.
    async fn play(&self, request: PlayRequest) -> MusicResult<()>;

    /// Forcible termination for whatever is playing in the guild. The
    /// cancellation token stays the primary stop signal.
    async fn stop(&self, _guild_id: GuildId) {}

    async fn set_volume(&self, guild_id: GuildId, volume: u8) -> MusicResult<()>;

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> MusicResult<()>;

    async fn shutdown(&self) {}
}
