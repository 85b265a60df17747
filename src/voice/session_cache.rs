use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{MusicError, MusicResult};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Partial voice credentials for one guild, as last pushed by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceInfo {
    pub session_id: Option<String>,
    pub token: Option<String>,
    pub endpoint: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl VoiceInfo {
    pub fn is_ready(&self) -> bool {
        self.credentials().is_some()
    }

    pub fn credentials(&self) -> Option<VoiceCredentials> {
        match (&self.token, &self.endpoint, &self.session_id) {
            (Some(token), Some(endpoint), Some(session_id))
                if !token.is_empty() && !endpoint.is_empty() && !session_id.is_empty() =>
            {
                Some(VoiceCredentials {
                    token: token.clone(),
                    endpoint: endpoint.clone(),
                    session_id: session_id.clone(),
                })
            }
            _ => None,
        }
    }
}

/// The token/endpoint/session-id triple a voice server needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceCredentials {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// Rendezvous between the gateway's voice callbacks and whoever needs the
/// credentials. The two callbacks arrive in either order, so readers poll.
#[derive(Debug, Default)]
pub struct VoiceSessionCache {
    entries: DashMap<GuildId, VoiceInfo>,
}

impl VoiceSessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Llamado desde VOICE_STATE_UPDATE del propio bot
    pub fn update_session_id(&self, guild_id: GuildId, session_id: impl Into<String>) {
        let mut entry = self.entries.entry(guild_id).or_default();
        entry.session_id = Some(session_id.into());
        entry.updated_at = Some(Utc::now());
        debug!("🔑 session_id de voz actualizado para guild {}", guild_id);
    }

    /// Llamado desde VOICE_SERVER_UPDATE
    pub fn update_server(&self, guild_id: GuildId, token: impl Into<String>, endpoint: impl Into<String>) {
        let mut entry = self.entries.entry(guild_id).or_default();
        entry.token = Some(token.into());
        entry.endpoint = Some(endpoint.into());
        entry.updated_at = Some(Utc::now());
        debug!("🌐 servidor de voz actualizado para guild {}", guild_id);
    }

    pub fn get(&self, guild_id: GuildId) -> Option<VoiceInfo> {
        self.entries.get(&guild_id).map(|entry| entry.clone())
    }

    pub fn ready(&self, guild_id: GuildId) -> Option<VoiceCredentials> {
        self.entries.get(&guild_id).and_then(|entry| entry.credentials())
    }

    /// Forgets everything known about the guild. Called on every channel join
    /// so a backend never binds to credentials from a previous connection.
    pub fn clear(&self, guild_id: GuildId) {
        self.entries.remove(&guild_id);
    }

    /// Polls until all three credentials are present or `timeout` elapses.
    pub async fn wait_ready(&self, guild_id: GuildId, timeout: Duration) -> MusicResult<VoiceCredentials> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(credentials) = self.ready(guild_id) {
                return Ok(credentials);
            }
            if Instant::now() >= deadline {
                return Err(MusicError::VoiceNotReady);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn guild() -> GuildId {
        GuildId::new(42)
    }

    #[test]
    fn test_ready_requires_all_three_fields() {
        let cache = VoiceSessionCache::new();
        assert!(cache.get(guild()).is_none());

        cache.update_server(guild(), "tok", "us-east.discord.media");
        assert!(!cache.get(guild()).unwrap().is_ready());
        assert!(cache.ready(guild()).is_none());

        cache.update_session_id(guild(), "sess");
        let credentials = cache.ready(guild()).unwrap();
        assert_eq!(credentials.token, "tok");
        assert_eq!(credentials.endpoint, "us-east.discord.media");
        assert_eq!(credentials.session_id, "sess");
    }

    #[test]
    fn test_order_does_not_matter() {
        let cache = VoiceSessionCache::new();
        cache.update_session_id(guild(), "sess");
        assert!(cache.ready(guild()).is_none());
        cache.update_server(guild(), "tok", "endpoint");
        assert!(cache.ready(guild()).is_some());
    }

    #[test]
    fn test_clear_resets_readiness() {
        let cache = VoiceSessionCache::new();
        cache.update_session_id(guild(), "sess");
        cache.update_server(guild(), "tok", "endpoint");
        cache.clear(guild());
        assert!(cache.ready(guild()).is_none());

        // Un solo campo nuevo no basta tras limpiar
        cache.update_session_id(guild(), "sess2");
        assert!(cache.ready(guild()).is_none());
    }

    #[test]
    fn test_empty_values_are_not_ready() {
        let cache = VoiceSessionCache::new();
        cache.update_session_id(guild(), "");
        cache.update_server(guild(), "tok", "endpoint");
        assert!(cache.ready(guild()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_sees_late_update() {
        let cache = Arc::new(VoiceSessionCache::new());
        cache.update_session_id(guild(), "sess");

        let writer = cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            writer.update_server(guild(), "tok", "endpoint");
        });

        let credentials = cache.wait_ready(guild(), Duration::from_secs(8)).await.unwrap();
        assert_eq!(credentials.session_id, "sess");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_times_out() {
        let cache = VoiceSessionCache::new();
        cache.update_server(guild(), "tok", "endpoint");
        let err = cache.wait_ready(guild(), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, MusicError::VoiceNotReady));
    }
}
