use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serenity::model::id::GuildId;
use std::time::Duration;
use tracing::debug;

use crate::{
    config::LavalinkConfig,
    error::{MusicError, MusicResult},
    voice::VoiceCredentials,
};

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);
const LOAD_TIMEOUT: Duration = Duration::from_secs(15);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(12);
const PLAYER_TIMEOUT: Duration = Duration::from_secs(6);

/// `/v4/loadtracks` response before the payload is interpreted.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLoadResult {
    #[serde(rename = "loadType")]
    pub load_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NodeTrack {
    pub encoded: String,
    #[serde(default)]
    pub info: TrackInfo,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    #[serde(default)]
    pub title: String,
    /// Milliseconds.
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub is_stream: bool,
}

/// Body of `PATCH /v4/sessions/{session}/players/{guild}`. Only the fields
/// that are set get serialized.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PlayerUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<TrackUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceUpdate>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrackUpdate {
    pub encoded: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceUpdate {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

impl PlayerUpdate {
    pub fn start(encoded: impl Into<String>, volume: u8) -> Self {
        Self {
            track: Some(TrackUpdate {
                encoded: encoded.into(),
            }),
            volume: Some(volume),
            paused: Some(false),
            ..Default::default()
        }
    }

    pub fn voice(credentials: &VoiceCredentials) -> Self {
        Self {
            voice: Some(VoiceUpdate {
                token: credentials.token.clone(),
                endpoint: credentials.endpoint.clone(),
                session_id: credentials.session_id.clone(),
            }),
            ..Default::default()
        }
    }

    pub fn volume(volume: u8) -> Self {
        Self {
            volume: Some(volume),
            ..Default::default()
        }
    }

    pub fn paused(paused: bool) -> Self {
        Self {
            paused: Some(paused),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerInfo {
    #[serde(default)]
    pub track: Option<NodeTrack>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub state: PlayerState,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerState {
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub connected: bool,
}

/// REST surface of a Lavalink v4 node.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeRest: Send + Sync {
    /// `GET /version`; doubles as the liveness check.
    async fn version(&self) -> MusicResult<String>;

    async fn load_tracks(&self, identifier: &str) -> MusicResult<RawLoadResult>;

    async fn update_player(
        &self,
        session_id: &str,
        guild_id: GuildId,
        update: &PlayerUpdate,
    ) -> MusicResult<()>;

    /// `None` when the node has no player for the guild (404).
    async fn get_player(&self, session_id: &str, guild_id: GuildId) -> MusicResult<Option<PlayerInfo>>;

    async fn destroy_player(&self, session_id: &str, guild_id: GuildId) -> MusicResult<()>;
}

pub struct HttpNodeRest {
    client: Client,
    base_url: String,
    password: String,
}

impl HttpNodeRest {
    pub fn new(config: &LavalinkConfig) -> MusicResult<Self> {
        let client = Client::builder()
            .user_agent(config.client_name.clone())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            password: config.password.clone(),
        })
    }

    fn player_url(&self, session_id: &str, guild_id: GuildId) -> String {
        format!("{}/v4/sessions/{}/players/{}", self.base_url, session_id, guild_id)
    }

    /// Non-2xx responses become [`MusicError::Node`] with the body attached.
    async fn check(response: Response) -> MusicResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(MusicError::Node {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl NodeRest for HttpNodeRest {
    async fn version(&self) -> MusicResult<String> {
        let response = self
            .client
            .get(format!("{}/version", self.base_url))
            .header("Authorization", &self.password)
            .timeout(VERSION_TIMEOUT)
            .send()
            .await?;
        Ok(Self::check(response).await?.text().await?)
    }

    async fn load_tracks(&self, identifier: &str) -> MusicResult<RawLoadResult> {
        let url = format!(
            "{}/v4/loadtracks?identifier={}",
            self.base_url,
            urlencoding::encode(identifier)
        );
        debug!("🔎 loadtracks: {}", identifier);

        let response = self
            .client
            .get(url)
            .header("Authorization", &self.password)
            .timeout(LOAD_TIMEOUT)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn update_player(
        &self,
        session_id: &str,
        guild_id: GuildId,
        update: &PlayerUpdate,
    ) -> MusicResult<()> {
        let response = self
            .client
            .patch(self.player_url(session_id, guild_id))
            .header("Authorization", &self.password)
            .json(update)
            .timeout(UPDATE_TIMEOUT)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_player(&self, session_id: &str, guild_id: GuildId) -> MusicResult<Option<PlayerInfo>> {
        let response = self
            .client
            .get(self.player_url(session_id, guild_id))
            .header("Authorization", &self.password)
            .timeout(PLAYER_TIMEOUT)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Player no encontrado (404) para guild {}", guild_id);
            return Ok(None);
        }
        Ok(Some(Self::check(response).await?.json().await?))
    }

    async fn destroy_player(&self, session_id: &str, guild_id: GuildId) -> MusicResult<()> {
        let response = self
            .client
            .delete(self.player_url(session_id, guild_id))
            .header("Authorization", &self.password)
            .timeout(PLAYER_TIMEOUT)
            .send()
            .await?;

        // Un 404 aquí significa que ya no existe
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }
}
