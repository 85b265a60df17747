use async_trait::async_trait;
use futures::{stream::BoxStream, Stream, StreamExt};
use serde::Deserialize;
use serenity::model::id::UserId;
use std::time::Duration;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, info};

use super::rest::NodeTrack;
use crate::{
    config::LavalinkConfig,
    error::{MusicError, MusicResult},
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Text frames from the node's control socket. Ends when the socket closes.
pub type MessageStream = BoxStream<'static, MusicResult<String>>;

/// Opens a control socket and waits for the node's `ready` handshake.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    /// Returns the session id announced by the node and the rest of the stream.
    async fn connect(&self) -> MusicResult<(String, MessageStream)>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum NodeMessage {
    #[serde(rename_all = "camelCase")]
    Ready {
        session_id: String,
        #[serde(default)]
        resumed: bool,
    },
    Event(NodeEvent),
    Stats {},
    PlayerUpdate {},
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub guild_id: String,
    #[serde(default)]
    pub track: Option<NodeTrack>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub exception: Option<NodeException>,
    #[serde(default)]
    pub threshold_ms: Option<u64>,
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub by_remote: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeException {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub cause: String,
}

impl NodeEvent {
    pub fn track_title(&self) -> &str {
        self.track
            .as_ref()
            .map(|t| t.info.title.as_str())
            .unwrap_or("(desconocida)")
    }

    pub fn encoded(&self) -> Option<&str> {
        self.track.as_ref().map(|t| t.encoded.as_str())
    }
}

/// Consumes messages until the `ready` op arrives. Anything else before it is
/// ignored.
pub async fn await_ready<S>(mut stream: S, timeout: Duration) -> MusicResult<(String, S)>
where
    S: Stream<Item = MusicResult<String>> + Unpin,
{
    let handshake = async {
        while let Some(message) = stream.next().await {
            let text = message?;
            if let Ok(NodeMessage::Ready { session_id, resumed }) = serde_json::from_str(&text) {
                if !session_id.is_empty() {
                    debug!("🤝 ready (resumed={})", resumed);
                    return Ok(session_id);
                }
            }
        }
        Err(MusicError::SocketClosed)
    };

    let session_id = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| MusicError::Timeout(format!("el nodo no envió ready en {:?}", timeout)))??;

    Ok((session_id, stream))
}

pub struct WsNodeConnector {
    url: String,
    password: String,
    user_id: UserId,
    client_name: String,
}

impl WsNodeConnector {
    pub fn new(config: &LavalinkConfig, user_id: UserId) -> Self {
        Self {
            url: config.websocket_url(),
            password: config.password.clone(),
            user_id,
            client_name: config.client_name.clone(),
        }
    }
}

fn header(value: &str) -> MusicResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| MusicError::Config(format!("valor de cabecera inválido: {}", e)))
}

#[async_trait]
impl NodeConnector for WsNodeConnector {
    async fn connect(&self) -> MusicResult<(String, MessageStream)> {
        let mut request = self.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Authorization", header(&self.password)?);
        headers.insert("User-Id", header(&self.user_id.to_string())?);
        headers.insert("Client-Name", header(&self.client_name)?);

        let (socket, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| MusicError::Timeout(format!("handshake con {}", self.url)))??;

        info!("🔌 WebSocket de control abierto: {}", self.url);

        let messages = socket
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                    Ok(Message::Close(frame)) => {
                        debug!("Nodo cerró el socket: {:?}", frame);
                        Some(Err(MusicError::SocketClosed))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(MusicError::from(e))),
                }
            })
            .boxed();

        await_ready(messages, READY_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use pretty_assertions::assert_eq;

    fn messages(items: Vec<&str>) -> impl Stream<Item = MusicResult<String>> + Unpin {
        stream::iter(items.into_iter().map(|s| Ok(s.to_string())).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn test_ready_after_noise() {
        let input = messages(vec![
            r#"{"op":"stats","players":0}"#,
            "not json",
            r#"{"op":"ready","resumed":false,"sessionId":"abc123"}"#,
            r#"{"op":"playerUpdate","guildId":"1"}"#,
        ]);

        let (session_id, mut rest) = await_ready(input, READY_TIMEOUT).await.unwrap();
        assert_eq!(session_id, "abc123");
        assert_eq!(rest.next().await.unwrap().unwrap(), r#"{"op":"playerUpdate","guildId":"1"}"#);
    }

    #[tokio::test]
    async fn test_closed_before_ready() {
        let input = messages(vec![r#"{"op":"stats"}"#]);
        assert!(matches!(
            await_ready(input, READY_TIMEOUT).await,
            Err(MusicError::SocketClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_times_out() {
        let input = stream::pending::<MusicResult<String>>();
        assert!(matches!(
            await_ready(input, Duration::from_secs(15)).await,
            Err(MusicError::Timeout(_))
        ));
    }

    #[test]
    fn test_parse_events() {
        let end: NodeMessage = serde_json::from_str(
            r#"{"op":"event","type":"TrackEndEvent","guildId":"42","reason":"finished",
                "track":{"encoded":"QAAA","info":{"title":"Song","length":1000}}}"#,
        )
        .unwrap();
        match end {
            NodeMessage::Event(event) => {
                assert_eq!(event.kind, "TrackEndEvent");
                assert_eq!(event.guild_id, "42");
                assert_eq!(event.reason.as_deref(), Some("finished"));
                assert_eq!(event.encoded(), Some("QAAA"));
                assert_eq!(event.track_title(), "Song");
            }
            other => panic!("unexpected {:?}", other),
        }

        let unknown: NodeMessage = serde_json::from_str(r#"{"op":"somethingNew"}"#).unwrap();
        assert!(matches!(unknown, NodeMessage::Unknown));
    }
}
