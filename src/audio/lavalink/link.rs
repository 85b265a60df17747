use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use serenity::model::id::GuildId;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::socket::{MessageStream, NodeConnector, NodeEvent, NodeMessage};
use crate::error::{MusicError, MusicResult};

const MAX_RECONNECT_ATTEMPTS: u64 = 10;
const RECONNECT_STEP: Duration = Duration::from_secs(1);

/// Track lifecycle signals forwarded from the control socket to a playing guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackSignal {
    Started { encoded: String },
    Ended { encoded: String, reason: String },
    Failed { encoded: String, message: String },
}

/// Receiver half handed to a playback task; see [`NodeLink::watch`].
pub struct TrackWatch {
    id: u64,
    pub signals: mpsc::UnboundedReceiver<TrackSignal>,
}

struct Session {
    id: String,
    epoch: u64,
    cancel: CancellationToken,
}

/// The control socket to the node and the session id bound to it.
///
/// Each socket gets an epoch. A read loop whose epoch is no longer current was
/// superseded by a reconnect and exits without touching the session.
pub struct NodeLink {
    connector: Arc<dyn NodeConnector>,
    session: RwLock<Option<Session>>,
    epochs: AtomicU64,
    connect_lock: Mutex<()>,
    watchers: DashMap<GuildId, (u64, mpsc::UnboundedSender<TrackSignal>)>,
    watch_ids: AtomicU64,
    shutdown: CancellationToken,
}

impl NodeLink {
    pub fn new(connector: Arc<dyn NodeConnector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            session: RwLock::new(None),
            epochs: AtomicU64::new(0),
            connect_lock: Mutex::new(()),
            watchers: DashMap::new(),
            watch_ids: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.id.clone())
    }

    /// Current session, opening a socket if there is none.
    pub async fn ensure_session(self: &Arc<Self>) -> MusicResult<String> {
        if let Some(id) = self.session_id() {
            return Ok(id);
        }
        let _guard = self.connect_lock.lock().await;
        if let Some(id) = self.session_id() {
            return Ok(id);
        }
        self.open().await
    }

    /// Replaces `stale` with a fresh session. If someone else already did, their
    /// session is returned.
    pub async fn reconnect(self: &Arc<Self>, stale: &str) -> MusicResult<String> {
        let _guard = self.connect_lock.lock().await;
        if let Some(id) = self.session_id() {
            if id != stale {
                return Ok(id);
            }
        }
        info!("🔄 Forzando reconexión con el nodo (sesión {} obsoleta)", truncate(stale, 12));
        self.open().await
    }

    /// Caller must hold `connect_lock`.
    async fn open(self: &Arc<Self>) -> MusicResult<String> {
        if self.shutdown.is_cancelled() {
            return Err(MusicError::NoSession);
        }

        let (session_id, messages) = self.connector.connect().await?;
        let epoch = self.epochs.fetch_add(1, Ordering::AcqRel) + 1;
        let cancel = self.shutdown.child_token();

        let previous = self.session.write().replace(Session {
            id: session_id.clone(),
            epoch,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        info!("🔗 Conectado al nodo de audio (sessionId={})", truncate(&session_id, 12));
        self.spawn_read_loop(messages, epoch, cancel);
        Ok(session_id)
    }

    fn spawn_read_loop(self: &Arc<Self>, messages: MessageStream, epoch: u64, cancel: CancellationToken) {
        let link = self.clone();
        tokio::spawn(async move { link.read_loop(messages, epoch, cancel).await });
    }

    async fn read_loop(self: Arc<Self>, mut messages: MessageStream, epoch: u64, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Read loop {} reemplazado", epoch);
                    return;
                }
                next = messages.next() => next,
            };

            match next {
                Some(Ok(text)) => self.handle_message(&text),
                Some(Err(e)) => {
                    warn!("⚠️ WebSocket del nodo desconectado: {}", e);
                    break;
                }
                None => {
                    warn!("⚠️ WebSocket del nodo cerrado");
                    break;
                }
            }
        }
        drop(messages);

        if !self.invalidate(epoch) {
            return;
        }
        self.reconnect_with_backoff().await;
    }

    /// Drops the session if it still belongs to `epoch`.
    fn invalidate(&self, epoch: u64) -> bool {
        let mut session = self.session.write();
        if !session.as_ref().is_some_and(|current| current.epoch == epoch) {
            return false;
        }
        if let Some(old) = session.take() {
            old.cancel.cancel();
        }
        true
    }

    async fn reconnect_with_backoff(self: &Arc<Self>) {
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_STEP * attempt as u32) => {}
            }

            match self.ensure_session().await {
                Ok(_) => return,
                Err(e) => warn!("⚠️ Reintento de reconexión {}/{} falló: {}", attempt, MAX_RECONNECT_ATTEMPTS, e),
            }
        }
        error!(
            "❌ Sin conexión con el nodo tras {} intentos; la reproducción fallará hasta la próxima reconexión",
            MAX_RECONNECT_ATTEMPTS
        );
    }

    pub(crate) fn handle_message(&self, text: &str) {
        let message = match serde_json::from_str::<NodeMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Mensaje del nodo ilegible: {}", e);
                return;
            }
        };

        match message {
            NodeMessage::Event(event) => {
                log_event(&event);
                self.forward(&event);
            }
            NodeMessage::Ready { session_id, .. } => {
                debug!("ready inesperado (sessionId={})", truncate(&session_id, 12));
            }
            NodeMessage::Stats {} | NodeMessage::PlayerUpdate {} => {}
            NodeMessage::Unknown => debug!("op desconocido del nodo: {}", text),
        }
    }

    fn forward(&self, event: &NodeEvent) {
        let signal = match event.kind.as_str() {
            "TrackStartEvent" => TrackSignal::Started {
                encoded: event.encoded().unwrap_or_default().to_string(),
            },
            "TrackEndEvent" => {
                let reason = event.reason.clone().unwrap_or_default();
                // Un reemplazo lo provoca nuestro propio PATCH
                if reason.eq_ignore_ascii_case("replaced") {
                    return;
                }
                TrackSignal::Ended {
                    encoded: event.encoded().unwrap_or_default().to_string(),
                    reason,
                }
            }
            "TrackExceptionEvent" => TrackSignal::Failed {
                encoded: event.encoded().unwrap_or_default().to_string(),
                message: event
                    .exception
                    .as_ref()
                    .and_then(|e| e.message.clone())
                    .unwrap_or_else(|| "sin detalles".to_string()),
            },
            "TrackStuckEvent" => TrackSignal::Failed {
                encoded: event.encoded().unwrap_or_default().to_string(),
                message: format!("pista atascada ({}ms)", event.threshold_ms.unwrap_or_default()),
            },
            _ => return,
        };

        let Some(guild_id) = parse_guild_id(&event.guild_id) else {
            return;
        };
        if let Some(watcher) = self.watchers.get(&guild_id) {
            let _ = watcher.1.send(signal);
        }
    }

    /// Routes the guild's completion signals to the returned receiver,
    /// replacing any previous watcher.
    pub fn watch(&self, guild_id: GuildId) -> TrackWatch {
        let id = self.watch_ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.insert(guild_id, (id, tx));
        TrackWatch { id, signals: rx }
    }

    pub fn unwatch(&self, guild_id: GuildId, watch: &TrackWatch) {
        self.watchers.remove_if(&guild_id, |_, (id, _)| *id == watch.id);
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.session.write().take();
        self.watchers.clear();
    }
}

fn parse_guild_id(raw: &str) -> Option<GuildId> {
    raw.parse::<u64>().ok().filter(|id| *id != 0).map(GuildId::new)
}

fn log_event(event: &NodeEvent) {
    let title = event.track_title();
    let guild = &event.guild_id;
    match event.kind.as_str() {
        "TrackStartEvent" => info!("▶️ TrackStart: {} (guild={})", title, guild),
        "TrackEndEvent" => info!(
            "⏹️ TrackEnd: {} reason={} (guild={})",
            title,
            event.reason.as_deref().unwrap_or(""),
            guild
        ),
        "TrackExceptionEvent" => {
            let exception = event.exception.clone().unwrap_or_default();
            warn!(
                "❌ TrackException: {}: {} (severity={}, cause={}, guild={})",
                title,
                exception.message.as_deref().unwrap_or("sin detalles"),
                exception.severity,
                exception.cause,
                guild
            );
        }
        "TrackStuckEvent" => warn!(
            "⚠️ TrackStuck: {} threshold={}ms (guild={})",
            title,
            event.threshold_ms.unwrap_or_default(),
            guild
        ),
        "WebSocketClosedEvent" => warn!(
            "🔌 WebSocketClosed: code={} byRemote={} (guild={})",
            event.code.unwrap_or_default(),
            event.by_remote.unwrap_or_default(),
            guild
        ),
        other => debug!("Evento del nodo: type={} guild={}", other, guild),
    }
}

/// Shortens ids and tokens before they reach the logs.
pub fn truncate(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &value[..idx]),
        None => value.to_string(),
    }
}
