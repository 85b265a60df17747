use parking_lot::{Mutex, MutexGuard};
use serenity::model::id::{ChannelId, GuildId};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        backend::{Backend, PlayRequest},
        queue::SongQueue,
        song::Song,
    },
    error::MusicResult,
    voice::{VoiceConnection, VoiceGateway, VoiceSessionCache},
};

/// Messages consumed by the per-guild event task.
#[derive(Debug)]
pub enum PlayerEvent {
    TrackFinished { generation: u64, result: MusicResult<()> },
    IdleTimeout { generation: u64 },
}

/// Read-only copy of a player's state for display.
#[derive(Debug, Clone)]
pub struct PlayerSnapshot {
    pub now_playing: Option<Song>,
    pub queue: Vec<Song>,
    pub queued_duration: Duration,
    pub playing: bool,
    pub paused: bool,
    pub volume: u8,
    pub connected: bool,
}

struct PlayerState {
    queue: SongQueue,
    now_playing: Option<Song>,
    paused: bool,
    volume: u8,
    connection: Option<Arc<dyn VoiceConnection>>,
    /// Bumped when a track starts, on stop and on an idle join; events
    /// carrying an older value are stale.
    generation: u64,
    cancel: Option<CancellationToken>,
}

/// Queue and playback state of one guild.
///
/// `playing` is derived from `now_playing`, so the two cannot disagree. At
/// most one backend task runs per guild: starting a song cancels the token of
/// the previous one, and [`GuildPlayer::start_if_idle`] checks and starts under
/// the same lock.
pub struct GuildPlayer {
    guild_id: GuildId,
    backend: Arc<dyn Backend>,
    gateway: Arc<dyn VoiceGateway>,
    voice_cache: Arc<VoiceSessionCache>,
    idle_grace: Duration,
    state: Mutex<PlayerState>,
    join_lock: AsyncMutex<()>,
    events: mpsc::UnboundedSender<PlayerEvent>,
}

impl GuildPlayer {
    pub fn new(
        guild_id: GuildId,
        backend: Arc<dyn Backend>,
        gateway: Arc<dyn VoiceGateway>,
        voice_cache: Arc<VoiceSessionCache>,
        volume: u8,
        idle_grace: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<GuildPlayer>| {
            let (events, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_events(weak.clone(), rx));

            Self {
                guild_id,
                backend,
                gateway,
                voice_cache,
                idle_grace,
                state: Mutex::new(PlayerState {
                    queue: SongQueue::new(),
                    now_playing: None,
                    paused: false,
                    volume,
                    connection: None,
                    generation: 0,
                    cancel: None,
                }),
                join_lock: AsyncMutex::new(()),
                events,
            }
        })
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Joins `channel_id`, replacing any previous connection. Voice
    /// credentials of the guild are dropped first so the backend never binds
    /// to the old ones.
    pub async fn join_channel(&self, channel_id: ChannelId) -> MusicResult<()> {
        let _guard = self.join_lock.lock().await;

        let previous = {
            let mut state = self.state.lock();
            match &state.connection {
                Some(conn) if conn.channel_id() == channel_id && conn.is_ready() => {
                    debug!("Ya conectado a {} en guild {}", channel_id, self.guild_id);
                    return Ok(());
                }
                _ => state.connection.take(),
            }
        };

        if let Some(previous) = previous {
            info!("🔀 Cambiando de canal en guild {}", self.guild_id);
            previous.disconnect().await;
        }
        self.voice_cache.clear(self.guild_id);

        let connection = self
            .gateway
            .join(self.guild_id, channel_id, self.backend.join_mode())
            .await?;
        info!("🔊 Conectado a {} en guild {}", channel_id, self.guild_id);

        let mut state = self.state.lock();
        state.connection = Some(connection);
        // Invalida temporizadores de inactividad previos a este join
        if state.now_playing.is_none() {
            state.generation += 1;
        }
        Ok(())
    }

    /// Appends a song; returns its 1-based position.
    pub fn enqueue(&self, song: Song, max_size: usize) -> MusicResult<usize> {
        let position = self.state.lock().queue.push(song, max_size)?;
        Ok(position)
    }

    /// Starts the next queued song when nothing is playing. Returns whether a
    /// song started.
    pub fn start_if_idle(&self) -> bool {
        let state = self.state.lock();
        if state.now_playing.is_some() {
            return false;
        }
        self.advance(state)
    }

    /// Starts the next queued song, replacing the current one, or goes idle
    /// when there is none.
    pub fn play_next(&self) {
        self.advance(self.state.lock());
    }

    fn advance(&self, mut state: MutexGuard<'_, PlayerState>) -> bool {
        if let Some(previous) = state.cancel.take() {
            previous.cancel();
        }

        let Some(connection) = state.connection.clone() else {
            state.now_playing = None;
            state.paused = false;
            debug!("Sin conexión de voz en guild {}, nada que reproducir", self.guild_id);
            return false;
        };

        let Some(song) = state.queue.pop() else {
            state.now_playing = None;
            state.paused = false;
            let generation = state.generation;
            drop(state);
            info!("📭 Cola vacía en guild {}", self.guild_id);
            self.schedule_idle_disconnect(generation);
            return false;
        };

        state.generation += 1;
        let generation = state.generation;
        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());
        state.now_playing = Some(song.clone());
        state.paused = false;
        let volume = state.volume;
        drop(state);

        info!("🎵 Siguiente en guild {}: {}", self.guild_id, song.title);

        let backend = self.backend.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = backend
                .play(PlayRequest {
                    connection,
                    song,
                    volume,
                    cancel,
                })
                .await;
            let _ = events.send(PlayerEvent::TrackFinished { generation, result });
        });
        true
    }

    fn schedule_idle_disconnect(&self, generation: u64) {
        let events = self.events.clone();
        let grace = self.idle_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(PlayerEvent::IdleTimeout { generation });
        });
    }

    /// Stops the current song; its completion advances the queue.
    pub async fn skip(&self) -> Option<Song> {
        let (current, cancel) = {
            let state = self.state.lock();
            (state.now_playing.clone(), state.cancel.clone())
        };

        if current.is_some() {
            if let Some(cancel) = cancel {
                cancel.cancel();
            }
            self.backend.stop(self.guild_id).await;
        }
        current
    }

    /// Clears everything and leaves the voice channel.
    pub async fn stop(&self) {
        let (cancel, connection) = {
            let mut state = self.state.lock();
            state.queue.clear();
            state.now_playing = None;
            state.paused = false;
            state.generation += 1;
            (state.cancel.take(), state.connection.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.backend.stop(self.guild_id).await;
        if let Some(connection) = connection {
            connection.disconnect().await;
        }
        info!("⏹️ Reproducción detenida y cola limpiada en guild {}", self.guild_id);
    }

    /// `volume` is expected in 0..=100 already.
    pub async fn set_volume(&self, volume: u8) -> MusicResult<()> {
        self.state.lock().volume = volume;
        self.backend.set_volume(self.guild_id, volume).await
    }

    /// Returns false when there is nothing to pause.
    pub async fn pause(&self) -> MusicResult<bool> {
        self.set_paused(true).await
    }

    /// Returns false when nothing is paused.
    pub async fn resume(&self) -> MusicResult<bool> {
        self.set_paused(false).await
    }

    async fn set_paused(&self, paused: bool) -> MusicResult<bool> {
        {
            let state = self.state.lock();
            if state.now_playing.is_none() || state.paused == paused {
                return Ok(false);
            }
        }

        self.backend.set_paused(self.guild_id, paused).await?;

        let mut state = self.state.lock();
        if state.now_playing.is_none() {
            return Ok(false);
        }
        state.paused = paused;
        Ok(true)
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        let state = self.state.lock();
        PlayerSnapshot {
            now_playing: state.now_playing.clone(),
            queue: state.queue.to_vec(),
            queued_duration: state.queue.total_duration(),
            playing: state.now_playing.is_some(),
            paused: state.paused,
            volume: state.volume,
            connected: state.connection.is_some(),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().now_playing.is_some()
    }

    async fn handle_event(&self, event: PlayerEvent) {
        match event {
            PlayerEvent::TrackFinished { generation, result } => {
                {
                    let state = self.state.lock();
                    if generation != state.generation || state.now_playing.is_none() {
                        debug!("Fin de pista obsoleto en guild {} (gen {})", self.guild_id, generation);
                        return;
                    }
                }
                if let Err(e) = result {
                    error!("❌ Error reproduciendo en guild {}: {}", self.guild_id, e);
                }
                self.play_next();
            }
            PlayerEvent::IdleTimeout { generation } => {
                let connection = {
                    let mut state = self.state.lock();
                    let idle = generation == state.generation
                        && state.now_playing.is_none()
                        && state.queue.is_empty();
                    if !idle {
                        return;
                    }
                    state.connection.take()
                };

                if let Some(connection) = connection {
                    info!("💤 Inactividad en guild {}, desconectando", self.guild_id);
                    connection.disconnect().await;
                }
            }
        }
    }
}

async fn run_events(player: Weak<GuildPlayer>, mut events: mpsc::UnboundedReceiver<PlayerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(player) = player.upgrade() else {
            warn!("Evento para un player ya liberado");
            break;
        };
        player.handle_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::MusicError,
        voice::{testing::StubGateway, JoinMode},
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Plays until cancelled or told to finish. Titles starting with "bad"
    /// fail immediately.
    #[derive(Default)]
    struct FakeBackend {
        plays: Mutex<Vec<String>>,
        volumes: Mutex<Vec<u8>>,
        paused: Mutex<Vec<bool>>,
        stops: AtomicUsize,
        finish: Notify,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn join_mode(&self) -> JoinMode {
            JoinMode::Media
        }

        async fn resolve(&self, query: &str) -> MusicResult<Song> {
            Ok(Song::new(query, query, query))
        }

        async fn play(&self, request: PlayRequest) -> MusicResult<()> {
            self.plays.lock().push(request.song.title.clone());
            if request.song.title.starts_with("bad") {
                return Err(MusicError::Resolution("roto".to_string()));
            }
            tokio::select! {
                _ = request.cancel.cancelled() => Ok(()),
                _ = self.finish.notified() => Ok(()),
            }
        }

        async fn stop(&self, _guild_id: GuildId) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        async fn set_volume(&self, _guild_id: GuildId, volume: u8) -> MusicResult<()> {
            self.volumes.lock().push(volume);
            Ok(())
        }

        async fn set_paused(&self, _guild_id: GuildId, paused: bool) -> MusicResult<()> {
            self.paused.lock().push(paused);
            Ok(())
        }
    }

    struct Fixture {
        player: Arc<GuildPlayer>,
        backend: Arc<FakeBackend>,
        gateway: Arc<StubGateway>,
        cache: Arc<VoiceSessionCache>,
    }

    fn guild() -> GuildId {
        GuildId::new(1)
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(FakeBackend::default());
        let gateway = Arc::new(StubGateway::default());
        let cache = Arc::new(VoiceSessionCache::new());
        let player = GuildPlayer::new(
            guild(),
            backend.clone(),
            gateway.clone(),
            cache.clone(),
            50,
            Duration::from_secs(120),
        );
        Fixture {
            player,
            backend,
            gateway,
            cache,
        }
    }

    fn song(title: &str) -> Song {
        Song::new(title, format!("https://example.com/{}", title), title)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn plays(f: &Fixture) -> Vec<String> {
        f.backend.plays.lock().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_respects_max_size() {
        let f = fixture();
        assert_eq!(f.player.enqueue(song("a"), 2).unwrap(), 1);
        assert_eq!(f.player.enqueue(song("b").with_duration(40), 2).unwrap(), 2);
        assert!(matches!(
            f.player.enqueue(song("c"), 2),
            Err(MusicError::QueueFull { len: 2, max: 2 })
        ));
        let snapshot = f.player.snapshot();
        assert_eq!(snapshot.queue.len(), 2);
        assert_eq!(snapshot.queued_duration, Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_next_without_connection_is_idempotent() {
        let f = fixture();
        f.player.enqueue(song("a"), 10).unwrap();

        f.player.play_next();
        f.player.play_next();
        settle().await;

        let snapshot = f.player.snapshot();
        assert!(!snapshot.playing);
        assert!(snapshot.now_playing.is_none());
        assert_eq!(snapshot.queue.len(), 1);
        assert!(plays(&f).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_advances_queue() {
        let f = fixture();
        f.player.join_channel(ChannelId::new(10)).await.unwrap();
        f.player.enqueue(song("a"), 10).unwrap();
        f.player.enqueue(song("b"), 10).unwrap();

        f.player.play_next();
        settle().await;
        assert_eq!(plays(&f), vec!["a"]);
        assert!(f.player.is_playing());

        f.backend.finish.notify_one();
        settle().await;
        assert_eq!(plays(&f), vec!["a", "b"]);
        assert_eq!(f.player.snapshot().now_playing.unwrap().title, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_if_idle_runs_one_task() {
        let f = fixture();
        f.player.join_channel(ChannelId::new(10)).await.unwrap();
        f.player.enqueue(song("a"), 10).unwrap();
        f.player.enqueue(song("b"), 10).unwrap();

        assert!(f.player.start_if_idle());
        assert!(!f.player.start_if_idle());
        settle().await;

        assert_eq!(plays(&f), vec!["a"]);
        let snapshot = f.player.snapshot();
        assert_eq!(snapshot.now_playing.unwrap().title, "a");
        assert_eq!(snapshot.queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_next_cancels_replaced_track() {
        let f = fixture();
        f.player.join_channel(ChannelId::new(10)).await.unwrap();
        f.player.enqueue(song("a"), 10).unwrap();
        f.player.enqueue(song("b"), 10).unwrap();
        f.player.enqueue(song("c"), 10).unwrap();

        let first = {
            f.player.play_next();
            f.player.state.lock().cancel.clone().unwrap()
        };
        f.player.play_next();
        settle().await;

        assert!(first.is_cancelled());
        assert_eq!(plays(&f), vec!["a", "b"]);
        // El fin de "a" es obsoleto y no adelanta la cola
        let snapshot = f.player.snapshot();
        assert_eq!(snapshot.now_playing.unwrap().title, "b");
        assert_eq!(snapshot.queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_song_does_not_stall_queue() {
        let f = fixture();
        f.player.join_channel(ChannelId::new(10)).await.unwrap();
        f.player.enqueue(song("bad-link"), 10).unwrap();
        f.player.enqueue(song("b"), 10).unwrap();

        f.player.play_next();
        settle().await;
        assert_eq!(plays(&f), vec!["bad-link", "b"]);
        assert_eq!(f.player.snapshot().now_playing.unwrap().title, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ignores_stale_completion() {
        let f = fixture();
        f.player.join_channel(ChannelId::new(10)).await.unwrap();
        f.player.enqueue(song("a"), 10).unwrap();
        f.player.enqueue(song("b"), 10).unwrap();
        f.player.play_next();
        settle().await;

        f.player.stop().await;
        settle().await;

        let snapshot = f.player.snapshot();
        assert!(snapshot.queue.is_empty());
        assert!(snapshot.now_playing.is_none());
        assert!(!snapshot.connected);
        // La pista cancelada no debe arrancar "b"
        assert_eq!(plays(&f), vec!["a"]);
        assert_eq!(f.gateway.connections.lock()[0].disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(f.backend.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_returns_current_and_advances() {
        let f = fixture();
        assert!(f.player.skip().await.is_none());

        f.player.join_channel(ChannelId::new(10)).await.unwrap();
        f.player.enqueue(song("a"), 10).unwrap();
        f.player.enqueue(song("b"), 10).unwrap();
        f.player.play_next();
        settle().await;

        assert_eq!(f.player.skip().await.unwrap().title, "a");
        settle().await;
        assert_eq!(plays(&f), vec!["a", "b"]);
        assert_eq!(f.player.snapshot().now_playing.unwrap().title, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_channel_clears_credentials() {
        let f = fixture();
        f.player.join_channel(ChannelId::new(10)).await.unwrap();

        f.cache.update_session_id(guild(), "sess");
        f.cache.update_server(guild(), "tok", "endpoint");

        // Mismo canal: no-op
        f.player.join_channel(ChannelId::new(10)).await.unwrap();
        assert!(f.cache.ready(guild()).is_some());
        assert_eq!(f.gateway.joins.lock().len(), 1);

        f.player.join_channel(ChannelId::new(11)).await.unwrap();
        assert!(f.cache.ready(guild()).is_none());
        assert_eq!(
            *f.gateway.joins.lock(),
            vec![
                (guild(), ChannelId::new(10), JoinMode::Media),
                (guild(), ChannelId::new(11), JoinMode::Media)
            ]
        );
        assert_eq!(f.gateway.connections.lock()[0].disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_is_stored_and_forwarded() {
        let f = fixture();
        f.player.set_volume(37).await.unwrap();
        assert_eq!(f.player.snapshot().volume, 37);
        assert_eq!(*f.backend.volumes.lock(), vec![37]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let f = fixture();
        assert!(!f.player.pause().await.unwrap());

        f.player.join_channel(ChannelId::new(10)).await.unwrap();
        f.player.enqueue(song("a"), 10).unwrap();
        f.player.play_next();
        settle().await;

        assert!(f.player.pause().await.unwrap());
        assert!(!f.player.pause().await.unwrap());
        assert!(f.player.snapshot().paused);
        assert!(f.player.resume().await.unwrap());
        assert_eq!(*f.backend.paused.lock(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_disconnect_after_grace() {
        let f = fixture();
        f.player.join_channel(ChannelId::new(10)).await.unwrap();
        f.player.play_next();

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert!(f.player.snapshot().connected);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!f.player.snapshot().connected);
        assert_eq!(f.gateway.connections.lock()[0].disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_invalidates_idle_timer() {
        let f = fixture();
        f.player.join_channel(ChannelId::new(10)).await.unwrap();
        f.player.play_next();

        tokio::time::sleep(Duration::from_secs(60)).await;
        f.player.join_channel(ChannelId::new(11)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(70)).await;
        assert!(f.player.snapshot().connected);
        assert_eq!(f.gateway.connections.lock()[1].disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_is_cancelled_by_playback() {
        let f = fixture();
        f.player.join_channel(ChannelId::new(10)).await.unwrap();
        f.player.play_next();

        tokio::time::sleep(Duration::from_secs(60)).await;
        f.player.enqueue(song("a"), 10).unwrap();
        f.player.play_next();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(f.player.snapshot().connected);
        assert!(f.player.is_playing());
    }
}
