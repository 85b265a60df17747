//! # Voice Module
//!
//! The seam between the playback core and the platform's voice layer.
//!
//! - [`session_cache`]: voice gateway credentials pushed by serenity events
//! - [`VoiceGateway`] / [`VoiceConnection`]: how a guild player joins a channel
//!   and, for the local pipeline, hands Opus frames to the voice driver
//! - [`songbird`]: the production implementation on top of songbird

pub mod session_cache;
pub mod songbird;

use async_trait::async_trait;
use bytes::Bytes;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;

use crate::error::MusicResult;

pub use session_cache::{VoiceCredentials, VoiceSessionCache};

/// What a join needs to keep locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Full voice connection; audio frames are sent from this process.
    Media,
    /// Gateway handshake only. The credentials land in the
    /// [`VoiceSessionCache`] and a remote node speaks the voice protocol.
    SignallingOnly,
}

/// Result of a non-blocking frame send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSend {
    Sent,
    /// Sink momentarily full; the frame was discarded.
    Dropped,
    /// Nobody is listening anymore.
    Closed,
}

#[async_trait]
pub trait VoiceConnection: Send + Sync {
    fn guild_id(&self) -> GuildId;

    fn channel_id(&self) -> ChannelId;

    /// False once the connection can no longer carry audio.
    fn is_ready(&self) -> bool;

    /// Pushes one Opus packet (20 ms) without waiting.
    fn send_frame(&self, frame: Bytes) -> FrameSend;

    /// Marks the start/end of an outbound audio stream.
    async fn set_speaking(&self, _speaking: bool) -> MusicResult<()> {
        Ok(())
    }

    async fn disconnect(&self);
}

#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        mode: JoinMode,
    ) -> MusicResult<Arc<dyn VoiceConnection>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory connection that records frames and disconnects.
    pub struct StubConnection {
        pub guild_id: GuildId,
        pub channel_id: ChannelId,
        pub frames: Mutex<Vec<Bytes>>,
        pub disconnects: AtomicUsize,
        pub gone: AtomicBool,
    }

    impl StubConnection {
        pub fn new(guild_id: GuildId, channel_id: ChannelId) -> Arc<Self> {
            Arc::new(Self {
                guild_id,
                channel_id,
                frames: Mutex::new(Vec::new()),
                disconnects: AtomicUsize::new(0),
                gone: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl VoiceConnection for StubConnection {
        fn guild_id(&self) -> GuildId {
            self.guild_id
        }

        fn channel_id(&self) -> ChannelId {
            self.channel_id
        }

        fn is_ready(&self) -> bool {
            !self.gone.load(Ordering::SeqCst)
        }

        fn send_frame(&self, frame: Bytes) -> FrameSend {
            self.frames.lock().push(frame);
            FrameSend::Sent
        }

        async fn disconnect(&self) {
            self.gone.store(true, Ordering::SeqCst);
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Gateway handing out [`StubConnection`]s and remembering every join.
    #[derive(Default)]
    pub struct StubGateway {
        pub joins: Mutex<Vec<(GuildId, ChannelId, JoinMode)>>,
        pub connections: Mutex<Vec<Arc<StubConnection>>>,
    }

    #[async_trait]
    impl VoiceGateway for StubGateway {
        async fn join(
            &self,
            guild_id: GuildId,
            channel_id: ChannelId,
            mode: JoinMode,
        ) -> MusicResult<Arc<dyn VoiceConnection>> {
            self.joins.lock().push((guild_id, channel_id, mode));
            let connection = StubConnection::new(guild_id, channel_id);
            self.connections.lock().push(connection.clone());
            Ok(connection)
        }
    }
}
