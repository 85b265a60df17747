//! # Audio Module
//!
//! Queueing and playback for every guild the bot is in.
//!
//! ## Architecture
//!
//! ### [`manager`] - Music Manager
//! - Builds the configured backend once per process
//! - Hands out one [`player::GuildPlayer`] per guild, created on first use
//!
//! ### [`player`] - Guild Player
//! - Bounded queue, now playing, pause flag and volume under one lock
//! - Advances on backend completion; stale completions are filtered by a
//!   generation counter
//! - Disconnects after an idle grace period
//!
//! ### [`backend`] - Playback Engines
//! - [`local`]: yt-dlp resolution, ffmpeg transcoding, 20 ms Opus pacing
//! - [`lavalink`]: a remote Lavalink v4 node driven over REST + WebSocket
//!
//! ## Flow
//!
//! ```text
//! /play -> manager.resolve -> player.join_channel -> player.enqueue
//!       -> player.play_next -> backend.play (task) -> TrackFinished
//!       -> player.play_next ...
//! ```

pub mod backend;
pub mod lavalink;
pub mod local;
pub mod manager;
pub mod player;
pub mod queue;
pub mod song;
