//! ffmpeg transcoding, Ogg demuxing and real-time frame pacing.

use bytes::Bytes;
use std::{
    io::{ErrorKind, Read},
    process::{Child, Command, Stdio},
    time::Duration,
};
use symphonia::{
    core::{
        errors::Error as SymphoniaError,
        formats::{FormatOptions, FormatReader},
        io::{MediaSourceStream, ReadOnlySource},
    },
    default::formats::OggReader,
};
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{MusicError, MusicResult},
    voice::{FrameSend, VoiceConnection},
};

/// One Opus packet per tick.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);
/// Paquetes demultiplexados en espera del pacer
pub const DEMUX_BUFFER: usize = 8;

pub fn ffmpeg_args(stream_url: &str, volume: u8) -> Vec<String> {
    let volume_filter = format!("volume={:.2}", f64::from(volume) / 100.0);
    [
        "-loglevel",
        "error",
        "-rw_timeout",
        "15000000",
        "-reconnect",
        "1",
        "-reconnect_streamed",
        "1",
        "-reconnect_at_eof",
        "1",
        "-reconnect_delay_max",
        "5",
        "-i",
        stream_url,
        "-ar",
        "48000",
        "-ac",
        "2",
        "-af",
        &volume_filter,
        "-c:a",
        "libopus",
        "-b:a",
        "96K",
        "-vbr",
        "on",
        "-frame_duration",
        "20",
        "-application",
        "audio",
        "-vn",
        "-f",
        "ogg",
        "pipe:1",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

pub fn spawn_transcoder(ffmpeg_path: &str, stream_url: &str, volume: u8) -> MusicResult<Child> {
    Command::new(ffmpeg_path)
        .args(ffmpeg_args(stream_url, volume))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| MusicError::Subprocess {
            tool: "ffmpeg".to_string(),
            detail: format!("no se pudo iniciar: {}", e),
        })
}

/// Reads the whole stderr stream and logs it once the process closes it.
pub fn drain_stderr(mut stderr: impl Read) {
    let mut output = String::new();
    if stderr.read_to_string(&mut output).is_ok() {
        let output = output.trim();
        if !output.is_empty() {
            warn!("⚠️ ffmpeg stderr: {}", output);
        }
    }
}

/// `OpusHead` / `OpusTags` carry stream metadata, not audio.
pub fn is_header_packet(packet: &[u8]) -> bool {
    packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags")
}

/// Blocking: pulls Opus packets out of ffmpeg's Ogg output until EOF or until
/// the receiving side hangs up. Returns the number of packets forwarded.
pub fn demux_opus<R>(output: R, frames: flume::Sender<Bytes>) -> MusicResult<usize>
where
    R: Read + Send + Sync + 'static,
{
    let source = MediaSourceStream::new(Box::new(ReadOnlySource::new(output)), Default::default());
    let mut reader = OggReader::try_new(source, &FormatOptions::default()).map_err(demux_error)?;

    let mut forwarded = 0;
    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("🏁 Fin del stream de ffmpeg ({} paquetes)", forwarded);
                return Ok(forwarded);
            }
            Err(e) => return Err(demux_error(e)),
        };

        let data = packet.buf();
        if data.is_empty() || is_header_packet(data) {
            continue;
        }

        if frames.send(Bytes::copy_from_slice(data)).is_err() {
            return Ok(forwarded);
        }
        forwarded += 1;
    }
}

fn demux_error(e: SymphoniaError) -> MusicError {
    MusicError::Subprocess {
        tool: "ffmpeg".to_string(),
        detail: format!("error al leer ogg: {}", e),
    }
}

/// Why the pacer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceOutcome {
    /// The demuxer ran dry.
    Finished,
    Cancelled,
    /// The voice connection stopped accepting audio.
    ConnectionLost,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PaceStats {
    pub sent: u64,
    pub dropped: u64,
}

/// Sends one packet per [`FRAME_INTERVAL`] to the voice connection. While
/// `paused` holds `true` nothing is pulled, which back-pressures the demuxer
/// and the transcoder behind it.
pub async fn pace_frames(
    frames: flume::Receiver<Bytes>,
    connection: &dyn VoiceConnection,
    cancel: &CancellationToken,
    mut paused: watch::Receiver<bool>,
) -> (PaceOutcome, PaceStats) {
    let mut stats = PaceStats::default();
    let mut ticker = interval(FRAME_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Sin emisor de pausa ya no hay nada que observar
    let mut pause_live = true;

    loop {
        if pause_live && *paused.borrow_and_update() {
            let resumed = tokio::select! {
                _ = cancel.cancelled() => return (PaceOutcome::Cancelled, stats),
                resumed = async { paused.wait_for(|p| !*p).await.is_ok() } => resumed,
            };
            if !resumed {
                pause_live = false;
            }
            ticker.reset();
            continue;
        }

        if !connection.is_ready() {
            return (PaceOutcome::ConnectionLost, stats);
        }

        let packet = tokio::select! {
            _ = cancel.cancelled() => return (PaceOutcome::Cancelled, stats),
            changed = paused.changed(), if pause_live => {
                if changed.is_err() {
                    pause_live = false;
                }
                continue;
            }
            packet = frames.recv_async() => match packet {
                Ok(packet) => packet,
                Err(_) => return (PaceOutcome::Finished, stats),
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => return (PaceOutcome::Cancelled, stats),
            _ = ticker.tick() => {}
        }

        match connection.send_frame(packet) {
            FrameSend::Sent => stats.sent += 1,
            FrameSend::Dropped => stats.dropped += 1,
            FrameSend::Closed => return (PaceOutcome::ConnectionLost, stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serenity::model::id::{ChannelId, GuildId};
    use std::{
        io::Cursor,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };
    use tokio::time::Instant;

    use crate::audio::local::testing::opus_fixture;

    #[derive(Default)]
    struct RecordingConnection {
        sent: Mutex<Vec<(Bytes, Instant)>>,
        full: AtomicBool,
        gone: AtomicBool,
    }

    #[async_trait]
    impl VoiceConnection for RecordingConnection {
        fn guild_id(&self) -> GuildId {
            GuildId::new(1)
        }

        fn channel_id(&self) -> ChannelId {
            ChannelId::new(2)
        }

        fn is_ready(&self) -> bool {
            !self.gone.load(Ordering::SeqCst)
        }

        fn send_frame(&self, frame: Bytes) -> FrameSend {
            if self.full.load(Ordering::SeqCst) {
                return FrameSend::Dropped;
            }
            self.sent.lock().push((frame, Instant::now()));
            FrameSend::Sent
        }

        async fn disconnect(&self) {}
    }

    fn packets(n: u8) -> flume::Receiver<Bytes> {
        let (tx, rx) = flume::unbounded();
        for i in 0..n {
            tx.send(Bytes::from(vec![i])).unwrap();
        }
        rx
    }

    #[test]
    fn test_ffmpeg_args() {
        let args = ffmpeg_args("https://cdn/x.mp3", 50);
        let at = |flag: &str| {
            let i = args.iter().position(|a| a == flag).unwrap();
            args[i + 1].clone()
        };
        assert_eq!(at("-i"), "https://cdn/x.mp3");
        assert_eq!(at("-af"), "volume=0.50");
        assert_eq!(at("-c:a"), "libopus");
        assert_eq!(at("-b:a"), "96K");
        assert_eq!(at("-frame_duration"), "20");
        assert_eq!(at("-reconnect_streamed"), "1");
        assert_eq!(args.last().unwrap(), "pipe:1");

        assert!(ffmpeg_args("u", 0).contains(&"volume=0.00".to_string()));
    }

    #[test]
    fn test_demux_forwards_audio_packets_only() {
        let (tx, rx) = flume::unbounded();
        let forwarded = demux_opus(Cursor::new(opus_fixture()), tx).unwrap();

        let packets: Vec<Bytes> = rx.drain().collect();
        assert_eq!(forwarded, 3);
        assert_eq!(
            packets,
            vec![
                Bytes::from_static(&[0xfc, 0xff, 0xfe]),
                Bytes::from_static(&[0xfc, 0x01, 0x02]),
                Bytes::from_static(&[0xfc, 0x03]),
            ]
        );
    }

    #[test]
    fn test_demux_stops_when_receiver_hangs_up() {
        let (tx, rx) = flume::bounded(1);
        drop(rx);
        assert_eq!(demux_opus(Cursor::new(opus_fixture()), tx).unwrap(), 0);
    }

    #[test]
    fn test_demux_rejects_non_ogg_output() {
        let (tx, _rx) = flume::unbounded();
        let err = demux_opus(Cursor::new(b"ffmpeg: not an ogg stream".to_vec()), tx).unwrap_err();
        assert!(matches!(err, MusicError::Subprocess { tool, .. } if tool == "ffmpeg"));
    }

    #[test]
    fn test_header_packets() {
        assert!(is_header_packet(b"OpusHead\x01\x02"));
        assert!(is_header_packet(b"OpusTags...."));
        assert!(!is_header_packet(b"\xfc\xff\xfe"));
        assert!(!is_header_packet(b""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paces_one_frame_per_tick() {
        let conn = RecordingConnection::default();
        let (_pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let (outcome, stats) = pace_frames(packets(5), &conn, &cancel, pause_rx).await;

        assert_eq!(outcome, PaceOutcome::Finished);
        assert_eq!(stats, PaceStats { sent: 5, dropped: 0 });

        let sent = conn.sent.lock();
        let payloads: Vec<u8> = sent.iter().map(|(b, _)| b[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
        for pair in sent.windows(2) {
            assert_eq!(pair[1].1 - pair[0].1, FRAME_INTERVAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sink_drops_instead_of_blocking() {
        let conn = RecordingConnection::default();
        conn.full.store(true, Ordering::SeqCst);
        let (_pause_tx, pause_rx) = watch::channel(false);

        let (outcome, stats) = pace_frames(packets(3), &conn, &CancellationToken::new(), pause_rx).await;

        assert_eq!(outcome, PaceOutcome::Finished);
        assert_eq!(stats, PaceStats { sent: 0, dropped: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_connection_not_ready() {
        let conn = RecordingConnection::default();
        conn.gone.store(true, Ordering::SeqCst);
        let (_pause_tx, pause_rx) = watch::channel(false);

        let (outcome, _) = pace_frames(packets(3), &conn, &CancellationToken::new(), pause_rx).await;
        assert_eq!(outcome, PaceOutcome::ConnectionLost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_packets() {
        let conn = Arc::new(RecordingConnection::default());
        let (_tx, rx) = flume::unbounded::<Bytes>();
        let (_pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let task = {
            let conn = conn.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pace_frames(rx, conn.as_ref(), &cancel, pause_rx).await.0 })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), PaceOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_frames_back() {
        let conn = Arc::new(RecordingConnection::default());
        let (pause_tx, pause_rx) = watch::channel(true);
        let rx = packets(2);

        let task = {
            let conn = conn.clone();
            tokio::spawn(async move {
                pace_frames(rx, conn.as_ref(), &CancellationToken::new(), pause_rx).await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(conn.sent.lock().is_empty());

        pause_tx.send_replace(false);
        let (outcome, stats) = task.await.unwrap();
        assert_eq!(outcome, PaceOutcome::Finished);
        assert_eq!(stats.sent, 2);
    }
}
