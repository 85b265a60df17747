use async_trait::async_trait;
use audiopus::{coder::Decoder, packet::Packet, Channels, MutSignals, SampleRate};
use bytes::Bytes;
use flume::{Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use ::songbird::{
    input::{Input, RawAdapter},
    tracks::TrackHandle,
    Call, Songbird,
};
use std::{
    io::{self, Read, Seek, SeekFrom},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use symphonia::core::io::MediaSource;
use tracing::{debug, info, warn};

use super::{FrameSend, JoinMode, VoiceConnection, VoiceGateway};
use crate::error::{MusicError, MusicResult};

const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: usize = 2;
/// 20 ms a 48 kHz
const FRAME_SAMPLES: usize = 960;
/// Opus permite paquetes de hasta 120 ms
const MAX_FRAME_SAMPLES: usize = 5_760;
/// Un segundo de audio en vuelo entre el pacer y el mezclador
const FRAME_BUFFER: usize = 50;

/// [`VoiceGateway`] backed by the songbird instance registered on the client.
pub struct SongbirdGateway {
    songbird: Arc<Songbird>,
}

impl SongbirdGateway {
    pub fn new(songbird: Arc<Songbird>) -> Self {
        Self { songbird }
    }
}

#[async_trait]
impl VoiceGateway for SongbirdGateway {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        mode: JoinMode,
    ) -> MusicResult<Arc<dyn VoiceConnection>> {
        let call = match mode {
            JoinMode::Media => self
                .songbird
                .join(guild_id, channel_id)
                .await
                .map_err(|e| MusicError::Voice(format!("no se pudo unir al canal: {}", e)))?,
            JoinMode::SignallingOnly => {
                let (info, call) = self
                    .songbird
                    .join_gateway(guild_id, channel_id)
                    .await
                    .map_err(|e| MusicError::Voice(format!("handshake de voz falló: {}", e)))?;
                debug!("🛰️ Handshake de voz completo (endpoint {})", info.endpoint);
                call
            }
        };

        info!("🔊 Conectado al canal {} en guild {} ({:?})", channel_id, guild_id, mode);

        Ok(Arc::new(SongbirdConnection {
            guild_id,
            channel_id,
            mode,
            songbird: self.songbird.clone(),
            call,
            outbound: Mutex::new(None),
            connected: AtomicBool::new(true),
        }))
    }
}

struct Outbound {
    frames: Sender<Bytes>,
    track: TrackHandle,
}

pub struct SongbirdConnection {
    guild_id: GuildId,
    channel_id: ChannelId,
    mode: JoinMode,
    songbird: Arc<Songbird>,
    call: Arc<tokio::sync::Mutex<Call>>,
    outbound: Mutex<Option<Outbound>>,
    connected: AtomicBool,
}

impl SongbirdConnection {
    fn close_outbound(&self) {
        if let Some(outbound) = self.outbound.lock().take() {
            drop(outbound.frames);
            let _ = outbound.track.stop();
        }
    }
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    fn is_ready(&self) -> bool {
        if !self.connected.load(Ordering::Acquire) {
            return false;
        }
        match self.outbound.lock().as_ref() {
            Some(outbound) => !outbound.frames.is_disconnected(),
            None => true,
        }
    }

    fn send_frame(&self, frame: Bytes) -> FrameSend {
        let outbound = self.outbound.lock();
        let Some(outbound) = outbound.as_ref() else {
            return FrameSend::Closed;
        };
        match outbound.frames.try_send(frame) {
            Ok(()) => FrameSend::Sent,
            Err(TrySendError::Full(_)) => FrameSend::Dropped,
            Err(TrySendError::Disconnected(_)) => FrameSend::Closed,
        }
    }

    async fn set_speaking(&self, speaking: bool) -> MusicResult<()> {
        if !speaking {
            self.close_outbound();
            return Ok(());
        }

        if self.mode == JoinMode::SignallingOnly {
            return Err(MusicError::Voice(
                "la conexión no tiene canal de medios local".to_string(),
            ));
        }

        self.close_outbound();

        let (tx, rx) = flume::bounded(FRAME_BUFFER);
        let source = OpusFrameSource::new(rx)?;
        let input: Input = RawAdapter::new(source, SAMPLE_RATE, CHANNELS as u32).into();
        let track = self.call.lock().await.play_input(input);

        *self.outbound.lock() = Some(Outbound { frames: tx, track });
        debug!("🎙️ Stream de salida abierto en guild {}", self.guild_id);
        Ok(())
    }

    async fn disconnect(&self) {
        self.close_outbound();
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.songbird.remove(self.guild_id).await {
            warn!("⚠️ Error al salir del canal de voz en guild {}: {}", self.guild_id, e);
        } else {
            info!("👋 Desconectado del canal de voz en guild {}", self.guild_id);
        }
    }
}

/// Turns queued Opus packets into the interleaved f32 PCM songbird's
/// [`RawAdapter`] expects. Emits silence while no packet is pending and ends
/// the stream once the sender is gone and the queue drained.
pub struct OpusFrameSource {
    state: Mutex<FrameSourceState>,
}

struct FrameSourceState {
    frames: Receiver<Bytes>,
    decoder: Decoder,
    pcm: Vec<f32>,
    pending: Vec<u8>,
    offset: usize,
}

impl OpusFrameSource {
    pub fn new(frames: Receiver<Bytes>) -> MusicResult<Self> {
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Stereo)
            .map_err(|e| MusicError::Voice(format!("no se pudo crear el decoder opus: {}", e)))?;

        Ok(Self {
            state: Mutex::new(FrameSourceState {
                frames,
                decoder,
                pcm: vec![0.0; MAX_FRAME_SAMPLES * CHANNELS],
                pending: Vec::with_capacity(MAX_FRAME_SAMPLES * CHANNELS * 4),
                offset: 0,
            }),
        })
    }
}

impl FrameSourceState {
    fn decode(&mut self, packet: &[u8]) {
        let decoded = Packet::try_from(packet).and_then(|input| {
            let output = MutSignals::try_from(&mut self.pcm[..])?;
            self.decoder.decode_float(Some(input), output, false)
        });
        let samples = match decoded {
            Ok(per_channel) => per_channel * CHANNELS,
            Err(e) => {
                warn!("⚠️ Paquete opus inválido, se reemplaza con silencio: {}", e);
                self.fill_silence();
                return;
            }
        };

        self.pending.clear();
        for sample in &self.pcm[..samples] {
            self.pending.extend_from_slice(&sample.to_le_bytes());
        }
        self.offset = 0;
    }

    fn fill_silence(&mut self) {
        self.pending.clear();
        self.pending.resize(FRAME_SAMPLES * CHANNELS * 4, 0);
        self.offset = 0;
    }
}

impl Read for OpusFrameSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.state.get_mut();

        if state.offset >= state.pending.len() {
            match state.frames.try_recv() {
                Ok(packet) => state.decode(&packet),
                Err(TryRecvError::Empty) => state.fill_silence(),
                Err(TryRecvError::Disconnected) => return Ok(0),
            }
        }

        let available = &state.pending[state.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        state.offset += n;
        Ok(n)
    }
}

impl Seek for OpusFrameSource {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "el stream de voz no admite seek",
        ))
    }
}

impl MediaSource for OpusFrameSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
