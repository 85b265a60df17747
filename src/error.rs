//! Error taxonomy for the playback subsystem.
//!
//! Variants are grouped the way callers react to them: configuration problems
//! disable the music feature, resolution and capacity problems go back to the
//! user who asked, transport and protocol problems abort the current song and
//! may trigger a reconnect first.

use thiserror::Error;

pub type MusicResult<T> = std::result::Result<T, MusicError>;

#[derive(Error, Debug)]
pub enum MusicError {
    // Configuración
    /// Missing binaries, unknown backend name or invalid settings.
    #[error("configuración de música inválida: {0}")]
    Config(String),

    // Resolución
    #[error("la búsqueda está vacía")]
    EmptyQuery,

    #[error("falta el término de búsqueda")]
    MissingSearchTerm,

    /// `bc:` only accepts a literal Bandcamp page URL.
    #[error("bc: espera una URL de Bandcamp (ejemplo: bc: https://artist.bandcamp.com/track/...)")]
    BandcampUrlRequired,

    #[error("no se encontraron resultados para: {0}")]
    NoResults(String),

    #[error("soundcloud devolvió un stream de preview ({0}s). Prueba otro resultado o cambia la búsqueda.")]
    PreviewStream(u64),

    #[error("error al resolver la canción: {0}")]
    Resolution(String),

    // Transporte
    #[error("{tool} falló: {detail}")]
    Subprocess { tool: String, detail: String },

    #[error("tiempo de espera agotado: {0}")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("error de voz: {0}")]
    Voice(String),

    // Protocolo / estado
    #[error("el nodo respondió {status}: {body}")]
    Node { status: u16, body: String },

    #[error("no hay sesión activa con el nodo de audio")]
    NoSession,

    #[error("el nodo cerró la conexión de control")]
    SocketClosed,

    #[error("el nodo no pudo reproducir la pista: {0}")]
    TrackFailed(String),

    #[error("voz no lista (faltan token/endpoint/sessionId)")]
    VoiceNotReady,

    // Capacidad
    #[error("la cola está llena ({len}/{max})")]
    QueueFull { len: usize, max: usize },
}

impl MusicError {
    /// True when the remote node no longer knows the session used for the call.
    pub fn is_session_stale(&self) -> bool {
        match self {
            MusicError::Node { status, body } => *status == 404 || body.contains("Session not found"),
            _ => false,
        }
    }

    /// True for errors the requesting user should see verbatim.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            MusicError::EmptyQuery
                | MusicError::MissingSearchTerm
                | MusicError::BandcampUrlRequired
                | MusicError::NoResults(_)
                | MusicError::PreviewStream(_)
                | MusicError::Resolution(_)
                | MusicError::QueueFull { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MusicError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MusicError::WebSocket(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_session_detection() {
        assert!(MusicError::Node { status: 404, body: String::new() }.is_session_stale());
        assert!(MusicError::Node {
            status: 400,
            body: "{\"message\":\"Session not found\"}".to_string()
        }
        .is_session_stale());
        assert!(!MusicError::Node { status: 500, body: "boom".to_string() }.is_session_stale());
        assert!(!MusicError::NoSession.is_session_stale());
    }

    #[test]
    fn test_queue_full_message() {
        let err = MusicError::QueueFull { len: 2, max: 2 };
        assert_eq!(err.to_string(), "la cola está llena (2/2)");
        assert!(err.is_user_facing());
    }
}
