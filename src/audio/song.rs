use std::time::Duration;

/// A resolved track, ready to be queued.
///
/// `track` is the backend-specific playback token: a direct media URL for the
/// local pipeline, an encoded track blob for Lavalink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Song {
    pub title: String,
    pub url: String,
    pub track: String,
    pub duration_secs: u64,
    pub added_by: Option<String>,
}

impl Song {
    pub fn new(title: impl Into<String>, url: impl Into<String>, track: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            track: track.into(),
            duration_secs: 0,
            added_by: None,
        }
    }

    pub fn with_duration(mut self, duration_secs: u64) -> Self {
        self.duration_secs = duration_secs;
        self
    }

    /// Sets the requester. Only the first call has an effect.
    pub fn with_requester(mut self, name: impl Into<String>) -> Self {
        if self.added_by.is_none() {
            self.added_by = Some(name.into());
        }
        self
    }

    pub fn duration(&self) -> Option<Duration> {
        (self.duration_secs > 0).then(|| Duration::from_secs(self.duration_secs))
    }

    /// Streams and radios report no duration.
    pub fn is_live(&self) -> bool {
        self.duration_secs == 0
    }

    pub fn requester(&self) -> &str {
        self.added_by.as_deref().unwrap_or("desconocido")
    }
}
