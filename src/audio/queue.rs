use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info};

use crate::{
    audio::song::Song,
    error::{MusicError, MusicResult},
};

/// FIFO of pending songs for one guild. The size bound is passed to each
/// [`SongQueue::push`].
#[derive(Debug, Default)]
pub struct SongQueue {
    items: VecDeque<Song>,
}

impl SongQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agrega una canción al final y devuelve su posición (1-based)
    pub fn push(&mut self, song: Song, max_size: usize) -> MusicResult<usize> {
        if self.items.len() >= max_size {
            return Err(MusicError::QueueFull {
                len: self.items.len(),
                max: max_size,
            });
        }

        info!("➕ Agregado a la cola: {}", song.title);
        self.items.push_back(song);
        Ok(self.items.len())
    }

    /// Obtiene la siguiente canción (FIFO - First In, First Out)
    pub fn pop(&mut self) -> Option<Song> {
        let next = self.items.pop_front();
        match &next {
            Some(song) => debug!("➡️ Siguiente en cola (FIFO): {}", song.title),
            None => debug!("📭 Cola vacía, no hay siguiente canción"),
        }
        next
    }

    /// Limpia la cola
    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Song> {
        self.items.iter().cloned().collect()
    }

    /// Sum of known durations; live streams count as zero.
    pub fn total_duration(&self) -> Duration {
        self.items.iter().filter_map(Song::duration).sum()
    }
}
