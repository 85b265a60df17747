use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::audio::{player::PlayerSnapshot, song::Song};

/// Entries listed by `/queue` before collapsing into "y N más".
pub const QUEUE_PAGE: usize = 15;

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

const STANDARD_FOOTER: &str = "🎵 Guild Jukebox";

fn footer(backend: &str) -> CreateEmbedFooter {
    CreateEmbedFooter::new(format!("{} • backend: {}", STANDARD_FOOTER, backend))
}

fn duration_label(song: &Song) -> String {
    if song.is_live() {
        return "🔴 En vivo".to_string();
    }
    format_duration(Duration::from_secs(song.duration_secs))
}

/// Crea un embed para mostrar la canción actual
pub fn create_now_playing_embed(snapshot: &PlayerSnapshot, backend: &str) -> Option<CreateEmbed> {
    let song = snapshot.now_playing.as_ref()?;
    let state = if snapshot.paused { "⏸️ En pausa" } else { "▶️ Sonando" };

    let mut embed = CreateEmbed::default()
        .title("🎵 Reproduciendo Ahora")
        .description(format!("**{}**", song.title))
        .color(colors::SUCCESS_GREEN)
        .field("⏱️ Duración", duration_label(song), true)
        .field("👤 Solicitado por", song.requester(), true)
        .field("🔊 Volumen", format!("{}%", snapshot.volume), true)
        .field("📍 Estado", state, true)
        .field("📋 En cola", snapshot.queue.len().to_string(), true);

    if song.url.starts_with("http") {
        embed = embed.url(&song.url);
    }

    Some(embed.timestamp(Timestamp::now()).footer(footer(backend)))
}

/// Embed de confirmación al agregar una canción
pub fn create_track_added_embed(song: &Song, position: usize, starts_now: bool, backend: &str) -> CreateEmbed {
    let title = if starts_now {
        "▶️ Reproduciendo"
    } else {
        "➕ Agregado a la cola"
    };

    let mut embed = CreateEmbed::default()
        .title(title)
        .description(format!("**{}**", song.title))
        .color(colors::MUSIC_PURPLE)
        .field("⏱️ Duración", duration_label(song), true)
        .field("👤 Solicitado por", song.requester(), true);

    if !starts_now {
        embed = embed.field("📍 Posición", format!("#{}", position), true);
    }
    if song.url.starts_with("http") {
        embed = embed.url(&song.url);
    }

    embed.footer(footer(backend))
}

pub fn create_queue_embed(snapshot: &PlayerSnapshot, backend: &str) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("📋 Cola de Reproducción")
        .color(colors::INFO_BLUE);

    if let Some(song) = &snapshot.now_playing {
        embed = embed.field(
            "🎵 Sonando",
            format!("**{}** [{}] • {}", song.title, duration_label(song), song.requester()),
            false,
        );
    }

    embed = if snapshot.queue.is_empty() {
        embed.description("La cola está vacía")
    } else {
        embed.description(queue_listing(&snapshot.queue))
    };

    embed
        .field("📊 Canciones", snapshot.queue.len().to_string(), true)
        .field("⏱️ Duración total", format_duration(snapshot.queued_duration), true)
        .field("🔊 Volumen", format!("{}%", snapshot.volume), true)
        .footer(footer(backend))
}

fn queue_listing(queue: &[Song]) -> String {
    let mut lines: Vec<String> = queue
        .iter()
        .take(QUEUE_PAGE)
        .enumerate()
        .map(|(i, song)| format!("`{}.` {} [{}]", i + 1, song.title, duration_label(song)))
        .collect();

    if queue.len() > QUEUE_PAGE {
        lines.push(format!("... y {} más", queue.len() - QUEUE_PAGE));
    }
    lines.join("\n")
}

pub fn create_error_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("❌ {}", title))
        .description(description)
        .color(colors::ERROR_RED)
}

pub fn create_info_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(title)
        .description(description)
        .color(colors::NEUTRAL_GRAY)
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0:00");
        assert_eq!(format_duration(Duration::from_secs(185)), "3:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }

    #[test]
    fn test_queue_listing_collapses_tail() {
        let queue: Vec<Song> = (1..=18)
            .map(|i| Song::new(format!("song {}", i), "u", "t").with_duration(60))
            .collect();

        let listing = queue_listing(&queue);
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines.len(), QUEUE_PAGE + 1);
        assert_eq!(lines[0], "`1.` song 1 [1:00]");
        assert_eq!(lines[QUEUE_PAGE], "... y 3 más");
    }

    #[test]
    fn test_live_songs_show_live_label() {
        let live = Song::new("radio", "http://radio", "http://radio");
        assert_eq!(duration_label(&live), "🔴 En vivo");
    }
}
