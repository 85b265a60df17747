use anyhow::Result;
use serenity::{
    builder::{
        CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage,
        EditInteractionResponse,
    },
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    audio::manager::MusicManager,
    error::MusicError,
    ui::embeds::{self, format_duration},
};

/// Maneja comandos slash
pub async fn handle_command(ctx: &Context, command: CommandInteraction) -> Result<()> {
    let Some(guild_id) = command.guild_id else {
        return reply(ctx, &command, "❌ Este comando solo funciona en un servidor", true).await;
    };

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    let manager = {
        let data = ctx.data.read().await;
        data.get::<MusicManager>().cloned()
    };
    let Some(manager) = manager else {
        return reply(ctx, &command, "❌ La música está deshabilitada en este bot", true).await;
    };

    match command.data.name.as_str() {
        "play" => handle_play(ctx, &command, guild_id, &manager).await?,
        "skip" => handle_skip(ctx, &command, guild_id, &manager).await?,
        "stop" => handle_stop(ctx, &command, guild_id, &manager).await?,
        "queue" => handle_queue(ctx, &command, guild_id, &manager).await?,
        "volume" => handle_volume(ctx, &command, guild_id, &manager).await?,
        "nowplaying" => handle_nowplaying(ctx, &command, guild_id, &manager).await?,
        "pause" => handle_pause(ctx, &command, guild_id, &manager).await?,
        "resume" => handle_resume(ctx, &command, guild_id, &manager).await?,
        _ => reply(ctx, &command, "❌ Comando no reconocido", true).await?,
    }

    Ok(())
}

async fn reply(ctx: &Context, command: &CommandInteraction, content: &str, ephemeral: bool) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;
    Ok(())
}

async fn reply_embed(ctx: &Context, command: &CommandInteraction, embed: CreateEmbed) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().embed(embed)),
        )
        .await?;
    Ok(())
}

// Handlers específicos para cada comando

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    guild_id: GuildId,
    manager: &Arc<MusicManager>,
) -> Result<()> {
    let query = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "query")
        .and_then(|opt| opt.value.as_str())
        .unwrap_or_default()
        .to_string();

    // Defer la respuesta ya que puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let embed = match play_query(ctx, command, guild_id, manager, &query).await {
        Ok(embed) => embed,
        Err(e) => {
            warn!("⚠️ /play falló en guild {}: {:?}", guild_id, e);
            embeds::create_error_embed("No se pudo reproducir", &user_message(&e))
        }
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
        .await?;
    Ok(())
}

async fn play_query(
    ctx: &Context,
    command: &CommandInteraction,
    guild_id: GuildId,
    manager: &Arc<MusicManager>,
    query: &str,
) -> Result<CreateEmbed> {
    // Verificar que el usuario esté en un canal de voz
    let channel_id = get_user_voice_channel(ctx, guild_id, command.user.id)?;

    let song = manager.resolve(query).await?;
    check_duration_limit(song.duration_secs, manager.max_song_duration())?;
    let song = song.with_requester(command.user.name.clone());

    let player = manager.player(guild_id);
    player.join_channel(channel_id).await?;
    let position = player.enqueue(song.clone(), manager.max_queue_size())?;

    let starts_now = player.start_if_idle() && position == 1;

    Ok(embeds::create_track_added_embed(
        &song,
        position,
        starts_now,
        manager.backend_name(),
    ))
}

fn check_duration_limit(duration_secs: u64, max_secs: u64) -> Result<()> {
    if max_secs > 0 && duration_secs > max_secs {
        anyhow::bail!(
            "⏱️ La canción dura {} y el máximo permitido es {}",
            format_duration(std::time::Duration::from_secs(duration_secs)),
            format_duration(std::time::Duration::from_secs(max_secs))
        );
    }
    Ok(())
}

/// Errors of the music core are shown verbatim only when they are meant for
/// the user; everything else gets a generic message.
fn user_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<MusicError>() {
        Some(music) if music.is_user_facing() => music.to_string(),
        Some(music) => {
            error!("❌ Error interno de música: {}", music);
            "Error interno del reproductor, inténtalo de nuevo".to_string()
        }
        None => err.to_string(),
    }
}

async fn handle_skip(
    ctx: &Context,
    command: &CommandInteraction,
    guild_id: GuildId,
    manager: &Arc<MusicManager>,
) -> Result<()> {
    match manager.player(guild_id).skip().await {
        Some(song) => reply(ctx, command, &format!("⏭️ Saltada: **{}**", song.title), false).await,
        None => reply(ctx, command, "❌ No hay nada reproduciéndose actualmente", true).await,
    }
}

async fn handle_stop(
    ctx: &Context,
    command: &CommandInteraction,
    guild_id: GuildId,
    manager: &Arc<MusicManager>,
) -> Result<()> {
    manager.player(guild_id).stop().await;
    reply(ctx, command, "⏹️ Reproducción detenida y cola limpiada", false).await
}

async fn handle_queue(
    ctx: &Context,
    command: &CommandInteraction,
    guild_id: GuildId,
    manager: &Arc<MusicManager>,
) -> Result<()> {
    let snapshot = manager.player(guild_id).snapshot();
    if snapshot.now_playing.is_none() && snapshot.queue.is_empty() {
        let embed = embeds::create_info_embed("📭 La cola está vacía", "Usa `/play` para agregar canciones");
        return reply_embed(ctx, command, embed).await;
    }
    reply_embed(ctx, command, embeds::create_queue_embed(&snapshot, manager.backend_name())).await
}

async fn handle_volume(
    ctx: &Context,
    command: &CommandInteraction,
    guild_id: GuildId,
    manager: &Arc<MusicManager>,
) -> Result<()> {
    let requested = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "level")
        .and_then(|opt| opt.value.as_i64());

    let Some(requested) = requested else {
        let current = manager.player(guild_id).snapshot().volume;
        return reply(ctx, command, &format!("🔊 Volumen actual: {}%", current), true).await;
    };

    let volume = clamp_volume(requested);
    if let Err(e) = manager.player(guild_id).set_volume(volume).await {
        warn!("⚠️ No se pudo aplicar el volumen en guild {}: {}", guild_id, e);
    }

    let note = if manager.backend_name() == "direct" {
        " (se aplica desde la siguiente canción)"
    } else {
        ""
    };
    reply(ctx, command, &format!("🔊 Volumen ajustado a {}%{}", volume, note), false).await
}

fn clamp_volume(level: i64) -> u8 {
    level.clamp(0, 100) as u8
}

async fn handle_nowplaying(
    ctx: &Context,
    command: &CommandInteraction,
    guild_id: GuildId,
    manager: &Arc<MusicManager>,
) -> Result<()> {
    let snapshot = manager.player(guild_id).snapshot();
    match embeds::create_now_playing_embed(&snapshot, manager.backend_name()) {
        Some(embed) => reply_embed(ctx, command, embed).await,
        None => reply(ctx, command, "❌ No hay nada reproduciéndose actualmente", true).await,
    }
}

async fn handle_pause(
    ctx: &Context,
    command: &CommandInteraction,
    guild_id: GuildId,
    manager: &Arc<MusicManager>,
) -> Result<()> {
    if manager.player(guild_id).pause().await? {
        reply(ctx, command, "⏸️ Reproducción pausada", false).await
    } else {
        reply(ctx, command, "❌ No hay nada que pausar", true).await
    }
}

async fn handle_resume(
    ctx: &Context,
    command: &CommandInteraction,
    guild_id: GuildId,
    manager: &Arc<MusicManager>,
) -> Result<()> {
    if manager.player(guild_id).resume().await? {
        reply(ctx, command, "▶️ Reproducción reanudada", false).await
    } else {
        reply(ctx, command, "❌ La reproducción no está en pausa", true).await
    }
}

// Funciones auxiliares

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Result<ChannelId> {
    let guild = guild_id
        .to_guild_cached(&ctx.cache)
        .ok_or_else(|| anyhow::anyhow!("Guild no encontrada en caché"))?;

    let channel_id = guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or_else(|| anyhow::anyhow!("🔇 Debes estar en un canal de voz"))?;

    Ok(channel_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_volume() {
        assert_eq!(clamp_volume(-5), 0);
        assert_eq!(clamp_volume(42), 42);
        assert_eq!(clamp_volume(250), 100);
    }

    #[test]
    fn test_duration_limit() {
        assert!(check_duration_limit(600, 0).is_ok());
        assert!(check_duration_limit(0, 300).is_ok());
        assert!(check_duration_limit(300, 300).is_ok());
        let err = check_duration_limit(301, 300).unwrap_err();
        assert!(err.to_string().contains("5:01"));
    }

    #[test]
    fn test_user_message_hides_internal_errors() {
        let facing = anyhow::Error::from(MusicError::QueueFull { len: 2, max: 2 });
        assert_eq!(user_message(&facing), MusicError::QueueFull { len: 2, max: 2 }.to_string());

        let internal = anyhow::Error::from(MusicError::NoSession);
        assert!(user_message(&internal).contains("Error interno"));

        let plain = anyhow::anyhow!("🔇 Debes estar en un canal de voz");
        assert_eq!(user_message(&plain), "🔇 Debes estar en un canal de voz");
    }
}
