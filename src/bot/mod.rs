//! # Bot Module
//!
//! Serenity event handler for the music commands.
//!
//! - Registers the slash commands on `ready` (per guild when `GUILD_ID` is
//!   set, globally otherwise)
//! - Dispatches command interactions to [`handlers`]
//! - Feeds the bot's own voice state and voice server updates into the
//!   [`VoiceSessionCache`], which the Lavalink backend needs to bind a node
//!   player to the guild's voice session
//!
//! The [`MusicManager`](crate::audio::manager::MusicManager) is not owned
//! here; handlers read it from the client's `TypeMap`.

use anyhow::Result;
use serenity::{
    all::{Context, EventHandler, GuildId, Interaction, Ready, VoiceServerUpdateEvent, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{config::Config, voice::VoiceSessionCache};

pub struct MusicBot {
    config: Arc<Config>,
    voice_cache: Arc<VoiceSessionCache>,
}

impl MusicBot {
    pub fn new(config: Arc<Config>, voice_cache: Arc<VoiceSessionCache>) -> Self {
        Self { config, voice_cache }
    }

    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");
        info!("🔧 Application ID: {}", self.config.application_id);

        match self.config.guild_id.filter(|id| *id != 0) {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                info!("🏠 Registrando comandos para guild específica: {}", guild_id);

                commands::register_guild_commands(ctx, guild_id)
                    .await
                    .map_err(|e| {
                        error!("❌ Error registrando comandos de guild: {:?}", e);
                        anyhow::anyhow!("No se pudieron registrar comandos de guild. Verifica que el bot tenga permisos de 'applications.commands' en la guild.")
                    })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                info!("🌐 Registrando comandos globalmente");
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for MusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Only the bot's own voice state matters: its session id is one third of
    /// the credentials a remote node needs.
    async fn voice_state_update(&self, ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        if new.user_id != ctx.cache.current_user().id {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };

        if new.channel_id.is_none() {
            debug!("🔌 Bot fuera de voz en guild {}", guild_id);
        }
        self.voice_cache.update_session_id(guild_id, new.session_id);
    }

    async fn voice_server_update(&self, _ctx: Context, event: VoiceServerUpdateEvent) {
        let Some(guild_id) = event.guild_id else {
            return;
        };
        match event.endpoint {
            Some(endpoint) => self.voice_cache.update_server(guild_id, event.token, endpoint),
            // Discord manda endpoint nulo mientras reasigna el servidor de voz
            None => warn!("⚠️ voice_server_update sin endpoint en guild {}", guild_id),
        }
    }
}
