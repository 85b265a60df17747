use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info, warn};

mod audio;
mod bot;
mod config;
mod error;
mod ui;
mod voice;

use crate::audio::{local::verify_binaries, manager::MusicManager};
use crate::bot::MusicBot;
use crate::config::Config;
use crate::voice::{songbird::SongbirdGateway, VoiceSessionCache};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_jukebox=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Guild Jukebox v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Arc::new(Config::load()?);

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    // Solo lo necesario para comandos slash y voz
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let voice_cache = Arc::new(VoiceSessionCache::new());
    let handler = MusicBot::new(config.clone(), voice_cache.clone());

    // Construir cliente
    let songbird = Songbird::serenity();
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird.clone())
        .await?;

    if config.music.enabled {
        info!("🎼 Inicializando música...");
        let user_id = client.http.get_current_user().await?.id;
        let gateway = Arc::new(SongbirdGateway::new(songbird));

        match MusicManager::new(&config.music, gateway, voice_cache, user_id).await {
            Ok(manager) => {
                info!("✅ Música lista (backend: {})", manager.backend_name());
                let mut data = client.data.write().await;
                data.insert::<MusicManager>(Arc::new(manager));
            }
            Err(e) => {
                error!("❌ Error al inicializar la música: {}", e);
                warn!("🔄 Continuando sin música; los comandos responderán que está deshabilitada");
            }
        }
    } else {
        info!("🔇 Música deshabilitada por configuración");
    }

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    let data = client.data.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Error al registrar Ctrl+C");
        info!("⚠️ Señal de shutdown recibida, cerrando...");

        let manager = data.read().await.get::<MusicManager>().cloned();
        if let Some(manager) = manager {
            manager.shutdown().await;
        }
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    match verify_binaries(&config.music.direct).await {
        Ok(()) => {
            println!("OK");
            Ok(())
        }
        Err(e) => anyhow::bail!("Dependencias faltantes: {}", e),
    }
}
