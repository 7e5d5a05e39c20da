use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

mod audio;
mod bot;
mod cache;
mod config;
mod error;
mod sources;
mod storage;

use crate::audio::{
    connection::ConnectionManager,
    directory::SerenityDirectory,
    lavalink::{LavalinkLink, LavalinkTransport},
    node::{LavalinkProbe, NodeProbe, NodeStatus, NodeSupervisor},
    player::AudioPlayer,
    transport::event_channel,
};
use crate::bot::OpenMusicBot;
use crate::cache::SearchCache;
use crate::config::Config;
use crate::sources::{lavalink::LavalinkSource, TrackResolver};
use crate::storage::JsonStorage;

const NODE_HEALTH_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?)
                .add_directive("lavalink_rs=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load()?);

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    let storage = Arc::new(tokio::sync::Mutex::new(JsonStorage::new(config.data_dir.clone()).await?));

    let link = Arc::new(LavalinkLink::new());
    let resolver = Arc::new(TrackResolver::new(
        Arc::new(LavalinkSource::new(link.clone(), config.search_prefix.clone())),
        SearchCache::new(config.cache_size, config.cache_ttl),
        config.search_limit,
        config.resolve_timeout,
    ));

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let bot = Arc::new(OpenMusicBot::new(config.clone(), storage.clone()));
    let songbird = Songbird::serenity();

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler_arc(bot.clone())
        .register_songbird_with(songbird.clone())
        .await?;

    // Lavalink identifica al bot por su id de usuario.
    let bot_id = client.http.get_current_user().await?.id;
    let (events_tx, events_rx) = event_channel();

    // El nodo arranca en segundo plano; las conexiones de voz esperan a que
    // el cliente Lavalink esté listo.
    let supervisor = Arc::new(NodeSupervisor::from_config(&config)?);
    let readiness = supervisor.readiness();
    tokio::spawn({
        let supervisor = supervisor.clone();
        let link = link.clone();
        let config = config.clone();
        async move {
            let status = supervisor
                .ensure_ready_then(move || async move { link.connect(&config, bot_id, events_tx).await })
                .await;
            if status == NodeStatus::Ready {
                info!("✅ Backend de audio listo");
                supervisor.watch_health(NODE_HEALTH_INTERVAL).await;
            }
        }
    });

    let transport = Arc::new(LavalinkTransport::new(songbird, link));
    let directory = Arc::new(SerenityDirectory::new(client.cache.clone(), client.http.clone()));

    let connections = ConnectionManager::new(
        transport.clone(),
        directory.clone(),
        readiness,
        config.node_ready_timeout,
        config.global_instance_limit,
        config.connect_cooldown,
    );

    let player = Arc::new(AudioPlayer::new(
        connections,
        transport,
        directory,
        resolver,
        storage,
        config.idle_timeout,
        config.alone_debounce,
    ));
    bot.attach_player(player.clone());
    tokio::spawn(player.clone().run(events_rx));

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("No se pudo escuchar Ctrl+C: {:?}", e);
            return;
        }
        warn!("⚠️ Apagado solicitado, saliendo de voz...");
        player.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Conectando a Discord");
    if let Err(why) = client.start().await {
        error!("Error del cliente: {:?}", why);
    }

    Ok(())
}

/// Chequeo de salud para el contenedor: el nodo Lavalink debe responder.
async fn health_check(config: &Config) -> Result<()> {
    let version = LavalinkProbe::new(config)?.probe().await?;
    println!("OK (Lavalink {})", version);
    Ok(())
}
