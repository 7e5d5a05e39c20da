//! # Módulo del Bot
//!
//! Lado de Open Music que da a Discord: registro de comandos de barra, el
//! despachador de interacciones y los eventos del gateway que necesita el
//! motor de reproducción.
//!
//! [`OpenMusicBot`] implementa el [`EventHandler`] de serenity. El
//! [`AudioPlayer`] se adjunta después de construir el cliente porque su
//! transporte de voz y su directorio de guilds necesitan la caché y el HTTP
//! del cliente.
//!
//! Los cambios de estado de voz se enrutan así:
//!
//! - el bot salió de voz: [`AudioPlayer::on_bot_disconnected`]
//! - el bot fue movido: [`AudioPlayer::on_bot_moved`]
//! - cualquier otro entró, salió o se movió: [`AudioPlayer::on_voice_state_update`]

use anyhow::Result;
use serenity::{
    all::{Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{
    audio::player::AudioPlayer,
    config::Config,
    storage::{GuildSettings, JsonStorage, ServerConfig},
};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

pub struct OpenMusicBot {
    config: Arc<Config>,
    /// Configuración por guild; el reproductor también la lee vía [`GuildSettings`].
    pub storage: Arc<tokio::sync::Mutex<JsonStorage>>,
    player: OnceLock<Arc<AudioPlayer>>,
    maintenance_started: AtomicBool,
}

impl OpenMusicBot {
    pub fn new(config: Arc<Config>, storage: Arc<tokio::sync::Mutex<JsonStorage>>) -> Self {
        Self {
            config,
            storage,
            player: OnceLock::new(),
            maintenance_started: AtomicBool::new(false),
        }
    }

    /// Entrega el reproductor al bot. Sólo la primera llamada tiene efecto.
    pub fn attach_player(&self, player: Arc<AudioPlayer>) {
        if self.player.set(player).is_err() {
            warn!("El reproductor ya estaba adjuntado");
        }
    }

    /// El reproductor, o un error si todavía no se adjuntó.
    pub fn player(&self) -> Result<&Arc<AudioPlayer>> {
        self.player
            .get()
            .ok_or_else(|| anyhow::anyhow!("el reproductor todavía no está listo"))
    }

    /// Configuración vigente del guild.
    pub async fn settings(&self, guild_id: GuildId) -> ServerConfig {
        self.storage.server_config(guild_id).await
    }

    /// Registra los comandos de barra: en el guild de desarrollo si está
    /// configurado (al instante) y globalmente si no (hasta una hora).
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos de barra...");

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no es miembro del guild de desarrollo {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id).await.map_err(|e| {
                    error!("❌ Error registrando comandos del guild: {:?}", e);
                    anyhow::anyhow!("no se pudieron registrar los comandos del guild; revisa el scope applications.commands")
                })?;
                info!("✅ Comandos registrados para el guild {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("no se pudieron registrar los comandos globales; revisa el scope applications.commands")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for OpenMusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea en {} servidor(es)", ready.user.name, ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Falló el registro de comandos: {:?}", e);
        }

        // `ready` se repite tras cada reconexión al gateway.
        if self.maintenance_started.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.player() {
            Ok(player) => {
                tokio::spawn(maintenance_tasks(player.clone()));
            }
            Err(e) => warn!("Mantenimiento no iniciado: {}", e),
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        match interaction {
            Interaction::Command(command) => {
                if let Err(e) = handlers::handle_command(&ctx, command, self).await {
                    error!("Error en comando: {:?}", e);
                }
            }
            Interaction::Component(component) => {
                if let Err(e) = handlers::handle_component(&ctx, component, self).await {
                    error!("Error en interacción de componente: {:?}", e);
                }
            }
            _ => {}
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id.or_else(|| old.as_ref().and_then(|vs| vs.guild_id)) else {
            return;
        };
        let Ok(player) = self.player() else {
            return;
        };

        if new.user_id == ctx.cache.current_user().id {
            match new.channel_id {
                None => {
                    info!("🔌 Desconectado de voz en guild {}", guild_id);
                    player.on_bot_disconnected(guild_id).await;
                }
                Some(channel_id) => {
                    let previous = old.and_then(|vs| vs.channel_id);
                    if previous.is_some() && previous != Some(channel_id) {
                        info!("🔀 Movido a {} en guild {}", channel_id, guild_id);
                    }
                    player.on_bot_moved(guild_id, channel_id).await;
                    // El canal nuevo puede estar vacío.
                    player.on_voice_state_update(guild_id).await;
                }
            }
            return;
        }

        if old.as_ref().and_then(|vs| vs.channel_id) != new.channel_id {
            debug!("Cambió la gente en voz en guild {}", guild_id);
            player.on_voice_state_update(guild_id).await;
        }
    }
}

/// Limpieza cada hora: se descartan de la caché las búsquedas vencidas.
async fn maintenance_tasks(player: Arc<AudioPlayer>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    interval.tick().await;

    loop {
        interval.tick().await;
        player.resolver().cache().cleanup_old_entries();
        info!(
            "🧹 Mantenimiento completado ({} sesión(es) activa(s))",
            player.active_sessions()
        );
    }
}
