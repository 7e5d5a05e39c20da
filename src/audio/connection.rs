use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{info, warn};

use super::{
    node::NodeReadiness,
    session::GuildSession,
    transport::{GuildDirectory, VoiceTransport},
};
use crate::error::{MusicError, MusicResult};

/// Control de admisión delante del transporte de voz.
pub struct ConnectionManager {
    transport: Arc<dyn VoiceTransport>,
    directory: Arc<dyn GuildDirectory>,
    readiness: NodeReadiness,
    ready_timeout: Duration,
    global_limit: usize,
    cooldown: Duration,
    // Vive aquí y no en la sesión: la sesión de un guild rechazado se
    // descarta y el enfriamiento debe sobrevivirla.
    cooldowns: DashMap<GuildId, Instant>,
    // Se mantiene entre la comprobación de capacidad y la conexión para que
    // dos guilds no superen el límite a la vez.
    admission: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn VoiceTransport>,
        directory: Arc<dyn GuildDirectory>,
        readiness: NodeReadiness,
        ready_timeout: Duration,
        global_limit: usize,
        cooldown: Duration,
    ) -> Self {
        Self {
            transport,
            directory,
            readiness,
            ready_timeout,
            global_limit,
            cooldown,
            cooldowns: DashMap::new(),
            admission: Mutex::new(()),
        }
    }

    /// Asegura que el bot esté en voz en el guild de `session`, entrando al
    /// canal de quien lo pidió si hace falta. Devuelve el canal del bot.
    pub async fn ensure_connected(&self, session: &mut GuildSession, requester: UserId) -> MusicResult<ChannelId> {
        let guild_id = session.guild_id;
        self.readiness.wait(self.ready_timeout).await?;

        if let Some(wait) = self.cooldown_remaining(guild_id) {
            return Err(MusicError::ConnectionRefused(format!(
                "entrar a voz falló hace poco, inténtalo de nuevo en {}s",
                wait.as_secs().max(1)
            )));
        }

        let _admission = self.admission.lock().await;

        let connected = self.transport.is_connected(guild_id).await;
        if !connected {
            let active = self.transport.active_connections().await;
            if active >= self.global_limit {
                warn!(
                    "Rechazando conexión de voz para guild {}: {}/{} sesiones en uso",
                    guild_id, active, self.global_limit
                );
                return Err(MusicError::ConnectionRefused(format!(
                    "las {} sesiones de voz están en uso, inténtalo más tarde",
                    self.global_limit
                )));
            }
        }

        let target = self
            .directory
            .voice_channel_of(guild_id, requester)
            .ok_or_else(|| MusicError::ConnectionRefused("primero entra a un canal de voz".to_string()))?;

        if connected {
            if let Some(current) = session.channel_id {
                return Ok(current);
            }
        }

        match self.transport.connect(guild_id, target).await {
            Ok(()) => {
                info!("Conectado al canal de voz {} en guild {}", target, guild_id);
                session.channel_id = Some(target);
                self.cooldowns.remove(&guild_id);
                session.intentional_disconnect = false;
                Ok(target)
            }
            Err(e) => {
                warn!("Falló la conexión de voz en guild {}: {}", guild_id, e);
                self.cooldowns.insert(guild_id, Instant::now() + self.cooldown);
                Err(MusicError::ConnectionRefused(format!("no pude entrar a <#{}>", target)))
            }
        }
    }

    pub async fn active_connections(&self) -> usize {
        self.transport.active_connections().await
    }

    /// Tiempo que le queda a `guild_id` antes de poder reintentar, si alguno.
    pub fn cooldown_remaining(&self, guild_id: GuildId) -> Option<Duration> {
        let now = Instant::now();
        let until = *self.cooldowns.get(&guild_id)?;
        if now < until {
            return Some(until - now);
        }
        self.cooldowns.remove_if(&guild_id, |_, until| *until <= now);
        None
    }
}
