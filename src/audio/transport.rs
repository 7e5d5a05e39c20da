//! Frontera entre el reproductor y lo que realmente transporta el audio.
//!
//! El reproductor nunca habla directamente con Lavalink, songbird ni la caché
//! de serenity; pasa por [`VoiceTransport`] y [`GuildDirectory`], y se entera
//! de las pistas terminadas por un canal de [`TransportEvent`].

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId, UserId};
use tokio::sync::mpsc;

use crate::error::MusicResult;
use crate::sources::Track;

/// Identifica un intento de reproducción; los eventos con un token anterior
/// están obsoletos.
pub type PlayToken = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    TrackEnded { guild_id: GuildId, token: PlayToken },
    TrackFailed { guild_id: GuildId, token: PlayToken, reason: String },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> MusicResult<()>;

    /// Inicia `track`, reemplazando lo que suene. El fin de la pista se
    /// reporta como un [`TransportEvent`] con `token`.
    async fn play(&self, guild_id: GuildId, track: &Track, token: PlayToken, volume: f32) -> MusicResult<()>;

    async fn pause(&self, guild_id: GuildId) -> MusicResult<()>;

    async fn resume(&self, guild_id: GuildId) -> MusicResult<()>;

    /// Detiene la pista actual. Las implementaciones pueden emitir un
    /// `TrackEnded` por ella; el reproductor lo trata como obsoleto.
    async fn stop(&self, guild_id: GuildId) -> MusicResult<()>;

    async fn set_volume(&self, guild_id: GuildId, volume: f32) -> MusicResult<()>;

    async fn disconnect(&self, guild_id: GuildId) -> MusicResult<()>;

    async fn is_connected(&self, guild_id: GuildId) -> bool;

    /// Guilds con conexión de voz viva, contados desde el transporte.
    async fn active_connections(&self) -> usize;
}

/// Lectura de miembros de un guild y una forma de publicar mensajes.
#[async_trait]
pub trait GuildDirectory: Send + Sync {
    fn voice_channel_of(&self, guild_id: GuildId, user_id: UserId) -> Option<ChannelId>;

    /// Miembros que no son bots presentes en `channel_id`.
    fn listener_count(&self, guild_id: GuildId, channel_id: ChannelId) -> usize;

    /// Publica `text` en `preferred`, o en el primer canal de texto donde el
    /// bot pueda escribir.
    async fn announce(&self, guild_id: GuildId, preferred: Option<ChannelId>, text: &str) -> anyhow::Result<()>;
}
