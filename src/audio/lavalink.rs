//! Reproducción sobre Lavalink: songbird negocia el gateway de voz de
//! Discord y el nodo Lavalink transmite el audio.
//!
//! El cliente de lavalink-rs sólo existe una vez que el nodo respondió, así
//! que se comparte a través de [`LavalinkLink`]: el supervisor del nodo lo
//! conecta antes de publicar `Ready` y tanto [`LavalinkTransport`] como
//! [`crate::sources::lavalink::LavalinkSource`] lo consultan en cada operación.
//!
//! Cada reproducción viaja con su `PlayToken` en el `userData` de la pista;
//! Lavalink lo devuelve en los eventos de fin y excepción, que se reenvían
//! al reproductor como [`TransportEvent`].

use async_trait::async_trait;
use dashmap::DashMap;
use lavalink_rs::{
    client::LavalinkClient,
    hook,
    model::{
        events::{Events, TrackEnd, TrackEndReason, TrackException, TrackStuck},
        http::{UpdatePlayer, UpdatePlayerTrack},
        player::ConnectionInfo,
        track::TrackData,
    },
    node::NodeBuilder,
    player_context::PlayerContext,
    prelude::NodeDistributionStrategy,
};
use serenity::model::id::{ChannelId, GuildId, UserId};
use songbird::Songbird;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

use super::transport::{EventSender, PlayToken, TransportEvent, VoiceTransport};
use crate::config::Config;
use crate::error::{MusicError, MusicResult};
use crate::sources::Track;

/// Clave del `userData` donde viaja el token de reproducción.
const TOKEN_KEY: &str = "token";

/// Ranura compartida para el cliente de Lavalink.
#[derive(Default)]
pub struct LavalinkLink {
    client: OnceLock<LavalinkClient>,
}

impl LavalinkLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cliente conectado, o un rechazo si el nodo todavía no está listo.
    pub fn client(&self) -> MusicResult<&LavalinkClient> {
        self.client
            .get()
            .ok_or_else(|| MusicError::ConnectionRefused("el backend de audio no está disponible".to_string()))
    }

    pub fn is_connected(&self) -> bool {
        self.client.get().is_some()
    }

    /// Crea el cliente contra el nodo configurado y registra los hooks de
    /// eventos. Sólo la primera llamada tiene efecto.
    pub async fn connect(&self, config: &Config, bot_id: UserId, events: EventSender) -> anyhow::Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let hooks = Events {
            track_end: Some(track_end),
            track_exception: Some(track_exception),
            track_stuck: Some(track_stuck),
            ..Default::default()
        };

        let node = NodeBuilder {
            hostname: format!("{}:{}", config.lavalink_host, config.lavalink_port),
            is_ssl: config.lavalink_secure,
            events: Events::default(),
            password: config.lavalink_password.clone(),
            user_id: lavalink_rs::model::UserId(bot_id.get()),
            session_id: None,
        };

        info!("🔗 Conectando cliente Lavalink a {}:{}", config.lavalink_host, config.lavalink_port);
        let client = LavalinkClient::new_with_data(
            hooks,
            vec![node],
            NodeDistributionStrategy::round_robin(),
            Arc::new(events),
        )
        .await;

        if self.client.set(client).is_err() {
            debug!("Cliente Lavalink ya estaba conectado");
        }
        Ok(())
    }
}

pub(crate) fn node_guild(guild_id: GuildId) -> lavalink_rs::model::GuildId {
    lavalink_rs::model::GuildId(guild_id.get())
}

/// Token guardado en el `userData` de una pista, si lo tiene.
fn play_token(track: &TrackData) -> Option<PlayToken> {
    track.user_data.as_ref()?.get(TOKEN_KEY)?.as_u64()
}

/// Evento para el reproductor a partir de un fin de pista. Las cargas
/// fallidas ya llegaron como excepción y se descartan.
fn end_event(guild_id: u64, track: &TrackData, reason: &TrackEndReason) -> Option<TransportEvent> {
    if matches!(reason, TrackEndReason::LoadFailed) {
        return None;
    }
    Some(TransportEvent::TrackEnded {
        guild_id: GuildId::new(guild_id),
        token: play_token(track)?,
    })
}

fn failure_event(guild_id: u64, track: &TrackData, reason: String) -> Option<TransportEvent> {
    Some(TransportEvent::TrackFailed {
        guild_id: GuildId::new(guild_id),
        token: play_token(track)?,
        reason,
    })
}

fn forward(client: &LavalinkClient, event: Option<TransportEvent>) {
    let Some(event) = event else {
        debug!("Evento de pista sin token; ignorado");
        return;
    };
    match client.data::<EventSender>() {
        Ok(events) => {
            if events.send(event).is_err() {
                error!("El bucle de eventos del reproductor terminó; evento descartado");
            }
        }
        Err(e) => error!("Cliente Lavalink sin canal de eventos: {:?}", e),
    }
}

#[hook]
async fn track_end(client: LavalinkClient, _session_id: String, event: &TrackEnd) {
    debug!("Pista terminada en guild {} ({:?})", event.guild_id.0, event.reason);
    forward(&client, end_event(event.guild_id.0, &event.track, &event.reason));
}

#[hook]
async fn track_exception(client: LavalinkClient, _session_id: String, event: &TrackException) {
    // El mensaje es opcional según la versión del nodo.
    let reason = serde_json::to_value(&event.exception)
        .ok()
        .and_then(|value| value.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| "error desconocido".to_string());
    warn!("❌ Error de pista en guild {}: {}", event.guild_id.0, reason);
    forward(&client, failure_event(event.guild_id.0, &event.track, reason));
}

#[hook]
async fn track_stuck(client: LavalinkClient, _session_id: String, event: &TrackStuck) {
    warn!("⚠️ Pista atascada en guild {} ({} ms)", event.guild_id.0, event.threshold_ms);
    let reason = format!("la pista quedó atascada {} ms", event.threshold_ms);
    forward(&client, failure_event(event.guild_id.0, &event.track, reason));
}

/// Volumen del reproductor (1.0 = 100%) en la escala de Lavalink.
fn node_volume(volume: f32) -> u16 {
    (volume.clamp(0.0, 10.0) * 100.0).round() as u16
}

/// [`VoiceTransport`] sobre jugadores de Lavalink.
pub struct LavalinkTransport {
    manager: Arc<Songbird>,
    link: Arc<LavalinkLink>,
    joined: DashMap<GuildId, ChannelId>,
}

impl LavalinkTransport {
    pub fn new(manager: Arc<Songbird>, link: Arc<LavalinkLink>) -> Self {
        Self {
            manager,
            link,
            joined: DashMap::new(),
        }
    }

    fn player(&self, guild_id: GuildId) -> MusicResult<PlayerContext> {
        self.link
            .client()?
            .get_player_context(node_guild(guild_id))
            .ok_or(MusicError::NoSession)
    }
}

fn node_error(e: impl std::fmt::Debug) -> MusicError {
    MusicError::Backend(format!("{:?}", e))
}

#[async_trait]
impl VoiceTransport for LavalinkTransport {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> MusicResult<()> {
        let client = self.link.client()?;
        info!("🔗 Entrando al canal {} en guild {}", channel_id, guild_id);

        let (connection, _call) = self
            .manager
            .join_gateway(guild_id, channel_id)
            .await
            .map_err(|e| MusicError::Backend(format!("no se pudo entrar al canal de voz: {:?}", e)))?;

        let info = ConnectionInfo {
            endpoint: connection.endpoint,
            token: connection.token,
            session_id: connection.session_id,
        };

        if let Err(e) = client.create_player_context(node_guild(guild_id), info).await {
            error!("❌ Lavalink rechazó el jugador de guild {}: {:?}", guild_id, e);
            if let Err(e) = self.manager.remove(guild_id).await {
                debug!("No se pudo salir de voz en guild {}: {:?}", guild_id, e);
            }
            return Err(node_error(e));
        }

        self.joined.insert(guild_id, channel_id);
        Ok(())
    }

    async fn play(&self, guild_id: GuildId, track: &Track, token: PlayToken, volume: f32) -> MusicResult<()> {
        let player = self.player(guild_id)?;

        let update = UpdatePlayer {
            track: Some(UpdatePlayerTrack {
                encoded: Some(track.locator().to_string()),
                user_data: Some(serde_json::json!({ TOKEN_KEY: token })),
                ..Default::default()
            }),
            volume: Some(node_volume(volume)),
            paused: Some(false),
            ..Default::default()
        };

        player
            .update_player(&update, false)
            .await
            .map_err(|e| MusicError::TrackPlayback(format!("{:?}", e)))?;
        debug!("▶️ {} enviado al nodo (token {})", track.title(), token);
        Ok(())
    }

    async fn pause(&self, guild_id: GuildId) -> MusicResult<()> {
        self.player(guild_id)?.set_pause(true).await.map_err(node_error)?;
        Ok(())
    }

    async fn resume(&self, guild_id: GuildId) -> MusicResult<()> {
        self.player(guild_id)?.set_pause(false).await.map_err(node_error)?;
        Ok(())
    }

    async fn stop(&self, guild_id: GuildId) -> MusicResult<()> {
        match self.player(guild_id) {
            Ok(player) => {
                player.stop_now().await.map_err(node_error)?;
                Ok(())
            }
            // Sin jugador no hay nada sonando.
            Err(MusicError::NoSession) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_volume(&self, guild_id: GuildId, volume: f32) -> MusicResult<()> {
        let player = self.player(guild_id)?;
        if let Err(e) = player.set_volume(node_volume(volume)).await {
            warn!("No se pudo ajustar el volumen en guild {}: {:?}", guild_id, e);
            return Err(node_error(e));
        }
        Ok(())
    }

    async fn disconnect(&self, guild_id: GuildId) -> MusicResult<()> {
        self.joined.remove(&guild_id);

        if let Ok(client) = self.link.client() {
            if client.get_player_context(node_guild(guild_id)).is_some() {
                if let Err(e) = client.delete_player(node_guild(guild_id)).await {
                    warn!("No se pudo eliminar el jugador de guild {}: {:?}", guild_id, e);
                }
            }
        }

        if self.manager.get(guild_id).is_some() {
            self.manager
                .remove(guild_id)
                .await
                .map_err(|e| MusicError::Backend(format!("no se pudo salir de voz: {:?}", e)))?;
        }
        info!("👋 Salí de voz en guild {}", guild_id);
        Ok(())
    }

    async fn is_connected(&self, guild_id: GuildId) -> bool {
        match self.manager.get(guild_id) {
            Some(call) => call.lock().await.current_channel().is_some(),
            None => false,
        }
    }

    async fn active_connections(&self) -> usize {
        let guilds: Vec<GuildId> = self.joined.iter().map(|entry| *entry.key()).collect();
        let mut active = 0;
        for guild_id in guilds {
            if self.is_connected(guild_id).await {
                active += 1;
            } else {
                self.joined.remove(&guild_id);
            }
        }
        active
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Pista tal como la entrega Lavalink v4.
    pub(crate) fn track_json(title: &str, length: u64, stream: bool, user_data: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "encoded": format!("QAAAjQIAJV{}", title.replace(' ', "")),
            "info": {
                "identifier": "dQw4w9WgXcQ",
                "isSeekable": !stream,
                "author": "RickAstleyVEVO",
                "length": length,
                "isStream": stream,
                "position": 0,
                "title": title,
                "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                "artworkUrl": null,
                "isrc": null,
                "sourceName": "youtube"
            },
            "pluginInfo": {},
            "userData": user_data
        })
    }

    fn track_data(user_data: serde_json::Value) -> TrackData {
        serde_json::from_value(track_json("song", 1000, false, user_data)).unwrap()
    }

    #[test]
    fn token_is_read_back_from_user_data() {
        assert_eq!(play_token(&track_data(serde_json::json!({ "token": 42 }))), Some(42));
        assert_eq!(play_token(&track_data(serde_json::json!({}))), None);
    }

    #[test]
    fn finished_tracks_become_end_events() {
        let track = track_data(serde_json::json!({ "token": 7 }));
        assert_eq!(
            end_event(3, &track, &TrackEndReason::Finished),
            Some(TransportEvent::TrackEnded {
                guild_id: GuildId::new(3),
                token: 7
            })
        );
        // Reemplazos y paradas traen el token viejo; el reproductor los descarta.
        assert!(end_event(3, &track, &TrackEndReason::Replaced).is_some());
    }

    #[test]
    fn load_failures_are_left_to_the_exception_event() {
        let track = track_data(serde_json::json!({ "token": 7 }));
        assert_eq!(end_event(3, &track, &TrackEndReason::LoadFailed), None);
        assert_eq!(
            failure_event(3, &track, "unavailable".to_string()),
            Some(TransportEvent::TrackFailed {
                guild_id: GuildId::new(3),
                token: 7,
                reason: "unavailable".to_string()
            })
        );
    }

    #[test]
    fn tracks_we_did_not_start_are_ignored() {
        let track = track_data(serde_json::Value::Null);
        assert_eq!(end_event(3, &track, &TrackEndReason::Finished), None);
    }

    #[test]
    fn volume_maps_to_node_scale() {
        assert_eq!(node_volume(1.0), 100);
        assert_eq!(node_volume(0.35), 35);
        assert_eq!(node_volume(2.0), 200);
        assert_eq!(node_volume(-1.0), 0);
    }

    #[test]
    fn unconnected_link_refuses() {
        let link = LavalinkLink::new();
        assert!(!link.is_connected());
        assert!(matches!(link.client(), Err(MusicError::ConnectionRefused(_))));
    }
}
