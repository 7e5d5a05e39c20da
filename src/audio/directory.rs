//! Miembros de guild y anuncios: las consultas salen de la caché de
//! serenity y los mensajes van por su cliente HTTP.

use async_trait::async_trait;
use serenity::{
    cache::Cache,
    http::Http,
    model::{
        channel::ChannelType,
        id::{ChannelId, GuildId, UserId},
        Permissions,
    },
};
use std::sync::Arc;
use tracing::warn;

use super::transport::GuildDirectory;

/// [`GuildDirectory`] sobre la caché de serenity.
pub struct SerenityDirectory {
    cache: Arc<Cache>,
    http: Arc<Http>,
}

impl SerenityDirectory {
    pub fn new(cache: Arc<Cache>, http: Arc<Http>) -> Self {
        Self { cache, http }
    }

    fn first_sendable_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        let bot_id = self.cache.current_user().id;
        let guild = self.cache.guild(guild_id)?;
        let member = guild.members.get(&bot_id)?;

        let mut text_channels: Vec<_> = guild
            .channels
            .values()
            .filter(|channel| channel.kind == ChannelType::Text)
            .filter(|channel| {
                guild
                    .user_permissions_in(channel, member)
                    .contains(Permissions::SEND_MESSAGES | Permissions::VIEW_CHANNEL)
            })
            .collect();
        text_channels.sort_by_key(|channel| (channel.position, channel.id));
        text_channels.first().map(|channel| channel.id)
    }
}

#[async_trait]
impl GuildDirectory for SerenityDirectory {
    fn voice_channel_of(&self, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
        self.cache
            .guild(guild_id)
            .and_then(|guild| guild.voice_states.get(&user_id).and_then(|vs| vs.channel_id))
    }

    fn listener_count(&self, guild_id: GuildId, channel_id: ChannelId) -> usize {
        let bot_id = self.cache.current_user().id;
        let Some(guild) = self.cache.guild(guild_id) else {
            return 0;
        };

        guild
            .voice_states
            .values()
            .filter(|vs| vs.channel_id == Some(channel_id) && vs.user_id != bot_id)
            .filter(|vs| {
                let is_bot = vs
                    .member
                    .as_ref()
                    .map(|member| member.user.bot)
                    .or_else(|| guild.members.get(&vs.user_id).map(|member| member.user.bot))
                    .unwrap_or(false);
                !is_bot
            })
            .count()
    }

    async fn announce(&self, guild_id: GuildId, preferred: Option<ChannelId>, text: &str) -> anyhow::Result<()> {
        if let Some(channel_id) = preferred {
            match channel_id.say(&self.http, text).await {
                Ok(_) => return Ok(()),
                Err(e) => warn!("No se pudo publicar en {} de guild {}: {}", channel_id, guild_id, e),
            }
        }

        let channel_id = self
            .first_sendable_channel(guild_id)
            .ok_or_else(|| anyhow::anyhow!("no hay canal de texto donde pueda escribir"))?;
        channel_id.say(&self.http, text).await?;
        Ok(())
    }
}
