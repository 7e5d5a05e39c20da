use anyhow::Result;
use serenity::{
    builder::{
        CreateActionRow, CreateInteractionResponse, CreateInteractionResponseMessage, CreateSelectMenu,
        CreateSelectMenuKind, CreateSelectMenuOption, EditInteractionResponse,
    },
    model::{
        application::{CommandDataOptionValue, CommandInteraction, ComponentInteraction, ComponentInteractionDataKind},
        id::{GuildId, RoleId},
        Permissions,
    },
    prelude::Context,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    audio::{
        player::{AudioPlayer, CurrentTrack, EnqueueOutcome, PlayRequest, QueueSnapshot},
        queue::LoopMode,
        session::PlayerState,
    },
    bot::OpenMusicBot,
    error::{MusicError, MusicResult},
    sources::{format_duration, TrackInfo},
    storage::ServerConfig,
};

const QUEUE_PAGE_SIZE: usize = 10;
const SEARCH_PICK_ID: &str = "search_pick";

/// Con qué responde un comando: visible para todos o sólo para quien lo usó.
enum Reply {
    Public(String),
    Private(String),
}

/// Despacha los comandos de barra.
pub async fn handle_command(ctx: &Context, command: CommandInteraction, bot: &OpenMusicBot) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("comando usado fuera de un servidor"))?;

    info!(
        "📝 /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    let player = bot.player()?;

    // Estos dos tardan más de lo que permite el plazo de la interacción.
    match command.data.name.as_str() {
        "play" => return handle_play(ctx, &command, player, guild_id).await,
        "search" => return handle_search(ctx, &command, player, guild_id).await,
        _ => {}
    }

    let result = match command.data.name.as_str() {
        "skip" => handle_vote_skip(&command, player, guild_id).await,
        "forceskip" => handle_force_skip(&command, bot, player, guild_id).await,
        "stop" => handle_stop(&command, bot, player, guild_id).await,
        "pause" => player
            .pause(guild_id)
            .await
            .map(|_| Reply::Public("⏸️ Reproducción pausada".to_string())),
        "resume" => player
            .resume(guild_id)
            .await
            .map(|_| Reply::Public("▶️ Reproducción reanudada".to_string())),
        "loop" => handle_loop(&command, player, guild_id).await,
        "volume" => {
            let level = int_option(&command, "level").unwrap_or(100).clamp(0, 200) as u16;
            player
                .set_volume(guild_id, level)
                .await
                .map(|level| Reply::Public(format!("🔊 Volumen ajustado a {}%", level)))
        }
        "queue" => {
            let page = int_option(&command, "page").unwrap_or(1).max(1) as usize;
            player
                .snapshot(guild_id)
                .await
                .map(|snapshot| Reply::Public(render_queue(&snapshot, page)))
        }
        "nowplaying" => player
            .now_playing(guild_id)
            .await
            .map(|current| Reply::Public(render_now_playing(&current))),
        "shuffle" => player
            .shuffle(guild_id)
            .await
            .map(|count| Reply::Public(format!("🔀 {} canciones mezcladas", count))),
        "reverse" => player
            .reverse(guild_id)
            .await
            .map(|count| Reply::Public(format!("🔃 {} canciones en orden inverso", count))),
        "dedup" => player
            .dedup(guild_id)
            .await
            .map(|removed| Reply::Public(format!("🧹 {} duplicado(s) eliminado(s)", removed))),
        "skipto" => handle_skip_to(&command, bot, player, guild_id).await,
        "remove" => {
            let position = int_option(&command, "position").unwrap_or(0).max(0) as usize;
            player
                .remove(guild_id, position)
                .await
                .map(|track| Reply::Public(format!("🗑️ Eliminada {}", track.describe())))
        }
        "move" => {
            let from = int_option(&command, "from").unwrap_or(0).max(0) as usize;
            let to = int_option(&command, "to").unwrap_or(0).max(0) as usize;
            player
                .move_track(guild_id, from, to)
                .await
                .map(|_| Reply::Public(format!("↕️ Canción {} movida a la posición {}", from, to)))
        }
        "clear" => handle_clear(&command, bot, player, guild_id).await,
        "settings" => return handle_settings(ctx, &command, bot, guild_id).await,
        other => Ok(Reply::Private(format!("❌ Comando no reconocido `{}`", other))),
    };

    let reply = result.unwrap_or_else(|e| error_reply(guild_id, &e));
    respond(ctx, &command, reply).await
}

/// Atiende el selector de resultados de `/search`.
pub async fn handle_component(ctx: &Context, component: ComponentInteraction, bot: &OpenMusicBot) -> Result<()> {
    let guild_id = component
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("componente usado fuera de un servidor"))?;

    if component.data.custom_id != SEARCH_PICK_ID {
        warn!("Componente desconocido {} en guild {}", component.data.custom_id, guild_id);
        return Ok(());
    }

    let ComponentInteractionDataKind::StringSelect { values } = &component.data.kind else {
        return Ok(());
    };
    let Some(url) = values.first() else {
        return Ok(());
    };

    info!("✅ {} eligió {} en guild {}", component.user.name, url, guild_id);
    component.defer(&ctx.http).await?;

    let outcome = bot
        .player()?
        .enqueue(PlayRequest {
            guild_id,
            user_id: component.user.id,
            text_channel: component.channel_id,
            query: url.clone(),
        })
        .await;

    let content = match outcome {
        Ok(outcome) => describe_enqueue(&outcome),
        Err(e) => error_text(guild_id, &e),
    };
    component
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content).components(vec![]))
        .await?;
    Ok(())
}

/// `/play`: se difiere la respuesta porque resolver y conectar puede
/// superar los tres segundos de Discord.
async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    player: &Arc<AudioPlayer>,
    guild_id: GuildId,
) -> Result<()> {
    let query = string_option(command, "query").ok_or_else(|| anyhow::anyhow!("falta la búsqueda"))?;
    command.defer(&ctx.http).await?;

    let outcome = player
        .enqueue(PlayRequest {
            guild_id,
            user_id: command.user.id,
            text_channel: command.channel_id,
            query: query.to_string(),
        })
        .await;

    let content = match outcome {
        Ok(outcome) => describe_enqueue(&outcome),
        Err(e) => error_text(guild_id, &e),
    };
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await?;
    Ok(())
}

async fn handle_search(
    ctx: &Context,
    command: &CommandInteraction,
    player: &Arc<AudioPlayer>,
    guild_id: GuildId,
) -> Result<()> {
    let query = string_option(command, "query").ok_or_else(|| anyhow::anyhow!("falta la búsqueda"))?;
    command.defer_ephemeral(&ctx.http).await?;

    info!("🔍 {} buscó {}", command.user.name, query);

    let response = match player.resolver().search(guild_id, query).await {
        Ok(results) => {
            let mut response = EditInteractionResponse::new().content(render_results(query, &results));
            if let Some(menu) = pick_menu(&results) {
                response = response.components(vec![CreateActionRow::SelectMenu(menu)]);
            }
            response
        }
        Err(e) => EditInteractionResponse::new().content(format!("❌ {}", e)),
    };

    command.edit_response(&ctx.http, response).await?;
    Ok(())
}

async fn handle_vote_skip(
    command: &CommandInteraction,
    player: &Arc<AudioPlayer>,
    guild_id: GuildId,
) -> MusicResult<Reply> {
    let outcome = player.vote_skip(guild_id, command.user.id).await?;
    let text = if outcome.skipped {
        "⏭️ Votación aprobada, saltando".to_string()
    } else if !outcome.added {
        format!("Ya votaste ({}/{})", outcome.count, outcome.needed)
    } else {
        format!("🗳️ Votos para saltar: {}/{}", outcome.count, outcome.needed)
    };
    Ok(Reply::Public(text))
}

/// Quien pidió la pista puede saltarla; el resto necesita el rol de DJ.
async fn handle_force_skip(
    command: &CommandInteraction,
    bot: &OpenMusicBot,
    player: &Arc<AudioPlayer>,
    guild_id: GuildId,
) -> MusicResult<Reply> {
    let current = player.now_playing(guild_id).await?;
    if current.track.requested_by() != command.user.id && !is_dj(command, &bot.settings(guild_id).await) {
        return Ok(Reply::Private(dj_only()));
    }

    let outcome = player.skip(guild_id).await?;
    Ok(Reply::Public(match outcome.next {
        Some(next) => format!("⏭️ Saltada {}, ahora suena {}", outcome.skipped.describe(), next.describe()),
        None => format!("⏭️ Saltada {}, la cola está vacía", outcome.skipped.describe()),
    }))
}

async fn handle_stop(
    command: &CommandInteraction,
    bot: &OpenMusicBot,
    player: &Arc<AudioPlayer>,
    guild_id: GuildId,
) -> MusicResult<Reply> {
    if !is_dj(command, &bot.settings(guild_id).await) {
        return Ok(Reply::Private(dj_only()));
    }
    player.stop(guild_id).await?;
    Ok(Reply::Public("⏹️ Reproducción detenida, salí del canal".to_string()))
}

async fn handle_skip_to(
    command: &CommandInteraction,
    bot: &OpenMusicBot,
    player: &Arc<AudioPlayer>,
    guild_id: GuildId,
) -> MusicResult<Reply> {
    if !is_dj(command, &bot.settings(guild_id).await) {
        return Ok(Reply::Private(dj_only()));
    }
    let position = int_option(command, "position").unwrap_or(0).max(0) as usize;
    let outcome = player.skip_to(guild_id, position).await?;
    Ok(Reply::Public(match outcome.next {
        Some(next) => format!("⏩ Saltando a {}", next.describe()),
        None => "⏩ No queda nada por reproducir".to_string(),
    }))
}

async fn handle_clear(
    command: &CommandInteraction,
    bot: &OpenMusicBot,
    player: &Arc<AudioPlayer>,
    guild_id: GuildId,
) -> MusicResult<Reply> {
    if !is_dj(command, &bot.settings(guild_id).await) {
        return Ok(Reply::Private(dj_only()));
    }
    let cleared = player.clear(guild_id).await?;
    Ok(Reply::Public(format!("🧹 {} canción(es) quitada(s) de la cola", cleared)))
}

async fn handle_loop(command: &CommandInteraction, player: &Arc<AudioPlayer>, guild_id: GuildId) -> MusicResult<Reply> {
    let mode = match string_option(command, "mode") {
        Some("track") => LoopMode::Track,
        Some("queue") => LoopMode::Queue,
        _ => LoopMode::Off,
    };
    player.set_repeat(guild_id, mode).await?;
    Ok(Reply::Public(format!("🔁 Repetición: {}", mode)))
}

/// `/settings`: aplica las opciones recibidas y muestra la configuración
/// resultante.
async fn handle_settings(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &OpenMusicBot,
    guild_id: GuildId,
) -> Result<()> {
    let id = guild_id.get();
    let mut storage = bot.storage.lock().await;

    if let Some(percent) = int_option(command, "vote_percent") {
        storage.set_vote_skip_percent(id, percent.clamp(1, 100) as u8).await?;
    }
    if let Some(role) = option(command, "dj_role").and_then(|value| value.as_role_id()) {
        storage.set_dj_role(id, Some(role.get())).await?;
    }
    if let Some(channel) = option(command, "announce_channel").and_then(|value| value.as_channel_id()) {
        storage.set_announcement_channel(id, Some(channel.get())).await?;
    }
    if let Some(volume) = int_option(command, "default_volume") {
        storage.set_default_volume(id, volume.clamp(0, 200) as u16).await?;
    }

    let mut config = storage.get_server_config(id).await?;
    let before = config.clone();
    if let Some(max) = int_option(command, "max_queue") {
        config.max_queue_size = max.max(1) as usize;
    }
    if let Some(limit) = int_option(command, "playlist_limit") {
        config.playlist_add_limit = limit.max(1) as usize;
    }
    if let Some(minutes) = int_option(command, "max_duration") {
        config.max_track_duration = minutes.max(0) as u64 * 60;
    }
    if config != before {
        storage.update_server_config(config.clone()).await?;
    }
    drop(storage);

    respond(ctx, command, Reply::Private(render_settings(&config))).await
}

async fn respond(ctx: &Context, command: &CommandInteraction, reply: Reply) -> Result<()> {
    let (content, ephemeral) = match reply {
        Reply::Public(content) => (content, false),
        Reply::Private(content) => (content, true),
    };
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

fn error_reply(guild_id: GuildId, error: &MusicError) -> Reply {
    Reply::Private(error_text(guild_id, error))
}

fn error_text(guild_id: GuildId, error: &MusicError) -> String {
    if !error.is_user_error() {
        warn!("Comando falló en guild {}: {}", guild_id, error);
    }
    format!("❌ {}", error)
}

fn describe_enqueue(outcome: &EnqueueOutcome) -> String {
    let extra = match outcome.added {
        0 | 1 => String::new(),
        n => format!(" y {} más", n - 1),
    };
    match outcome.position {
        None => format!("🎵 Reproduciendo {}{}", outcome.first.describe(), extra),
        Some(position) => format!("➕ Agregada {}{} en la posición {}", outcome.first.describe(), extra, position),
    }
}

/// Sin rol de DJ configurado todos pueden; si no, hace falta el rol o
/// permiso de gestionar el servidor.
fn is_dj(command: &CommandInteraction, settings: &ServerConfig) -> bool {
    let Some(role) = settings.dj_role_id else {
        return true;
    };
    let Some(member) = command.member.as_ref() else {
        return false;
    };

    member.roles.contains(&RoleId::new(role))
        || member
            .permissions
            .is_some_and(|perms| perms.contains(Permissions::MANAGE_GUILD))
}

fn dj_only() -> String {
    "🚫 Sólo el rol de DJ puede hacer eso".to_string()
}

fn option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a CommandDataOptionValue> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .map(|opt| &opt.value)
}

fn string_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    option(command, name).and_then(|value| value.as_str())
}

fn int_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    option(command, name).and_then(|value| value.as_i64())
}

/// `/nowplaying`: posición, quién la pidió y cuándo empezó (marca de tiempo
/// relativa de Discord).
fn render_now_playing(current: &CurrentTrack) -> String {
    let track = &current.track;
    let position = if track.is_stream() {
        "en vivo".to_string()
    } else {
        format!("{} / {}", format_duration(current.elapsed), format_duration(track.duration()))
    };
    let mut out = format!(
        "🎵 **{}** [{}]\nPedida por <@{}> · empezó <t:{}:R>",
        track.title(),
        position,
        track.requested_by(),
        current.started_at.timestamp()
    );
    if let Some(url) = track.display_url() {
        out.push_str(&format!("\n<{}>", url));
    }
    out
}

/// Página `page` (desde 1) de la cola; una página fuera de rango muestra la
/// última.
fn render_queue(snapshot: &QueueSnapshot, page: usize) -> String {
    let mut out = String::new();

    match &snapshot.now_playing {
        Some(current) => {
            let paused = if snapshot.state == PlayerState::Paused { " (en pausa)" } else { "" };
            out.push_str(&format!(
                "🎵 Ahora: {} [{}]{}\n",
                current.track.describe(),
                format_duration(current.elapsed),
                paused
            ));
        }
        None => out.push_str("Nada reproduciéndose\n"),
    }

    if snapshot.upcoming.is_empty() {
        out.push_str("La cola está vacía");
        return out;
    }

    let pages = snapshot.upcoming.len().div_ceil(QUEUE_PAGE_SIZE);
    let page = page.min(pages);
    let start = (page - 1) * QUEUE_PAGE_SIZE;

    for (i, track) in snapshot.upcoming.iter().enumerate().skip(start).take(QUEUE_PAGE_SIZE) {
        out.push_str(&format!("`{}.` {} · <@{}>\n", i + 1, track.describe(), track.requested_by()));
    }

    out.push_str(&format!(
        "\nPágina {}/{} · {} canciones · {} en total · repetición {} · volumen {}%",
        page,
        pages,
        snapshot.upcoming.len(),
        format_duration(snapshot.total_duration),
        snapshot.loop_mode,
        snapshot.volume_percent
    ));
    out
}

fn render_results(query: &str, results: &[TrackInfo]) -> String {
    let mut out = format!("🔍 Resultados para **{}**\n", query);
    for (i, info) in results.iter().enumerate() {
        let duration = if info.is_stream {
            "en vivo".to_string()
        } else {
            format_duration(info.duration)
        };
        let author = info.author.as_deref().map(|a| format!(" · {}", a)).unwrap_or_default();
        out.push_str(&format!("`{}.` {}{} `[{}]`\n", i + 1, info.title, author, duration));
    }
    out
}

/// Menú cuyos valores son las URLs a encolar. Discord limita etiquetas y
/// valores a 100 caracteres; resultados sin URL no se ofrecen.
fn pick_menu(results: &[TrackInfo]) -> Option<CreateSelectMenu> {
    let options: Vec<_> = results
        .iter()
        .filter_map(|info| {
            let url = info.url.as_deref()?;
            if url.chars().count() > 100 {
                return None;
            }
            let label: String = info.title.chars().take(100).collect();
            Some(CreateSelectMenuOption::new(label, url))
        })
        .collect();

    if options.is_empty() {
        return None;
    }

    Some(
        CreateSelectMenu::new(SEARCH_PICK_ID, CreateSelectMenuKind::String { options })
            .placeholder("Elige una canción para reproducir")
            .min_values(1)
            .max_values(1),
    )
}

fn render_settings(config: &ServerConfig) -> String {
    let dj = config
        .dj_role_id
        .map_or("cualquiera".to_string(), |id| format!("<@&{}>", id));
    let announce = config
        .announcement_channel_id
        .map_or("primer canal con permiso de escritura".to_string(), |id| format!("<#{}>", id));
    let max_duration = config
        .max_duration()
        .map_or("sin límite".to_string(), |d| humantime::format_duration(d).to_string());

    format!(
        "⚙️ **Configuración de música**\n\
        Votos para saltar: {}% de los oyentes\n\
        DJ: {}\n\
        Anuncios: {}\n\
        Volumen por defecto: {}%\n\
        Límite de cola: {} · límite de playlist: {}\n\
        Canción más larga: {}",
        config.vote_skip_percent,
        dj,
        announce,
        config.default_volume,
        config.max_queue_size,
        config.playlist_add_limit,
        max_duration
    )
}
