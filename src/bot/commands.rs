use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId, Permissions},
    prelude::Context,
};

/// Registra los comandos globalmente (pueden tardar hasta una hora).
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }
    Ok(())
}

/// Registra los comandos en un guild (desarrollo; se actualizan al instante).
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;
    Ok(())
}

/// Todos los comandos de barra del bot.
pub fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        search_command(),
        skip_command(),
        forceskip_command(),
        stop_command(),
        pause_command(),
        resume_command(),
        loop_command(),
        volume_command(),
        queue_command(),
        nowplaying_command(),
        shuffle_command(),
        reverse_command(),
        dedup_command(),
        skipto_command(),
        remove_command(),
        move_command(),
        clear_command(),
        settings_command(),
    ]
}

// Reproducción

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Reproduce una canción o playlist")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "query", "URL o términos de búsqueda").required(true),
        )
}

fn search_command() -> CreateCommand {
    CreateCommand::new("search")
        .description("Busca canciones y elige una de los resultados")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "query", "Términos de búsqueda").required(true),
        )
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Vota para saltar la canción actual")
}

fn forceskip_command() -> CreateCommand {
    CreateCommand::new("forceskip").description("Salta la canción actual sin votación (DJ)")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Detiene la reproducción, limpia la cola y sale (DJ)")
}

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pausa la reproducción actual")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Reanuda la reproducción pausada")
}

fn loop_command() -> CreateCommand {
    CreateCommand::new("loop")
        .description("Cambia el modo de repetición")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "mode", "Modo de repetición")
                .add_string_choice("Desactivado", "off")
                .add_string_choice("Canción actual", "track")
                .add_string_choice("Toda la cola", "queue")
                .required(true),
        )
}

fn volume_command() -> CreateCommand {
    CreateCommand::new("volume")
        .description("Ajusta el volumen de reproducción")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "level", "Volumen en porcentaje (0-200)")
                .min_int_value(0)
                .max_int_value(200)
                .required(true),
        )
}

// Cola

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue")
        .description("Muestra la cola")
        .add_option(CreateCommandOption::new(CommandOptionType::Integer, "page", "Número de página").min_int_value(1))
}

fn nowplaying_command() -> CreateCommand {
    CreateCommand::new("nowplaying").description("Muestra la canción actual")
}

fn shuffle_command() -> CreateCommand {
    CreateCommand::new("shuffle").description("Mezcla la cola")
}

fn reverse_command() -> CreateCommand {
    CreateCommand::new("reverse").description("Invierte el orden de la cola")
}

fn dedup_command() -> CreateCommand {
    CreateCommand::new("dedup").description("Quita canciones repetidas de la cola")
}

fn skipto_command() -> CreateCommand {
    CreateCommand::new("skipto")
        .description("Salta a una posición de la cola (DJ)")
        .add_option(position_option("position", "Posición en la cola"))
}

fn remove_command() -> CreateCommand {
    CreateCommand::new("remove")
        .description("Quita una canción de la cola")
        .add_option(position_option("position", "Posición en la cola"))
}

fn move_command() -> CreateCommand {
    CreateCommand::new("move")
        .description("Mueve una canción dentro de la cola")
        .add_option(position_option("from", "Posición actual"))
        .add_option(position_option("to", "Posición nueva"))
}

fn clear_command() -> CreateCommand {
    CreateCommand::new("clear").description("Vacía la cola sin detener la canción actual (DJ)")
}

// Configuración

fn settings_command() -> CreateCommand {
    CreateCommand::new("settings")
        .description("Muestra o cambia la configuración de música del servidor")
        .default_member_permissions(Permissions::MANAGE_GUILD)
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "vote_percent", "Oyentes necesarios para saltar por votación (%)")
                .min_int_value(1)
                .max_int_value(100),
        )
        .add_option(CreateCommandOption::new(
            CommandOptionType::Role,
            "dj_role",
            "Rol que puede forzar saltos, detener y vaciar",
        ))
        .add_option(CreateCommandOption::new(
            CommandOptionType::Channel,
            "announce_channel",
            "Dónde van los mensajes de \"reproduciendo\"",
        ))
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "default_volume", "Volumen para sesiones nuevas (%)")
                .min_int_value(0)
                .max_int_value(200),
        )
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "max_queue", "Máximo de canciones en cola")
                .min_int_value(1)
                .max_int_value(1000),
        )
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "playlist_limit", "Canciones que puede agregar una playlist")
                .min_int_value(1)
                .max_int_value(500),
        )
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "max_duration", "Duración máxima por canción en minutos (0 = sin límite)")
                .min_int_value(0)
                .max_int_value(1440),
        )
}

fn position_option(name: &str, description: &str) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::Integer, name, description)
        .min_int_value(1)
        .required(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_are_unique() {
        let names: Vec<String> = all_commands()
            .iter()
            .map(|command| {
                serde_json::to_value(command).unwrap()["name"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), names.len());
    }
}
