use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

/// Configuración por guild que lee el núcleo de reproducción; se guarda como
/// un archivo JSON por guild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub guild_id: u64,
    /// Porcentaje, 0..=200.
    pub default_volume: u16,
    pub max_queue_size: usize,
    /// Máximo de pistas que puede agregar un solo enlace de playlist.
    pub playlist_add_limit: usize,
    pub dj_role_id: Option<u64>,
    /// Porcentaje de oyentes necesario para aprobar un voto de salto.
    pub vote_skip_percent: u8,
    /// Segundos; 0 desactiva el límite. Las transmisiones nunca se limitan.
    pub max_track_duration: u64,
    pub announcement_channel_id: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            guild_id: 0,
            default_volume: 100,
            max_queue_size: 100,
            playlist_add_limit: 50,
            dj_role_id: None,
            vote_skip_percent: 50,
            max_track_duration: 3600,
            announcement_channel_id: None,
        }
    }
}

impl ServerConfig {
    pub fn for_guild(guild_id: u64) -> Self {
        Self {
            guild_id,
            ..Self::default()
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        (self.max_track_duration > 0).then(|| Duration::from_secs(self.max_track_duration))
    }
}

/// Vista de sólo lectura de la configuración por guild que usa el reproductor.
#[async_trait]
pub trait GuildSettings: Send + Sync {
    async fn server_config(&self, guild_id: GuildId) -> ServerConfig;
}

/// Almacén de configuración respaldado por archivos JSON
pub struct JsonStorage {
    data_dir: PathBuf,
    servers_cache: HashMap<u64, ServerConfig>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let servers_dir = data_dir.join("servers");
        fs::create_dir_all(&servers_dir).await?;

        info!("Almacenamiento inicializado en {}", data_dir.display());

        let mut storage = Self {
            data_dir,
            servers_cache: HashMap::new(),
        };
        storage.load_all_servers().await?;

        Ok(storage)
    }

    /// Devuelve la configuración guardada y escribe los valores por defecto para guilds nuevos.
    pub async fn get_server_config(&mut self, guild_id: u64) -> Result<ServerConfig> {
        if let Some(config) = self.servers_cache.get(&guild_id) {
            return Ok(config.clone());
        }

        match self.load_server_config(guild_id).await {
            Ok(config) => {
                self.servers_cache.insert(guild_id, config.clone());
                Ok(config)
            }
            Err(_) => {
                let config = ServerConfig::for_guild(guild_id);
                self.save_server_config(&config).await?;
                self.servers_cache.insert(guild_id, config.clone());

                info!("Configuración por defecto creada para el guild {}", guild_id);
                Ok(config)
            }
        }
    }

    pub async fn update_server_config(&mut self, config: ServerConfig) -> Result<()> {
        let guild_id = config.guild_id;
        self.save_server_config(&config).await?;
        self.servers_cache.insert(guild_id, config);

        info!("Configuración actualizada para el guild {}", guild_id);
        Ok(())
    }

    pub async fn set_default_volume(&mut self, guild_id: u64, volume: u16) -> Result<()> {
        let mut config = self.get_server_config(guild_id).await?;
        config.default_volume = volume.min(200);
        self.update_server_config(config).await
    }

    pub async fn set_dj_role(&mut self, guild_id: u64, role_id: Option<u64>) -> Result<()> {
        let mut config = self.get_server_config(guild_id).await?;
        config.dj_role_id = role_id;
        self.update_server_config(config).await
    }

    pub async fn set_vote_skip_percent(&mut self, guild_id: u64, percent: u8) -> Result<()> {
        let mut config = self.get_server_config(guild_id).await?;
        config.vote_skip_percent = percent.clamp(1, 100);
        self.update_server_config(config).await
    }

    pub async fn set_announcement_channel(&mut self, guild_id: u64, channel_id: Option<u64>) -> Result<()> {
        let mut config = self.get_server_config(guild_id).await?;
        config.announcement_channel_id = channel_id;
        self.update_server_config(config).await
    }

    async fn load_server_config(&self, guild_id: u64) -> Result<ServerConfig> {
        let content = fs::read_to_string(self.server_file_path(guild_id)).await?;
        let config: ServerConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    async fn save_server_config(&self, config: &ServerConfig) -> Result<()> {
        let content = serde_json::to_string_pretty(config)?;
        fs::write(self.server_file_path(config.guild_id), content).await?;
        Ok(())
    }

    async fn load_all_servers(&mut self) -> Result<()> {
        let servers_dir = self.data_dir.join("servers");
        let mut files = fs::read_dir(&servers_dir).await?;
        let mut loaded_count = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let guild_id = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok());

            if let Some(guild_id) = guild_id {
                match self.load_server_config(guild_id).await {
                    Ok(config) => {
                        self.servers_cache.insert(guild_id, config);
                        loaded_count += 1;
                    }
                    Err(e) => warn!("No se pudo cargar la configuración del guild {}: {}", guild_id, e),
                }
            }
        }

        if loaded_count > 0 {
            info!("Configuración cargada para {} guilds", loaded_count);
        }

        Ok(())
    }

    fn server_file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir.join("servers").join(format!("guild_{}.json", guild_id))
    }
}

#[async_trait]
impl GuildSettings for tokio::sync::Mutex<JsonStorage> {
    async fn server_config(&self, guild_id: GuildId) -> ServerConfig {
        let mut storage = self.lock().await;
        match storage.get_server_config(guild_id.get()).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Usando la configuración por defecto para el guild {}: {:?}", guild_id, e);
                ServerConfig::for_guild(guild_id.get())
            }
        }
    }
}
