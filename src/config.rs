use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Configuración del proceso, leída del entorno (y de `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // guild de desarrollo para registrar comandos al instante

    // Nodo Lavalink
    pub lavalink_host: String,
    pub lavalink_port: u16,
    pub lavalink_password: String,
    pub lavalink_secure: bool,
    pub lavalink_autostart: bool,
    pub lavalink_jar: PathBuf,
    pub java_path: String,
    pub node_connect_attempts: u32,
    pub node_retry_delay: Duration,
    pub node_start_timeout: Duration,
    pub node_ready_timeout: Duration,

    // Límites de reproducción
    pub global_instance_limit: usize,
    pub idle_timeout: Duration,
    pub alone_debounce: Duration,
    pub connect_cooldown: Duration,
    pub search_limit: usize,
    pub search_prefix: String,
    pub resolve_timeout: Duration,

    // Caché
    pub cache_size: usize,
    pub cache_ttl: Duration,

    // Rutas
    pub data_dir: PathBuf,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} no es válido: {}", key, e)),
        _ => Ok(default),
    }
}

fn env_secs(key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_or(key, default)?))
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            discord_token: std::env::var("DISCORD_TOKEN")?,
            application_id: std::env::var("APPLICATION_ID")?.parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            lavalink_host: env_or("LAVALINK_HOST", defaults.lavalink_host)?,
            lavalink_port: env_or("LAVALINK_PORT", defaults.lavalink_port)?,
            lavalink_password: env_or("LAVALINK_PASSWORD", defaults.lavalink_password)?,
            lavalink_secure: env_or("LAVALINK_SECURE", defaults.lavalink_secure)?,
            lavalink_autostart: env_or("LAVALINK_AUTOSTART", defaults.lavalink_autostart)?,
            lavalink_jar: env_or("LAVALINK_JAR", defaults.lavalink_jar)?,
            java_path: env_or("JAVA_PATH", defaults.java_path)?,
            node_connect_attempts: env_or("NODE_CONNECT_ATTEMPTS", defaults.node_connect_attempts)?,
            node_retry_delay: env_secs("NODE_RETRY_DELAY", 5)?,
            node_start_timeout: env_secs("NODE_START_TIMEOUT", 60)?,
            node_ready_timeout: env_secs("NODE_READY_TIMEOUT", 30)?,

            global_instance_limit: env_or("GLOBAL_INSTANCE_LIMIT", defaults.global_instance_limit)?,
            idle_timeout: env_secs("IDLE_TIMEOUT", 300)?,
            alone_debounce: env_secs("ALONE_DEBOUNCE", 5)?,
            connect_cooldown: env_secs("CONNECT_COOLDOWN", 60)?,
            search_limit: env_or("SEARCH_LIMIT", defaults.search_limit)?,
            search_prefix: env_or("SEARCH_PREFIX", defaults.search_prefix)?,
            resolve_timeout: env_secs("RESOLVE_TIMEOUT", 15)?,

            cache_size: env_or("CACHE_SIZE", defaults.cache_size)?,
            cache_ttl: env_secs("CACHE_TTL", 600)?,

            data_dir: env_or("DATA_DIR", defaults.data_dir)?,
        };

        std::fs::create_dir_all(&config.data_dir)?;
        config.validate()?;

        Ok(config)
    }

    /// Validaciones que de otro modo aparecerían como rechazos confusos en
    /// tiempo de ejecución.
    pub fn validate(&self) -> Result<()> {
        if self.global_instance_limit == 0 {
            anyhow::bail!("GLOBAL_INSTANCE_LIMIT debe ser mayor que 0");
        }

        if !(1..=10).contains(&self.search_limit) {
            anyhow::bail!("SEARCH_LIMIT debe estar entre 1 y 10, recibido: {}", self.search_limit);
        }

        if self.node_connect_attempts == 0 {
            anyhow::bail!("NODE_CONNECT_ATTEMPTS debe ser mayor que 0");
        }

        if self.idle_timeout.is_zero() {
            anyhow::bail!("IDLE_TIMEOUT debe ser mayor que 0");
        }

        if self.cache_size == 0 {
            anyhow::bail!("El tamaño de la caché debe ser mayor que 0");
        }

        if self.lavalink_autostart && !self.lavalink_jar.exists() {
            anyhow::bail!(
                "LAVALINK_AUTOSTART está activo pero {} no existe",
                self.lavalink_jar.display()
            );
        }

        Ok(())
    }

    /// URL base de la API REST de Lavalink.
    pub fn lavalink_base_url(&self) -> String {
        let scheme = if self.lavalink_secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.lavalink_host, self.lavalink_port)
    }

    /// Resumen para el log; nunca incluye el token ni la contraseña del nodo.
    pub fn summary(&self) -> String {
        format!(
            "Resumen de configuración:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Lavalink: {} (autostart={})\n  \
            Límites: {} sesiones de voz, {}s inactividad, {}s de espera, {} resultados\n  \
            Caché: {} entradas, {}s ttl",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.lavalink_base_url(),
            self.lavalink_autostart,
            self.global_instance_limit,
            self.idle_timeout.as_secs(),
            self.connect_cooldown.as_secs(),
            self.search_limit,
            self.cache_size,
            self.cache_ttl.as_secs(),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            lavalink_host: "localhost".to_string(),
            lavalink_port: 2333,
            lavalink_password: "youshallnotpass".to_string(),
            lavalink_secure: false,
            lavalink_autostart: false,
            lavalink_jar: "Lavalink.jar".into(),
            java_path: "java".to_string(),
            node_connect_attempts: 3,
            node_retry_delay: Duration::from_secs(5),
            node_start_timeout: Duration::from_secs(60),
            node_ready_timeout: Duration::from_secs(30),

            global_instance_limit: 5,
            idle_timeout: Duration::from_secs(300),
            alone_debounce: Duration::from_secs(5),
            connect_cooldown: Duration::from_secs(60),
            search_limit: 5,
            search_prefix: "ytsearch".to_string(),
            resolve_timeout: Duration::from_secs(15),

            cache_size: 100,
            cache_ttl: Duration::from_secs(600),

            data_dir: "/app/data".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_instance_limit() {
        let config = Config {
            global_instance_limit: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_search_limit() {
        let config = Config {
            search_limit: 25,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn summary_hides_secrets() {
        let config = Config {
            discord_token: "super-secret-token".to_string(),
            ..Config::default()
        };
        let summary = config.summary();
        assert!(!summary.contains("super-secret-token"));
        assert!(!summary.contains("youshallnotpass"));
        assert!(summary.contains("http://localhost:2333"));
    }
}
