pub mod lavalink;

use async_trait::async_trait;
use serenity::model::id::{GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::cache::SearchCache;
use crate::error::{MusicError, MusicResult};

pub use lavalink::LavalinkSource;

/// Backend de búsqueda y carga de pistas. El guild sólo decide qué nodo
/// atiende la petición.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MusicSource: Send + Sync {
    /// Ejecuta una búsqueda de texto y devuelve como máximo `limit`
    /// candidatos.
    async fn search(&self, guild_id: GuildId, query: &str, limit: usize) -> MusicResult<Vec<TrackInfo>>;

    /// Carga una URL. Una pista da una entrada; una playlist da todas sus
    /// pistas en orden.
    async fn fetch(&self, guild_id: GuildId, url: &str) -> MusicResult<Vec<TrackInfo>>;

    fn source_name(&self) -> &'static str;
}

/// Metadatos de una pista tal como los devuelve la fuente, antes de que
/// alguien la pida.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub title: String,
    pub author: Option<String>,
    /// Pista codificada que el nodo de audio sabe reproducir.
    pub locator: String,
    /// `Duration::ZERO` si se desconoce.
    pub duration: Duration,
    pub url: Option<String>,
    pub is_stream: bool,
}

impl TrackInfo {
    pub fn requested_by(self, requester: UserId) -> Track {
        Track {
            title: self.title,
            author: self.author,
            locator: self.locator,
            duration: self.duration,
            url: self.url,
            is_stream: self.is_stream,
            requested_by: requester,
        }
    }
}

/// Pista lista para la cola. No cambia una vez resuelta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    title: String,
    author: Option<String>,
    locator: String,
    duration: Duration,
    url: Option<String>,
    is_stream: bool,
    requested_by: UserId,
}

impl Track {
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }
    pub fn locator(&self) -> &str {
        &self.locator
    }
    pub fn duration(&self) -> Duration {
        self.duration
    }
    /// URL canónica para mostrar, si la fuente la conoce.
    pub fn display_url(&self) -> Option<&str> {
        self.url.as_deref()
    }
    pub fn is_stream(&self) -> bool {
        self.is_stream
    }
    pub fn requested_by(&self) -> UserId {
        self.requested_by
    }

    /// Clave usada al quitar duplicados de la cola.
    pub fn normalized_title(&self) -> String {
        normalize(&self.title)
    }

    /// `Título (3:25)` o `Título (en vivo)`, para las respuestas en el chat.
    pub fn describe(&self) -> String {
        if self.is_stream {
            format!("**{}** (en vivo)", self.title)
        } else if self.duration.is_zero() {
            format!("**{}**", self.title)
        } else {
            format!("**{}** ({})", self.title, format_duration(self.duration))
        }
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else {
        format!("{}:{:02}", secs / 60, secs % 60)
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn is_url(query: &str) -> bool {
    url::Url::parse(query.trim())
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Límites de cada petición, tomados de la configuración del guild.
#[derive(Debug, Clone, Copy)]
pub struct ResolveLimits {
    pub playlist_add_limit: usize,
    pub max_duration: Option<Duration>,
}

/// Convierte una búsqueda o URL del usuario en pistas para la cola.
pub struct TrackResolver {
    source: Arc<dyn MusicSource>,
    cache: SearchCache,
    search_limit: usize,
    timeout: Duration,
}

impl TrackResolver {
    pub fn new(source: Arc<dyn MusicSource>, cache: SearchCache, search_limit: usize, timeout: Duration) -> Self {
        Self {
            source,
            cache,
            search_limit: search_limit.clamp(1, 10),
            timeout,
        }
    }

    pub fn cache(&self) -> &SearchCache {
        &self.cache
    }

    /// Resuelve `query` para `requester` en `guild_id`.
    ///
    /// Las URLs se cargan directamente (las playlists se recortan al límite
    /// del guild); lo demás se busca y sólo se queda el mejor resultado.
    pub async fn resolve(
        &self,
        guild_id: GuildId,
        query: &str,
        requester: UserId,
        limits: ResolveLimits,
    ) -> MusicResult<Vec<Track>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MusicError::NotFound("búsqueda vacía".to_string()));
        }

        let direct = is_url(query);
        let mut infos = self.candidates(guild_id, query, direct).await?;

        if direct {
            if infos.len() > limits.playlist_add_limit {
                info!(
                    "Playlist {} recortada de {} a {} pistas",
                    query,
                    infos.len(),
                    limits.playlist_add_limit
                );
            }
            infos.truncate(limits.playlist_add_limit.max(1));
        } else {
            infos.truncate(1);
        }

        let found = infos.len();
        if let Some(max) = limits.max_duration {
            infos.retain(|info| info.is_stream || info.duration <= max);
        }

        if infos.is_empty() {
            let reason = match limits.max_duration {
                Some(max) if found > 0 => format!(
                    "`{}` dura más que el límite de {}",
                    query,
                    humantime::format_duration(max)
                ),
                _ => format!("sin resultados para `{}`", query),
            };
            return Err(MusicError::NotFound(reason));
        }

        Ok(infos.into_iter().map(|info| info.requested_by(requester)).collect())
    }

    /// Candidatos para el selector de `/search`, como máximo el límite
    /// configurado.
    pub async fn search(&self, guild_id: GuildId, query: &str) -> MusicResult<Vec<TrackInfo>> {
        let infos = self.candidates(guild_id, query.trim(), false).await?;
        if infos.is_empty() {
            return Err(MusicError::NotFound(format!("sin resultados para `{}`", query.trim())));
        }
        Ok(infos)
    }

    async fn candidates(&self, guild_id: GuildId, query: &str, direct: bool) -> MusicResult<Vec<TrackInfo>> {
        let key = if direct { query.to_string() } else { normalize(query) };
        if let Some(hit) = self.cache.get(&key) {
            debug!("Caché del resolvedor acertó para {}", key);
            return Ok(hit);
        }

        let lookup = async {
            if direct {
                self.source.fetch(guild_id, query).await
            } else {
                self.source.search(guild_id, query, self.search_limit).await
            }
        };

        let mut infos = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Búsqueda de {} en {} agotó el tiempo", query, self.source.source_name());
                return Err(MusicError::Backend("la búsqueda tardó demasiado".to_string()));
            }
        };

        if !direct {
            infos.truncate(self.search_limit);
        }
        if !infos.is_empty() {
            self.cache.insert(key, infos.clone());
        }

        Ok(infos)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn info(title: &str, secs: u64) -> TrackInfo {
        TrackInfo {
            title: title.to_string(),
            author: None,
            locator: format!("QAAA{}", title.replace(' ', "")),
            duration: Duration::from_secs(secs),
            url: Some(format!("https://example.com/{}", title.replace(' ', "-"))),
            is_stream: false,
        }
    }

    pub(crate) fn track(title: &str) -> Track {
        info(title, 180).requested_by(UserId::new(1))
    }

    const GUILD: GuildId = GuildId::new(1);

    fn limits() -> ResolveLimits {
        ResolveLimits {
            playlist_add_limit: 3,
            max_duration: Some(Duration::from_secs(600)),
        }
    }

    fn resolver(source: MockMusicSource) -> TrackResolver {
        TrackResolver::new(
            Arc::new(source),
            SearchCache::new(16, Duration::from_secs(60)),
            5,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn search_keeps_best_match() {
        let mut source = MockMusicSource::new();
        source
            .expect_search()
            .withf(|guild, query, limit| *guild == GuildId::new(3) && query == "never gonna" && *limit == 5)
            .times(1)
            .returning(|_, _, _| Ok(vec![info("first", 200), info("second", 200)]));
        source.expect_source_name().return_const("mock");

        let tracks = resolver(source)
            .resolve(GuildId::new(3), "never gonna", UserId::new(9), limits())
            .await
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].title(), "first");
        assert_eq!(tracks[0].requested_by(), UserId::new(9));
    }

    #[tokio::test]
    async fn playlist_urls_are_capped() {
        let mut source = MockMusicSource::new();
        source.expect_fetch().times(1).returning(|_, _| {
            Ok((0..10).map(|i| info(&format!("t{}", i), 100)).collect())
        });
        source.expect_source_name().return_const("mock");

        let tracks = resolver(source)
            .resolve(GUILD, "https://example.com/playlist?list=x", UserId::new(1), limits())
            .await
            .unwrap();
        let titles: Vec<_> = tracks.iter().map(|t| t.title().to_string()).collect();
        assert_eq!(titles, vec!["t0", "t1", "t2"]);
    }

    #[tokio::test]
    async fn empty_results_are_not_found() {
        let mut source = MockMusicSource::new();
        source.expect_search().returning(|_, _, _| Ok(Vec::new()));
        source.expect_source_name().return_const("mock");

        let err = resolver(source)
            .resolve(GUILD, "nothing here", UserId::new(1), limits())
            .await
            .unwrap_err();
        assert!(matches!(err, MusicError::NotFound(_)));
    }

    #[tokio::test]
    async fn overlong_tracks_are_rejected() {
        let mut source = MockMusicSource::new();
        source.expect_search().returning(|_, _, _| Ok(vec![info("ten hour mix", 36_000)]));
        source.expect_source_name().return_const("mock");

        let err = resolver(source)
            .resolve(GUILD, "ten hour mix", UserId::new(1), limits())
            .await
            .unwrap_err();
        match err {
            MusicError::NotFound(reason) => assert!(reason.contains("dura más que")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn backend_errors_propagate() {
        let mut source = MockMusicSource::new();
        source
            .expect_search()
            .returning(|_, _, _| Err(MusicError::Backend("node down".to_string())));
        source.expect_source_name().return_const("mock");

        let err = resolver(source)
            .resolve(GUILD, "anything", UserId::new(1), limits())
            .await
            .unwrap_err();
        assert_eq!(err, MusicError::Backend("node down".to_string()));
    }

    #[tokio::test]
    async fn repeated_searches_hit_the_cache() {
        let mut source = MockMusicSource::new();
        source
            .expect_search()
            .times(1)
            .returning(|_, _, _| Ok(vec![info("cached", 100)]));
        source.expect_source_name().return_const("mock");

        let resolver = resolver(source);
        resolver.resolve(GUILD, "Cached  Song", UserId::new(1), limits()).await.unwrap();
        let again = resolver
            .resolve(GuildId::new(2), "cached song", UserId::new(2), limits())
            .await
            .unwrap();
        assert_eq!(again[0].requested_by(), UserId::new(2));
    }

    #[test]
    fn detects_urls() {
        assert!(is_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(is_url("http://example.com/song.mp3"));
        assert!(!is_url("lofi hip hop"));
        assert!(!is_url("ftp://example.com/song.mp3"));
    }

    #[test]
    fn normalizes_titles() {
        let track = track("  Hello   World ");
        assert_eq!(track.normalized_title(), "hello world");
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(Duration::from_secs(65)), "1:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }
}
