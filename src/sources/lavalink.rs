use async_trait::async_trait;
use lavalink_rs::model::track::{Track as LoadResult, TrackData, TrackLoadData, TrackLoadType};
use serenity::model::id::GuildId;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

use super::{MusicSource, TrackInfo};
use crate::audio::lavalink::{node_guild, LavalinkLink};
use crate::error::{MusicError, MusicResult};

/// Búsqueda y carga de pistas a través del nodo Lavalink.
pub struct LavalinkSource {
    link: Arc<LavalinkLink>,
    search_prefix: String,
}

impl LavalinkSource {
    pub fn new(link: Arc<LavalinkLink>, search_prefix: impl Into<String>) -> Self {
        Self {
            link,
            search_prefix: search_prefix.into(),
        }
    }

    async fn load(&self, guild_id: GuildId, identifier: &str) -> MusicResult<Vec<TrackInfo>> {
        debug!("Lavalink loadtracks: {}", identifier);
        let loaded = self
            .link
            .client()?
            .load_tracks(node_guild(guild_id), identifier)
            .await
            .map_err(|e| MusicError::Backend(format!("{:?}", e)))?;
        into_infos(loaded)
    }
}

#[async_trait]
impl MusicSource for LavalinkSource {
    async fn search(&self, guild_id: GuildId, query: &str, limit: usize) -> MusicResult<Vec<TrackInfo>> {
        let identifier = format!("{}:{}", self.search_prefix, query);
        let mut infos = self.load(guild_id, &identifier).await?;
        infos.truncate(limit);
        Ok(infos)
    }

    async fn fetch(&self, guild_id: GuildId, url: &str) -> MusicResult<Vec<TrackInfo>> {
        self.load(guild_id, url).await
    }

    fn source_name(&self) -> &'static str {
        "lavalink"
    }
}

impl From<TrackData> for TrackInfo {
    fn from(track: TrackData) -> Self {
        let info = track.info;
        let author = Some(info.author).filter(|a| !a.trim().is_empty());
        let duration = if info.is_stream {
            Duration::ZERO
        } else {
            Duration::from_millis(info.length)
        };

        TrackInfo {
            title: info.title,
            author,
            locator: track.encoded,
            duration,
            url: info.uri,
            is_stream: info.is_stream,
        }
    }
}

fn into_infos(loaded: LoadResult) -> MusicResult<Vec<TrackInfo>> {
    if matches!(loaded.load_type, TrackLoadType::Empty) {
        return Ok(Vec::new());
    }

    match loaded.data {
        Some(TrackLoadData::Track(track)) => Ok(vec![track.into()]),
        Some(TrackLoadData::Playlist(playlist)) => {
            debug!("Playlist {} cargada ({} pistas)", playlist.info.name, playlist.tracks.len());
            Ok(playlist.tracks.into_iter().map(TrackInfo::from).collect())
        }
        Some(TrackLoadData::Search(tracks)) => Ok(tracks.into_iter().map(TrackInfo::from).collect()),
        Some(TrackLoadData::Error(exception)) => {
            // El mensaje puede faltar según la versión del nodo.
            let message = serde_json::to_value(&exception)
                .ok()
                .and_then(|value| value.get("message").and_then(|m| m.as_str()).map(str::to_string))
                .unwrap_or_else(|| "error desconocido".to_string());
            error!("Lavalink no pudo cargar la pista: {}", message);
            Err(MusicError::Backend(message))
        }
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::lavalink::tests::track_json;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parse(load: serde_json::Value) -> MusicResult<Vec<TrackInfo>> {
        into_infos(serde_json::from_value(load).unwrap())
    }

    #[test]
    fn parses_single_track() {
        let infos = parse(json!({
            "loadType": "track",
            "data": track_json("Never Gonna Give You Up", 212_000, false, json!({}))
        }))
        .unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].title, "Never Gonna Give You Up");
        assert_eq!(infos[0].duration, Duration::from_secs(212));
        assert_eq!(infos[0].author.as_deref(), Some("RickAstleyVEVO"));
        assert_eq!(infos[0].locator, "QAAAjQIAJVNeverGonnaGiveYouUp");
        assert_eq!(infos[0].url.as_deref(), Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
    }

    #[test]
    fn parses_playlist_in_order() {
        let infos = parse(json!({
            "loadType": "playlist",
            "data": {
                "info": { "name": "Mix", "selectedTrack": -1 },
                "pluginInfo": {},
                "tracks": [
                    track_json("one", 1000, false, json!({})),
                    track_json("two", 2000, false, json!({}))
                ]
            }
        }))
        .unwrap();
        let titles: Vec<_> = infos.into_iter().map(|i| i.title).collect();
        assert_eq!(titles, vec!["one", "two"]);
    }

    #[test]
    fn streams_have_no_duration() {
        let infos = parse(json!({
            "loadType": "search",
            "data": [track_json("radio", 9_223_372_036_854_775_807, true, json!({}))]
        }))
        .unwrap();
        assert!(infos[0].is_stream);
        assert_eq!(infos[0].duration, Duration::ZERO);
    }

    #[test]
    fn error_maps_to_backend() {
        let err = parse(json!({
            "loadType": "error",
            "data": { "message": "This video is unavailable", "severity": "common", "cause": "..." }
        }))
        .unwrap_err();
        assert_eq!(err, MusicError::Backend("This video is unavailable".to_string()));
    }

    #[tokio::test]
    async fn loading_before_the_node_is_up_is_refused() {
        let source = LavalinkSource::new(Arc::new(LavalinkLink::new()), "ytsearch");
        let err = source.search(GuildId::new(1), "anything", 5).await.unwrap_err();
        assert!(matches!(err, MusicError::ConnectionRefused(_)));
    }
}
