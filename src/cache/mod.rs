//! # Módulo de Caché
//!
//! Caché de corta vida para los resultados del resolver, así las búsquedas
//! repetidas de `/play` no vuelven a consultar el nodo Lavalink.
//!
//! Las entradas se indexan por el identificador de búsqueda normalizado y
//! guardan listas de [`TrackInfo`] sin solicitante; el solicitante se añade
//! cuando el resolver las convierte en pistas encolables.
//!
//! ```env
//! CACHE_SIZE=100   # máximo de búsquedas en caché
//! CACHE_TTL=600    # segundos que una entrada sigue válida
//! ```

pub mod lru_cache;

use lru_cache::LRUCache;
use tracing::info;

use crate::sources::TrackInfo;

pub type SearchCache = LRUCache<String, Vec<TrackInfo>>;

impl SearchCache {
    /// Limpieza periódica; la llama la tarea de mantenimiento.
    pub fn cleanup_old_entries(&self) {
        let removed = self.cleanup_expired();
        if removed > 0 {
            let metrics = self.metrics();
            info!(
                "Limpieza de caché: {} entradas vencidas eliminadas (aciertos {:.0}%)",
                removed,
                metrics.hit_rate() * 100.0
            );
        }
    }
}
