use rand::seq::SliceRandom;
use std::{collections::{HashSet, VecDeque}, fmt, time::Duration};
use tracing::{debug, info};

use crate::error::{MusicError, MusicResult};
use crate::sources::Track;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Off,
    /// Repite la pista actual.
    Track,
    /// Devuelve las pistas terminadas al final de la cola.
    Queue,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopMode::Off => write!(f, "desactivado"),
            LoopMode::Track => write!(f, "pista actual"),
            LoopMode::Queue => write!(f, "toda la cola"),
        }
    }
}

/// Por qué se detuvo la pista actual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Finished,
    /// Salto explícito o votación aprobada; ignora `LoopMode::Track`.
    Skipped,
    /// No arrancó o murió a mitad; nunca se repite.
    Failed,
}

/// Pistas pendientes más la política de repetición que decide qué sigue.
#[derive(Debug)]
pub struct MusicQueue {
    items: VecDeque<Track>,
    loop_mode: LoopMode,
    max_size: usize,
}

impl MusicQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            loop_mode: LoopMode::Off,
            max_size,
        }
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    /// Agrega todas las pistas que quepan; sólo falla si no cabe ninguna.
    pub fn extend(&mut self, tracks: Vec<Track>) -> MusicResult<usize> {
        let available = self.max_size.saturating_sub(self.items.len());
        if available == 0 && !tracks.is_empty() {
            return Err(MusicError::QueueFull(self.max_size));
        }

        let to_add = tracks.len().min(available);
        self.items.extend(tracks.into_iter().take(to_add));
        debug!("{} pistas encoladas ({} esperando)", to_add, self.items.len());
        Ok(to_add)
    }

    /// Elige la siguiente pista según la que acaba de terminar.
    ///
    /// Devuelve `None` cuando no queda nada por reproducir.
    pub fn advance(&mut self, finished: Option<Track>, reason: EndReason) -> Option<Track> {
        if let Some(track) = finished {
            match (self.loop_mode, reason) {
                (LoopMode::Track, EndReason::Finished) => {
                    debug!("Repitiendo {}", track.title());
                    return Some(track);
                }
                (LoopMode::Queue, EndReason::Finished | EndReason::Skipped) => {
                    self.items.push_back(track);
                }
                _ => {}
            }
        }

        self.items.pop_front()
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.items.len();
        self.items.clear();
        cleared
    }

    pub fn shuffle(&mut self) {
        self.items.make_contiguous().shuffle(&mut rand::thread_rng());
        info!("🔀 Cola mezclada ({} pistas)", self.items.len());
    }

    pub fn reverse(&mut self) {
        self.items.make_contiguous().reverse();
    }

    /// Quita las copias posteriores de pistas cuyo título normalizado ya
    /// apareció, conservando la primera. `playing` cuenta como vista.
    pub fn dedup(&mut self, playing: Option<&Track>) -> usize {
        let mut seen: HashSet<String> = playing.map(|t| t.normalized_title()).into_iter().collect();
        let before = self.items.len();
        self.items.retain(|track| seen.insert(track.normalized_title()));
        before - self.items.len()
    }

    /// Descarta todo lo anterior a `position` (desde 1) para que suene después.
    pub fn skip_to(&mut self, position: usize) -> MusicResult<usize> {
        if position == 0 || position > self.items.len() {
            return Err(MusicError::InvalidPosition(position));
        }
        let dropped = position - 1;
        self.items.drain(..dropped);
        Ok(dropped)
    }

    /// Quita la pista en `position` (desde 1).
    pub fn remove(&mut self, position: usize) -> MusicResult<Track> {
        if position == 0 {
            return Err(MusicError::InvalidPosition(position));
        }
        self.items
            .remove(position - 1)
            .ok_or(MusicError::InvalidPosition(position))
    }

    /// Mueve una pista entre posiciones (desde 1).
    pub fn move_track(&mut self, from: usize, to: usize) -> MusicResult<()> {
        let len = self.items.len();
        if from == 0 || from > len {
            return Err(MusicError::InvalidPosition(from));
        }
        if to == 0 || to > len {
            return Err(MusicError::InvalidPosition(to));
        }
        if from != to {
            let track = self.items.remove(from - 1).ok_or(MusicError::InvalidPosition(from))?;
            self.items.insert(to - 1, track);
        }
        Ok(())
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    pub fn total_duration(&self) -> Duration {
        self.items.iter().map(Track::duration).sum()
    }
}
