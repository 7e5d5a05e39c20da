use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{queue::MusicQueue, transport::PlayToken, vote::VoteSkip};
use crate::sources::Track;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Connecting,
    Playing,
    Paused,
}

/// La pista en curso y su reloj de reproducción.
#[derive(Debug, Clone)]
pub struct NowPlaying {
    pub track: Track,
    /// Hora de pared en que empezó, para mostrarla en Discord.
    pub started_at: DateTime<Utc>,
    started: Instant,
    paused_at: Option<Instant>,
    paused_for: Duration,
}

impl NowPlaying {
    pub fn new(track: Track) -> Self {
        Self {
            track,
            started_at: Utc::now(),
            started: Instant::now(),
            paused_at: None,
            paused_for: Duration::ZERO,
        }
    }

    /// Posición de reproducción, sin contar el tiempo en pausa.
    pub fn elapsed(&self) -> Duration {
        let end = self.paused_at.unwrap_or_else(Instant::now);
        end.duration_since(self.started).saturating_sub(self.paused_for)
    }

    fn pause(&mut self) {
        self.paused_at.get_or_insert_with(Instant::now);
    }

    fn resume(&mut self) {
        if let Some(at) = self.paused_at.take() {
            self.paused_for += at.elapsed();
        }
    }
}

#[derive(Debug)]
struct IdleTimer {
    epoch: u64,
    cancel: CancellationToken,
}

/// Todo lo que el reproductor sabe de un guild. Vive detrás del mutex del
/// guild; cada transición mantiene ese lock.
#[derive(Debug)]
pub struct GuildSession {
    pub guild_id: GuildId,
    pub queue: MusicQueue,
    pub now_playing: Option<NowPlaying>,
    pub state: PlayerState,
    pub votes: VoteSkip,
    /// Canal de voz donde está el bot.
    pub channel_id: Option<ChannelId>,
    /// De dónde vino el último comando; los errores se reportan ahí.
    pub text_channel: Option<ChannelId>,
    /// Canal configurado para los mensajes de "reproduciendo".
    pub announce_channel: Option<ChannelId>,
    pub volume: f32,
    pub intentional_disconnect: bool,
    /// Se marca cuando la sesión ya salió del almacén.
    pub torn_down: bool,
    play_token: PlayToken,
    idle_timer: Option<IdleTimer>,
    idle_epoch: u64,
    alone_check: Option<CancellationToken>,
}

impl GuildSession {
    pub fn new(guild_id: GuildId, max_queue_size: usize, volume: f32) -> Self {
        Self {
            guild_id,
            queue: MusicQueue::new(max_queue_size),
            now_playing: None,
            state: PlayerState::Idle,
            votes: VoteSkip::default(),
            channel_id: None,
            text_channel: None,
            announce_channel: None,
            volume,
            intentional_disconnect: false,
            torn_down: false,
            play_token: 0,
            idle_timer: None,
            idle_epoch: 0,
            alone_check: None,
        }
    }

    /// Nada sonando y nada esperando.
    pub fn is_idle(&self) -> bool {
        self.state == PlayerState::Idle && self.now_playing.is_none() && self.queue.is_empty()
    }

    pub fn current_token(&self) -> PlayToken {
        self.play_token
    }

    /// Invalida los eventos del intento de reproducción anterior.
    pub fn next_token(&mut self) -> PlayToken {
        self.play_token += 1;
        self.play_token
    }

    pub fn pause(&mut self) {
        self.state = PlayerState::Paused;
        if let Some(now) = self.now_playing.as_mut() {
            now.pause();
        }
    }

    pub fn resume(&mut self) {
        self.state = PlayerState::Playing;
        if let Some(now) = self.now_playing.as_mut() {
            now.resume();
        }
    }

    /// Reemplaza el temporizador de inactividad pendiente. Devuelve la época
    /// que el nuevo debe seguir cumpliendo al dispararse, y su token de
    /// cancelación.
    pub fn arm_idle_timer(&mut self) -> (u64, CancellationToken) {
        self.cancel_idle_timer();
        self.idle_epoch += 1;
        let cancel = CancellationToken::new();
        self.idle_timer = Some(IdleTimer {
            epoch: self.idle_epoch,
            cancel: cancel.clone(),
        });
        debug!("Temporizador de inactividad armado para guild {} (época {})", self.guild_id, self.idle_epoch);
        (self.idle_epoch, cancel)
    }

    pub fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel.cancel();
            debug!("Temporizador de inactividad cancelado para guild {} (época {})", self.guild_id, timer.epoch);
        }
    }

    pub fn idle_timer_pending(&self) -> bool {
        self.idle_timer.is_some()
    }

    /// Verdadero si el temporizador armado en `epoch` sigue siendo el vigente.
    pub fn idle_timer_matches(&self, epoch: u64) -> bool {
        self.idle_timer.as_ref().is_some_and(|timer| timer.epoch == epoch)
    }

    /// Reemplaza la comprobación pendiente de "solo en el canal".
    pub fn arm_alone_check(&mut self) -> CancellationToken {
        self.cancel_alone_check();
        let cancel = CancellationToken::new();
        self.alone_check = Some(cancel.clone());
        cancel
    }

    pub fn alone_check_pending(&self) -> bool {
        self.alone_check.as_ref().is_some_and(|cancel| !cancel.is_cancelled())
    }

    pub fn cancel_alone_check(&mut self) {
        if let Some(cancel) = self.alone_check.take() {
            cancel.cancel();
        }
    }

    /// Cancela temporizadores y olvida todo el estado de reproducción.
    pub fn reset(&mut self) {
        self.cancel_idle_timer();
        self.cancel_alone_check();
        self.queue.clear();
        self.now_playing = None;
        self.votes.clear();
        self.state = PlayerState::Idle;
        self.next_token();
    }
}

pub type SharedSession = Arc<Mutex<GuildSession>>;

/// Mapa de sesiones vivas por guild.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<GuildId, SharedSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, guild_id: GuildId, init: impl FnOnce() -> GuildSession) -> SharedSession {
        self.sessions
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone()
    }

    pub fn get(&self, guild_id: GuildId) -> Option<SharedSession> {
        self.sessions.get(&guild_id).map(|s| s.clone())
    }

    /// Quita `session` si sigue siendo la registrada para el guild.
    pub fn remove(&self, guild_id: GuildId, session: &SharedSession) -> bool {
        self.sessions
            .remove_if(&guild_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::tests::track;

    fn session() -> GuildSession {
        GuildSession::new(GuildId::new(1), 10, 1.0)
    }

    #[test]
    fn arming_replaces_previous_timer() {
        let mut session = session();
        let (first_epoch, first) = session.arm_idle_timer();
        let (second_epoch, second) = session.arm_idle_timer();

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(!session.idle_timer_matches(first_epoch));
        assert!(session.idle_timer_matches(second_epoch));
    }

    #[test]
    fn reset_cancels_timer_and_bumps_token() {
        let mut session = session();
        let (_, cancel) = session.arm_idle_timer();
        let token = session.current_token();
        session.now_playing = Some(NowPlaying::new(track("a")));

        session.reset();
        assert!(cancel.is_cancelled());
        assert!(session.is_idle());
        assert!(session.current_token() > token);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_excludes_paused_time() {
        let mut session = session();
        session.now_playing = Some(NowPlaying::new(track("a")));
        session.state = PlayerState::Playing;

        tokio::time::advance(Duration::from_secs(10)).await;
        session.pause();
        tokio::time::advance(Duration::from_secs(30)).await;
        session.resume();
        tokio::time::advance(Duration::from_secs(5)).await;

        let elapsed = session.now_playing.as_ref().unwrap().elapsed();
        assert_eq!(elapsed.as_secs(), 15);
    }

    #[test]
    fn store_only_removes_matching_session() {
        let store = SessionStore::new();
        let guild = GuildId::new(5);
        let first = store.get_or_create(guild, || GuildSession::new(guild, 10, 1.0));
        assert!(store.remove(guild, &first));

        let second = store.get_or_create(guild, || GuildSession::new(guild, 10, 1.0));
        assert!(!store.remove(guild, &first));
        assert!(Arc::ptr_eq(&second, &store.get(guild).unwrap()));
    }
}
