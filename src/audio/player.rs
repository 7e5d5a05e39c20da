use chrono::{DateTime, Utc};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::{
    connection::ConnectionManager,
    queue::{EndReason, LoopMode},
    session::{GuildSession, NowPlaying, PlayerState, SessionStore, SharedSession},
    transport::{EventReceiver, GuildDirectory, TransportEvent, VoiceTransport},
    vote::VoteOutcome,
};
use crate::error::{MusicError, MusicResult};
use crate::sources::{ResolveLimits, Track, TrackResolver};
use crate::storage::{GuildSettings, ServerConfig};

/// Una petición de `/play` tal como la ve el motor.
#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub text_channel: ChannelId,
    pub query: String,
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub first: Track,
    pub added: usize,
    /// Posición (desde 1) de `first` en la cola; `None` si empezó a sonar.
    pub position: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SkipOutcome {
    pub skipped: Track,
    pub next: Option<Track>,
}

/// La pista que suena y desde cuándo.
#[derive(Debug, Clone)]
pub struct CurrentTrack {
    pub track: Track,
    /// Posición de reproducción sin contar pausas.
    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
}

/// Copia de sólo lectura del reproductor de un guild, para mostrarla.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub now_playing: Option<CurrentTrack>,
    pub upcoming: Vec<Track>,
    pub loop_mode: LoopMode,
    pub state: PlayerState,
    pub volume_percent: u16,
    pub total_duration: Duration,
}

/// Motor de reproducción por guild.
///
/// Cada transición toma el lock de la sesión del guild, así que comandos,
/// eventos del transporte y temporizadores de un guild nunca se intercalan.
pub struct AudioPlayer {
    sessions: SessionStore,
    connections: ConnectionManager,
    transport: Arc<dyn VoiceTransport>,
    directory: Arc<dyn GuildDirectory>,
    resolver: Arc<TrackResolver>,
    settings: Arc<dyn GuildSettings>,
    idle_timeout: Duration,
    alone_debounce: Duration,
}

impl AudioPlayer {
    pub fn new(
        connections: ConnectionManager,
        transport: Arc<dyn VoiceTransport>,
        directory: Arc<dyn GuildDirectory>,
        resolver: Arc<TrackResolver>,
        settings: Arc<dyn GuildSettings>,
        idle_timeout: Duration,
        alone_debounce: Duration,
    ) -> Self {
        Self {
            sessions: SessionStore::new(),
            connections,
            transport,
            directory,
            resolver,
            settings,
            idle_timeout,
            alone_debounce,
        }
    }

    /// Resolvedor compartido, también usado por `/search`.
    pub fn resolver(&self) -> &TrackResolver {
        &self.resolver
    }

    /// Guilds con sesión viva.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Sale de voz en todos los guilds; se usa al apagar el proceso.
    pub async fn shutdown(&self) {
        let guilds = self.sessions.guilds();
        info!("Deteniendo {} sesión(es) activa(s)", guilds.len());
        let results = futures::future::join_all(guilds.iter().map(|guild_id| self.stop(*guild_id))).await;
        for (guild_id, result) in guilds.iter().zip(results) {
            if let Err(e) = result {
                debug!("La sesión de guild {} ya no existía: {}", guild_id, e);
            }
        }
    }

    /// Consume eventos del transporte hasta que se suelta el emisor.
    pub async fn run(self: Arc<Self>, mut events: EventReceiver) {
        info!("🎧 Bucle de eventos del reproductor iniciado");
        while let Some(event) = events.recv().await {
            self.handle_transport_event(event).await;
        }
        info!("Bucle de eventos del reproductor detenido");
    }

    /// Resuelve la búsqueda, entra a voz si hace falta, encola el resultado
    /// y empieza a reproducir si el guild estaba inactivo.
    pub async fn enqueue(self: &Arc<Self>, request: PlayRequest) -> MusicResult<EnqueueOutcome> {
        let guild_id = request.guild_id;
        let settings = self.settings.server_config(guild_id).await;
        let limits = ResolveLimits {
            playlist_add_limit: settings.playlist_add_limit.max(1),
            max_duration: settings.max_duration(),
        };

        let tracks = self
            .resolver
            .resolve(guild_id, &request.query, request.user_id, limits)
            .await?;
        let first = tracks.first().cloned().ok_or_else(|| MusicError::NotFound(request.query.clone()))?;

        let (session, mut s) = loop {
            let session = self.sessions.get_or_create(guild_id, || new_session(guild_id, &settings));
            let guard = session.clone().lock_owned().await;
            if !guard.torn_down {
                break (session, guard);
            }
        };

        s.text_channel = Some(request.text_channel);
        s.announce_channel = settings.announcement_channel_id.map(ChannelId::new);
        s.queue.set_max_size(settings.max_queue_size);

        let was_idle = s.state == PlayerState::Idle;
        if was_idle {
            s.state = PlayerState::Connecting;
        }

        if let Err(e) = self.connections.ensure_connected(&mut s, request.user_id).await {
            if was_idle {
                s.state = PlayerState::Idle;
            }
            if s.is_idle() && !self.transport.is_connected(guild_id).await {
                s.torn_down = true;
                self.sessions.remove(guild_id, &session);
            }
            return Err(e);
        }

        let added = match s.queue.extend(tracks) {
            Ok(added) => added,
            Err(e) => {
                if was_idle {
                    s.state = PlayerState::Idle;
                }
                if s.is_idle() && !s.idle_timer_pending() {
                    self.arm_idle_timer(&session, &mut s);
                }
                return Err(e);
            }
        };
        s.cancel_idle_timer();

        info!(
            "➕ {} pista(s) encolada(s) en guild {} para {}",
            added, guild_id, request.user_id
        );

        let position = if s.now_playing.is_none() {
            self.advance(&session, &mut s, None, EndReason::Finished).await;
            None
        } else {
            Some(s.queue.len() + 1 - added)
        };

        Ok(EnqueueOutcome { first, added, position })
    }

    /// Salta la pista actual sin votación.
    pub async fn skip(self: &Arc<Self>, guild_id: GuildId) -> MusicResult<SkipOutcome> {
        let session = self.session(guild_id)?;
        let mut s = session.clone().lock_owned().await;
        self.skip_current(&session, &mut s).await
    }

    /// Cuenta el voto de `user_id` para saltar; salta al alcanzar el quórum.
    pub async fn vote_skip(self: &Arc<Self>, guild_id: GuildId, user_id: UserId) -> MusicResult<VoteOutcome> {
        let percent = self.settings.server_config(guild_id).await.vote_skip_percent;
        let session = self.session(guild_id)?;
        let mut s = session.clone().lock_owned().await;

        if s.now_playing.is_none() {
            return Err(MusicError::NothingPlaying);
        }
        let channel_id = s.channel_id.ok_or(MusicError::NoSession)?;
        if self.directory.voice_channel_of(guild_id, user_id) != Some(channel_id) {
            return Err(MusicError::NotListening);
        }

        let listeners = self.directory.listener_count(guild_id, channel_id);
        let outcome = s.votes.vote(user_id, listeners, percent);
        debug!(
            "Voto para saltar en guild {}: {}/{} (nuevo: {})",
            guild_id, outcome.count, outcome.needed, outcome.added
        );

        if outcome.skipped {
            self.skip_current(&session, &mut s).await?;
        }
        Ok(outcome)
    }

    /// Limpia todo y sale de voz.
    pub async fn stop(&self, guild_id: GuildId) -> MusicResult<()> {
        let session = self.session(guild_id)?;
        let mut s = session.clone().lock_owned().await;
        self.teardown(&session, &mut s, true, None).await;
        Ok(())
    }

    /// Pausa la pista actual. Pausar algo ya pausado no hace nada.
    pub async fn pause(&self, guild_id: GuildId) -> MusicResult<()> {
        let session = self.session(guild_id)?;
        let mut s = session.lock().await;
        match s.state {
            PlayerState::Playing => {
                self.transport.pause(guild_id).await?;
                s.pause();
                Ok(())
            }
            PlayerState::Paused => Ok(()),
            _ => Err(MusicError::NothingPlaying),
        }
    }

    /// Reanuda una pista pausada.
    pub async fn resume(&self, guild_id: GuildId) -> MusicResult<()> {
        let session = self.session(guild_id)?;
        let mut s = session.lock().await;
        match s.state {
            PlayerState::Paused => {
                self.transport.resume(guild_id).await?;
                s.resume();
                Ok(())
            }
            PlayerState::Playing => Ok(()),
            _ => Err(MusicError::NothingPlaying),
        }
    }

    /// Cambia el modo de repetición de la cola.
    pub async fn set_repeat(&self, guild_id: GuildId, mode: LoopMode) -> MusicResult<()> {
        let session = self.session(guild_id)?;
        session.lock().await.queue.set_loop_mode(mode);
        info!("🔁 Modo de repetición en guild {}: {}", guild_id, mode);
        Ok(())
    }

    /// Ajusta el volumen; `percent` se limita a 0..=200. Devuelve el valor
    /// aplicado.
    pub async fn set_volume(&self, guild_id: GuildId, percent: u16) -> MusicResult<u16> {
        let percent = percent.min(200);
        let session = self.session(guild_id)?;
        let mut s = session.lock().await;
        s.volume = f32::from(percent) / 100.0;
        if s.now_playing.is_some() {
            self.transport.set_volume(guild_id, s.volume).await?;
        }
        Ok(percent)
    }

    /// Mezcla la cola pendiente. Devuelve cuántas pistas quedan.
    pub async fn shuffle(&self, guild_id: GuildId) -> MusicResult<usize> {
        let session = self.session(guild_id)?;
        let mut s = session.lock().await;
        s.queue.shuffle();
        Ok(s.queue.len())
    }

    /// Invierte el orden de la cola pendiente.
    pub async fn reverse(&self, guild_id: GuildId) -> MusicResult<usize> {
        let session = self.session(guild_id)?;
        let mut s = session.lock().await;
        s.queue.reverse();
        Ok(s.queue.len())
    }

    /// Quita pistas repetidas (incluida la que suena). Devuelve cuántas
    /// se quitaron.
    pub async fn dedup(&self, guild_id: GuildId) -> MusicResult<usize> {
        let session = self.session(guild_id)?;
        let mut guard = session.lock().await;
        let s = &mut *guard;
        Ok(s.queue.dedup(s.now_playing.as_ref().map(|now| &now.track)))
    }

    /// Vacía la cola sin tocar la pista actual.
    pub async fn clear(&self, guild_id: GuildId) -> MusicResult<usize> {
        let session = self.session(guild_id)?;
        let cleared = session.lock().await.queue.clear();
        Ok(cleared)
    }

    /// Quita la pista en la posición `position` (desde 1).
    pub async fn remove(&self, guild_id: GuildId, position: usize) -> MusicResult<Track> {
        let session = self.session(guild_id)?;
        let removed = session.lock().await.queue.remove(position)?;
        Ok(removed)
    }

    /// Mueve una pista de `from` a `to`, ambas posiciones desde 1.
    pub async fn move_track(&self, guild_id: GuildId, from: usize, to: usize) -> MusicResult<()> {
        let session = self.session(guild_id)?;
        let result = session.lock().await.queue.move_track(from, to);
        result
    }

    /// Salta a la posición indicada (desde 1), descartando lo anterior.
    pub async fn skip_to(self: &Arc<Self>, guild_id: GuildId, position: usize) -> MusicResult<SkipOutcome> {
        let session = self.session(guild_id)?;
        let mut s = session.clone().lock_owned().await;
        let dropped = s.queue.skip_to(position)?;
        debug!("Descartadas {} pistas antes de la posición {} en guild {}", dropped, position, guild_id);
        self.skip_current(&session, &mut s).await
    }

    /// Copia del estado del guild para `/queue` y `/nowplaying`.
    pub async fn snapshot(&self, guild_id: GuildId) -> MusicResult<QueueSnapshot> {
        let session = self.session(guild_id)?;
        let s = session.lock().await;
        Ok(QueueSnapshot {
            now_playing: s.now_playing.as_ref().map(|now| CurrentTrack {
                track: now.track.clone(),
                elapsed: now.elapsed(),
                started_at: now.started_at,
            }),
            upcoming: s.queue.iter().cloned().collect(),
            loop_mode: s.queue.loop_mode(),
            state: s.state,
            volume_percent: (s.volume * 100.0).round() as u16,
            total_duration: s.queue.total_duration(),
        })
    }

    /// La pista que suena, o `NothingPlaying`.
    pub async fn now_playing(&self, guild_id: GuildId) -> MusicResult<CurrentTrack> {
        self.snapshot(guild_id)
            .await?
            .now_playing
            .ok_or(MusicError::NothingPlaying)
    }

    /// Canal de voz donde está el bot en `guild_id`, si está en alguno.
    pub async fn current_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        let session = self.sessions.get(guild_id)?;
        let channel = session.lock().await.channel_id;
        channel
    }

    /// Aplica un fin o fallo de pista. Los eventos con un token que ya no
    /// es el actual se ignoran.
    pub async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        let (guild_id, token) = match &event {
            TransportEvent::TrackEnded { guild_id, token } => (*guild_id, *token),
            TransportEvent::TrackFailed { guild_id, token, .. } => (*guild_id, *token),
        };

        let Some(session) = self.sessions.get(guild_id) else {
            debug!("Evento de pista para guild {} sin sesión", guild_id);
            return;
        };
        let mut s = session.clone().lock_owned().await;

        if s.torn_down || token != s.current_token() {
            debug!(
                "Ignorando evento de pista viejo en guild {} (token {}, actual {})",
                guild_id,
                token,
                s.current_token()
            );
            return;
        }

        let finished = s.now_playing.take().map(|now| now.track);
        match event {
            TransportEvent::TrackEnded { .. } => {
                self.advance(&session, &mut s, finished, EndReason::Finished).await;
            }
            TransportEvent::TrackFailed { reason, .. } => {
                let title = finished.as_ref().map_or("la pista", |t| t.title()).to_string();
                warn!("Falló la reproducción de {} en guild {}: {}", title, guild_id, reason);
                self.report(&s, format!("⚠️ No pude reproducir **{}**, la salto.", title));
                self.advance(&session, &mut s, finished, EndReason::Failed).await;
            }
        }
    }

    /// Se llama en cada cambio de estado de voz de un miembro que no es el
    /// bot. Si el bot queda solo, arma la comprobación diferida.
    pub async fn on_voice_state_update(self: &Arc<Self>, guild_id: GuildId) {
        let Some(session) = self.sessions.get(guild_id) else {
            return;
        };
        let mut s = session.lock().await;
        let Some(channel_id) = s.channel_id else {
            return;
        };

        if self.directory.listener_count(guild_id, channel_id) > 0 {
            s.cancel_alone_check();
            return;
        }
        if s.alone_check_pending() {
            return;
        }

        debug!("Solo en {} (guild {}), esperando {:?}", channel_id, guild_id, self.alone_debounce);
        let cancel = s.arm_alone_check();
        let player = Arc::clone(self);
        let session = Arc::clone(&session);
        let deadline = tokio::time::Instant::now() + self.alone_debounce;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => player.alone_expired(guild_id, session).await,
            }
        });
    }

    /// El bot fue movido a otro canal de voz.
    pub async fn on_bot_moved(&self, guild_id: GuildId, channel_id: ChannelId) {
        if let Some(session) = self.sessions.get(guild_id) {
            let mut s = session.lock().await;
            if s.channel_id.is_some() && s.channel_id != Some(channel_id) {
                info!("Movido al canal {} en guild {}", channel_id, guild_id);
                s.channel_id = Some(channel_id);
            }
        }
    }

    /// Se perdió la conexión de voz del bot. Sólo actúa cuando el motor no
    /// la pidió.
    pub async fn on_bot_disconnected(&self, guild_id: GuildId) {
        let Some(session) = self.sessions.get(guild_id) else {
            return;
        };
        let mut s = session.clone().lock_owned().await;
        if s.torn_down || s.intentional_disconnect || s.channel_id.is_none() {
            return;
        }
        if self.transport.is_connected(guild_id).await {
            return;
        }

        warn!("🔌 Desconectado de voz desde fuera en guild {}", guild_id);
        self.teardown(
            &session,
            &mut s,
            false,
            Some("🔌 Me desconectaron de voz, así que vacié la cola."),
        )
        .await;
    }

    fn session(&self, guild_id: GuildId) -> MusicResult<SharedSession> {
        self.sessions.get(guild_id).ok_or(MusicError::NoSession)
    }

    async fn skip_current(
        self: &Arc<Self>,
        session: &SharedSession,
        s: &mut GuildSession,
    ) -> MusicResult<SkipOutcome> {
        let skipped = s.now_playing.take().ok_or(MusicError::NothingPlaying)?.track;

        // Los eventos tardíos de la pista saltada no deben avanzar otra vez.
        s.next_token();
        if let Err(e) = self.transport.stop(s.guild_id).await {
            warn!("No se pudo detener la pista en guild {}: {}", s.guild_id, e);
        }
        info!("⏭️ Saltada {} en guild {}", skipped.title(), s.guild_id);

        self.advance(session, s, Some(skipped.clone()), EndReason::Skipped).await;
        Ok(SkipOutcome {
            skipped,
            next: s.now_playing.as_ref().map(|now| now.track.clone()),
        })
    }

    /// Arranca lo que la cola diga que sigue. Las pistas que no arrancan se
    /// reportan y cuentan como terminadas. Sin nada más, queda inactivo.
    async fn advance(
        self: &Arc<Self>,
        session: &SharedSession,
        s: &mut GuildSession,
        mut finished: Option<Track>,
        mut reason: EndReason,
    ) {
        let guild_id = s.guild_id;
        s.now_playing = None;

        loop {
            s.votes.clear();

            let Some(track) = s.queue.advance(finished.take(), reason) else {
                s.state = PlayerState::Idle;
                debug!("Cola terminada en guild {}", guild_id);
                self.arm_idle_timer(session, s);
                return;
            };

            let token = s.next_token();
            match self.transport.play(guild_id, &track, token, s.volume).await {
                Ok(()) => {
                    info!("🎵 Reproduciendo {} en guild {}", track.title(), guild_id);
                    s.cancel_idle_timer();
                    s.state = PlayerState::Playing;
                    self.announce(s.guild_id, s.announce_channel, format!("🎵 Reproduciendo {}", track.describe()));
                    s.now_playing = Some(NowPlaying::new(track));
                    return;
                }
                Err(e) => {
                    warn!("No se pudo iniciar {} en guild {}: {}", track.title(), guild_id, e);
                    self.report(s, format!("⚠️ No pude reproducir **{}**: {}", track.title(), e));
                    finished = Some(track);
                    reason = EndReason::Failed;
                }
            }
        }
    }

    fn arm_idle_timer(self: &Arc<Self>, session: &SharedSession, s: &mut GuildSession) {
        let (epoch, cancel) = s.arm_idle_timer();
        let player = Arc::clone(self);
        let session = Arc::clone(session);
        let guild_id = s.guild_id;
        let deadline = tokio::time::Instant::now() + self.idle_timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => player.idle_expired(guild_id, session, epoch).await,
            }
        });
    }

    async fn idle_expired(&self, guild_id: GuildId, session: SharedSession, epoch: u64) {
        let mut s = session.clone().lock_owned().await;
        if s.torn_down || !s.idle_timer_matches(epoch) || !s.is_idle() {
            debug!("El temporizador {} de guild {} ya no aplica", epoch, guild_id);
            return;
        }

        info!("💤 Saliendo de guild {} tras {:?} inactivo", guild_id, self.idle_timeout);
        self.teardown(
            &session,
            &mut s,
            true,
            Some("💤 Salí del canal de voz por inactividad."),
        )
        .await;
    }

    async fn alone_expired(&self, guild_id: GuildId, session: SharedSession) {
        let mut s = session.clone().lock_owned().await;
        if s.torn_down || !s.alone_check_pending() {
            return;
        }
        s.cancel_alone_check();

        let still_alone = s
            .channel_id
            .is_some_and(|channel_id| self.directory.listener_count(guild_id, channel_id) == 0);
        if !still_alone {
            return;
        }

        info!("👋 Todos salieron del canal en guild {}", guild_id);
        self.teardown(
            &session,
            &mut s,
            true,
            Some("👋 Todos salieron del canal de voz, así que yo también."),
        )
        .await;
    }

    /// Termina la sesión definitivamente. Con `leave_voice` se le pide al
    /// transporte que desconecte; si no, la conexión ya no existe.
    async fn teardown(&self, session: &SharedSession, s: &mut GuildSession, leave_voice: bool, message: Option<&str>) {
        let guild_id = s.guild_id;
        if leave_voice {
            s.intentional_disconnect = true;
        }
        s.reset();
        s.torn_down = true;
        s.channel_id = None;

        if leave_voice {
            if let Err(e) = self.transport.disconnect(guild_id).await {
                warn!("No se pudo salir de voz en guild {}: {}", guild_id, e);
            }
        }
        self.sessions.remove(guild_id, session);

        if let Some(message) = message {
            self.announce(guild_id, s.text_channel, message.to_string());
        }
        debug!("Sesión de guild {} cerrada", guild_id);
    }

    /// Los errores van al canal del último comando.
    fn report(&self, s: &GuildSession, text: String) {
        self.announce(s.guild_id, s.text_channel, text);
    }

    fn announce(&self, guild_id: GuildId, preferred: Option<ChannelId>, text: String) {
        let directory = Arc::clone(&self.directory);
        tokio::spawn(async move {
            if let Err(e) = directory.announce(guild_id, preferred, &text).await {
                warn!("No se pudo anunciar en guild {}: {:?}", guild_id, e);
            }
        });
    }
}

fn new_session(guild_id: GuildId, settings: &ServerConfig) -> GuildSession {
    GuildSession::new(
        guild_id,
        settings.max_queue_size,
        f32::from(settings.default_volume.min(200)) / 100.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{
        connection::tests::{FakeDirectory, FakeTransport},
        node::NodeReadiness,
    };
    use crate::cache::SearchCache;
    use crate::sources::{tests::info, MockMusicSource};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    const GUILD: GuildId = GuildId::new(1);
    const VOICE: ChannelId = ChannelId::new(500);
    const TEXT: ChannelId = ChannelId::new(600);
    const REQUESTER: UserId = UserId::new(7);

    struct FixedSettings(ServerConfig);

    #[async_trait]
    impl GuildSettings for FixedSettings {
        async fn server_config(&self, _guild_id: GuildId) -> ServerConfig {
            self.0.clone()
        }
    }

    struct Harness {
        player: Arc<AudioPlayer>,
        transport: Arc<FakeTransport>,
        directory: Arc<FakeDirectory>,
    }

    fn harness() -> Harness {
        harness_with(ServerConfig::for_guild(GUILD.get()))
    }

    fn harness_with(settings: ServerConfig) -> Harness {
        let mut source = MockMusicSource::new();
        source.expect_search().returning(|_, query, _| Ok(vec![info(query, 180)]));
        source.expect_source_name().return_const("mock");

        let transport = Arc::new(FakeTransport::default());
        let directory = Arc::new(FakeDirectory::default());
        directory.join(GUILD, REQUESTER, VOICE);

        let connections = ConnectionManager::new(
            transport.clone(),
            directory.clone(),
            NodeReadiness::ready(),
            Duration::from_secs(5),
            5,
            Duration::from_secs(60),
        );
        let resolver = TrackResolver::new(
            Arc::new(source),
            SearchCache::new(16, Duration::from_secs(60)),
            5,
            Duration::from_secs(5),
        );

        let player = Arc::new(AudioPlayer::new(
            connections,
            transport.clone(),
            directory.clone(),
            Arc::new(resolver),
            Arc::new(FixedSettings(settings)),
            Duration::from_secs(300),
            Duration::from_secs(5),
        ));

        Harness {
            player,
            transport,
            directory,
        }
    }

    fn request(query: &str) -> PlayRequest {
        PlayRequest {
            guild_id: GUILD,
            user_id: REQUESTER,
            text_channel: TEXT,
            query: query.to_string(),
        }
    }

    /// Deja correr las tareas de temporizadores y anuncios.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    impl Harness {
        async fn play(&self, query: &str) -> EnqueueOutcome {
            self.player.enqueue(request(query)).await.unwrap()
        }

        async fn finish_current(&self) {
            let token = self.transport.last_token();
            self.player
                .handle_transport_event(TransportEvent::TrackEnded { guild_id: GUILD, token })
                .await;
        }

        async fn current_title(&self) -> Option<String> {
            self.player
                .snapshot(GUILD)
                .await
                .ok()
                .and_then(|snap| snap.now_playing)
                .map(|current| current.track.title().to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_enqueue_starts_playback() {
        let h = harness();
        let first = h.play("song a").await;
        let second = h.play("song b").await;

        assert_eq!(first.position, None);
        assert_eq!(second.position, Some(1));
        assert_eq!(h.transport.played_titles(), vec!["song a"]);
        assert_eq!(h.current_title().await.as_deref(), Some("song a"));

        h.finish_current().await;
        assert_eq!(h.transport.played_titles(), vec!["song a", "song b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_end_event_is_ignored() {
        let h = harness();
        h.play("a").await;
        h.play("b").await;
        h.play("c").await;

        let old_token = h.transport.last_token();
        h.player.skip(GUILD).await.unwrap();
        assert_eq!(h.current_title().await.as_deref(), Some("b"));

        // El transporte reporta después el fin de la pista saltada.
        h.player
            .handle_transport_event(TransportEvent::TrackEnded {
                guild_id: GUILD,
                token: old_token,
            })
            .await;
        assert_eq!(h.current_title().await.as_deref(), Some("b"));
        assert_eq!(h.transport.played_titles(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_current_replays_until_skipped() {
        let h = harness();
        h.play("loop me").await;
        h.play("after").await;
        h.player.set_repeat(GUILD, LoopMode::Track).await.unwrap();

        for _ in 0..3 {
            h.finish_current().await;
        }
        assert_eq!(h.transport.played_titles(), vec!["loop me"; 4]);
        assert_eq!(h.player.snapshot(GUILD).await.unwrap().upcoming.len(), 1);

        let skipped = h.player.skip(GUILD).await.unwrap();
        assert_eq!(skipped.next.unwrap().title(), "after");
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_queue_rotates() {
        let h = harness();
        h.play("a").await;
        h.play("b").await;
        h.player.set_repeat(GUILD, LoopMode::Queue).await.unwrap();

        for _ in 0..4 {
            h.finish_current().await;
        }
        assert_eq!(h.transport.played_titles(), vec!["a", "b", "a", "b", "a"]);
        assert_eq!(h.player.snapshot(GUILD).await.unwrap().upcoming.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn vote_skip_needs_half_of_listeners() {
        let h = harness();
        for user in 1..=3 {
            h.directory.join(GUILD, UserId::new(user), VOICE);
        }
        h.play("first").await;
        h.play("second").await;

        let one = h.player.vote_skip(GUILD, UserId::new(1)).await.unwrap();
        assert_eq!((one.count, one.needed, one.skipped), (1, 2, false));

        let again = h.player.vote_skip(GUILD, UserId::new(1)).await.unwrap();
        assert!(!again.added);
        assert!(!again.skipped);

        let two = h.player.vote_skip(GUILD, UserId::new(2)).await.unwrap();
        assert!(two.skipped);
        assert_eq!(h.current_title().await.as_deref(), Some("second"));

        // Con la pista nueva empieza otra ronda de votos.
        let three = h.player.vote_skip(GUILD, UserId::new(3)).await.unwrap();
        assert_eq!((three.count, three.skipped), (1, false));
    }

    #[tokio::test(start_paused = true)]
    async fn vote_from_outside_channel_is_rejected() {
        let h = harness();
        h.play("song").await;
        let err = h.player.vote_skip(GUILD, UserId::new(99)).await.unwrap_err();
        assert_eq!(err, MusicError::NotListening);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_disconnects_once() {
        let h = harness();
        h.play("only").await;
        h.finish_current().await;
        assert!(h.transport.is_connected(GUILD).await);

        tokio::time::advance(Duration::from_secs(299)).await;
        settle().await;
        assert!(h.transport.is_connected(GUILD).await);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(!h.transport.is_connected(GUILD).await);
        assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(h.player.active_sessions(), 0);

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_before_timeout_cancels_idle_timer() {
        let h = harness();
        h.play("first").await;
        h.finish_current().await;

        tokio::time::advance(Duration::from_secs(299)).await;
        settle().await;
        h.play("second").await;

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert!(h.transport.is_connected(GUILD).await);
        assert_eq!(h.current_title().await.as_deref(), Some("second"));
        assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_track_is_reported_and_skipped() {
        let h = harness();
        h.play("broken").await;
        h.play("fine").await;
        h.player.set_repeat(GUILD, LoopMode::Track).await.unwrap();

        let token = h.transport.last_token();
        h.player
            .handle_transport_event(TransportEvent::TrackFailed {
                guild_id: GUILD,
                token,
                reason: "403".to_string(),
            })
            .await;
        settle().await;

        assert_eq!(h.current_title().await.as_deref(), Some("fine"));
        assert!(h.directory.announced().iter().any(|text| text.contains("No pude reproducir **broken**")));
    }

    #[tokio::test(start_paused = true)]
    async fn start_failures_fall_through_to_idle() {
        let h = harness();
        h.transport.fail_play.store(true, Ordering::SeqCst);
        h.play("nope").await;
        settle().await;

        let snapshot = h.player.snapshot(GUILD).await.unwrap();
        assert_eq!(snapshot.state, PlayerState::Idle);
        assert!(snapshot.now_playing.is_none());
        assert!(!h.directory.announced().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn leaves_after_everyone_goes() {
        let h = harness();
        h.play("song").await;

        h.directory.leave(GUILD, REQUESTER);
        h.player.on_voice_state_update(GUILD).await;
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert!(h.transport.is_connected(GUILD).await);

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert!(!h.transport.is_connected(GUILD).await);
        assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 1);

        // El eco del gateway de nuestra propia desconexión no cambia nada.
        h.player.on_bot_disconnected(GUILD).await;
        assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn returning_listener_cancels_alone_check() {
        let h = harness();
        h.play("song").await;

        h.directory.leave(GUILD, REQUESTER);
        h.player.on_voice_state_update(GUILD).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        h.directory.join(GUILD, REQUESTER, VOICE);
        h.player.on_voice_state_update(GUILD).await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert!(h.transport.is_connected(GUILD).await);
    }

    #[tokio::test(start_paused = true)]
    async fn external_disconnect_tears_down_without_transport_call() {
        let h = harness();
        h.play("song").await;
        h.play("next").await;

        // Un moderador lo echó de voz.
        h.transport.connected.lock().remove(&GUILD);
        h.player.on_bot_disconnected(GUILD).await;

        assert_eq!(h.player.active_sessions(), 0);
        assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(h.player.snapshot(GUILD).await.unwrap_err(), MusicError::NoSession);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_and_disconnects() {
        let h = harness();
        h.play("a").await;
        h.play("b").await;
        h.player.stop(GUILD).await.unwrap();

        assert!(!h.transport.is_connected(GUILD).await);
        assert_eq!(h.player.active_sessions(), 0);

        // Volver a reproducir crea una sesión nueva.
        h.play("c").await;
        assert_eq!(h.current_title().await.as_deref(), Some("c"));
        assert!(h.player.snapshot(GUILD).await.unwrap().upcoming.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn requester_outside_voice_gets_refusal() {
        let h = harness();
        h.directory.leave(GUILD, REQUESTER);
        let err = h.player.enqueue(request("song")).await.unwrap_err();
        assert!(matches!(err, MusicError::ConnectionRefused(_)));
        assert_eq!(h.player.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_join_keeps_guild_in_cooldown() {
        let h = harness();
        h.transport.fail_connect.store(true, Ordering::SeqCst);
        assert!(h.player.enqueue(request("first")).await.is_err());
        // La sesión fallida desaparece, el enfriamiento no.
        assert_eq!(h.player.active_sessions(), 0);

        h.transport.fail_connect.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(10)).await;
        let err = h.player.enqueue(request("retry")).await.unwrap_err();
        assert!(matches!(err, MusicError::ConnectionRefused(_)));
        assert!(err.to_string().contains("inténtalo de nuevo en"));
        assert!(h.transport.played_titles().is_empty());

        tokio::time::advance(Duration::from_secs(51)).await;
        h.play("later").await;
        assert_eq!(h.current_title().await.as_deref(), Some("later"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_is_refused() {
        let h = harness_with(ServerConfig {
            max_queue_size: 1,
            ..ServerConfig::for_guild(GUILD.get())
        });
        h.play("playing").await;
        h.play("waiting").await;
        let err = h.player.enqueue(request("overflow")).await.unwrap_err();
        assert_eq!(err, MusicError::QueueFull(1));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_elapsed_and_volume_is_clamped() {
        let h = harness();
        h.play("song").await;

        tokio::time::advance(Duration::from_secs(20)).await;
        h.player.pause(GUILD).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;

        let current = h.player.now_playing(GUILD).await.unwrap();
        assert_eq!(current.elapsed.as_secs(), 20);

        h.player.resume(GUILD).await.unwrap();
        assert_eq!(h.player.set_volume(GUILD, 350).await.unwrap(), 200);
        assert_eq!(*h.transport.volume.lock(), Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_to_jumps_ahead() {
        let h = harness();
        for title in ["a", "b", "c", "d"] {
            h.play(title).await;
        }
        let outcome = h.player.skip_to(GUILD, 2).await.unwrap();
        assert_eq!(outcome.skipped.title(), "a");
        assert_eq!(outcome.next.unwrap().title(), "c");

        let upcoming: Vec<_> = h
            .player
            .snapshot(GUILD)
            .await
            .unwrap()
            .upcoming
            .iter()
            .map(|t| t.title().to_string())
            .collect();
        assert_eq!(upcoming, vec!["d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_leaves_every_guild() {
        let h = harness();
        let other = GuildId::new(2);
        h.directory.join(other, REQUESTER, VOICE);

        h.play("here").await;
        h.player
            .enqueue(PlayRequest {
                guild_id: other,
                ..request("there")
            })
            .await
            .unwrap();
        assert_eq!(h.transport.active_connections().await, 2);

        h.player.shutdown().await;
        assert_eq!(h.transport.active_connections().await, 0);
        assert_eq!(h.player.active_sessions(), 0);
    }
}
