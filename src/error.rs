use thiserror::Error;

/// Errores del núcleo de reproducción.
///
/// El texto de `Display` es lo que la capa de comandos muestra en el chat,
/// así que cada mensaje está escrito para quien ejecutó el comando.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MusicError {
    /// Límite global, enfriamiento, usuario fuera de voz o backend caído.
    #[error("No puedo conectarme: {0}")]
    ConnectionRefused(String),

    #[error("No encontré nada: {0}")]
    NotFound(String),

    /// Fallo transitorio del resolvedor o del transporte.
    #[error("El backend de audio falló, inténtalo más tarde ({0})")]
    Backend(String),

    #[error("Falló la reproducción: {0}")]
    TrackPlayback(String),

    #[error("No hay nada reproduciéndose ahora mismo")]
    NothingPlaying,

    #[error("Tienes que estar escuchando en mi canal de voz")]
    NotListening,

    #[error("La cola está llena (máximo {0} pistas)")]
    QueueFull(usize),

    #[error("No hay ninguna pista en la posición {0}")]
    InvalidPosition(usize),

    #[error("No estoy conectado a voz en este servidor")]
    NoSession,
}

impl MusicError {
    /// Errores que el usuario puede resolver; el resto se registra como
    /// advertencia.
    pub fn is_user_error(&self) -> bool {
        !matches!(self, MusicError::Backend(_) | MusicError::TrackPlayback(_))
    }
}

pub type MusicResult<T> = std::result::Result<T, MusicError>;
