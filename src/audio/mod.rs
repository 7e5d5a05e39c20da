//! # Módulo de Audio
//!
//! Motor de reproducción por guild.
//!
//! - [`session`] - estado de cada guild y el almacén que lo posee
//! - [`queue`] - pistas pendientes, modos de repetición y edición de la cola
//! - [`vote`] - conteo de votos para saltar
//! - [`connection`] - admisión a voz: nodo listo, límite global, enfriamiento
//! - [`node`] - arranque del nodo Lavalink y señal de disponibilidad
//! - [`player`] - el motor que lo une todo
//! - [`transport`] - traits por los que el reproductor maneja voz y guilds
//! - [`lavalink`] - transporte sobre jugadores de Lavalink
//! - [`directory`] - consultas de miembros en la caché de serenity
//!
//! Toda mutación de la sesión de un guild ocurre bajo el lock de esa sesión:
//! comandos, eventos de pista y temporizadores de un mismo guild se
//! serializan mientras los demás guilds avanzan por su cuenta.

pub mod connection;
pub mod directory;
pub mod lavalink;
pub mod node;
pub mod player;
pub mod queue;
pub mod session;
pub mod transport;
pub mod vote;
