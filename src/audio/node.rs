use async_process::{Child, Command, Stdio};
use async_trait::async_trait;
use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::{watch, Mutex}};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{MusicError, MusicResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Ready,
    Failed,
}

/// Señal de disponibilidad, de un solo disparo, para todo lo que necesita el nodo.
#[derive(Debug, Clone)]
pub struct NodeReadiness {
    rx: watch::Receiver<NodeStatus>,
}

impl NodeReadiness {
    /// Ya señalada; para cuando no corre ningún supervisor.
    pub fn ready() -> Self {
        let (_tx, rx) = watch::channel(NodeStatus::Ready);
        Self { rx }
    }

    pub fn status(&self) -> NodeStatus {
        *self.rx.borrow()
    }

    /// Espera a que termine el arranque, rindiéndose tras `timeout`.
    pub async fn wait(&self, timeout: Duration) -> MusicResult<()> {
        let mut rx = self.rx.clone();
        let status = match tokio::time::timeout(timeout, rx.wait_for(|s| *s != NodeStatus::Pending)).await {
            Ok(Ok(status)) => *status,
            // El supervisor desapareció antes de decidir.
            Ok(Err(_)) => NodeStatus::Failed,
            Err(_) => {
                return Err(MusicError::ConnectionRefused(
                    "el backend de audio todavía está arrancando, inténtalo en un momento".to_string(),
                ))
            }
        };

        match status {
            NodeStatus::Ready => Ok(()),
            _ => Err(MusicError::ConnectionRefused("el backend de audio no está disponible".to_string())),
        }
    }
}

/// Chequeo de salud contra el nodo de audio.
#[async_trait]
pub trait NodeProbe: Send + Sync {
    /// Devuelve la versión del nodo cuando responde.
    async fn probe(&self) -> anyhow::Result<String>;
}

/// Sondea `GET /version` en un nodo Lavalink.
pub struct LavalinkProbe {
    http: reqwest::Client,
    base_url: String,
    password: String,
}

impl LavalinkProbe {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(Duration::from_secs(5)).build()?,
            base_url: config.lavalink_base_url(),
            password: config.lavalink_password.clone(),
        })
    }
}

#[async_trait]
impl NodeProbe for LavalinkProbe {
    async fn probe(&self) -> anyhow::Result<String> {
        let version = self
            .http
            .get(format!("{}/version", self.base_url))
            .header("Authorization", &self.password)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(version.trim().to_string())
    }
}

/// Cómo lanzar un nodo local cuando ninguno responde.
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub java: String,
    pub jar: PathBuf,
    pub host: String,
    pub port: u16,
    pub start_timeout: Duration,
}

/// Levanta el nodo de audio una vez al inicio y publica su disponibilidad.
pub struct NodeSupervisor {
    probe: Arc<dyn NodeProbe>,
    attempts: u32,
    retry_delay: Duration,
    local: Option<LocalNode>,
    status: watch::Sender<NodeStatus>,
    process: Mutex<Option<Child>>,
}

impl NodeSupervisor {
    pub fn new(probe: Arc<dyn NodeProbe>, attempts: u32, retry_delay: Duration, local: Option<LocalNode>) -> Self {
        let (status, _) = watch::channel(NodeStatus::Pending);
        Self {
            probe,
            attempts: attempts.max(1),
            retry_delay,
            local,
            status,
            process: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let local = config.lavalink_autostart.then(|| LocalNode {
            java: config.java_path.clone(),
            jar: config.lavalink_jar.clone(),
            host: config.lavalink_host.clone(),
            port: config.lavalink_port,
            start_timeout: config.node_start_timeout,
        });

        Ok(Self::new(
            Arc::new(LavalinkProbe::new(config)?),
            config.node_connect_attempts,
            config.node_retry_delay,
            local,
        ))
    }

    pub fn readiness(&self) -> NodeReadiness {
        NodeReadiness {
            rx: self.status.subscribe(),
        }
    }

    /// Ejecuta el arranque y publica el resultado. Una vez `Ready` el estado
    /// no retrocede.
    pub async fn ensure_ready(&self) -> NodeStatus {
        self.ensure_ready_then(|| async { Ok(()) }).await
    }

    /// Como [`Self::ensure_ready`], pero `attach` corre cuando el nodo
    /// responde y antes de publicar `Ready`; si falla, el estado es `Failed`.
    pub async fn ensure_ready_then<F, Fut>(&self, attach: F) -> NodeStatus
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if *self.status.borrow() == NodeStatus::Ready {
            return NodeStatus::Ready;
        }

        let mut ready = self.connect_with_retries().await;

        if !ready {
            if let Some(local) = &self.local {
                match self.launch_local_node(local).await {
                    Ok(()) => ready = self.connect_with_retries().await,
                    Err(e) => error!("No se pudo iniciar el nodo de audio local: {:?}", e),
                }
            }
        }

        if ready {
            if let Err(e) = attach().await {
                error!("❌ El nodo respondió pero no se pudo conectar el cliente: {:?}", e);
                ready = false;
            }
        } else {
            error!(
                "Backend de audio inalcanzable tras {} intentos; se rechazarán las conexiones de voz",
                self.attempts
            );
        }

        let status = if ready { NodeStatus::Ready } else { NodeStatus::Failed };
        self.status.send_replace(status);
        status
    }

    /// Vuelve a sondear el nodo periódicamente una vez arriba. Los fallos
    /// sólo se registran; la disponibilidad nunca se retira.
    pub async fn watch_health(self: Arc<Self>, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        let mut healthy = true;

        loop {
            interval.tick().await;
            if *self.status.borrow() != NodeStatus::Ready {
                continue;
            }
            match self.probe.probe().await {
                Ok(_) if !healthy => {
                    info!("Backend de audio alcanzable de nuevo");
                    healthy = true;
                }
                Ok(_) => {}
                Err(e) if healthy => {
                    warn!("El backend de audio dejó de responder: {}", e);
                    healthy = false;
                }
                Err(e) => debug!("Backend de audio sigue caído: {}", e),
            }
        }
    }

    async fn connect_with_retries(&self) -> bool {
        for attempt in 1..=self.attempts {
            match self.probe.probe().await {
                Ok(version) => {
                    info!("Conectado al backend de audio (versión {})", version);
                    return true;
                }
                Err(e) => {
                    warn!("Sondeo {}/{} del backend de audio falló: {}", attempt, self.attempts, e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        false
    }

    async fn launch_local_node(&self, local: &LocalNode) -> anyhow::Result<()> {
        info!("Iniciando nodo de audio local: {} -jar {}", local.java, local.jar.display());

        let workdir = local
            .jar
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let child = Command::new(&local.java)
            .arg("-jar")
            .arg(&local.jar)
            .current_dir(workdir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        *self.process.lock().await = Some(child);

        let deadline = tokio::time::Instant::now() + local.start_timeout;
        while tokio::time::Instant::now() < deadline {
            if TcpStream::connect((local.host.as_str(), local.port)).await.is_ok() {
                info!("Nodo de audio local escuchando en {}:{}", local.host, local.port);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        anyhow::bail!(
            "el nodo local no abrió {}:{} en {}",
            local.host,
            local.port,
            humantime::format_duration(local.start_timeout)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProbe {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyProbe {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl NodeProbe for FlakyProbe {
        async fn probe(&self) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("connection refused");
            }
            Ok("4.0.8".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn becomes_ready_after_retries() {
        let probe = FlakyProbe::new(2);
        let supervisor = NodeSupervisor::new(probe.clone(), 3, Duration::from_secs(5), None);
        let readiness = supervisor.readiness();

        assert_eq!(supervisor.ensure_ready().await, NodeStatus::Ready);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert!(readiness.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let probe = FlakyProbe::new(10);
        let supervisor = NodeSupervisor::new(probe.clone(), 3, Duration::from_secs(5), None);
        let readiness = supervisor.readiness();

        assert_eq!(supervisor.ensure_ready().await, NodeStatus::Failed);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            readiness.wait(Duration::from_secs(1)).await,
            Err(MusicError::ConnectionRefused(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_time_out_while_pending() {
        let supervisor = NodeSupervisor::new(FlakyProbe::new(0), 1, Duration::from_secs(1), None);
        let readiness = supervisor.readiness();
        assert_eq!(readiness.status(), NodeStatus::Pending);

        let err = readiness.wait(Duration::from_secs(2)).await.unwrap_err();
        assert!(err.to_string().contains("todavía está arrancando"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_client_attach_marks_node_failed() {
        let supervisor = NodeSupervisor::new(FlakyProbe::new(0), 1, Duration::from_secs(1), None);
        let readiness = supervisor.readiness();

        let status = supervisor
            .ensure_ready_then(|| async { anyhow::bail!("handshake rejected") })
            .await;
        assert_eq!(status, NodeStatus::Failed);
        assert!(readiness.wait(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_waits_for_client_attach() {
        let supervisor = NodeSupervisor::new(FlakyProbe::new(0), 1, Duration::from_secs(1), None);
        let readiness = supervisor.readiness();
        let seen = readiness.clone();

        let status = supervisor
            .ensure_ready_then(|| async move {
                assert_eq!(seen.status(), NodeStatus::Pending);
                Ok(())
            })
            .await;
        assert_eq!(status, NodeStatus::Ready);
        assert_eq!(readiness.status(), NodeStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_wake_when_bootstrap_finishes() {
        let supervisor = Arc::new(NodeSupervisor::new(FlakyProbe::new(1), 2, Duration::from_secs(3), None));
        let readiness = supervisor.readiness();

        let waiter = tokio::spawn(async move { readiness.wait(Duration::from_secs(30)).await });
        supervisor.ensure_ready().await;
        assert!(waiter.await.unwrap().is_ok());
    }
}
