use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::CaptureBackend;
use crate::config::Config;
use crate::health::HealthMetrics;
use crate::publish::Publisher;
use crate::session::supervisor::{StateHandle, Supervisor};

/// Agent orchestrates the health server, the publisher and the capture
/// supervisor.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    publisher: Publisher,
    supervisor: Option<JoinHandle<()>>,
    state: Option<StateHandle>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent after checking the environment it will run in.
    pub fn new(cfg: Config) -> Result<Self> {
        check_environment(&cfg)?;

        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let publisher = Publisher::new(cfg.publish.clone(), Arc::clone(&health));

        Ok(Self {
            cfg,
            health,
            publisher,
            supervisor: None,
            state: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Supervisor state, once started.
    pub fn state(&self) -> Option<&StateHandle> {
        self.state.as_ref()
    }

    /// Start all components.
    pub async fn start(&mut self) -> Result<()> {
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        self.publisher
            .start(self.cancel.child_token())
            .await
            .context("starting publisher")?;
        let handle = self
            .publisher
            .handle()
            .context("publisher has no queue after start")?;

        let mut capture = CaptureBackend::from_config(&self.cfg.capture);
        let health = Arc::clone(&self.health);
        capture.on_parse_error(Arc::new(move |_| health.events_dropped.inc()));

        let mut supervisor = Supervisor::new(
            self.cfg.session.clone(),
            capture,
            handle,
            Arc::clone(&self.health),
        );
        self.state = Some(supervisor.state());

        let ctx = self.cancel.child_token();
        self.supervisor = Some(tokio::spawn(async move {
            supervisor.run(ctx).await;
        }));

        info!(
            node = %self.cfg.publish.node_name,
            interval_secs = self.cfg.session.interval_secs(),
            capture = ?self.cfg.capture.kind,
            "agent started",
        );

        Ok(())
    }

    /// Graceful shutdown: stop the supervisor, drain the publisher, stop
    /// the health server.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.supervisor.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "supervisor task join failed");
            }
        }

        if let Err(e) = self.publisher.stop().await {
            warn!(error = %e, "stopping publisher");
        }

        self.health.stop().await?;

        info!("agent stopped");
        Ok(())
    }
}

/// Fails fast on an environment the pipeline cannot run in.
fn check_environment(cfg: &Config) -> Result<()> {
    if cfg.publish.transport_override.trim().is_empty() {
        check_socket(&cfg.publish.socket)?;
    }

    Ok(())
}

fn check_socket(path: &Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let meta = std::fs::metadata(path)
        .with_context(|| format!("collectd socket {} is not available", path.display()))?;

    if !meta.file_type().is_socket() {
        bail!("{} is not a unix socket", path.display());
    }

    Ok(())
}
