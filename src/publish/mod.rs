pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::sample::{MetricSample, WindowSnapshot};
use crate::config::PublishConfig;
use crate::health::HealthMetrics;

use self::transport::Transport;

/// Formats one sample as a collectd `PUTVAL` command, newline included.
pub fn format_putval(node: &str, interval_secs: u64, sample: &MetricSample) -> String {
    format!(
        "PUTVAL \"{}/{}\" interval={} {}:{}\n",
        node,
        sample.key.metric_path(),
        interval_secs,
        sample.timestamp,
        sample.value,
    )
}

/// Formats every sample of a window, in snapshot order.
pub fn format_window(node: &str, snapshot: &WindowSnapshot) -> Vec<String> {
    let interval_secs = snapshot.interval.as_secs();
    snapshot
        .samples
        .iter()
        .map(|s| format_putval(node, interval_secs, s))
        .collect()
}

/// Cheap handle used by sessions to hand windows to the publisher.
///
/// Never blocks: when the queue is full the window is dropped.
#[derive(Clone)]
pub struct PublisherHandle {
    tx: mpsc::Sender<WindowSnapshot>,
    health: Arc<HealthMetrics>,
}

impl PublisherHandle {
    /// Enqueues a window. Returns false if it was dropped.
    pub fn publish(&self, snapshot: WindowSnapshot) -> bool {
        let samples = snapshot.len();
        match self.tx.try_send(snapshot) {
            Ok(()) => true,
            Err(TrySendError::Full(snap)) => {
                self.health.publish_windows_dropped.inc();
                warn!(
                    timestamp = snap.timestamp,
                    samples, "publish queue full, dropping window"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.health.publish_windows_dropped.inc();
                warn!(samples, "publisher stopped, dropping window");
                false
            }
        }
    }
}

/// Background writer of aggregated windows.
///
/// Windows go through a bounded queue to a single worker that formats them
/// and writes them to the transport with a per-window timeout.
pub struct Publisher {
    cfg: PublishConfig,
    health: Arc<HealthMetrics>,
    tx: Option<mpsc::Sender<WindowSnapshot>>,
    task: Option<JoinHandle<()>>,
}

impl Publisher {
    pub fn new(cfg: PublishConfig, health: Arc<HealthMetrics>) -> Self {
        Self {
            cfg,
            health,
            tx: None,
            task: None,
        }
    }

    /// Starts the worker with the transport selected by configuration.
    pub async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let transport = Transport::from_config(&self.cfg).context("creating transport")?;
        self.start_with(ctx, transport)
    }

    /// Starts the worker on an explicit transport.
    pub fn start_with(&mut self, ctx: CancellationToken, transport: Transport) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.cfg.queue_size.max(1));

        info!(
            transport = transport.name(),
            node = %self.cfg.node_name,
            queue_size = self.cfg.queue_size,
            "publisher started",
        );

        let worker = Worker {
            node: self.cfg.node_name.clone(),
            export_timeout: self.cfg.export_timeout,
            transport,
            health: Arc::clone(&self.health),
        };

        self.task = Some(tokio::spawn(worker.run(ctx, rx)));
        self.tx = Some(tx);

        Ok(())
    }

    /// Returns a handle for enqueuing windows, if started.
    pub fn handle(&self) -> Option<PublisherHandle> {
        self.tx.as_ref().map(|tx| PublisherHandle {
            tx: tx.clone(),
            health: Arc::clone(&self.health),
        })
    }

    /// Stops accepting windows and waits for queued ones to be written.
    pub async fn stop(&mut self) -> Result<()> {
        self.tx.take();
        if let Some(task) = self.task.take() {
            task.await.context("joining publisher worker")?;
        }
        Ok(())
    }
}

struct Worker {
    node: String,
    export_timeout: Duration,
    transport: Transport,
    health: Arc<HealthMetrics>,
}

impl Worker {
    async fn run(mut self, ctx: CancellationToken, mut rx: mpsc::Receiver<WindowSnapshot>) {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    // Drain what was already queued.
                    while let Ok(snapshot) = rx.try_recv() {
                        self.write(&snapshot).await;
                    }
                    break;
                }
                item = rx.recv() => {
                    match item {
                        Some(snapshot) => self.write(&snapshot).await,
                        None => break,
                    }
                }
            }
        }

        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "closing transport");
        }
        debug!("publisher worker stopped");
    }

    async fn write(&mut self, snapshot: &WindowSnapshot) {
        if snapshot.is_empty() {
            return;
        }

        let lines = format_window(&self.node, snapshot);

        match tokio::time::timeout(self.export_timeout, self.transport.write_batch(&lines)).await
        {
            Ok(Ok(())) => {
                self.health.samples_published.inc_by(lines.len() as f64);
                debug!(
                    timestamp = snapshot.timestamp,
                    samples = lines.len(),
                    "window published"
                );
            }
            Ok(Err(e)) => {
                self.health.publish_errors.inc();
                error!(
                    error = %e,
                    timestamp = snapshot.timestamp,
                    samples = lines.len(),
                    "publishing window failed, dropping remaining samples"
                );
            }
            Err(_) => {
                self.health.publish_errors.inc();
                error!(
                    timeout = ?self.export_timeout,
                    timestamp = snapshot.timestamp,
                    "publishing window timed out, abandoning write"
                );
            }
        }
    }
}
