pub mod scheduler;
pub mod supervisor;

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::Aggregator;
use crate::capture::{Capture, EventStream};
use crate::clock::SessionClock;
use crate::config::SessionConfig;
use crate::health::HealthMetrics;
use crate::ident::IdentifierEncoder;
use crate::publish::PublisherHandle;

use self::scheduler::TickScheduler;

/// How a capture session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Reached `max_intervals` windows.
    Completed,
    /// The capture stream closed without an error.
    Ended,
    /// The capture failed to start or failed while running.
    Failed(anyhow::Error),
    /// Shutdown was requested.
    Cancelled,
}

impl SessionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// One bounded capture session.
///
/// Owns a fresh identifier encoder and aggregator; both are discarded with
/// the session, so a restart recomputes every encoding and starts from empty
/// accumulators. A window still open when the session ends is dropped.
pub struct Session {
    cfg: SessionConfig,
    encoder: Arc<IdentifierEncoder>,
    aggregator: Aggregator,
    publisher: PublisherHandle,
    health: Arc<HealthMetrics>,
    reported_misses: u64,
}

impl Session {
    pub fn new(cfg: &SessionConfig, publisher: PublisherHandle, health: Arc<HealthMetrics>) -> Self {
        let encoder = Arc::new(IdentifierEncoder::new());
        let aggregator = Aggregator::new(cfg.interval, Arc::clone(&encoder));

        Self {
            cfg: cfg.clone(),
            encoder,
            aggregator,
            publisher,
            health,
            reported_misses: 0,
        }
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Runs the session to completion.
    ///
    /// `on_running` is called once the capture has started. The capture is
    /// always stopped before this returns.
    pub async fn run<C, F>(
        &mut self,
        capture: &mut C,
        ctx: &CancellationToken,
        on_running: F,
    ) -> SessionOutcome
    where
        C: Capture,
        F: FnOnce(),
    {
        let cancel = ctx.child_token();

        let outcome = match capture.start(cancel.clone(), self.cfg.event_buffer).await {
            Ok(events) => {
                on_running();
                info!(
                    capture = capture.name(),
                    interval = ?self.cfg.interval,
                    max_intervals = self.cfg.max_intervals,
                    "capture session running",
                );
                self.drive(events, &cancel).await
            }
            Err(e) => SessionOutcome::Failed(e),
        };

        cancel.cancel();
        if let Err(e) = capture.stop().await {
            warn!(capture = capture.name(), error = %e, "stopping capture");
        }

        self.health
            .identifier_cache_size
            .set(self.encoder.len() as f64);

        outcome
    }

    async fn drive(&mut self, mut events: EventStream, cancel: &CancellationToken) -> SessionOutcome {
        let clock = SessionClock::new();
        let mut scheduler = TickScheduler::new(self.cfg.interval, self.cfg.max_intervals);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(windows = scheduler.fired(), "session cancelled");
                    return SessionOutcome::Cancelled;
                }

                tick = scheduler.tick() => {
                    self.flush(clock.now_epoch_secs());
                    if tick.last {
                        debug!(windows = tick.window, "session reached window limit");
                        return SessionOutcome::Completed;
                    }
                }

                item = events.recv() => {
                    match item {
                        Some(Ok(event)) => {
                            self.aggregator.record(&event);
                            self.health.events_received.inc();
                        }
                        Some(Err(e)) => return SessionOutcome::Failed(e.into()),
                        None => return SessionOutcome::Ended,
                    }
                }
            }
        }
    }

    /// Closes the current window and hands it to the publisher.
    fn flush(&mut self, timestamp: u64) {
        let started = Instant::now();

        let snapshot = self.aggregator.snapshot_and_reset(timestamp);

        debug!(
            timestamp,
            reads = snapshot.reads(),
            writes = snapshot.writes,
            samples = snapshot.len(),
            cache_hits = self.encoder.hits(),
            "window closed",
        );

        let misses = self.encoder.misses();
        self.health
            .identifier_cache_misses
            .inc_by(misses.saturating_sub(self.reported_misses) as f64);
        self.reported_misses = misses;
        self.health
            .identifier_cache_size
            .set(self.encoder.len() as f64);

        if !snapshot.is_empty() {
            self.publisher.publish(snapshot);
        }

        self.health.windows_flushed.inc();
        self.health
            .flush_duration
            .observe(started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use anyhow::Result;
    use tokio::sync::mpsc;

    use crate::capture::event::{OpKind, OperationEvent};
    use crate::capture::CaptureError;
    use crate::publish::Publisher;
    use crate::publish::transport::{StreamTransport, Transport};
    use crate::config::PublishConfig;

    /// Capture fed from a test-held channel.
    struct ChannelCapture {
        rx: Option<EventStream>,
        fail_start: bool,
        stopped: bool,
    }

    impl Capture for ChannelCapture {
        fn name(&self) -> &str {
            "channel"
        }

        async fn start(&mut self, _ctx: CancellationToken, _buffer: usize) -> Result<EventStream> {
            if self.fail_start {
                anyhow::bail!("capture facility unavailable");
            }
            self.rx.take().ok_or_else(|| anyhow::anyhow!("already started"))
        }

        async fn stop(&mut self) -> Result<()> {
            self.stopped = true;
            Ok(())
        }
    }

    fn event() -> OperationEvent {
        OperationEvent {
            pool_guid: 1,
            dataset_guid: 2,
            kind: OpKind::Write,
            bytes: 4096,
            start_ns: 0,
            end_ns: 50_000,
        }
    }

    fn session_cfg(max_intervals: u32) -> SessionConfig {
        SessionConfig {
            interval: Duration::from_secs(1),
            max_intervals,
            ..Default::default()
        }
    }

    fn publisher(health: &Arc<HealthMetrics>) -> (Publisher, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut publisher = Publisher::new(
            PublishConfig {
                node_name: "n".to_string(),
                ..Default::default()
            },
            Arc::clone(health),
        );
        publisher
            .start_with(
                CancellationToken::new(),
                Transport::Stream(StreamTransport::from_writer("duplex", client)),
            )
            .expect("start");
        (publisher, server)
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_completes_after_max_intervals() {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let (publisher, _server) = publisher(&health);
        let (tx, rx) = mpsc::channel(16);
        let mut capture = ChannelCapture {
            rx: Some(rx),
            fail_start: false,
            stopped: false,
        };

        tx.send(Ok(event())).await.expect("send");

        let mut session = Session::new(
            &session_cfg(2),
            publisher.handle().expect("handle"),
            Arc::clone(&health),
        );
        let mut running = false;
        let outcome = session
            .run(&mut capture, &CancellationToken::new(), || running = true)
            .await;

        assert!(matches!(outcome, SessionOutcome::Completed));
        assert!(running);
        assert!(capture.stopped);
        assert_eq!(health.windows_flushed.get(), 2.0);
        assert_eq!(health.events_received.get(), 1.0);
        assert_eq!(health.identifier_cache_misses.get(), 2.0);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_error_fails_session_and_drops_window() {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let (publisher, _server) = publisher(&health);
        let (tx, rx) = mpsc::channel(16);
        let mut capture = ChannelCapture {
            rx: Some(rx),
            fail_start: false,
            stopped: false,
        };

        tx.send(Ok(event())).await.expect("send");
        tx.send(Err(CaptureError::Exited {
            status: "exit status: 1".to_string(),
        }))
        .await
        .expect("send");

        let mut session = Session::new(
            &session_cfg(50),
            publisher.handle().expect("handle"),
            Arc::clone(&health),
        );
        let outcome = session
            .run(&mut capture, &CancellationToken::new(), || {})
            .await;

        assert!(outcome.is_failure());
        assert!(capture.stopped);
        assert_eq!(health.windows_flushed.get(), 0.0);
        assert_eq!(session.aggregator().pending_events(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_stream_ends_session() {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let (publisher, _server) = publisher(&health);
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let mut capture = ChannelCapture {
            rx: Some(rx),
            fail_start: false,
            stopped: false,
        };

        let mut session = Session::new(
            &session_cfg(50),
            publisher.handle().expect("handle"),
            Arc::clone(&health),
        );
        let outcome = session
            .run(&mut capture, &CancellationToken::new(), || {})
            .await;
        assert!(matches!(outcome, SessionOutcome::Ended));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_does_not_run() {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let (publisher, _server) = publisher(&health);
        let mut capture = ChannelCapture {
            rx: None,
            fail_start: true,
            stopped: false,
        };

        let mut session = Session::new(
            &session_cfg(50),
            publisher.handle().expect("handle"),
            Arc::clone(&health),
        );
        let mut running = false;
        let outcome = session
            .run(&mut capture, &CancellationToken::new(), || running = true)
            .await;

        assert!(outcome.is_failure());
        assert!(!running);
        assert!(capture.stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_session() {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let (publisher, _server) = publisher(&health);
        let (_tx, rx) = mpsc::channel(1);
        let mut capture = ChannelCapture {
            rx: Some(rx),
            fail_start: false,
            stopped: false,
        };

        let ctx = CancellationToken::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            cancel.cancel();
        });

        let mut session = Session::new(
            &session_cfg(50),
            publisher.handle().expect("handle"),
            Arc::clone(&health),
        );
        let outcome = session.run(&mut capture, &ctx, || {}).await;

        assert!(matches!(outcome, SessionOutcome::Cancelled));
        assert_eq!(health.windows_flushed.get(), 1.0);
    }
}
