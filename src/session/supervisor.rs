use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::Capture;
use crate::config::SessionConfig;
use crate::health::HealthMetrics;
use crate::publish::PublisherHandle;

use super::{Session, SessionOutcome};

/// Lifecycle state of the capture supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Failed = 3,
}

impl SupervisorState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Stopped),
            1 => Some(Self::Starting),
            2 => Some(Self::Running),
            3 => Some(Self::Failed),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable supervisor state mirrored into the health gauge.
#[derive(Clone)]
pub struct StateHandle {
    state: Arc<AtomicU8>,
    health: Arc<HealthMetrics>,
}

impl StateHandle {
    fn new(health: Arc<HealthMetrics>) -> Self {
        health.supervisor_state.set(f64::from(SupervisorState::Stopped as u8));
        Self {
            state: Arc::new(AtomicU8::new(SupervisorState::Stopped as u8)),
            health,
        }
    }

    pub fn get(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::Relaxed))
            .unwrap_or(SupervisorState::Stopped)
    }

    fn set(&self, state: SupervisorState) {
        self.state.store(state as u8, Ordering::Relaxed);
        self.health.supervisor_state.set(f64::from(state as u8));
    }
}

/// Restarts capture sessions until shutdown.
///
/// Every session gets a fresh encoder and aggregator. Sessions are restarted
/// immediately and without a retry limit. A nonzero `restart_delay` pauses
/// only after sessions that ended before their window limit.
pub struct Supervisor<C: Capture> {
    cfg: SessionConfig,
    capture: C,
    publisher: PublisherHandle,
    health: Arc<HealthMetrics>,
    state: StateHandle,
    sessions: u64,
}

impl<C: Capture> Supervisor<C> {
    pub fn new(
        cfg: SessionConfig,
        capture: C,
        publisher: PublisherHandle,
        health: Arc<HealthMetrics>,
    ) -> Self {
        let state = StateHandle::new(Arc::clone(&health));
        Self {
            cfg,
            capture,
            publisher,
            health,
            state,
            sessions: 0,
        }
    }

    /// Handle for observing the current state from other tasks.
    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    /// Sessions started so far.
    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    /// Runs sessions until `ctx` is cancelled.
    pub async fn run(&mut self, ctx: CancellationToken) {
        info!(
            capture = self.capture.name(),
            interval = ?self.cfg.interval,
            max_intervals = self.cfg.max_intervals,
            "capture supervisor started",
        );

        while !ctx.is_cancelled() {
            self.sessions += 1;
            self.state.set(SupervisorState::Starting);
            self.health.sessions_started.inc();

            let mut session = Session::new(
                &self.cfg,
                self.publisher.clone(),
                Arc::clone(&self.health),
            );
            let running = self.state.clone();
            let outcome = session
                .run(&mut self.capture, &ctx, move || {
                    running.set(SupervisorState::Running)
                })
                .await;

            let delay = match outcome {
                SessionOutcome::Completed => {
                    self.health.sessions_completed.inc();
                    self.state.set(SupervisorState::Stopped);
                    info!(session = self.sessions, "capture session completed, restarting");
                    false
                }
                SessionOutcome::Ended => {
                    self.health.sessions_completed.inc();
                    self.state.set(SupervisorState::Stopped);
                    warn!(session = self.sessions, "capture stream ended, restarting");
                    true
                }
                SessionOutcome::Failed(e) => {
                    self.health.sessions_failed.inc();
                    self.state.set(SupervisorState::Failed);
                    warn!(
                        session = self.sessions,
                        error = %format!("{e:#}"),
                        "capture session failed, restarting",
                    );
                    true
                }
                SessionOutcome::Cancelled => break,
            };

            if delay && !self.cfg.restart_delay.is_zero() {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tokio::time::sleep(self.cfg.restart_delay) => {}
                }
            }
        }

        self.state.set(SupervisorState::Stopped);
        info!(sessions = self.sessions, "capture supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use anyhow::Result;
    use tokio::sync::mpsc;

    use crate::capture::event::{OpKind, OperationEvent};
    use crate::capture::{CaptureError, EventStream};
    use crate::config::PublishConfig;
    use crate::publish::transport::{StreamTransport, Transport};
    use crate::publish::Publisher;

    /// What each successive session's capture does.
    enum Script {
        FailStart,
        Exit,
        Error,
        Hang,
    }

    struct ScriptedCapture {
        script: VecDeque<Script>,
        starts: u32,
        held: Vec<mpsc::Sender<Result<OperationEvent, CaptureError>>>,
    }

    impl Capture for ScriptedCapture {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn start(&mut self, _ctx: CancellationToken, _buffer: usize) -> Result<EventStream> {
            self.starts += 1;
            let (tx, rx) = mpsc::channel(4);
            let ev = OperationEvent {
                pool_guid: 7,
                dataset_guid: 8,
                kind: OpKind::Read,
                bytes: 512,
                start_ns: 0,
                end_ns: 1_000,
            };
            match self.script.pop_front().unwrap_or(Script::Hang) {
                Script::FailStart => anyhow::bail!("no capture facility"),
                Script::Exit => {
                    tx.send(Ok(ev)).await?;
                }
                Script::Error => {
                    tx.send(Err(CaptureError::Exited {
                        status: "exit status: 2".to_string(),
                    }))
                    .await?;
                }
                Script::Hang => {
                    tx.send(Ok(ev)).await?;
                    self.held.push(tx);
                }
            }
            Ok(rx)
        }

        async fn stop(&mut self) -> Result<()> {
            self.held.clear();
            Ok(())
        }
    }

    fn supervisor(
        script: Vec<Script>,
        cfg: SessionConfig,
    ) -> (Supervisor<ScriptedCapture>, Publisher, Arc<HealthMetrics>) {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let mut publisher = Publisher::new(
            PublishConfig {
                node_name: "n".to_string(),
                ..Default::default()
            },
            Arc::clone(&health),
        );
        publisher
            .start_with(
                CancellationToken::new(),
                Transport::Stream(StreamTransport::from_writer("sink", tokio::io::sink())),
            )
            .expect("start");

        let capture = ScriptedCapture {
            script: script.into(),
            starts: 0,
            held: Vec::new(),
        };
        let sup = Supervisor::new(
            cfg,
            capture,
            publisher.handle().expect("handle"),
            Arc::clone(&health),
        );
        (sup, publisher, health)
    }

    fn cfg() -> SessionConfig {
        SessionConfig {
            interval: Duration::from_secs(1),
            max_intervals: 2,
            restart_delay: Duration::from_secs(1),
            event_buffer: 16,
        }
    }

    #[test]
    fn test_state_round_trip() {
        for s in [
            SupervisorState::Stopped,
            SupervisorState::Starting,
            SupervisorState::Running,
            SupervisorState::Failed,
        ] {
            assert_eq!(SupervisorState::from_u8(s as u8), Some(s));
        }
        assert_eq!(SupervisorState::from_u8(9), None);
        assert_eq!(SupervisorState::Running.to_string(), "running");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_restart_without_limit() {
        let (mut sup, _publisher, health) = supervisor(
            vec![Script::FailStart, Script::Error, Script::Exit, Script::FailStart],
            cfg(),
        );
        let ctx = CancellationToken::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            // Four restarts with a 1s delay each, then one running session.
            tokio::time::sleep(Duration::from_millis(4500)).await;
            cancel.cancel();
        });

        sup.run(ctx).await;

        assert_eq!(sup.capture.starts, 5);
        assert_eq!(sup.sessions(), 5);
        assert_eq!(health.sessions_failed.get(), 3.0);
        assert_eq!(health.sessions_completed.get(), 1.0);
        assert_eq!(sup.state().get(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_config_restarts_failures_without_pause() {
        let cfg = SessionConfig {
            interval: Duration::from_secs(1),
            ..Default::default()
        };
        let (mut sup, _publisher, health) = supervisor(
            vec![Script::FailStart, Script::Error, Script::FailStart],
            cfg,
        );
        let ctx = CancellationToken::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        });

        sup.run(ctx).await;

        // Three failures and the running fourth session all fit before the
        // first window closes.
        assert_eq!(sup.capture.starts, 4);
        assert_eq!(health.sessions_failed.get(), 3.0);
        assert_eq!(health.windows_flushed.get(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_session_restarts_immediately() {
        let (mut sup, _publisher, health) = supervisor(vec![], cfg());
        let ctx = CancellationToken::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            cancel.cancel();
        });

        sup.run(ctx).await;

        assert_eq!(sup.sessions(), 2);
        assert_eq!(health.sessions_completed.get(), 1.0);
        assert_eq!(health.sessions_failed.get(), 0.0);
        assert_eq!(health.windows_flushed.get(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_is_running_during_session() {
        let (mut sup, _publisher, health) = supervisor(vec![], cfg());
        let state = sup.state();
        let ctx = CancellationToken::new();
        let cancel = ctx.clone();

        let task = tokio::spawn(async move {
            sup.run(ctx).await;
            sup
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(state.get(), SupervisorState::Running);
        assert_eq!(health.supervisor_state.get(), 2.0);

        cancel.cancel();
        let sup = task.await.expect("join");
        assert_eq!(sup.state().get(), SupervisorState::Stopped);
    }
}
