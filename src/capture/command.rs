//! Capture backed by an external tracing command.
//!
//! The command (typically a kernel tracing script) prints one record per
//! line on stdout; see [`super::parse`] for the format. Each session spawns
//! a fresh process, and the process is killed when the session ends.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CommandCaptureConfig;

use super::event::OperationEvent;
use super::parse::parse_line;
use super::{Capture, CaptureError, EventStream, ParseErrorHandler};

type EventSender = mpsc::Sender<Result<OperationEvent, CaptureError>>;

/// Capture that spawns a command and parses its stdout.
pub struct CommandCapture {
    cfg: CommandCaptureConfig,
    parse_error_handler: Option<ParseErrorHandler>,
    cancel: Option<CancellationToken>,
    read_task: Option<tokio::task::JoinHandle<()>>,
}

impl CommandCapture {
    /// Creates a command capture; nothing is spawned until `start`.
    pub fn new(cfg: CommandCaptureConfig) -> Self {
        Self {
            cfg,
            parse_error_handler: None,
            cancel: None,
            read_task: None,
        }
    }

    /// Register a handler for records that fail to parse.
    pub fn on_parse_error(&mut self, handler: ParseErrorHandler) {
        self.parse_error_handler = Some(handler);
    }
}

impl Capture for CommandCapture {
    fn name(&self) -> &str {
        "command"
    }

    async fn start(&mut self, ctx: CancellationToken, buffer: usize) -> Result<EventStream> {
        let mut child = Command::new(&self.cfg.program)
            .args(&self.cfg.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning capture command {}", self.cfg.program))?;

        let stdout = child
            .stdout
            .take()
            .context("capture command stdout was not piped")?;

        info!(
            program = %self.cfg.program,
            pid = ?child.id(),
            "capture command started",
        );

        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = ctx.child_token();
        let handler = self.parse_error_handler.clone();

        self.read_task = Some(tokio::spawn(read_loop(
            child,
            stdout,
            tx,
            cancel.clone(),
            handler,
        )));
        self.cancel = Some(cancel);

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }

        if let Some(task) = self.read_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "capture reader task join failed");
            }
        }

        Ok(())
    }
}

async fn read_loop(
    mut child: Child,
    stdout: ChildStdout,
    tx: EventSender,
    ctx: CancellationToken,
    on_parse_error: Option<ParseErrorHandler>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                kill(&mut child).await;
                return;
            }

            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(Some(event)) => {
                        if tx.send(Ok(event)).await.is_err() {
                            // Session is gone; nobody will read further events.
                            kill(&mut child).await;
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(error = %e, line = %line, "skipping malformed capture record");
                        if let Some(handler) = &on_parse_error {
                            handler(e);
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(CaptureError::Io(e))).await;
                    kill(&mut child).await;
                    return;
                }
            }
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => {
            debug!("capture command exited cleanly");
        }
        Ok(status) => {
            let _ = tx
                .send(Err(CaptureError::Exited {
                    status: status.to_string(),
                }))
                .await;
        }
        Err(e) => {
            let _ = tx.send(Err(CaptureError::Io(e))).await;
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "capture command already exited");
    }
}
