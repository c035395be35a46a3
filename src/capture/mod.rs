pub mod command;
pub mod event;
pub mod parse;
pub mod synthetic;

use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use self::event::OperationEvent;
use self::parse::ParseError;

/// Stream of events delivered by a running capture.
///
/// The channel closing means the capture ended on its own. An `Err` item
/// means it failed; the session treats both as the end of the session.
pub type EventStream = mpsc::Receiver<Result<OperationEvent, CaptureError>>;

/// Callback for capture records that could not be parsed.
pub type ParseErrorHandler = Arc<dyn Fn(ParseError) + Send + Sync>;

/// Failures of a running capture.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture process exited with {status}")]
    Exited { status: String },

    #[error("reading capture output: {0}")]
    Io(#[from] std::io::Error),
}

/// Capture manages an external event source for one session.
///
/// A capture is started once per session and stopped when the session ends;
/// the supervisor starts it again with the same configuration for the next
/// session.
pub trait Capture: Send {
    /// Returns the capture's name for logging.
    fn name(&self) -> &str;

    /// Start producing events. `buffer` bounds the event channel.
    fn start(
        &mut self,
        ctx: CancellationToken,
        buffer: usize,
    ) -> impl std::future::Future<Output = Result<EventStream>> + Send;

    /// Stop producing events and release the underlying facility.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Capture selected by configuration.
///
/// Enum dispatch lets the supervisor stay generic over one concrete type.
pub enum CaptureBackend {
    Command(command::CommandCapture),
    Synthetic(synthetic::SyntheticCapture),
}

impl CaptureBackend {
    /// Builds the capture named by `cfg.kind`.
    pub fn from_config(cfg: &crate::config::CaptureConfig) -> Self {
        match cfg.kind {
            crate::config::CaptureKind::Command => {
                Self::Command(command::CommandCapture::new(cfg.command.clone()))
            }
            crate::config::CaptureKind::Synthetic => {
                Self::Synthetic(synthetic::SyntheticCapture::new(cfg.synthetic.clone()))
            }
        }
    }

    /// Register a handler for records that fail to parse. Only the command
    /// capture parses records.
    pub fn on_parse_error(&mut self, handler: ParseErrorHandler) {
        if let Self::Command(c) = self {
            c.on_parse_error(handler);
        }
    }
}

impl Capture for CaptureBackend {
    fn name(&self) -> &str {
        match self {
            Self::Command(c) => c.name(),
            Self::Synthetic(c) => c.name(),
        }
    }

    async fn start(&mut self, ctx: CancellationToken, buffer: usize) -> Result<EventStream> {
        match self {
            Self::Command(c) => c.start(ctx, buffer).await,
            Self::Synthetic(c) => c.start(ctx, buffer).await,
        }
    }

    async fn stop(&mut self) -> Result<()> {
        match self {
            Self::Command(c) => c.stop().await,
            Self::Synthetic(c) => c.stop().await,
        }
    }
}
