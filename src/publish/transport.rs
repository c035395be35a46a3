use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, ChildStdin, Command};

use tracing::{debug, warn};

use crate::config::PublishConfig;

/// Values of `transport_override` that select standard output.
const STDOUT_OVERRIDES: [&str; 2] = ["-", "stdout"];

/// Failures writing a window to the collector.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connecting to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("writing to transport: {0}")]
    Write(#[from] std::io::Error),

    #[error("collector rejected record: {0}")]
    Rejected(String),

    #[error("collector closed the connection")]
    Closed,

    #[error("spawning transport command {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Transport dispatches PUTVAL lines to the collector socket or a stream.
///
/// Enum dispatch keeps the writer's async calls free of boxed futures.
pub enum Transport {
    UnixSocket(UnixSocketTransport),
    Stream(StreamTransport),
}

impl Transport {
    /// Selects the transport from publishing configuration.
    ///
    /// An empty override means the collector socket. `-` or `stdout` writes
    /// to standard output; any other value is run through `sh -c` with the
    /// records on its stdin.
    pub fn from_config(cfg: &PublishConfig) -> Result<Self, TransportError> {
        let target = cfg.transport_override.trim();
        if target.is_empty() {
            return Ok(Self::UnixSocket(UnixSocketTransport::new(&cfg.socket)));
        }
        if STDOUT_OVERRIDES.contains(&target) {
            return Ok(Self::Stream(StreamTransport::stdout()));
        }
        StreamTransport::command(target).map(Self::Stream)
    }

    /// Returns the transport name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::UnixSocket(_) => "unixsock",
            Self::Stream(t) => t.name(),
        }
    }

    /// Writes one window's records in order.
    ///
    /// Stops at the first failure; records after it are not sent.
    pub async fn write_batch(&mut self, lines: &[String]) -> Result<(), TransportError> {
        match self {
            Self::UnixSocket(t) => t.write_batch(lines).await,
            Self::Stream(t) => t.write_batch(lines).await,
        }
    }

    /// Flushes and releases the transport.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        match self {
            Self::UnixSocket(_) => Ok(()),
            Self::Stream(t) => t.close().await,
        }
    }
}

/// collectd `unixsock` plugin client.
///
/// A connection is opened per window so a collector restart costs at most
/// one window. Every PUTVAL is answered with a status line; a negative
/// status is a rejection.
pub struct UnixSocketTransport {
    path: PathBuf,
}

impl UnixSocketTransport {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    async fn write_batch(&mut self, lines: &[String]) -> Result<(), TransportError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|source| TransportError::Connect {
                path: self.path.clone(),
                source,
            })?;
        let (read_half, mut write_half) = stream.into_split();
        let mut responses = BufReader::new(read_half).lines();

        for line in lines {
            write_half.write_all(line.as_bytes()).await?;

            let status = responses.next_line().await?.ok_or(TransportError::Closed)?;
            if status.trim_start().starts_with('-') {
                return Err(TransportError::Rejected(status));
            }
        }

        write_half.shutdown().await?;
        Ok(())
    }
}

/// Writer for the debug overrides: standard output or a child's stdin.
///
/// A command child that has exited, or whose pipe failed a write, is reaped
/// and spawned again before the next window, so one dead child costs at
/// most the window it was writing.
pub struct StreamTransport {
    name: &'static str,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    command: Option<String>,
    child: Option<Child>,
    broken: bool,
}

impl StreamTransport {
    /// Records go to the process's standard output.
    pub fn stdout() -> Self {
        Self::from_writer("stdout", tokio::io::stdout())
    }

    /// Records are piped into `sh -c <command>`; its stdout is inherited.
    pub fn command(command: &str) -> Result<Self, TransportError> {
        let (child, stdin) = spawn_shell(command)?;

        Ok(Self {
            name: "command",
            writer: Box::new(stdin),
            command: Some(command.to_string()),
            child: Some(child),
            broken: false,
        })
    }

    /// Wraps an arbitrary writer.
    pub fn from_writer<W>(name: &'static str, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            name,
            writer: Box::new(writer),
            command: None,
            child: None,
            broken: false,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    async fn write_batch(&mut self, lines: &[String]) -> Result<(), TransportError> {
        self.respawn_if_exited().await?;

        let res = self.write_lines(lines).await;
        if res.is_err() {
            self.broken = true;
        }
        res
    }

    async fn write_lines(&mut self, lines: &[String]) -> Result<(), TransportError> {
        for line in lines {
            self.writer.write_all(line.as_bytes()).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn respawn_if_exited(&mut self) -> Result<(), TransportError> {
        let Some(command) = self.command.as_deref() else {
            return Ok(());
        };

        let exited = match self.child.as_mut() {
            Some(child) => self.broken || child.try_wait()?.is_some(),
            None => true,
        };
        if !exited {
            return Ok(());
        }

        if let Some(mut child) = self.child.take() {
            // A child with a broken pipe may still be running.
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "transport command already gone");
            }
            let status = child.wait().await?;
            warn!(%status, command, "transport command exited, respawning");
        }

        let (child, stdin) = spawn_shell(command)?;
        self.writer = Box::new(stdin);
        self.child = Some(child);
        self.broken = false;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.broken {
            self.writer = Box::new(tokio::io::sink());
        }
        self.writer.flush().await?;
        self.writer.shutdown().await?;

        if let Some(mut child) = self.child.take() {
            // Dropping our end of the pipe lets the child see EOF.
            self.writer = Box::new(tokio::io::sink());
            let status = child.wait().await?;
            if !status.success() {
                warn!(%status, "transport command exited unsuccessfully");
            }
        }
        Ok(())
    }
}

fn spawn_shell(command: &str) -> Result<(Child, ChildStdin), TransportError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TransportError::Spawn {
            command: command.to_string(),
            source,
        })?;

    let stdin = child.stdin.take().ok_or_else(|| TransportError::Spawn {
        command: command.to_string(),
        source: std::io::Error::other("stdin was not piped"),
    })?;

    Ok((child, stdin))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    fn lines() -> Vec<String> {
        vec![
            "PUTVAL \"n/pool-A/gauge-bw\" interval=60 1:2\n".to_string(),
            "PUTVAL \"n/pool-A/gauge-iops\" interval=60 1:3\n".to_string(),
        ]
    }

    fn publish_cfg(transport_override: &str) -> PublishConfig {
        PublishConfig {
            transport_override: transport_override.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_selects_transport_from_override() {
        let t = Transport::from_config(&publish_cfg("")).expect("transport");
        assert_eq!(t.name(), "unixsock");

        let t = Transport::from_config(&publish_cfg("-")).expect("transport");
        assert_eq!(t.name(), "stdout");

        let t = Transport::from_config(&publish_cfg("stdout")).expect("transport");
        assert_eq!(t.name(), "stdout");
    }

    #[tokio::test]
    async fn test_stream_writes_lines_in_order() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut t = Transport::Stream(StreamTransport::from_writer("duplex", client));

        t.write_batch(&lines()).await.expect("write");
        t.close().await.expect("close");

        let mut out = String::new();
        server.read_to_string(&mut out).await.expect("read");
        assert_eq!(out, lines().concat());
    }

    #[tokio::test]
    async fn test_command_transport_receives_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out.txt");
        let cmd = format!("cat > {}", out.display());

        let mut t = Transport::from_config(&publish_cfg(&cmd)).expect("transport");
        assert_eq!(t.name(), "command");
        t.write_batch(&lines()).await.expect("write");
        t.close().await.expect("close");

        let written = std::fs::read_to_string(&out).expect("read output");
        assert_eq!(written, lines().concat());
    }

    #[tokio::test]
    async fn test_command_respawned_after_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out.txt");
        // Each child accepts a single record and exits.
        let cmd = format!("head -n 1 >> {}", out.display());

        let mut t = Transport::from_config(&publish_cfg(&cmd)).expect("transport");
        for _ in 0..3 {
            // The remainder of a window may hit the closed pipe.
            let _ = t.write_batch(&lines()).await;
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        t.close().await.expect("close");

        let written = std::fs::read_to_string(&out).expect("read output");
        let first = lines()[0].clone();
        assert_eq!(written, first.repeat(3));
    }

    #[tokio::test]
    async fn test_unix_socket_acknowledged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("collectd.sock");
        let listener = UnixListener::bind(&path).expect("bind");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (r, mut w) = stream.into_split();
            let mut reader = BufReader::new(r).lines();
            let mut got = Vec::new();
            while let Some(line) = reader.next_line().await.expect("read") {
                got.push(line);
                w.write_all(b"0 Success: 1 value has been dispatched.\n")
                    .await
                    .expect("respond");
            }
            got
        });

        let mut t = Transport::UnixSocket(UnixSocketTransport::new(&path));
        t.write_batch(&lines()).await.expect("write");

        let got = server.await.expect("server");
        assert_eq!(got.len(), 2);
        assert!(got[0].starts_with("PUTVAL \"n/pool-A/gauge-bw\""));
    }

    #[tokio::test]
    async fn test_unix_socket_rejection_stops_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("collectd.sock");
        let listener = UnixListener::bind(&path).expect("bind");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (r, mut w) = stream.into_split();
            let mut reader = BufReader::new(r).lines();
            let mut count = 0;
            while let Some(_line) = reader.next_line().await.expect("read") {
                count += 1;
                w.write_all(b"-1 Parse error\n").await.expect("respond");
            }
            count
        });

        let mut t = Transport::UnixSocket(UnixSocketTransport::new(&path));
        let err = t.write_batch(&lines()).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected(ref s) if s.contains("Parse error")));
        drop(t);

        assert_eq!(server.await.expect("server"), 1);
    }

    #[tokio::test]
    async fn test_unix_socket_missing_path() {
        let mut t = Transport::UnixSocket(UnixSocketTransport::new(Path::new(
            "/nonexistent/collectd.sock",
        )));
        let err = t.write_batch(&lines()).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
