//! Controller side of a dedicated worker connection.
//!
//! Flow:
//! 1. Configure optional stdio pipes
//! 2. Spawn the worker through the host and arm the inbound listener
//! 3. Wait for the worker's ready signal
//! 4. Run the relay: control tokens are consumed, stdio lines go to the
//!    configured writers, everything else reaches the application
//! 5. On `Close` from the worker or `terminate()`: drain, release the pipes,
//!    fire the closed signal
//!
//! Each pipe is written by its own feeder task. A reader that stops reading
//! fills its pipe and stalls only that feeder; the relay keeps going.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::bridge::channel::{
    Endpoint, EventStream, Message, MessageEvent, SpawnSpec, WorkerHandle, WorkerHost,
};
use crate::bridge::protocol::{CLOSE, Control, StreamId, classify, control_message};
use crate::config::LinkConfig;
use crate::error::ConnectionError;
use crate::lifecycle::ClosedSignal;

/// Capacity of the in-memory pipes handed out by `stdout_pipe()`/`stderr_pipe()`.
pub const PIPE_CAPACITY: usize = 64 * 1024;

pub(crate) type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Running {
    handle: Arc<dyn WorkerHandle>,
    cancel: CancellationToken,
    closed: ClosedSignal,
    close_requested: AtomicBool,
}

pub struct DedicatedConnection {
    host: Arc<dyn WorkerHost>,
    spec: SpawnSpec,
    config: LinkConfig,
    stdout: Option<PipeWriter>,
    stderr: Option<PipeWriter>,
    events: Option<mpsc::UnboundedReceiver<MessageEvent>>,
    running: Option<Running>,
}

impl DedicatedConnection {
    pub fn new(host: Arc<dyn WorkerHost>, spec: SpawnSpec) -> Self {
        Self {
            host,
            spec,
            config: LinkConfig::default(),
            stdout: None,
            stderr: None,
            events: None,
            running: None,
        }
    }

    pub fn with_config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// The worker's name. Generated at start when the `SpawnSpec` had none.
    pub fn name(&self) -> Option<&str> {
        self.spec.name.as_deref()
    }

    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }

    /// Read end of a pipe fed with the worker's stdout lines.
    pub fn stdout_pipe(&mut self) -> Result<DuplexStream, ConnectionError> {
        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        self.set_stdout(writer)?;
        Ok(reader)
    }

    /// Read end of a pipe fed with the worker's stderr lines.
    pub fn stderr_pipe(&mut self) -> Result<DuplexStream, ConnectionError> {
        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        self.set_stderr(writer)?;
        Ok(reader)
    }

    pub fn set_stdout(
        &mut self,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Result<(), ConnectionError> {
        self.ensure_configurable(StreamId::Stdout)?;
        self.stdout = Some(Box::new(writer));
        Ok(())
    }

    pub fn set_stderr(
        &mut self,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Result<(), ConnectionError> {
        self.ensure_configurable(StreamId::Stderr)?;
        self.stderr = Some(Box::new(writer));
        Ok(())
    }

    fn ensure_configurable(&self, stream: StreamId) -> Result<(), ConnectionError> {
        if self.running.is_some() {
            return Err(ConnectionError::configuration(format!(
                "{stream} cannot be set after the worker started"
            )));
        }
        let already_set = match stream {
            StreamId::Stdout => self.stdout.is_some(),
            StreamId::Stderr => self.stderr.is_some(),
        };
        if already_set {
            return Err(ConnectionError::configuration(format!("{stream} already set")));
        }
        Ok(())
    }

    /// Spawn the worker and wait for its ready signal.
    pub async fn start(&mut self) -> Result<(), ConnectionError> {
        if self.running.is_some() {
            return Err(ConnectionError::configuration("worker already started"));
        }
        let name = self.spec.ensure_name().to_string();
        tracing::debug!(%name, path = %self.spec.path, "Starting dedicated worker");

        let handle = self.host.spawn(&self.spec).await?;
        let cancel = CancellationToken::new();
        let mut events = match handle.listen(cancel.clone()) {
            Ok(events) => events,
            Err(e) => {
                handle.terminate();
                return Err(e.into());
            }
        };

        match events.next().await {
            Some(first) if first.is_null() => {}
            Some(first) => {
                tracing::warn!(%name, data = %first.data, "Expected ready signal, got a message");
            }
            None => {
                handle.terminate();
                return Err(ConnectionError::ChannelClosed);
            }
        }
        tracing::debug!(%name, "Dedicated worker ready");

        let (tx, rx) = mpsc::unbounded_channel();
        let closed = ClosedSignal::new();
        let relay = Relay {
            name,
            stdout: self.stdout.take(),
            stderr: self.stderr.take(),
            cancel: cancel.clone(),
            closed: closed.clone(),
            tx,
        };
        tokio::spawn(relay.run(events));

        self.events = Some(rx);
        self.running = Some(Running {
            handle,
            cancel,
            closed,
            close_requested: AtomicBool::new(false),
        });
        Ok(())
    }

    fn running(&self) -> Result<&Running, ConnectionError> {
        self.running
            .as_ref()
            .ok_or_else(|| ConnectionError::configuration("worker not started"))
    }

    /// Application messages from the worker. Available once, after start.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<MessageEvent>> {
        self.events.take()
    }

    pub fn post(&self, data: impl Into<Message>) -> Result<(), ConnectionError> {
        self.post_with_transfer(data, Vec::new())
    }

    pub fn post_with_transfer(
        &self,
        data: impl Into<Message>,
        transfer: Vec<Bytes>,
    ) -> Result<(), ConnectionError> {
        self.running()?.handle.post(data.into(), transfer)?;
        Ok(())
    }

    /// Ask the worker to close itself. Completion is observed with `wait()`.
    pub fn close(&self) -> Result<(), ConnectionError> {
        let running = self.running()?;
        if running.closed.is_fired() || running.close_requested.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match running.handle.post(control_message(CLOSE), Vec::new()) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!(error = %e, "Close request not delivered, worker already gone");
                Ok(())
            }
        }
    }

    /// Destroy the worker immediately. Idempotent; a no-op before start.
    pub fn terminate(&self) {
        if let Some(running) = &self.running {
            running.handle.terminate();
            running.cancel.cancel();
        }
    }

    /// Resolves when the relay has ended. Returns at once if never started.
    pub async fn wait(&self) {
        if let Some(running) = &self.running {
            running.closed.wait().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.running.as_ref().is_some_and(|r| r.closed.is_fired())
    }
}

struct Relay {
    name: String,
    stdout: Option<PipeWriter>,
    stderr: Option<PipeWriter>,
    cancel: CancellationToken,
    closed: ClosedSignal,
    tx: mpsc::UnboundedSender<MessageEvent>,
}

impl Relay {
    async fn run(self, mut events: EventStream) {
        let stdout = self.stdout.map(|w| PipeFeed::spawn(StreamId::Stdout, w));
        let stderr = self.stderr.map(|w| PipeFeed::spawn(StreamId::Stderr, w));
        while let Some(event) = events.next().await {
            match classify(&event.data) {
                Some(Control::Close) => {
                    tracing::debug!(name = %self.name, "Worker closed");
                    self.cancel.cancel();
                }
                Some(Control::Stdout(line)) if stdout.is_some() => feed(&stdout, line),
                Some(Control::Stderr(line)) if stderr.is_some() => feed(&stderr, line),
                Some(Control::Stdout(_) | Control::Stderr(_)) | None => {
                    forward(&self.tx, &self.name, event)
                }
                Some(other) => {
                    tracing::warn!(name = %self.name, control = ?other, "Dropping unexpected control message");
                }
            }
        }

        // Feeders shut their pipes down once the queued lines are written.
        drop((stdout, stderr));
        drop(self.tx);
        self.closed.fire();
        tracing::debug!(name = %self.name, "Dedicated relay ended");
    }

}

fn forward(tx: &mpsc::UnboundedSender<MessageEvent>, name: &str, event: MessageEvent) {
    if tx.send(event).is_err() {
        tracing::trace!(%name, "Event receiver dropped");
    }
}

/// Queue in front of a pipe writer, drained by a task of its own.
///
/// Must be created inside a runtime. Dropping the feed lets the task finish
/// the queued lines and shut the writer down.
pub(crate) struct PipeFeed {
    stream: StreamId,
    tx: mpsc::UnboundedSender<String>,
}

impl PipeFeed {
    pub(crate) fn spawn(stream: StreamId, mut writer: PipeWriter) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    tracing::debug!(%stream, error = %e, "Pipe reader gone, dropping output");
                    return;
                }
            }
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(%stream, error = %e, "Pipe shutdown failed");
            }
        });
        Self { stream, tx }
    }

    fn send(&self, line: &str) {
        if self.tx.send(line.to_string()).is_err() {
            tracing::trace!(stream = %self.stream, "Pipe feeder gone, dropping line");
        }
    }
}

pub(crate) fn feed(pipe: &Option<PipeFeed>, line: &str) {
    match pipe {
        Some(pipe) => pipe.send(line),
        None => tracing::trace!(len = line.len(), "No pipe open, dropping line"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::{ChannelError, SharedSpawn, SpawnError};
    use async_trait::async_trait;

    /// A host whose workers vanish before saying anything.
    struct SilentHost;

    struct SilentWorker;

    impl Endpoint for SilentWorker {
        fn post(&self, _: Message, _: Vec<Bytes>) -> Result<(), ChannelError> {
            Ok(())
        }

        fn listen(&self, _: CancellationToken) -> Result<EventStream, ChannelError> {
            Ok(futures::stream::empty().boxed())
        }

        fn close(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    impl WorkerHandle for SilentWorker {
        fn name(&self) -> &str {
            "silent"
        }

        fn terminate(&self) {}
    }

    #[async_trait]
    impl WorkerHost for SilentHost {
        async fn spawn(&self, _: &SpawnSpec) -> Result<Arc<dyn WorkerHandle>, SpawnError> {
            Ok(Arc::new(SilentWorker))
        }

        async fn spawn_shared(&self, _: &SpawnSpec) -> Result<SharedSpawn, SpawnError> {
            Err(SpawnError::Other("unsupported".into()))
        }

        async fn connect_shared(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Arc<dyn Endpoint>, SpawnError> {
            Err(SpawnError::Other("unsupported".into()))
        }
    }

    #[test]
    fn pipes_can_only_be_set_once() {
        let mut conn = DedicatedConnection::new(Arc::new(SilentHost), SpawnSpec::new("a.wasm"));
        conn.stdout_pipe().unwrap();
        let err = conn.stdout_pipe().err().unwrap();
        insta::assert_snapshot!(err.to_string(), @"invalid configuration: stdout already set");

        conn.stderr_pipe().unwrap();
        assert!(matches!(
            conn.set_stderr(tokio::io::sink()),
            Err(ConnectionError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn stream_end_before_ready_is_channel_closed() {
        let mut conn = DedicatedConnection::new(Arc::new(SilentHost), SpawnSpec::new("a.wasm"));
        let err = conn.start().await.err().unwrap();
        assert!(matches!(err, ConnectionError::ChannelClosed));
        assert!(conn.name().is_some());
    }

    #[test]
    fn calls_before_start_are_rejected() {
        let conn = DedicatedConnection::new(Arc::new(SilentHost), SpawnSpec::new("a.wasm"));
        assert!(matches!(conn.post("x"), Err(ConnectionError::Configuration(_))));
        assert!(matches!(conn.close(), Err(ConnectionError::Configuration(_))));
        conn.terminate();
        assert!(!conn.is_closed());
    }
}
