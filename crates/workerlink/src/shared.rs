//! Controller side of shared worker connections.
//!
//! A shared worker is reached through ports. The controller that starts one
//! holds a [`MgmtConnection`] on a dedicated management port: the worker's
//! stdio arrives there, sink switches are requested there, and closing it
//! shuts the worker down. Application traffic uses ordinary
//! [`SharedConnection`]s, any number of them, each on its own port.
//!
//! Tracked connections live in a DashMap so relays can deregister themselves
//! without contending with the mgmt connection's own bookkeeping.
//!
//! Mgmt stdio pipes open on demand. Lines that arrive while a pipe is not
//! open are dropped, and a full pipe never holds up the mgmt relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::channel::{Endpoint, EventStream, Message, MessageEvent, SpawnSpec, WorkerHost};
use crate::bridge::protocol::{
    CLOSE, Control, PortCommand, StreamId, WRITE_TO_CONSOLE, WRITE_TO_CONTROLLER, classify,
    control_message,
};
use crate::config::LinkConfig;
use crate::dedicated::{PIPE_CAPACITY, PipeFeed, PipeWriter, feed};
use crate::error::ConnectionError;
use crate::lifecycle::{ClosedSignal, Lifecycle};

// =============================================================================
// Mgmt connection
// =============================================================================

struct MgmtInner {
    name: String,
    url: String,
    host: Arc<dyn WorkerHost>,
    config: LinkConfig,
    port: Arc<dyn Endpoint>,
    cancel: CancellationToken,
    closed: ClosedSignal,
    lifecycle: Lifecycle,
    connections: DashMap<Uuid, Arc<SharedCore>>,
}

type PipeInstall = (StreamId, PipeWriter);

pub struct MgmtConnection {
    inner: Arc<MgmtInner>,
    pipes: mpsc::UnboundedSender<PipeInstall>,
    stdout_taken: AtomicBool,
    stderr_taken: AtomicBool,
}

impl MgmtConnection {
    pub async fn start(host: Arc<dyn WorkerHost>, spec: SpawnSpec) -> Result<Self, ConnectionError> {
        Self::start_with_config(host, spec, LinkConfig::default()).await
    }

    /// Start (or detect) the shared worker named by `spec` and bind the mgmt port.
    ///
    /// Fails with `AlreadyExists` when a live worker already uses the name. The
    /// ports opened while finding out are released with a plain `Close`, which
    /// detaches them without counting toward the worker's idle shutdown.
    pub async fn start_with_config(
        host: Arc<dyn WorkerHost>,
        mut spec: SpawnSpec,
        config: LinkConfig,
    ) -> Result<Self, ConnectionError> {
        let name = spec.ensure_name().to_string();
        tracing::debug!(%name, path = %spec.path, "Starting shared worker");
        let spawned = host.spawn_shared(&spec).await?;

        // The worker posts its ready signal on the initial port once it listens
        // for connects; only then is it safe to open the mgmt port.
        {
            let initial_cancel = CancellationToken::new();
            let mut initial = spawned.port.listen(initial_cancel.clone())?;
            if initial.next().await.is_none() {
                return Err(ConnectionError::ChannelClosed);
            }
            initial_cancel.cancel();
        }

        let port = host.connect_shared(&name, &spawned.url).await?;
        let cancel = CancellationToken::new();
        let mut events = port.listen(cancel.clone())?;
        let Some(ack) = events.next().await else {
            release_port(&spawned.port, None);
            return Err(ConnectionError::ChannelClosed);
        };

        if ack.is_null() {
            // Both ports were accepted as ordinary ports of a live worker.
            tracing::debug!(%name, "Shared worker already exists");
            cancel.cancel();
            release_port(&spawned.port, Some(control_message(CLOSE)));
            release_port(&port, Some(control_message(CLOSE)));
            return Err(ConnectionError::already_exists(name));
        }
        release_port(&spawned.port, None);
        tracing::debug!(%name, url = %spawned.url, "Mgmt port established");

        let inner = Arc::new(MgmtInner {
            name,
            url: spawned.url,
            host,
            config,
            port,
            cancel,
            closed: ClosedSignal::new(),
            lifecycle: Lifecycle::new(),
            connections: DashMap::new(),
        });
        let (pipes, installs) = mpsc::unbounded_channel();
        tokio::spawn(mgmt_relay(Arc::clone(&inner), events, installs));

        Ok(Self {
            inner,
            pipes,
            stdout_taken: AtomicBool::new(false),
            stderr_taken: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Read end of the worker's stdout lines from now on. Available once.
    pub fn stdout(&self) -> Option<DuplexStream> {
        self.open_pipe(StreamId::Stdout, &self.stdout_taken)
    }

    /// Read end of the worker's stderr lines from now on. Available once.
    pub fn stderr(&self) -> Option<DuplexStream> {
        self.open_pipe(StreamId::Stderr, &self.stderr_taken)
    }

    fn open_pipe(&self, stream: StreamId, taken: &AtomicBool) -> Option<DuplexStream> {
        if taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        if self.pipes.send((stream, Box::new(writer))).is_err() {
            // Relay already ended; the reader sees end of stream.
            tracing::debug!(name = %self.inner.name, %stream, "Pipe opened after the mgmt relay ended");
        }
        Some(reader)
    }

    /// Worker stdio goes back to its console.
    pub fn set_write_to_console(&self) -> Result<(), ConnectionError> {
        self.inner.port.post(control_message(WRITE_TO_CONSOLE), Vec::new())?;
        Ok(())
    }

    /// Worker stdio comes to this connection's pipes only.
    pub fn set_write_to_controller(&self) -> Result<(), ConnectionError> {
        self.inner.port.post(control_message(WRITE_TO_CONTROLLER), Vec::new())?;
        Ok(())
    }

    /// Open an ordinary connection tracked by this mgmt connection.
    pub async fn connect(&self) -> Result<SharedConnection, ConnectionError> {
        SharedConnection::open_new(
            Arc::clone(&self.inner.host),
            self.inner.name.clone(),
            self.inner.url.clone(),
            Some(Arc::downgrade(&self.inner)),
        )
        .await
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Shut the worker down. Tracked connections are closed too. Idempotent.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        if !inner.lifecycle.begin_close() {
            inner.closed.wait().await;
            return Ok(());
        }
        tracing::debug!(name = %inner.name, "Closing shared worker");
        if let Err(e) = inner.port.post(control_message(CLOSE), Vec::new()) {
            tracing::debug!(error = %e, "Close request not delivered");
        }

        let tracked: Vec<Arc<SharedCore>> = inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for core in tracked {
            core.close().await;
        }
        inner.connections.clear();

        tokio::time::sleep(inner.config.shutdown_yield).await;
        inner.cancel.cancel();
        inner.closed.wait().await;
        if let Err(e) = inner.port.close() {
            tracing::debug!(error = %e, "Mgmt port close failed");
        }
        inner.lifecycle.finish();
        Ok(())
    }

    pub async fn terminate(&self) -> Result<(), ConnectionError> {
        self.close().await
    }

    /// Resolves once the mgmt relay has ended.
    pub async fn wait(&self) {
        self.inner.closed.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_fired()
    }
}

fn release_port(port: &Arc<dyn Endpoint>, farewell: Option<Message>) {
    if let Some(farewell) = farewell
        && let Err(e) = port.post(farewell, Vec::new())
    {
        tracing::debug!(error = %e, "Could not release port");
    }
    if let Err(e) = port.close() {
        tracing::debug!(error = %e, "Port close failed");
    }
}

async fn mgmt_relay(
    inner: Arc<MgmtInner>,
    mut events: EventStream,
    mut installs: mpsc::UnboundedReceiver<PipeInstall>,
) {
    let mut stdout: Option<PipeFeed> = None;
    let mut stderr: Option<PipeFeed> = None;
    loop {
        let event = tokio::select! {
            biased;
            Some((stream, writer)) = installs.recv() => {
                let pipe = Some(PipeFeed::spawn(stream, writer));
                match stream {
                    StreamId::Stdout => stdout = pipe,
                    StreamId::Stderr => stderr = pipe,
                }
                continue;
            }
            event = events.next() => event,
        };
        let Some(event) = event else {
            break;
        };
        match classify(&event.data) {
            Some(Control::Close) => {
                tracing::debug!(name = %inner.name, "Shared worker closed");
                inner.cancel.cancel();
            }
            Some(Control::Stdout(line)) => feed(&stdout, line),
            Some(Control::Stderr(line)) => feed(&stderr, line),
            Some(other) => {
                tracing::warn!(name = %inner.name, control = ?other, "Dropping unexpected control message");
            }
            None => {
                tracing::warn!(name = %inner.name, data = %event.data, "Ignoring application message on mgmt port");
            }
        }
    }

    drop((stdout, stderr));
    inner.closed.fire();
    tracing::debug!(name = %inner.name, "Mgmt relay ended");
}

// =============================================================================
// Shared connection
// =============================================================================

struct SharedCore {
    port: Arc<dyn Endpoint>,
    cancel: CancellationToken,
    closed: ClosedSignal,
    close_started: AtomicBool,
}

impl SharedCore {
    async fn close(&self) {
        if self.close_started.swap(true, Ordering::AcqRel) {
            self.closed.wait().await;
            return;
        }
        self.cancel.cancel();
        self.closed.wait().await;
        if let Err(e) = self.port.post(control_message(CLOSE), Vec::new()) {
            tracing::debug!(error = %e, "Close not delivered to worker port");
        }
        if let Err(e) = self.port.close() {
            tracing::debug!(error = %e, "Port close failed");
        }
    }
}

/// An ordinary port to a shared worker.
pub struct SharedConnection {
    id: Uuid,
    name: String,
    url: String,
    host: Arc<dyn WorkerHost>,
    core: Arc<SharedCore>,
    events: Option<mpsc::UnboundedReceiver<MessageEvent>>,
    mgmt: Option<Weak<MgmtInner>>,
}

impl SharedConnection {
    /// Connect to a live shared worker by name and url.
    pub async fn connect(
        host: Arc<dyn WorkerHost>,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> Result<Self, ConnectionError> {
        Self::open_new(host, name.into(), url.into(), None).await
    }

    /// Start the worker and return a first ordinary connection with its mgmt connection.
    pub async fn start(
        host: Arc<dyn WorkerHost>,
        spec: SpawnSpec,
    ) -> Result<(SharedConnection, MgmtConnection), ConnectionError> {
        let mgmt = MgmtConnection::start(host, spec).await?;
        let conn = mgmt.connect().await?;
        Ok((conn, mgmt))
    }

    async fn open_new(
        host: Arc<dyn WorkerHost>,
        name: String,
        url: String,
        mgmt: Option<Weak<MgmtInner>>,
    ) -> Result<Self, ConnectionError> {
        let id = Uuid::new_v4();
        let (core, events) = open_port(&host, &name, &url, id, mgmt.as_ref()).await?;
        Ok(Self {
            id,
            name,
            url,
            host,
            core,
            events: Some(events),
            mgmt,
        })
    }

    /// Open a fresh port after this connection closed. Tracking is kept.
    pub async fn reconnect(&mut self) -> Result<(), ConnectionError> {
        if !self.core.closed.is_fired() {
            return Err(ConnectionError::configuration(
                "cannot reconnect a connection that is still open",
            ));
        }
        if !self.core.close_started.load(Ordering::Acquire)
            && let Err(e) = self.core.port.close()
        {
            tracing::debug!(error = %e, "Port close failed");
        }
        let (core, events) =
            open_port(&self.host, &self.name, &self.url, self.id, self.mgmt.as_ref()).await?;
        self.core = core;
        self.events = Some(events);
        tracing::debug!(name = %self.name, id = %self.id, "Reconnected");
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Application messages from the worker. Refilled by `reconnect()`.
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
        self.core.port.post(data.into(), transfer)?;
        Ok(())
    }

    /// Ask the worker to close this port (and to shut down if it was the last).
    pub fn close_port(&self) -> Result<(), ConnectionError> {
        self.post(PortCommand::ClosePort.message())
    }

    /// Ask the worker to shut down regardless of other ports.
    pub fn close_worker(&self) -> Result<(), ConnectionError> {
        self.post(PortCommand::CloseWorker.message())
    }

    /// Stop relaying and detach from the worker. Idempotent.
    ///
    /// Unlike `close_port()`, this never counts toward the worker's idle
    /// shutdown.
    pub async fn close(&self) {
        self.core.close().await;
    }

    pub async fn wait(&self) {
        self.core.closed.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.is_fired()
    }
}

async fn open_port(
    host: &Arc<dyn WorkerHost>,
    name: &str,
    url: &str,
    id: Uuid,
    mgmt: Option<&Weak<MgmtInner>>,
) -> Result<(Arc<SharedCore>, mpsc::UnboundedReceiver<MessageEvent>), ConnectionError> {
    let port = host.connect_shared(name, url).await?;
    let cancel = CancellationToken::new();
    let mut events = port.listen(cancel.clone())?;

    match events.next().await {
        Some(first) if first.is_null() => {}
        Some(first) if classify(&first.data) == Some(Control::Close) => {
            tracing::debug!(%name, "Worker refused the port");
            release_port(&port, None);
            return Err(ConnectionError::ChannelClosed);
        }
        Some(first) => {
            tracing::warn!(%name, data = %first.data, "Expected ready signal, got a message");
        }
        None => {
            release_port(&port, None);
            return Err(ConnectionError::ChannelClosed);
        }
    }

    let core = Arc::new(SharedCore {
        port,
        cancel,
        closed: ClosedSignal::new(),
        close_started: AtomicBool::new(false),
    });
    let tracker = mgmt.and_then(Weak::upgrade);
    if let Some(tracker) = &tracker {
        tracker.connections.insert(id, Arc::clone(&core));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(shared_relay(
        Arc::clone(&core),
        events,
        tx,
        id,
        tracker.as_ref().map(Arc::downgrade),
    ));
    tracing::debug!(%name, %id, "Shared connection ready");
    Ok((core, rx))
}

async fn shared_relay(
    core: Arc<SharedCore>,
    mut events: EventStream,
    tx: mpsc::UnboundedSender<MessageEvent>,
    id: Uuid,
    mgmt: Option<Weak<MgmtInner>>,
) {
    while let Some(event) = events.next().await {
        match classify(&event.data) {
            Some(Control::Close) => {
                tracing::debug!(%id, "Worker closed the port");
                core.cancel.cancel();
            }
            Some(other) => {
                tracing::warn!(%id, control = ?other, "Dropping unexpected control message");
            }
            None => {
                if tx.send(event).is_err() {
                    tracing::trace!(%id, "Event receiver dropped");
                }
            }
        }
    }
    drop(tx);
    core.closed.fire();

    if let Some(mgmt) = mgmt.and_then(|weak| weak.upgrade()) {
        mgmt.connections
            .remove_if(&id, |_, tracked| Arc::ptr_eq(tracked, &core));
    }
}
