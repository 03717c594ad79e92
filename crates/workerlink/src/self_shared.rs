//! Worker side of a shared worker: the connect multiplexer and its ports.
//!
//! The first port to connect after the ready signal becomes the mgmt port.
//! It carries the worker's stdio to the controller that started it and the
//! control tokens that switch sinks or shut the worker down. Every later port
//! is handed to the application as a [`SelfSharedPort`].
//!
//! Ports that completed setup are kept in a registry. The worker is idle when
//! the registry is empty, which is only checked when a port closes through
//! `ClosePort` or from the worker side; a close that leaves it empty shuts the
//! worker down. A peer's plain `Close` only detaches its port. Marking the
//! worker as shutting down happens under the same lock as that check, so a
//! port that shows up afterwards is refused instead of being stranded.
//!
//! Accepted ports that have not been set up yet are tracked as pending.
//! Shutdown refuses them, and so does dropping one without calling `setup()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::channel::{
    ConnectStream, Endpoint, EventStream, Message, MessageEvent, SharedWorkerScope,
};
use crate::bridge::protocol::{
    CLOSE, Control, PortCommand, classify, control_message, mgmt_ack, port_command, ready,
};
use crate::config::LinkConfig;
use crate::error::ConnectionError;
use crate::lifecycle::{ClosedSignal, Lifecycle, lock};
use crate::redirect::{SinkSet, StdioRedirector};

#[derive(Default)]
struct Registry {
    ports: HashMap<Uuid, Arc<PortCore>>,
    pending: HashMap<Uuid, Arc<PortCore>>,
    shutting_down: bool,
}

struct MuxInner {
    scope: Arc<dyn SharedWorkerScope>,
    redirector: StdioRedirector,
    config: LinkConfig,
    mgmt: Arc<dyn Endpoint>,
    cancel: CancellationToken,
    lifecycle: Lifecycle,
    closed: ClosedSignal,
    registry: Mutex<Registry>,
}

impl MuxInner {
    /// Remove a port. With `idle_check`, returns true if that left the worker
    /// idle, in which case the worker is marked as shutting down before the
    /// lock is released.
    fn deregister(&self, id: Uuid, idle_check: bool) -> bool {
        let mut registry = lock(&self.registry);
        if registry.ports.remove(&id).is_none() || !idle_check {
            return false;
        }
        if registry.ports.is_empty() && !registry.shutting_down {
            registry.shutting_down = true;
            return true;
        }
        false
    }

    async fn shutdown(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }
        tracing::debug!(name = %self.scope.name(), "Shutting down shared worker");

        let (ports, pending): (Vec<Arc<PortCore>>, Vec<Arc<PortCore>>) = {
            let mut registry = lock(&self.registry);
            registry.shutting_down = true;
            (
                registry.ports.drain().map(|(_, core)| core).collect(),
                registry.pending.drain().map(|(_, core)| core).collect(),
            )
        };
        for core in pending {
            tracing::debug!(id = %core.id, "Refusing port that was never set up");
            core.refuse();
        }
        for core in ports {
            core.request_close();
            core.closed.wait().await;
        }

        if let Err(e) = self.mgmt.post(control_message(CLOSE), Vec::new()) {
            tracing::debug!(error = %e, "Close not delivered on mgmt port");
        }
        self.cancel.cancel();
        tokio::time::sleep(self.config.shutdown_yield).await;

        self.redirector.reset();
        if let Err(e) = self.mgmt.close() {
            tracing::debug!(error = %e, "Mgmt port close failed");
        }
        if let Err(e) = self.scope.close() {
            tracing::warn!(error = %e, "Failed to close shared worker scope");
        }
        self.lifecycle.finish();
        self.closed.fire();
        tracing::debug!(name = %self.scope.name(), "Shared worker closed");
    }
}

/// Handle on the worker's multiplexer, returned by [`SelfSharedConnection::setup`].
#[derive(Clone)]
pub struct SelfSharedConnection {
    inner: Arc<MuxInner>,
}

impl SelfSharedConnection {
    pub async fn setup(
        scope: Arc<dyn SharedWorkerScope>,
        redirector: StdioRedirector,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SelfSharedPort>), ConnectionError> {
        Self::setup_with_config(scope, redirector, LinkConfig::default()).await
    }

    /// Announce readiness, bind the mgmt port, and start accepting ports.
    pub async fn setup_with_config(
        scope: Arc<dyn SharedWorkerScope>,
        redirector: StdioRedirector,
        config: LinkConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SelfSharedPort>), ConnectionError> {
        let initial = scope
            .initial_port()
            .ok_or_else(|| ConnectionError::setup("shared worker has no initial port"))?;

        let cancel = CancellationToken::new();
        let mut connects = scope.listen_connect(cancel.clone())?;
        initial.post(ready(), Vec::new())?;

        let mgmt = connects.next().await.ok_or(ConnectionError::ChannelClosed)?;
        redirector.redirect(SinkSet::controller(&mgmt));
        let mgmt_events = mgmt.listen(cancel.child_token())?;
        mgmt.post(mgmt_ack(), Vec::new())?;
        tracing::debug!(name = %scope.name(), "Mgmt port bound");

        let inner = Arc::new(MuxInner {
            scope,
            redirector,
            config,
            mgmt,
            cancel,
            lifecycle: Lifecycle::new(),
            closed: ClosedSignal::new(),
            registry: Mutex::new(Registry::default()),
        });
        tokio::spawn(mgmt_loop(Arc::clone(&inner), mgmt_events));

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(Arc::clone(&inner), connects, tx));
        Ok((Self { inner }, rx))
    }

    pub fn name(&self) -> &str {
        self.inner.scope.name()
    }

    /// No ports are registered. Advisory: it can change right after.
    pub fn idle(&self) -> bool {
        lock(&self.inner.registry).ports.is_empty()
    }

    pub fn port_count(&self) -> usize {
        lock(&self.inner.registry).ports.len()
    }

    /// Close every port, tell the controller, close the worker. A second
    /// caller returns immediately.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    /// Resolves once the worker has shut down.
    pub async fn wait(&self) {
        self.inner.closed.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_fired()
    }

    pub fn redirector(&self) -> &StdioRedirector {
        &self.inner.redirector
    }
}

async fn accept_loop(
    inner: Arc<MuxInner>,
    mut connects: ConnectStream,
    tx: mpsc::UnboundedSender<SelfSharedPort>,
) {
    while let Some(port) = connects.next().await {
        let core = Arc::new(PortCore::new(port));
        {
            let mut registry = lock(&inner.registry);
            if registry.shutting_down {
                drop(registry);
                tracing::debug!(id = %core.id, "Worker shutting down, refusing port");
                core.refuse();
                continue;
            }
            registry.pending.insert(core.id, Arc::clone(&core));
        }
        tracing::trace!(id = %core.id, "Port connected");
        let accepted = SelfSharedPort {
            core,
            mux: Arc::clone(&inner),
        };
        if let Err(mpsc::error::SendError(dropped)) = tx.send(accepted) {
            // Dropping it refuses it.
            tracing::debug!(id = %dropped.id(), "No one is accepting ports");
        }
    }
}

async fn mgmt_loop(inner: Arc<MuxInner>, mut events: EventStream) {
    while let Some(event) = events.next().await {
        match classify(&event.data) {
            Some(Control::Close) => {
                tracing::debug!("Controller requested shutdown");
                inner.shutdown().await;
                break;
            }
            Some(Control::WriteToConsole) => inner.redirector.reset(),
            Some(Control::WriteToController) => {
                inner.redirector.redirect(SinkSet::controller(&inner.mgmt));
            }
            Some(other) => {
                tracing::warn!(control = ?other, "Dropping unexpected control message");
            }
            None => {
                tracing::warn!(data = %event.data, "Ignoring application message on mgmt port");
            }
        }
    }
}

// =============================================================================
// Ports
// =============================================================================

struct PortCore {
    id: Uuid,
    port: Arc<dyn Endpoint>,
    cancel: CancellationToken,
    lifecycle: Lifecycle,
    closed: ClosedSignal,
    started: AtomicBool,
    released: AtomicBool,
}

impl PortCore {
    fn new(port: Arc<dyn Endpoint>) -> Self {
        Self {
            id: Uuid::new_v4(),
            port,
            cancel: CancellationToken::new(),
            lifecycle: Lifecycle::new(),
            closed: ClosedSignal::new(),
            started: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    fn request_close(&self) {
        if self.lifecycle.begin_close() {
            self.cancel.cancel();
        }
    }

    /// Answer with `Close` and let the port go. Only the first call acts.
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.port.post(control_message(CLOSE), Vec::new()) {
            tracing::debug!(id = %self.id, error = %e, "Close ack not delivered");
        }
        if let Err(e) = self.port.close() {
            tracing::debug!(id = %self.id, error = %e, "Port close failed");
        }
        self.lifecycle.finish();
        self.closed.fire();
    }

    /// Turn away a port that never got set up.
    fn refuse(&self) {
        self.lifecycle.begin_close();
        self.cancel.cancel();
        self.release();
    }
}

/// An ordinary port accepted by the shared worker.
pub struct SelfSharedPort {
    core: Arc<PortCore>,
    mux: Arc<MuxInner>,
}

impl SelfSharedPort {
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// Register the port and complete the handshake with its peer.
    ///
    /// Fails with `ChannelClosed` when the worker is already shutting down;
    /// the peer then receives `Close` instead of the ready signal.
    pub fn setup(&self) -> Result<mpsc::UnboundedReceiver<MessageEvent>, ConnectionError> {
        let core = &self.core;
        if core.started.swap(true, Ordering::AcqRel) {
            return Err(ConnectionError::configuration("port already set up"));
        }

        {
            let mut registry = lock(&self.mux.registry);
            registry.pending.remove(&core.id);
            if registry.shutting_down {
                drop(registry);
                tracing::debug!(id = %core.id, "Worker shutting down, refusing port");
                core.refuse();
                return Err(ConnectionError::ChannelClosed);
            }
            registry.ports.insert(core.id, Arc::clone(core));
        }

        let handshake = core
            .port
            .listen(core.cancel.clone())
            .and_then(|events| core.port.post(ready(), Vec::new()).map(|()| events));
        let events = match handshake {
            Ok(events) => events,
            Err(e) => {
                lock(&self.mux.registry).ports.remove(&core.id);
                core.refuse();
                return Err(e.into());
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(port_relay(Arc::clone(core), Arc::clone(&self.mux), events, tx));
        tracing::debug!(id = %core.id, "Port ready");
        Ok(rx)
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

    /// Close this port from the worker side. Idleness is evaluated as for the
    /// peer's `ClosePort`.
    pub async fn close(&self) {
        if self.refuse_unstarted() {
            return;
        }
        self.core.request_close();
        self.core.closed.wait().await;
    }

    pub async fn wait(&self) {
        self.core.closed.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.is_fired()
    }

    /// Refuse the port if `setup()` was never called. Returns whether it did.
    fn refuse_unstarted(&self) -> bool {
        if self.core.started.swap(true, Ordering::AcqRel) {
            return false;
        }
        lock(&self.mux.registry).pending.remove(&self.core.id);
        self.core.refuse();
        true
    }
}

impl Drop for SelfSharedPort {
    fn drop(&mut self) {
        if self.refuse_unstarted() {
            tracing::debug!(id = %self.core.id, "Port dropped before setup, refused");
        }
    }
}

async fn port_relay(
    core: Arc<PortCore>,
    mux: Arc<MuxInner>,
    mut events: EventStream,
    tx: mpsc::UnboundedSender<MessageEvent>,
) {
    let mut shutdown_after = false;
    let mut idle_check = true;
    while let Some(event) = events.next().await {
        match classify(&event.data) {
            Some(Control::Close) => {
                if core.lifecycle.is_listening() {
                    tracing::debug!(id = %core.id, "Peer detached");
                    idle_check = false;
                }
                core.request_close();
            }
            Some(other) => {
                tracing::warn!(id = %core.id, control = ?other, "Dropping unexpected control message");
            }
            None => match port_command(&event.data) {
                Some(PortCommand::ClosePort) => {
                    tracing::debug!(id = %core.id, "Peer closed port");
                    core.request_close();
                }
                Some(PortCommand::CloseWorker) => {
                    tracing::debug!(id = %core.id, "Peer requested worker shutdown");
                    core.request_close();
                    shutdown_after = true;
                }
                None => {
                    if tx.send(event).is_err() {
                        tracing::trace!(id = %core.id, "Event receiver dropped");
                    }
                }
            },
        }
    }
    drop(tx);

    // Deregister before acking, so the peer never sees Close while we still
    // count it.
    let became_idle = mux.deregister(core.id, idle_check);
    core.release();
    if became_idle {
        tracing::debug!(id = %core.id, "Last port closed, worker idle");
    }
    if became_idle || shutdown_after {
        mux.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::ChannelError;

    struct NoInitialPort;

    impl SharedWorkerScope for NoInitialPort {
        fn name(&self) -> &str {
            "orphan"
        }

        fn initial_port(&self) -> Option<Arc<dyn Endpoint>> {
            None
        }

        fn listen_connect(&self, _: CancellationToken) -> Result<ConnectStream, ChannelError> {
            Ok(futures::stream::empty().boxed())
        }

        fn close(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn setup_requires_initial_port() {
        let err = SelfSharedConnection::setup(Arc::new(NoInitialPort), StdioRedirector::new())
            .await
            .err()
            .unwrap();
        insta::assert_snapshot!(err.to_string(), @"setup failed: shared worker has no initial port");
    }
}
