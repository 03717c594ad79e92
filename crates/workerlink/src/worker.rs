//! Worker side of a dedicated connection.
//!
//! Runs inside the worker program. [`SelfConnection::setup`] arms the inbound
//! listener, points the worker's stdio at the controller, and only then posts
//! the ready signal, so nothing the controller sends after the handshake can be
//! lost. The relay strips control tokens and hands application messages to
//! the returned receiver.
//!
//! Closing is cooperative: either side may ask. The controller's `Close` and a
//! local [`SelfCloser::close`] run the same sequence, guarded so it happens
//! once: stop listening, drain, acknowledge with `Close`, yield, close the
//! scope.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::bridge::channel::{Endpoint, EventStream, Message, MessageEvent, WorkerScope};
use crate::bridge::protocol::{CLOSE, Control, StreamId, classify, control_message, ready};
use crate::config::LinkConfig;
use crate::error::ConnectionError;
use crate::lifecycle::{ClosedSignal, Lifecycle};
use crate::redirect::{Sink, SinkSet, StdioRedirector};

pub struct SelfConnection {
    scope: Arc<dyn WorkerScope>,
    redirector: StdioRedirector,
    config: LinkConfig,
}

impl SelfConnection {
    pub fn new(scope: Arc<dyn WorkerScope>, redirector: StdioRedirector) -> Self {
        Self {
            scope,
            redirector,
            config: LinkConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        self.scope.name()
    }

    /// Handshake with stdio going to both the console and the controller.
    pub fn setup(
        self,
    ) -> Result<(mpsc::UnboundedReceiver<MessageEvent>, SelfCloser), ConnectionError> {
        let endpoint: Arc<dyn Endpoint> = self.scope.clone();
        let sinks = SinkSet::console_and_controller(&endpoint);
        self.setup_with_sinks(sinks)
    }

    pub fn setup_with_sinks(
        self,
        sinks: SinkSet,
    ) -> Result<(mpsc::UnboundedReceiver<MessageEvent>, SelfCloser), ConnectionError> {
        let cancel = CancellationToken::new();
        let events = self.scope.listen(cancel.clone())?;
        self.redirector.redirect(sinks);
        self.scope.post(ready(), Vec::new())?;
        tracing::debug!(name = %self.scope.name(), "Worker ready");

        let inner = Arc::new(SelfInner {
            scope: self.scope,
            redirector: self.redirector,
            config: self.config,
            cancel,
            lifecycle: Lifecycle::new(),
            relay_done: ClosedSignal::new(),
            closed: ClosedSignal::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(relay(Arc::clone(&inner), events, tx));
        Ok((rx, SelfCloser { inner }))
    }
}

struct SelfInner {
    scope: Arc<dyn WorkerScope>,
    redirector: StdioRedirector,
    config: LinkConfig,
    cancel: CancellationToken,
    lifecycle: Lifecycle,
    relay_done: ClosedSignal,
    closed: ClosedSignal,
}

impl SelfInner {
    fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.scope.clone()
    }

    /// Runs after the relay drained. Only the winner of `begin_close` gets here.
    async fn finish_close(&self) {
        if let Err(e) = self.scope.post(control_message(CLOSE), Vec::new()) {
            tracing::debug!(error = %e, "Could not acknowledge close");
        }
        tokio::time::sleep(self.config.shutdown_yield).await;
        if let Err(e) = self.scope.close() {
            tracing::warn!(error = %e, "Failed to close worker scope");
        }
        self.lifecycle.finish();
        self.closed.fire();
        tracing::debug!(name = %self.scope.name(), "Worker closed");
    }
}

async fn relay(
    inner: Arc<SelfInner>,
    mut events: EventStream,
    tx: mpsc::UnboundedSender<MessageEvent>,
) {
    let mut close_requested = false;
    while let Some(event) = events.next().await {
        match classify(&event.data) {
            Some(Control::Close) => {
                tracing::debug!("Controller requested close");
                if inner.lifecycle.begin_close() {
                    close_requested = true;
                    inner.cancel.cancel();
                }
            }
            Some(Control::WriteToConsole) => inner.redirector.reset(),
            Some(Control::WriteToController) => {
                inner.redirector.redirect(SinkSet::controller(&inner.endpoint()));
            }
            Some(other) => {
                tracing::warn!(control = ?other, "Dropping unexpected control message");
            }
            None => {
                if tx.send(event).is_err() {
                    tracing::trace!("Event receiver dropped");
                }
            }
        }
    }
    drop(tx);
    inner.relay_done.fire();
    if close_requested {
        inner.finish_close().await;
    }
}

/// Control handle returned by [`SelfConnection::setup`]. Cheap to clone.
#[derive(Clone)]
pub struct SelfCloser {
    inner: Arc<SelfInner>,
}

impl SelfCloser {
    /// Close the worker. Safe from inside the loop consuming events; a second
    /// call returns immediately.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        if !self.inner.lifecycle.begin_close() {
            return Ok(());
        }
        self.inner.cancel.cancel();
        self.inner.relay_done.wait().await;
        self.inner.finish_close().await;
        Ok(())
    }

    /// Resolves once the close sequence has completed, whoever started it.
    pub async fn wait(&self) {
        self.inner.closed.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_fired()
    }

    pub fn name(&self) -> &str {
        self.inner.scope.name()
    }

    pub fn post(&self, data: impl Into<Message>) -> Result<(), ConnectionError> {
        self.post_with_transfer(data, Vec::new())
    }

    pub fn post_with_transfer(
        &self,
        data: impl Into<Message>,
        transfer: Vec<Bytes>,
    ) -> Result<(), ConnectionError> {
        self.inner.scope.post(data.into(), transfer)?;
        Ok(())
    }

    pub fn write_to_null(&self) {
        self.inner.redirector.redirect(SinkSet::discard());
    }

    pub fn reset_write_sync(&self) {
        self.inner.redirector.reset();
    }

    pub fn write_to_controller(&self) {
        self.inner
            .redirector
            .redirect(SinkSet::controller(&self.inner.endpoint()));
    }

    pub fn controller_sink(&self, stream: StreamId) -> Sink {
        Sink::controller(self.inner.endpoint(), stream)
    }

    pub fn redirector(&self) -> &StdioRedirector {
        &self.inner.redirector
    }
}
