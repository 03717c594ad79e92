//! In-process host: worker programs run as tokio tasks, endpoints are mailboxes.
//!
//! Programs are registered under a path and looked up on spawn. Delivery
//! mirrors a browser worker closely enough to exercise the handshake: the
//! worker-bound inbox of a dedicated worker drops messages while nobody is
//! listening, every other inbox queues until its first listener arms.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::channel::{
    ChannelError, ConnectStream, Endpoint, EventStream, Message, MessageEvent, SharedSpawn,
    SharedWorkerScope, SpawnError, SpawnSpec, WorkerHandle, WorkerHost, WorkerScope,
};
use crate::lifecycle::lock;

/// What happens to items delivered while no listener is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Drop,
    /// Hold items for the first listener; drop once it has come and gone.
    QueueUntilListened,
}

struct MailboxState<T> {
    listeners: Vec<(u64, mpsc::UnboundedSender<T>)>,
    backlog: Option<Vec<T>>,
    next_id: u64,
    closed: bool,
}

struct Mailbox<T> {
    label: &'static str,
    state: Mutex<MailboxState<T>>,
}

impl<T: Clone + Send + 'static> Mailbox<T> {
    fn new(label: &'static str, delivery: Delivery) -> Arc<Self> {
        let backlog = match delivery {
            Delivery::Drop => None,
            Delivery::QueueUntilListened => Some(Vec::new()),
        };
        Arc::new(Self {
            label,
            state: Mutex::new(MailboxState {
                listeners: Vec::new(),
                backlog,
                next_id: 0,
                closed: false,
            }),
        })
    }

    fn deliver(&self, item: T) {
        let mut state = lock(&self.state);
        if state.closed {
            tracing::trace!(mailbox = self.label, "Mailbox closed, dropping item");
            return;
        }
        if state.listeners.is_empty() {
            match state.backlog.as_mut() {
                Some(backlog) => backlog.push(item),
                None => tracing::trace!(mailbox = self.label, "No listener armed, dropping item"),
            }
            return;
        }
        state.listeners.retain(|(_, tx)| tx.send(item.clone()).is_ok());
    }

    fn subscribe(self: &Arc<Self>, cancel: CancellationToken) -> Result<BoxStream<'static, T>, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(ChannelError::Closed);
            }
            let id = state.next_id;
            state.next_id += 1;
            for item in state.backlog.take().into_iter().flatten() {
                let _ = tx.send(item);
            }
            state.listeners.push((id, tx));
            id
        };

        let subscription = Subscription {
            rx,
            cancel,
            mailbox: Arc::clone(self),
            id,
            detached: false,
        };
        Ok(futures::stream::unfold(subscription, |mut sub| async move {
            let item = sub.next().await?;
            Some((item, sub))
        })
        .boxed())
    }

    fn unsubscribe(&self, id: u64) {
        lock(&self.state).listeners.retain(|(other, _)| *other != id);
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.listeners.clear();
        state.backlog = None;
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

struct Subscription<T: Clone + Send + 'static> {
    rx: mpsc::UnboundedReceiver<T>,
    cancel: CancellationToken,
    mailbox: Arc<Mailbox<T>>,
    id: u64,
    detached: bool,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    async fn next(&mut self) -> Option<T> {
        if !self.detached {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    // Dropping our sender lets recv() drain what is queued, then end.
                    self.detached = true;
                    self.mailbox.unsubscribe(self.id);
                }
                item = self.rx.recv() => return item,
            }
        }
        self.rx.recv().await
    }
}

impl<T: Clone + Send + 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        if !self.detached {
            self.mailbox.unsubscribe(self.id);
        }
    }
}

fn event_stream(
    mailbox: &Arc<Mailbox<MessageEvent>>,
    cancel: CancellationToken,
) -> Result<EventStream, ChannelError> {
    mailbox.subscribe(cancel)
}

// =============================================================================
// Message ports
// =============================================================================

/// One side of an entangled port pair.
pub struct LocalPort {
    inbox: Arc<Mailbox<MessageEvent>>,
    peer: Arc<Mailbox<MessageEvent>>,
    closed: AtomicBool,
}

impl LocalPort {
    pub fn pair() -> (Arc<LocalPort>, Arc<LocalPort>) {
        let a = Mailbox::new("port", Delivery::QueueUntilListened);
        let b = Mailbox::new("port", Delivery::QueueUntilListened);
        let left = Arc::new(LocalPort {
            inbox: Arc::clone(&a),
            peer: Arc::clone(&b),
            closed: AtomicBool::new(false),
        });
        let right = Arc::new(LocalPort {
            inbox: b,
            peer: a,
            closed: AtomicBool::new(false),
        });
        (left, right)
    }
}

impl Endpoint for LocalPort {
    fn post(&self, data: Message, transfer: Vec<Bytes>) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.peer.deliver(MessageEvent { data, transfer });
        Ok(())
    }

    fn listen(&self, cancel: CancellationToken) -> Result<EventStream, ChannelError> {
        event_stream(&self.inbox, cancel)
    }

    fn close(&self) -> Result<(), ChannelError> {
        self.closed.store(true, Ordering::Release);
        self.inbox.close();
        Ok(())
    }
}

// =============================================================================
// Dedicated workers
// =============================================================================

struct LocalWorker {
    name: String,
    to_worker: Arc<Mailbox<MessageEvent>>,
    to_controller: Arc<Mailbox<MessageEvent>>,
    task: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl LocalWorker {
    fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            to_worker: Mailbox::new("worker", Delivery::Drop),
            to_controller: Mailbox::new("controller", Delivery::QueueUntilListened),
            task: Mutex::new(None),
            terminated: AtomicBool::new(false),
        })
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(name = %self.name, "Terminating local worker");
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.to_worker.close();
    }
}

/// Controller side of a dedicated worker.
pub struct LocalWorkerHandle(Arc<LocalWorker>);

impl Endpoint for LocalWorkerHandle {
    fn post(&self, data: Message, transfer: Vec<Bytes>) -> Result<(), ChannelError> {
        if self.0.terminated.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.0.to_worker.deliver(MessageEvent { data, transfer });
        Ok(())
    }

    fn listen(&self, cancel: CancellationToken) -> Result<EventStream, ChannelError> {
        event_stream(&self.0.to_controller, cancel)
    }

    /// Releasing the handle stops the worker.
    fn close(&self) -> Result<(), ChannelError> {
        self.0.terminate();
        Ok(())
    }
}

impl WorkerHandle for LocalWorkerHandle {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn terminate(&self) {
        self.0.terminate();
    }
}

/// A dedicated worker's own scope.
pub struct LocalWorkerScope(Arc<LocalWorker>);

impl Endpoint for LocalWorkerScope {
    fn post(&self, data: Message, transfer: Vec<Bytes>) -> Result<(), ChannelError> {
        if self.0.terminated.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.0.to_controller.deliver(MessageEvent { data, transfer });
        Ok(())
    }

    fn listen(&self, cancel: CancellationToken) -> Result<EventStream, ChannelError> {
        event_stream(&self.0.to_worker, cancel)
    }

    fn close(&self) -> Result<(), ChannelError> {
        tracing::debug!(name = %self.0.name, "Local worker closed itself");
        self.0.to_worker.close();
        Ok(())
    }
}

impl WorkerScope for LocalWorkerScope {
    fn name(&self) -> &str {
        &self.0.name
    }
}

// =============================================================================
// Shared workers
// =============================================================================

type SharedRegistry = Mutex<HashMap<String, Arc<LocalSharedWorker>>>;

struct LocalSharedWorker {
    name: String,
    url: String,
    connect: Arc<Mailbox<Arc<dyn Endpoint>>>,
    initial_port: Arc<LocalPort>,
    registry: Weak<SharedRegistry>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LocalSharedWorker {
    /// Open a new port pair and hand the worker side to the connect listener.
    fn open_port(&self) -> Arc<dyn Endpoint> {
        let (controller, worker) = LocalPort::pair();
        let worker: Arc<dyn Endpoint> = worker;
        self.connect.deliver(worker);
        controller
    }
}

/// A shared worker's own scope.
pub struct LocalSharedScope(Arc<LocalSharedWorker>);

impl SharedWorkerScope for LocalSharedScope {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn initial_port(&self) -> Option<Arc<dyn Endpoint>> {
        let port: Arc<dyn Endpoint> = self.0.initial_port.clone();
        Some(port)
    }

    fn listen_connect(&self, cancel: CancellationToken) -> Result<ConnectStream, ChannelError> {
        self.0.connect.subscribe(cancel)
    }

    fn close(&self) -> Result<(), ChannelError> {
        tracing::debug!(name = %self.0.name, "Local shared worker closed itself");
        self.0.connect.close();
        if let Some(registry) = self.0.registry.upgrade() {
            let mut registry = lock(&registry);
            if registry
                .get(&self.0.name)
                .is_some_and(|live| Arc::ptr_eq(live, &self.0))
            {
                registry.remove(&self.0.name);
            }
        }
        // Whatever the program still awaits ends with the worker.
        if let Some(task) = lock(&self.0.task).take() {
            task.abort();
        }
        Ok(())
    }
}

// =============================================================================
// Host
// =============================================================================

/// What a dedicated worker program receives when it starts.
pub struct DedicatedContext {
    pub name: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub scope: Arc<dyn WorkerScope>,
}

/// What a shared worker program receives when it starts.
pub struct SharedContext {
    pub name: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub scope: Arc<dyn SharedWorkerScope>,
}

type ProgramFn<C> = Arc<dyn Fn(C) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
enum Program {
    Dedicated(ProgramFn<DedicatedContext>),
    Shared(ProgramFn<SharedContext>),
}

/// Runs registered worker programs in-process.
#[derive(Default)]
pub struct LocalHost {
    programs: Mutex<HashMap<String, Program>>,
    shared: Arc<SharedRegistry>,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_dedicated<F, Fut>(&self, path: impl Into<String>, program: F)
    where
        F: Fn(DedicatedContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let program: ProgramFn<DedicatedContext> = Arc::new(move |ctx| Box::pin(program(ctx)));
        lock(&self.programs).insert(path.into(), Program::Dedicated(program));
    }

    pub fn register_shared<F, Fut>(&self, path: impl Into<String>, program: F)
    where
        F: Fn(SharedContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let program: ProgramFn<SharedContext> = Arc::new(move |ctx| Box::pin(program(ctx)));
        lock(&self.programs).insert(path.into(), Program::Shared(program));
    }

    /// Whether a shared worker is currently live under `name`.
    pub fn is_shared_running(&self, name: &str) -> bool {
        lock(&self.shared).contains_key(name)
    }

    fn program(&self, path: &str) -> Result<Program, SpawnError> {
        lock(&self.programs)
            .get(path)
            .cloned()
            .ok_or_else(|| SpawnError::ScriptNotFound(path.to_string()))
    }
}

#[async_trait]
impl WorkerHost for LocalHost {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Arc<dyn WorkerHandle>, SpawnError> {
        let Program::Dedicated(program) = self.program(&spec.path)? else {
            return Err(SpawnError::Other(format!(
                "{} is a shared worker script",
                spec.path
            )));
        };
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::debug!(%name, path = %spec.path, "Spawning local worker");

        let worker = LocalWorker::new(name.clone());
        let ctx = DedicatedContext {
            name,
            args: spec.effective_args(),
            env: spec.effective_env(),
            scope: Arc::new(LocalWorkerScope(Arc::clone(&worker))),
        };
        let task = tokio::spawn(program(ctx));
        *lock(&worker.task) = Some(task);
        Ok(Arc::new(LocalWorkerHandle(worker)))
    }

    async fn spawn_shared(&self, spec: &SpawnSpec) -> Result<SharedSpawn, SpawnError> {
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut registry = lock(&self.shared);
        if let Some(existing) = registry.get(&name) {
            tracing::debug!(%name, "Shared worker already live, connecting");
            return Ok(SharedSpawn {
                port: existing.open_port(),
                name,
                url: existing.url.clone(),
            });
        }

        let Program::Shared(program) = self.program(&spec.path)? else {
            return Err(SpawnError::Other(format!(
                "{} is a dedicated worker script",
                spec.path
            )));
        };
        let url = format!("blob:workerlink/{}", Uuid::new_v4());
        tracing::debug!(%name, %url, path = %spec.path, "Spawning local shared worker");

        let (controller, initial) = LocalPort::pair();
        let worker = Arc::new(LocalSharedWorker {
            name: name.clone(),
            url: url.clone(),
            connect: Mailbox::new("connect", Delivery::Drop),
            initial_port: initial,
            registry: Arc::downgrade(&self.shared),
            task: Mutex::new(None),
        });
        registry.insert(name.clone(), Arc::clone(&worker));
        drop(registry);

        let ctx = SharedContext {
            name: name.clone(),
            args: spec.effective_args(),
            env: spec.effective_env(),
            scope: Arc::new(LocalSharedScope(Arc::clone(&worker))),
        };
        let task = tokio::spawn(program(ctx));
        *lock(&worker.task) = Some(task);

        Ok(SharedSpawn {
            port: controller,
            name,
            url,
        })
    }

    async fn connect_shared(
        &self,
        name: &str,
        url: &str,
    ) -> Result<Arc<dyn Endpoint>, SpawnError> {
        if name.is_empty() {
            return Err(SpawnError::MissingName);
        }
        if url.is_empty() {
            return Err(SpawnError::MissingUrl);
        }
        let registry = lock(&self.shared);
        match registry.get(name) {
            Some(worker) if worker.url == url && !worker.connect.is_closed() => {
                Ok(worker.open_port())
            }
            _ => Err(SpawnError::WorkerNotFound {
                name: name.to_string(),
                url: url.to_string(),
            }),
        }
    }
}
