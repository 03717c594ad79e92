//! Line-oriented stdio redirection inside a worker.
//!
//! The worker's output streams are funnelled through a [`StdioRedirector`]:
//! raw writes are buffered per stream until a newline, and each complete line
//! is fanned out to the sinks currently active for that stream. Connections
//! switch the active set at runtime (console, controller, both, nothing).
//!
//! The redirector is an explicit instance. Whatever in the worker produces
//! output (an `io::Write` adaptor, the tracing layer, a runtime hook) is
//! handed a clone.
//!
//! Sinks run with the redirector's lock held so a sink switch never splits a
//! line. A sink that writes back into the redirector on the same thread would
//! deadlock; such writes are discarded instead (see [`is_dispatching`]).

use std::cell::Cell;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::bridge::channel::Endpoint;
use crate::bridge::codec::LineDecoder;
use crate::bridge::protocol::stdio_message;
use crate::lifecycle::lock;

pub use crate::bridge::protocol::StreamId;

pub type RawWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Where a complete line goes.
#[derive(Clone)]
pub enum Sink {
    /// The host log, as an info event on `workerlink::console`.
    Console,
    /// Posted to the controller as a stdio-prefixed message.
    Controller {
        endpoint: Arc<dyn Endpoint>,
        stream: StreamId,
    },
    /// Written with a trailing newline to an arbitrary writer.
    Raw(RawWriter),
    Discard,
}

impl Sink {
    pub fn controller(endpoint: Arc<dyn Endpoint>, stream: StreamId) -> Self {
        Self::Controller { endpoint, stream }
    }

    pub fn raw(writer: impl Write + Send + 'static) -> Self {
        Self::Raw(Arc::new(Mutex::new(Box::new(writer))))
    }

    fn emit(&self, stream: StreamId, line: &str) -> io::Result<()> {
        match self {
            Self::Console => {
                tracing::info!(target: "workerlink::console", %stream, "{line}");
                Ok(())
            }
            Self::Controller { endpoint, stream } => endpoint
                .post(stdio_message(*stream, line), Vec::new())
                .map_err(io::Error::other),
            Self::Raw(writer) => {
                let mut writer = lock(writer);
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
                writer.flush()
            }
            Self::Discard => Ok(()),
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Console => f.write_str("Console"),
            Self::Controller { stream, .. } => write!(f, "Controller({stream})"),
            Self::Raw(_) => f.write_str("Raw"),
            Self::Discard => f.write_str("Discard"),
        }
    }
}

/// Ordered sinks per stream. Order is fan-out order.
#[derive(Clone, Debug, Default)]
pub struct SinkSet {
    pub stdout: Vec<Sink>,
    pub stderr: Vec<Sink>,
}

impl SinkSet {
    pub fn console() -> Self {
        Self {
            stdout: vec![Sink::Console],
            stderr: vec![Sink::Console],
        }
    }

    pub fn controller(endpoint: &Arc<dyn Endpoint>) -> Self {
        Self {
            stdout: vec![Sink::controller(Arc::clone(endpoint), StreamId::Stdout)],
            stderr: vec![Sink::controller(Arc::clone(endpoint), StreamId::Stderr)],
        }
    }

    pub fn console_and_controller(endpoint: &Arc<dyn Endpoint>) -> Self {
        Self {
            stdout: vec![
                Sink::Console,
                Sink::controller(Arc::clone(endpoint), StreamId::Stdout),
            ],
            stderr: vec![
                Sink::Console,
                Sink::controller(Arc::clone(endpoint), StreamId::Stderr),
            ],
        }
    }

    pub fn discard() -> Self {
        Self {
            stdout: vec![Sink::Discard],
            stderr: vec![Sink::Discard],
        }
    }

    pub fn with_stdout(mut self, sinks: Vec<Sink>) -> Self {
        self.stdout = sinks;
        self
    }

    pub fn with_stderr(mut self, sinks: Vec<Sink>) -> Self {
        self.stderr = sinks;
        self
    }

    pub fn for_stream(&self, stream: StreamId) -> &[Sink] {
        match stream {
            StreamId::Stdout => &self.stdout,
            StreamId::Stderr => &self.stderr,
        }
    }
}

thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// True while this thread is delivering lines to sinks.
pub fn is_dispatching() -> bool {
    DISPATCHING.with(Cell::get)
}

struct DispatchGuard;

impl DispatchGuard {
    fn enter() -> Option<Self> {
        if DISPATCHING.with(|d| d.replace(true)) {
            None
        } else {
            Some(Self)
        }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|d| d.set(false));
    }
}

#[derive(Default)]
struct LineBuffer {
    decoder: LineDecoder,
    pending: BytesMut,
}

struct RedirectState {
    original: SinkSet,
    active: SinkSet,
    stdout: LineBuffer,
    stderr: LineBuffer,
}

#[derive(Clone)]
pub struct StdioRedirector {
    inner: Arc<Mutex<RedirectState>>,
}

impl Default for StdioRedirector {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioRedirector {
    /// A redirector whose original sinks are the console for both streams.
    pub fn new() -> Self {
        Self::with_original(SinkSet::console())
    }

    pub fn with_original(original: SinkSet) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RedirectState {
                active: original.clone(),
                original,
                stdout: LineBuffer::default(),
                stderr: LineBuffer::default(),
            })),
        }
    }

    pub fn redirect(&self, sinks: SinkSet) {
        tracing::debug!(stdout = ?sinks.stdout, stderr = ?sinks.stderr, "Redirecting stdio");
        lock(&self.inner).active = sinks;
    }

    /// Restore the sinks given at construction.
    pub fn reset(&self) {
        {
            let mut state = lock(&self.inner);
            state.active = state.original.clone();
        }
        tracing::debug!("Stdio sinks reset");
    }

    pub fn active(&self) -> SinkSet {
        lock(&self.inner).active.clone()
    }

    /// Accept a fragment of output. Always consumes the whole buffer.
    pub fn write(&self, stream: StreamId, buf: &[u8]) -> usize {
        let Some(_guard) = DispatchGuard::enter() else {
            return buf.len();
        };

        let mut state = lock(&self.inner);
        let RedirectState {
            active,
            stdout,
            stderr,
            ..
        } = &mut *state;
        let LineBuffer { decoder, pending } = match stream {
            StreamId::Stdout => stdout,
            StreamId::Stderr => stderr,
        };
        pending.extend_from_slice(buf);

        loop {
            match decoder.decode(pending) {
                Ok(Some(line)) => dispatch(active.for_stream(stream), stream, &line),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(%stream, error = %e, "Dropping undecodable output");
                    pending.clear();
                    break;
                }
            }
        }
        buf.len()
    }

    /// Like [`write`](Self::write), addressed by fd number (1 or 2).
    pub fn write_fd(&self, fd: i32, buf: &[u8]) -> io::Result<usize> {
        let stream = StreamId::from_fd(fd).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("unknown stream id {fd}"))
        })?;
        Ok(self.write(stream, buf))
    }

    pub fn writer(&self, stream: StreamId) -> RedirectWriter {
        RedirectWriter {
            redirector: self.clone(),
            stream,
        }
    }

    pub fn writer_fd(&self, fd: i32) -> io::Result<RedirectWriter> {
        let stream = StreamId::from_fd(fd).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("unknown stream id {fd}"))
        })?;
        Ok(self.writer(stream))
    }
}

fn dispatch(sinks: &[Sink], stream: StreamId, line: &str) {
    for sink in sinks {
        if let Err(e) = sink.emit(stream, line) {
            tracing::warn!(%stream, ?sink, error = %e, "Sink write failed");
        }
    }
}

/// `io::Write` into one stream of a redirector.
pub struct RedirectWriter {
    redirector: StdioRedirector,
    stream: StreamId,
}

impl Write for RedirectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.redirector.write(self.stream, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::local::LocalPort;
    use futures::StreamExt;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8(lock(&self.0).clone()).unwrap()
        }
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("broken pipe"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fragments_are_joined_into_lines() {
        let capture = Capture::default();
        let redirector = StdioRedirector::new();
        redirector.redirect(SinkSet::discard().with_stdout(vec![Sink::raw(capture.clone())]));

        assert_eq!(redirector.write(StreamId::Stdout, b"ab"), 2);
        assert_eq!(capture.text(), "");
        redirector.write(StreamId::Stdout, b"c\n");
        assert_eq!(capture.text(), "abc\n");
    }

    #[test]
    fn streams_buffer_independently() {
        let out = Capture::default();
        let err = Capture::default();
        let redirector = StdioRedirector::with_original(
            SinkSet::default()
                .with_stdout(vec![Sink::raw(out.clone())])
                .with_stderr(vec![Sink::raw(err.clone())]),
        );

        redirector.write(StreamId::Stdout, b"out-");
        redirector.write(StreamId::Stderr, b"err\n");
        redirector.write(StreamId::Stdout, b"done\r\n");

        assert_eq!(out.text(), "out-done\n");
        assert_eq!(err.text(), "err\n");
    }

    #[test]
    fn failing_sink_does_not_stop_fan_out() {
        let before = Capture::default();
        let after = Capture::default();
        let redirector = StdioRedirector::new();
        redirector.redirect(SinkSet::discard().with_stderr(vec![
            Sink::raw(before.clone()),
            Sink::raw(Broken),
            Sink::raw(after.clone()),
        ]));

        let written = redirector.write(StreamId::Stderr, b"one\ntwo\n");
        assert_eq!(written, 8);
        assert_eq!(before.text(), "one\ntwo\n");
        assert_eq!(after.text(), "one\ntwo\n");
    }

    #[test]
    fn reset_restores_original() {
        let original = Capture::default();
        let other = Capture::default();
        let redirector = StdioRedirector::with_original(
            SinkSet::discard().with_stdout(vec![Sink::raw(original.clone())]),
        );

        redirector.redirect(SinkSet::discard().with_stdout(vec![Sink::raw(other.clone())]));
        redirector.write(StreamId::Stdout, b"a\n");
        redirector.reset();
        redirector.write(StreamId::Stdout, b"b\n");

        assert_eq!(other.text(), "a\n");
        assert_eq!(original.text(), "b\n");
    }

    #[test]
    fn unknown_fd_is_rejected() {
        let redirector = StdioRedirector::new();
        let err = redirector.write_fd(3, b"x\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(redirector.writer_fd(0).is_err());
        assert_eq!(redirector.write_fd(2, b"x").unwrap(), 1);
    }

    #[test]
    fn reentrant_write_is_discarded() {
        struct Echo(StdioRedirector, Capture);

        impl Write for Echo {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                assert!(is_dispatching());
                self.0.write(StreamId::Stdout, b"loop\n");
                self.1.write(buf)
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let capture = Capture::default();
        let redirector = StdioRedirector::new();
        redirector.redirect(
            SinkSet::discard()
                .with_stdout(vec![Sink::raw(Echo(redirector.clone(), capture.clone()))]),
        );

        redirector.write(StreamId::Stdout, b"once\n");
        assert_eq!(capture.text(), "once\n");
        assert!(!is_dispatching());
    }

    #[test]
    fn io_write_adaptor() {
        let capture = Capture::default();
        let redirector = StdioRedirector::new();
        redirector.redirect(SinkSet::discard().with_stdout(vec![Sink::raw(capture.clone())]));

        let mut out = redirector.writer(StreamId::Stdout);
        writeln!(out, "x = {}", 1).unwrap();
        assert_eq!(capture.text(), "x = 1\n");
    }

    #[tokio::test]
    async fn controller_sink_posts_prefixed_lines() {
        let (worker_side, controller_side) = LocalPort::pair();
        let endpoint: Arc<dyn Endpoint> = worker_side;
        let redirector = StdioRedirector::new();
        redirector.redirect(SinkSet::controller(&endpoint));

        redirector.write(StreamId::Stdout, b"hi\n");
        redirector.write(StreamId::Stderr, b"oops\n");

        let mut events = controller_side.listen(CancellationToken::new()).unwrap();
        assert_eq!(
            events.next().await.unwrap().data,
            json!("__WORKERLINK_STDOUT__hi\n")
        );
        assert_eq!(
            events.next().await.unwrap().data,
            json!("__WORKERLINK_STDERR__oops\n")
        );
    }
}
