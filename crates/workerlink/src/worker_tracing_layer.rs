//! Tracing layer for code running inside a worker.
//!
//! Renders each event as a `[level target] message` line into the
//! redirector's stderr stream, so worker diagnostics reach whatever sinks are
//! active (console, controller, both) like any other stderr output.

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::redirect::{StdioRedirector, StreamId, is_dispatching};

pub struct WorkerTracingLayer {
    redirector: StdioRedirector,
}

impl WorkerTracingLayer {
    pub fn new(redirector: StdioRedirector) -> Self {
        Self { redirector }
    }

    fn level_to_string(level: &Level) -> &'static str {
        match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        }
    }
}

impl<S> Layer<S> for WorkerTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        // Events raised by a sink would come straight back here.
        if is_dispatching() {
            return;
        }

        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let line = format!(
            "[{} {}] {}\n",
            Self::level_to_string(metadata.level()),
            metadata.target(),
            visitor.message
        );
        self.redirector.write(StreamId::Stderr, line.as_bytes());
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::lock;
    use crate::redirect::{Sink, SinkSet};
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn events_become_stderr_lines() {
        let capture = Capture::default();
        let redirector = StdioRedirector::with_original(
            SinkSet::discard().with_stderr(vec![Sink::raw(capture.clone())]),
        );
        let subscriber =
            tracing_subscriber::registry().with(WorkerTracingLayer::new(redirector.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "worker::app", "disk almost full");
            tracing::info!(target: "worker::app", "{} items", 3);
        });

        let text = String::from_utf8(lock(&capture.0).clone()).unwrap();
        insta::assert_snapshot!(text.trim_end(), @r"
        [warn worker::app] disk almost full
        [info worker::app] 3 items
        ");
    }

    #[test]
    fn console_sink_does_not_loop() {
        let capture = Capture::default();
        let redirector = StdioRedirector::with_original(
            SinkSet::discard().with_stderr(vec![Sink::Console, Sink::raw(capture.clone())]),
        );
        let subscriber =
            tracing_subscriber::registry().with(WorkerTracingLayer::new(redirector.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "worker::app", "once");
        });

        let text = String::from_utf8(lock(&capture.0).clone()).unwrap();
        assert_eq!(text, "[error worker::app] once\n");
    }
}
