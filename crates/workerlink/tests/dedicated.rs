use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::json;
use tokio_util::codec::FramedRead;
use tracing_subscriber::layer::SubscriberExt;
use workerlink::bridge::codec::LineDecoder;
use workerlink::{
    ChannelError, ConnectionError, DedicatedConnection, LocalHost, SelfConnection, SpawnSpec,
    StdioRedirector, StreamId, WorkerTracingLayer,
};

const TIMEOUT: Duration = Duration::from_secs(2);

/// Prints every string it receives on stdout, echoes everything else back,
/// closes itself on "Close" and logs a warning on "warn".
fn echo_host() -> Arc<LocalHost> {
    let host = LocalHost::new();
    host.register_dedicated("echo.wasm", |ctx| async move {
        let redirector = StdioRedirector::new();
        let Ok((mut events, closer)) =
            SelfConnection::new(ctx.scope, redirector.clone()).setup()
        else {
            return;
        };
        let mut stdout = redirector.writer(StreamId::Stdout);
        while let Some(event) = events.recv().await {
            match event.as_str() {
                Some("Close") => {
                    let _ = closer.close().await;
                }
                Some("warn") => {
                    let subscriber = tracing_subscriber::registry()
                        .with(WorkerTracingLayer::new(redirector.clone()));
                    tracing::subscriber::with_default(subscriber, || {
                        tracing::warn!(target: "echo", "running low");
                    });
                }
                Some(text) => {
                    let _ = writeln!(stdout, "{text}");
                }
                None => {
                    let _ = closer.post(event.data);
                }
            }
        }
    });
    Arc::new(host)
}

#[tokio::test]
async fn hello_then_close() -> Result<()> {
    let mut conn = DedicatedConnection::new(echo_host(), SpawnSpec::new("echo.wasm"));
    let stdout = conn.stdout_pipe()?;
    conn.start().await?;

    let mut lines = FramedRead::new(stdout, LineDecoder::new());
    conn.post("Hello")?;
    let line = tokio::time::timeout(TIMEOUT, lines.next())
        .await?
        .context("stdout ended")??;
    assert_eq!(line, "Hello");

    conn.post("Close")?;
    tokio::time::timeout(TIMEOUT, conn.wait()).await?;
    assert!(conn.is_closed());

    // Pipe writers are shut down with the relay.
    assert!(tokio::time::timeout(TIMEOUT, lines.next()).await?.is_none());
    Ok(())
}

/// Posts every message straight back, closing itself on "Close".
fn reply_host() -> Arc<LocalHost> {
    let host = LocalHost::new();
    host.register_dedicated("reply.wasm", |ctx| async move {
        let Ok((mut events, closer)) =
            SelfConnection::new(ctx.scope, StdioRedirector::new()).setup()
        else {
            return;
        };
        while let Some(event) = events.recv().await {
            if event.as_str() == Some("Close") {
                let _ = closer.close().await;
                continue;
            }
            let _ = closer.post(event.data);
        }
    });
    Arc::new(host)
}

#[tokio::test]
async fn hello_reply_then_close_ends_events() -> Result<()> {
    let mut conn = DedicatedConnection::new(reply_host(), SpawnSpec::new("reply.wasm"));
    conn.start().await?;
    let mut events = conn.take_events().context("events already taken")?;

    conn.post("Hello")?;
    let reply = tokio::time::timeout(TIMEOUT, events.recv()).await?.context("closed")?;
    assert_eq!(reply.as_str(), Some("Hello"));

    conn.post("Close")?;
    assert!(tokio::time::timeout(TIMEOUT, events.recv()).await?.is_none());
    tokio::time::timeout(TIMEOUT, conn.wait()).await?;
    assert!(conn.is_closed());
    Ok(())
}

#[tokio::test]
async fn application_messages_reach_consumer() -> Result<()> {
    let mut conn = DedicatedConnection::new(echo_host(), SpawnSpec::new("echo.wasm"));
    conn.start().await?;
    let mut events = conn.take_events().context("events already taken")?;
    assert!(conn.take_events().is_none());

    conn.post(json!({"n": 1}))?;
    conn.post(json!([1, 2]))?;
    let first = tokio::time::timeout(TIMEOUT, events.recv()).await?.context("closed")?;
    let second = tokio::time::timeout(TIMEOUT, events.recv()).await?.context("closed")?;
    assert_eq!(first.data, json!({"n": 1}));
    assert_eq!(second.data, json!([1, 2]));
    Ok(())
}

#[tokio::test]
async fn stdout_without_pipe_passes_through() -> Result<()> {
    let mut conn = DedicatedConnection::new(echo_host(), SpawnSpec::new("echo.wasm"));
    conn.start().await?;
    let mut events = conn.take_events().context("events already taken")?;

    conn.post("line")?;
    let event = tokio::time::timeout(TIMEOUT, events.recv()).await?.context("closed")?;
    assert_eq!(event.as_str(), Some("__WORKERLINK_STDOUT__line\n"));
    Ok(())
}

#[tokio::test]
async fn worker_logs_arrive_on_stderr() -> Result<()> {
    let mut conn = DedicatedConnection::new(echo_host(), SpawnSpec::new("echo.wasm"));
    let stderr = conn.stderr_pipe()?;
    conn.start().await?;

    conn.post("warn")?;
    let mut lines = FramedRead::new(stderr, LineDecoder::new());
    let line = tokio::time::timeout(TIMEOUT, lines.next())
        .await?
        .context("stderr ended")??;
    insta::assert_snapshot!(line, @"[warn echo] running low");
    Ok(())
}

#[tokio::test]
async fn controller_close_is_idempotent() -> Result<()> {
    let mut conn = DedicatedConnection::new(echo_host(), SpawnSpec::new("echo.wasm"));
    conn.start().await?;

    conn.close()?;
    conn.close()?;
    tokio::time::timeout(TIMEOUT, conn.wait()).await?;
    conn.close()?;
    Ok(())
}

#[tokio::test]
async fn terminate_is_a_hard_stop() -> Result<()> {
    let mut conn = DedicatedConnection::new(echo_host(), SpawnSpec::new("echo.wasm"));
    conn.start().await?;

    conn.terminate();
    conn.terminate();
    tokio::time::timeout(TIMEOUT, conn.wait()).await?;

    let err = conn.post("late").unwrap_err();
    assert!(matches!(err, ConnectionError::Channel(ChannelError::Closed)));
    Ok(())
}

#[tokio::test]
async fn generated_name_is_written_back() -> Result<()> {
    let mut conn = DedicatedConnection::new(echo_host(), SpawnSpec::new("echo.wasm"));
    assert!(conn.name().is_none());
    conn.start().await?;
    let name = conn.name().context("no name")?;
    assert!(uuid::Uuid::parse_str(name).is_ok());

    let mut named = DedicatedConnection::new(
        echo_host(),
        SpawnSpec::new("echo.wasm").with_name("printer"),
    );
    named.start().await?;
    assert_eq!(named.name(), Some("printer"));
    Ok(())
}

#[tokio::test]
async fn misconfiguration_is_reported() -> Result<()> {
    let mut conn = DedicatedConnection::new(echo_host(), SpawnSpec::new("echo.wasm"));
    conn.start().await?;

    let err = conn.start().await.unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"invalid configuration: worker already started");

    let err = conn.stdout_pipe().unwrap_err();
    insta::assert_snapshot!(
        err.to_string(),
        @"invalid configuration: stdout cannot be set after the worker started"
    );

    let mut missing = DedicatedConnection::new(echo_host(), SpawnSpec::new("missing.wasm"));
    let err = missing.start().await.unwrap_err();
    assert!(matches!(err, ConnectionError::Spawn(_)));
    Ok(())
}
