use std::collections::HashMap;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::config::proxy::HandlerSettings;
use crate::metrics;
use crate::server::services::provider_services::Provider;
use crate::server::utils::template_utils;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to spawn handler: {0}")]
    Spawn(String),
    #[error("upstream stream failed: {0}")]
    Upstream(String),
}

#[derive(Debug, Error)]
#[error("no stream permits available")]
pub struct PermitExhausted;

/// a configured command vector plus its template and environment vars;
/// rendering happens per spawn so `{{url}}` and friends come from the
/// request
#[derive(Debug, Clone, Default)]
pub struct ShellStreamer {
    command: Vec<String>,
    env_vars: Vec<(String, String)>,
    template_vars: HashMap<String, String>,
}

impl ShellStreamer {
    pub fn from_handler(handler: &HandlerSettings) -> Self {
        Self {
            command: handler.command.0.clone(),
            env_vars: handler
                .env_vars
                .iter()
                .map(|nv| (nv.name.clone(), nv.value.clone()))
                .collect(),
            template_vars: handler
                .template_vars
                .iter()
                .map(|nv| (nv.name.clone(), nv.value.clone()))
                .collect(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.command.is_empty()
    }

    pub fn spawn(&self, extra_vars: &[(&str, &str)]) -> Result<Child, StreamError> {
        if !self.is_configured() {
            return Err(StreamError::Spawn("no command configured".to_string()));
        }

        let mut vars = self.template_vars.clone();
        for (name, value) in extra_vars {
            vars.insert(name.to_string(), value.to_string());
        }

        let rendered = template_utils::render_all(&self.command, &vars);

        let mut command = Command::new(&rendered[0]);
        command
            .args(&rendered[1..])
            .envs(self.env_vars.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        command.spawn().map_err(|e| StreamError::Spawn(e.to_string()))
    }
}

/// permits held for the lifetime of one proxied stream; field order is
/// the release order, the reverse of acquisition
pub struct PermitSet {
    _client: Option<OwnedSemaphorePermit>,
    _provider: Option<OwnedSemaphorePermit>,
    _server: Option<OwnedSemaphorePermit>,
}

impl PermitSet {
    pub fn empty() -> Self {
        Self {
            _client: None,
            _provider: None,
            _server: None,
        }
    }
}

/// acquires up to three nested permits in server, provider, client
/// order; any failure drops whatever was already held
pub async fn acquire_permits(
    server: Option<Arc<Semaphore>>,
    provider: Option<Arc<Semaphore>>,
    client: Option<Arc<Semaphore>>,
    wait: Option<std::time::Duration>,
) -> Result<PermitSet, PermitExhausted> {
    let server = acquire_one(server, wait).await?;
    let provider = acquire_one(provider, wait).await?;
    let client = acquire_one(client, wait).await?;
    Ok(PermitSet {
        _client: client,
        _provider: provider,
        _server: server,
    })
}

async fn acquire_one(
    semaphore: Option<Arc<Semaphore>>,
    wait: Option<std::time::Duration>,
) -> Result<Option<OwnedSemaphorePermit>, PermitExhausted> {
    let Some(semaphore) = semaphore else {
        return Ok(None);
    };
    match wait {
        Some(wait) if !wait.is_zero() => {
            match tokio::time::timeout(wait, semaphore.acquire_owned()).await {
                Ok(Ok(permit)) => Ok(Some(permit)),
                _ => Err(PermitExhausted),
            }
        }
        _ => semaphore
            .try_acquire_owned()
            .map(Some)
            .map_err(|_| PermitExhausted),
    }
}

struct StreamGuard {
    child: Option<Child>,
    _permits: PermitSet,
    provider_name: Option<String>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(provider_name) = self.provider_name.take() {
            metrics::active_streams().dec();
            metrics::add_provider_streams(&provider_name, -1);
        }

        // collect the exit status off to the side; kill_on_drop already
        // took care of runaway processes when the client went away
        if let Some(mut child) = self.child.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    match child.wait().await {
                        Ok(status) if !status.success() => {
                            debug!("stream handler exited with {status}");
                        }
                        Ok(_) => {}
                        Err(e) => debug!("failed to reap stream handler: {e}"),
                    }
                });
            }
        }
    }
}

/// body of a proxied stream: the probe chunk first, then the live
/// process output; dropping it releases permits and kills the process
pub struct ProcessBody {
    first: Option<Bytes>,
    stdout: ReaderStream<ChildStdout>,
    _guard: StreamGuard,
}

impl Stream for ProcessBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(first) = this.first.take() {
            return Poll::Ready(Some(Ok(first)));
        }
        Pin::new(&mut this.stdout).poll_next(cx)
    }
}

/// renders and spawns the provider's stream command for the first
/// (highest priority) upstream url and waits for the first bytes; an
/// exit before any output surfaces as an upstream error so the caller
/// can fall back to the error clip
pub async fn run_stream(
    provider: &Provider,
    url: &str,
    permits: PermitSet,
) -> Result<ProcessBody, StreamError> {
    let mut child = provider.stream_streamer().spawn(&[("url", url)])?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| StreamError::Spawn("handler has no stdout".to_string()))?;
    drain_stderr(&mut child);

    let mut stdout = ReaderStream::with_capacity(stdout, 64 * 1024);

    use futures::StreamExt;
    match stdout.next().await {
        Some(Ok(first)) => {
            metrics::active_streams().inc();
            metrics::add_provider_streams(provider.name(), 1);
            Ok(ProcessBody {
                first: Some(first),
                stdout,
                _guard: StreamGuard {
                    child: Some(child),
                    _permits: permits,
                    provider_name: Some(provider.name().to_string()),
                },
            })
        }
        Some(Err(e)) => {
            let _ = child.start_kill();
            Err(StreamError::Upstream(e.to_string()))
        }
        None => {
            let status = child.wait().await;
            Err(StreamError::Upstream(format!(
                "handler produced no output, exit: {status:?}"
            )))
        }
    }
}

/// spawns one of the error clips and streams its output; returns None
/// when the handler is not configured or refuses to start
pub async fn run_clip(streamer: &ShellStreamer) -> Option<ProcessBody> {
    if !streamer.is_configured() {
        return None;
    }

    let mut child = match streamer.spawn(&[]) {
        Ok(child) => child,
        Err(e) => {
            warn!("failed to spawn error clip: {e}");
            return None;
        }
    };

    let stdout = child.stdout.take()?;
    drain_stderr(&mut child);

    Some(ProcessBody {
        first: None,
        stdout: ReaderStream::with_capacity(stdout, 64 * 1024),
        _guard: StreamGuard {
            child: Some(child),
            _permits: PermitSet::empty(),
            provider_name: None,
        },
    })
}

fn drain_stderr(child: &mut Child) {
    if let Some(mut stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut collected = String::new();
            let _ = stderr.read_to_string(&mut collected).await;
            let collected = collected.trim();
            if !collected.is_empty() {
                debug!("stream handler stderr: {collected}");
            }
        });
    }
}
