//! The stub: relays caller requests to whichever skeleton is attached
//!
//! Callers are the process's own stdin/stdout and, optionally, every
//! connection on a caller socket. Each caller is served by its own task,
//! one line at a time, so answers come back in the order of its requests.
//!
//! Shutdown happens in two steps. `shutdown` stops accepting skeletons,
//! callers and new lines. After the grace period `abort` answers whatever
//! is still waiting with `denied`.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::StubConfig;
use crate::remote::RequestingAgent;
use crate::request::{Answer, TrustRequest};
use crate::transport::{Listener, UnixEndpoint};

pub struct Stub {
    config: StubConfig,
    agent: RequestingAgent,
    listener: Listener,
    callers: Option<UnixEndpoint>,
}

impl Stub {
    /// Bind the remote agent endpoint and the caller socket, if any
    pub async fn bind(config: StubConfig) -> Result<Self> {
        let listener = Listener::bind(&config.endpoint, config.max_frame_bytes, config.private_endpoints)
            .await
            .with_context(|| format!("Failed to bind remote agent endpoint {}", config.endpoint))?;

        let callers = match &config.caller_endpoint {
            Some(path) => Some(
                UnixEndpoint::bind(path, config.max_frame_bytes, config.private_endpoints)
                    .await
                    .with_context(|| format!("Failed to bind caller endpoint {}", path.display()))?,
            ),
            None => None,
        };

        info!(
            "Stub for {} listening on {} (request timeout {:?})",
            config.service, config.endpoint, config.request_timeout
        );

        Ok(Self {
            agent: RequestingAgent::new(config.request_timeout),
            config,
            listener,
            callers,
        })
    }

    pub fn agent(&self) -> &RequestingAgent {
        &self.agent
    }

    /// Serve until `shutdown` fires, then drain
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            config,
            agent,
            mut listener,
            callers,
        } = self;

        let abort = CancellationToken::new();
        let tracker = TaskTracker::new();

        if config.stdio_caller {
            tracker.spawn(serve_caller(
                "stdio".to_string(),
                tokio::io::stdin(),
                tokio::io::stdout(),
                agent.clone(),
                shutdown.clone(),
                abort.clone(),
                config.max_frame_bytes,
            ));
        }

        let mut next_caller_id = 0u64;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(channel) => agent.attach(channel),
                    Err(e) => warn!("Failed to accept a skeleton: {}", e),
                },
                accepted = accept_caller(callers.as_ref()) => match accepted {
                    Ok(stream) => {
                        next_caller_id += 1;
                        let (reader, writer) = stream.into_split();
                        tracker.spawn(serve_caller(
                            format!("socket #{}", next_caller_id),
                            reader,
                            writer,
                            agent.clone(),
                            shutdown.clone(),
                            abort.clone(),
                            config.max_frame_bytes,
                        ));
                    }
                    Err(e) => warn!("Failed to accept a caller: {}", e),
                },
            }
        }

        info!("Stub for {} stopping", config.service);
        drop(listener);
        drop(callers);

        tracker.close();
        drain(&tracker, &abort, config.shutdown_grace).await;
        agent.shutdown().await;

        info!("Stub for {} stopped", config.service);
        Ok(())
    }
}

async fn accept_caller(callers: Option<&UnixEndpoint>) -> std::io::Result<tokio::net::UnixStream> {
    match callers {
        Some(endpoint) => endpoint.accept_stream().await,
        None => std::future::pending().await,
    }
}

/// Wait for callers to finish, answering the rest `denied` after `grace`
async fn drain(tracker: &TaskTracker, abort: &CancellationToken, grace: Duration) {
    if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
        warn!("Grace period of {:?} over, denying outstanding requests", grace);
        abort.cancel();
        tracker.wait().await;
    }
}

/// Serve one caller: a line in, one answer token out
pub async fn serve_caller<R, W>(
    name: String,
    reader: R,
    writer: W,
    agent: RequestingAgent,
    shutdown: CancellationToken,
    abort: CancellationToken,
    max_frame_bytes: usize,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame_bytes));
    let mut answers = FramedWrite::new(writer, LinesCodec::new());
    let mut served = 0u64;

    debug!("Caller {} connected", name);

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next() => line,
        };

        let (answer, done) = match line {
            None => break,
            Some(Ok(line)) => {
                let answer = tokio::select! {
                    _ = abort.cancelled() => Answer::Denied,
                    answer = answer_line(&agent, &line) => answer,
                };
                (answer, false)
            }
            // The reader gives up after an oversized line
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!("Caller {} sent an oversized line", name);
                (Answer::Denied, true)
            }
            Some(Err(e)) => {
                warn!("Caller {}: {}", name, e);
                break;
            }
        };

        if let Err(e) = answers.send(answer.as_str()).await {
            debug!("Caller {} went away before its answer: {}", name, e);
            break;
        }
        served += 1;

        if done {
            break;
        }
    }

    debug!("Caller {} done after {} requests", name, served);
}

async fn answer_line(agent: &RequestingAgent, line: &str) -> Answer {
    let request: TrustRequest = match line.parse() {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed request {:?}: {}", line, e);
            return Answer::Denied;
        }
    };

    match agent.request(request).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!("{} denied: {}", request, e);
            Answer::Denied
        }
    }
}
