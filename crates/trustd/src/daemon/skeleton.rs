//! The skeleton: answers relayed requests from the store or a local agent
//!
//! One request at a time. A verdict found in the store is returned as is;
//! otherwise the local agent decides and the verdict is recorded before
//! the answer goes out.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zbus::Connection;

use crate::agent::{self, LocalAgent};
use crate::config::{Endpoint, SkeletonConfig};
use crate::remote::{AnsweringAgent, RequestHandler, ServeOutcome};
use crate::request::{Answer, TrustRequest};
use crate::store::{self, Store};
use crate::transport::{self, Channel};

/// Store lookup, then local agent, then record
pub struct Decider {
    service: String,
    store: Arc<dyn Store>,
    agent: Box<dyn LocalAgent>,
}

impl Decider {
    pub fn new(service: impl Into<String>, store: Arc<dyn Store>, agent: Box<dyn LocalAgent>) -> Self {
        Self {
            service: service.into(),
            store,
            agent,
        }
    }
}

#[async_trait]
impl RequestHandler for Decider {
    async fn handle(&self, request: TrustRequest) -> Answer {
        match self.store.lookup(&self.service, request.uid, request.feature) {
            Ok(Some(answer)) => {
                debug!("{} -> {} (stored)", request, answer);
                return answer;
            }
            Ok(None) => {}
            Err(e) => warn!("Store lookup for {} failed, asking the agent: {}", request, e),
        }

        let answer = self.agent.decide(&request).await;

        if let Err(e) = self.store.record(&self.service, request.uid, request.feature, answer) {
            warn!("Failed to record {} for {}: {}", answer, request, e);
        }

        info!("{} -> {} ({})", request, answer, self.agent.kind().as_str());
        answer
    }
}

pub struct Skeleton {
    config: SkeletonConfig,
    decider: Decider,
    /// Keeps the store's bus name owned
    _exposure: Option<Connection>,
}

impl Skeleton {
    /// Open the store, build the local agent and expose the store
    pub async fn start(config: SkeletonConfig) -> Result<Self> {
        let store = store::open(config.store_path.as_deref()).with_context(|| match &config.store_path {
            Some(path) => format!("Failed to open trust store {}", path.display()),
            None => "Failed to create in-memory trust store".to_string(),
        })?;

        let agent = agent::from_config(config.local_agent, &config.service, &config.prompt)?;

        let exposure = match config.store_bus {
            Some(scope) => Some(
                store::expose(scope, &config.service, Arc::clone(&store))
                    .await
                    .with_context(|| format!("Failed to expose the trust store of {}", config.service))?,
            ),
            None => None,
        };

        info!(
            "Skeleton for {} using {} agent, store {}",
            config.service,
            config.local_agent.as_str(),
            config
                .store_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "in memory".to_string())
        );

        Ok(Self {
            decider: Decider::new(config.service.clone(), store, agent),
            config,
            _exposure: exposure,
        })
    }

    /// Serve the stub until `shutdown` fires, reconnecting whenever the
    /// channel is lost
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Some(mut channel) = self.connect_initial(&shutdown).await? else {
            return Ok(());
        };

        loop {
            let mut answering = AnsweringAgent::new(channel);
            let outcome = answering.serve(&self.decider, &shutdown).await;
            let served = answering.served();

            match outcome {
                ServeOutcome::Cancelled => {
                    info!("Skeleton for {} stopping after {} requests", self.config.service, served);
                    answering.close().await;
                    return Ok(());
                }
                ServeOutcome::Closed(e) => {
                    info!("Lost the stub after {} requests: {}", served, e);
                    answering.close().await;
                }
            }

            channel = match self.reconnect(&shutdown).await {
                Some(channel) => channel,
                None => return Ok(()),
            };
        }
    }

    /// The stub may still be starting; keep trying for `connect_timeout`
    async fn connect_initial(&self, shutdown: &CancellationToken) -> Result<Option<Channel>> {
        let endpoint = &self.config.endpoint;
        let deadline = Instant::now() + self.config.connect_timeout;

        loop {
            match transport::connect(endpoint, self.config.max_frame_bytes).await {
                Ok(channel) => {
                    info!("Connected to the stub at {}", endpoint);
                    return Ok(Some(channel));
                }
                Err(e) if Instant::now() >= deadline => {
                    bail!(
                        "Failed to reach the stub at {} within {:?}: {}",
                        endpoint,
                        self.config.connect_timeout,
                        e
                    );
                }
                Err(e) => debug!("Stub at {} not reachable yet: {}", endpoint, e),
            }

            if !self.pause(shutdown).await {
                return Ok(None);
            }
        }
    }

    async fn reconnect(&self, shutdown: &CancellationToken) -> Option<Channel> {
        let endpoint: &Endpoint = &self.config.endpoint;

        loop {
            if !self.pause(shutdown).await {
                return None;
            }

            match transport::connect(endpoint, self.config.max_frame_bytes).await {
                Ok(channel) => {
                    info!("Reconnected to the stub at {}", endpoint);
                    return Some(channel);
                }
                Err(e) => debug!("Reconnect to {} failed: {}", endpoint, e),
            }
        }
    }

    /// Sleep one reconnect interval. False if shutdown came first.
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.reconnect_interval) => true,
        }
    }
}
