//! Termination signals

use std::io;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// SIGINT and SIGTERM, installed as soon as this is constructed so that a
/// signal arriving during startup is not lost
pub struct ShutdownSignal {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignal {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Resolve on the first SIGINT or SIGTERM
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => info!("Received SIGINT"),
            _ = self.terminate.recv() => info!("Received SIGTERM"),
        }
    }

    /// A token cancelled by the first termination signal
    pub fn into_token(mut self) -> CancellationToken {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            self.recv().await;
            cancel.cancel();
        });
        token
    }
}
