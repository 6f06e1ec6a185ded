//! Error taxonomy shared by the transport, agent and store layers

use std::time::Duration;
use thiserror::Error;

use crate::request::ParseError;

/// Transport-level failures
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel closed by peer")]
    Closed,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus error: {0}")]
    Bus(#[from] zbus::Error),
}

/// Protocol-level failures of a remote agent exchange
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("no answer within {0:?}")]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    Transport(#[from] ChannelError),

    #[error("malformed answer: {0}")]
    Protocol(#[from] ParseError),

    #[error("no skeleton attached for uid {0}")]
    NoSession(u32),

    #[error("daemon is stopping")]
    Cancelled,
}

/// Trust store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("bus error: {0}")]
    Bus(#[from] zbus::Error),

    #[error("bus call failed: {0}")]
    Fdo(#[from] zbus::fdo::Error),
}
