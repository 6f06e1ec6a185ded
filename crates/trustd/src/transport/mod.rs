//! Transport channels between stub and skeleton
//!
//! Both bindings carry the same thing: an ordered stream of text frames
//! with no embedded newlines. The binding supplies delivery; meaning lives
//! in the remote agent.

pub mod bus;
pub mod unix;

use crate::config::Endpoint;
use crate::error::ChannelError;

pub use self::bus::{BusChannel, BusListener};
pub use self::unix::{UnixChannel, UnixEndpoint};

/// A connected, bidirectional frame channel
pub enum Channel {
    Unix(UnixChannel),
    Bus(BusChannel),
}

impl Channel {
    pub async fn send(&mut self, frame: &str) -> Result<(), ChannelError> {
        if frame.contains('\n') {
            return Err(ChannelError::Malformed("frame contains a newline".to_string()));
        }

        match self {
            Self::Unix(channel) => channel.send(frame).await,
            Self::Bus(channel) => channel.send(frame).await,
        }
    }

    /// Block until the next frame arrives or the peer goes away.
    /// Cancel-safe on both bindings.
    pub async fn receive(&mut self) -> Result<String, ChannelError> {
        match self {
            Self::Unix(channel) => channel.receive().await,
            Self::Bus(channel) => channel.receive().await,
        }
    }

    /// Credentials of the process on the other end, when the binding knows them
    pub fn peer_uid(&self) -> Option<u32> {
        match self {
            Self::Unix(channel) => channel.peer_uid(),
            Self::Bus(channel) => channel.peer_uid(),
        }
    }

    pub fn binding(&self) -> &'static str {
        match self {
            Self::Unix(_) => "local-socket",
            Self::Bus(_) => "bus",
        }
    }

    /// Orderly shutdown; the peer sees `ChannelError::Closed`
    pub async fn close(self) {
        match self {
            Self::Unix(channel) => channel.close().await,
            Self::Bus(channel) => channel.close().await,
        }
    }
}

/// The accepting side of a binding
pub enum Listener {
    Unix(UnixEndpoint),
    Bus(BusListener),
}

impl Listener {
    /// Bind the endpoint. Any failure here is a startup error.
    pub async fn bind(endpoint: &Endpoint, max_frame_bytes: usize, private: bool) -> Result<Self, ChannelError> {
        match endpoint {
            Endpoint::LocalSocket(path) => {
                Ok(Self::Unix(UnixEndpoint::bind(path, max_frame_bytes, private).await?))
            }
            Endpoint::Bus { scope, name } => {
                Ok(Self::Bus(BusListener::bind(*scope, name, max_frame_bytes).await?))
            }
        }
    }

    /// Wait for the next peer. Cancel-safe.
    pub async fn accept(&mut self) -> Result<Channel, ChannelError> {
        match self {
            Self::Unix(endpoint) => endpoint.accept().await.map(Channel::Unix),
            Self::Bus(listener) => listener.accept().await.map(Channel::Bus),
        }
    }
}

/// Reach a listening peer
pub async fn connect(endpoint: &Endpoint, max_frame_bytes: usize) -> Result<Channel, ChannelError> {
    match endpoint {
        Endpoint::LocalSocket(path) => UnixChannel::connect(path, max_frame_bytes).await.map(Channel::Unix),
        Endpoint::Bus { scope, name } => {
            BusChannel::connect(*scope, name, max_frame_bytes).await.map(Channel::Bus)
        }
    }
}
