//! trustd - Trust broker between untrusted requesters and a trusted decider
//!
//! A **stub** accepts "may process P of user U use feature F?" lines from
//! local callers and relays them over a transport channel to a **skeleton**,
//! which answers from its trust store or asks a local agent and records the
//! verdict. Every request gets exactly one `granted` or `denied` back; any
//! failure along the way denies.
//!
//! caller -> stub -> channel -> skeleton -> store / local agent
//!
//! Channels come in two bindings: a local socket and a message bus.

pub mod agent;
pub mod bus;
pub mod config;
pub mod daemon;
pub mod error;
pub mod remote;
pub mod request;
pub mod store;
pub mod transport;

pub use agent::LocalAgent;
pub use config::{DaemonConfig, Endpoint, SkeletonConfig, StubConfig};
pub use daemon::{Skeleton, Stub};
pub use error::{AgentError, ChannelError, StoreError};
pub use remote::{AnsweringAgent, RequestHandler, RequestingAgent};
pub use request::{Answer, TrustRequest};
pub use store::Store;
