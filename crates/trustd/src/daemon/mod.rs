//! Daemon roles

pub mod signal;
pub mod skeleton;
pub mod stub;

pub use self::signal::ShutdownSignal;
pub use self::skeleton::{Decider, Skeleton};
pub use self::stub::Stub;
