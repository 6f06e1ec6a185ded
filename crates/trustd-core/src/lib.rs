//! trustd core - shared functionality for the trust broker daemons
//!
//! Holds the filesystem layout every role agrees on and the helpers used to
//! describe a requesting process.

pub mod paths;
pub mod process;

pub use paths::Paths;
pub use process::ProcessInfo;
