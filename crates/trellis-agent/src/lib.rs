//! Trellis agent library.
//!
//! Re-exports the agent's components so integration tests can wire the
//! real client, executor, and supervisor against an in-process
//! controller.

pub mod client;
pub mod config;
pub mod executor;
pub mod ping;
pub mod prober;
pub mod routeops;
pub mod status;
pub mod supervisor;
