//! The node-local invocation entry point: the synchronous submit path,
//! the async enqueue path, and the dequeue worker loop that drives
//! queued calls through the same submit machinery.

pub mod agent;
pub mod worker;

pub use agent::{Agent, Invocation, LocalAgent};
pub use worker::spawn_async_worker;
