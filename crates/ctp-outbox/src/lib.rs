//! Turns committed `outbox` rows into derived relational rows and downstream
//! queue messages. This is the system's durability spine: anything a worker
//! discovers gets written to the outbox in the same transaction as its
//! other writes, and only this publisher ever fans it back out.

mod publisher;
mod sinks;

pub use publisher::{OutboxPublisher, PublisherConfig, PublisherStats};
pub use sinks::{DownstreamSink, QueueManagerSink, QueuedJob};

#[cfg(test)]
mod tests;
