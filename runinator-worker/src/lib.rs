//! Runinator worker.
//!
//! Leases firings from the broker, resolves their action to a registered
//! handler, runs it under a hard wall-clock timeout, reports the run to
//! the web service and settles the lease (ack on success, requeue on
//! retryable failures and timeouts, drop on validation failures).

pub mod handlers;
pub mod pool;
pub mod registry;

pub use pool::{RunSink, WorkerPool};
pub use registry::{Handler, HandlerOutcome, HandlerRegistry};
