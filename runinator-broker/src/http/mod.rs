//! HTTP binding of the broker contract.
//!
//! The server side exposes the in-memory queue over axum; the client side
//! implements [`crate::Broker`] against that surface, so schedulers and
//! workers can run against either binding via `--broker-backend`.

mod client;
mod server;
mod types;

pub use client::HttpBroker;
pub use server::{router, serve};
pub use types::{AckRequest, ErrorBody, NackRequest, PublishResponse};
