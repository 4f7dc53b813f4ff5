//! Shared domain model for the Runinator task runner.
//!
//! This crate holds the types that every Runinator service speaks:
//! scheduled tasks and their run history, the firings that travel through
//! the broker, and the cron engine that decides when a task fires next.

pub mod cron;
pub mod firing;
pub mod models;

pub use cron::{CronExpression, ParseError};
pub use firing::{DeadFiring, Firing};
pub use models::{InvalidTask, ScheduledTask, TaskAck, TaskPatch, TaskRun, TaskRunReport};
