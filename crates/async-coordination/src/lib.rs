//! Async coordination primitives.
//!
//! This crate provides:
//! - [`KeyedSequencer`]: strict FIFO execution per key, independent across keys
//! - [`Limiter`]: at most N tasks in flight, FIFO backlog, idle signal
//! - [`SettlablePromise`]: a future resolved or rejected from the outside
//! - [`race_timeout`], [`race_cancellation`], [`race_cancellation_and_timeout`]:
//!   stop waiting on an operation without aborting it

mod error;
mod limiter;
mod promise;
mod race;
mod sequencer;

pub use error::{AsyncError, AsyncResult, RaceError};
pub use limiter::{LimitedTask, Limiter};
pub use promise::SettlablePromise;
pub use race::{race_cancellation, race_cancellation_and_timeout, race_timeout};
pub use sequencer::KeyedSequencer;

pub use tokio_util::sync::CancellationToken;
