#![warn(missing_docs)]

//! Write-back scheduling for a content-addressed store cache.
//!
//! A write-back cache accepts puts locally and uploads them to the owning
//! remote store later. This crate is that deferred half: it tracks pending
//! writebacks per endpoint, schedules them across a fixed writer pool under
//! an adaptive concurrency ceiling, rides out endpoint outages with timed
//! retry probes, answers flush fences, and records every pending writeback
//! as a hard link on disk so the queue survives restarts.
//!
//! The enclosing disk cache, real store bindings, and all user-facing
//! surfaces live elsewhere; they reach this crate through
//! [`WritebackQueue`] and the [`StoreBinder`] / [`StoreClient`] seams.

pub mod error;
pub mod links;
pub mod location;
pub mod parallelism;
pub mod queue;
pub mod scheduler;
pub mod store;

mod writer;

pub use error::{WritebackError, WritebackResult};
pub use links::{CacheLayout, WRITEBACK_SUFFIX};
pub use location::{Endpoint, Location, Reference, Transport};
pub use parallelism::Parallelism;
pub use queue::{EndpointQueue, EndpointState, Request};
pub use scheduler::{WritebackConfig, WritebackQueue, WritebackStats};
pub use store::{
    BoxFuture, MockStore, MockStoreBinder, MockStoreStats, Refdata, StoreBinder, StoreClient,
};
