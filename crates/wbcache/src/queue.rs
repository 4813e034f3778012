//! Per-endpoint queues of pending writebacks.
//!
//! Pure data: only the scheduler task ever touches these.

use std::collections::VecDeque;

use crate::error::WritebackError;
use crate::location::Location;

/// What the scheduler currently believes about an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointState {
    /// Never spoken to, or due for a probe after an outage.
    #[default]
    Unknown,
    /// Answering puts.
    Live,
    /// Not answering; dispatch is paused until a retry probe.
    Dead,
}

/// A pending writeback, owned by the scheduler or by one writer at a time.
#[derive(Debug)]
pub struct Request {
    /// Which object, bound for which store.
    pub location: Location,
    /// Result of the last put attempt, if any.
    pub err: Option<WritebackError>,
}

impl Request {
    /// A fresh request with no attempts recorded.
    pub fn new(location: Location) -> Self {
        Self {
            location,
            err: None,
        }
    }
}

/// FIFO of requests bound for one endpoint, plus its liveness state.
///
/// Created lazily on the first request for an endpoint and kept for the
/// lifetime of the scheduler. A failed request rejoins the tail.
#[derive(Debug, Default)]
pub struct EndpointQueue {
    /// Pending requests in dispatch order.
    pub queue: VecDeque<Request>,
    /// Liveness belief driving dispatch.
    pub state: EndpointState,
    /// Whether a retry probe timer is already pending for this endpoint.
    pub retry_armed: bool,
}
