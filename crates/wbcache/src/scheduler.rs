//! Writeback scheduling: one task owns all queue state and feeds a fixed
//! pool of writers under an adaptive concurrency ceiling.
//!
//! Submissions, flush fences, writer completions, and retry probes arrive
//! on separate channels multiplexed in a single select loop, so every
//! mutation of the queue state happens on the scheduler task and no lock is
//! ever held across a put.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{WritebackError, WritebackResult};
use crate::links::CacheLayout;
use crate::location::{Endpoint, Location, Reference};
use crate::parallelism::Parallelism;
use crate::queue::{EndpointQueue, EndpointState, Request};
use crate::store::StoreBinder;
use crate::writer::Writer;

/// Configuration for the writeback queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WritebackConfig {
    /// Number of writer tasks. Also the capacity of every internal channel
    /// and the hard ceiling for concurrent writebacks.
    pub writers: usize,
    /// Starting ceiling for concurrent writebacks.
    pub initial_max_parallel: usize,
    /// Delay before probing an endpoint whose writebacks failed.
    pub retry_interval: Duration,
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            writers: 20,
            initial_max_parallel: 6,
            retry_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Counters published by the scheduler after every event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WritebackStats {
    /// Requests accepted, duplicates excluded.
    pub submitted: u64,
    /// Requests that completed successfully.
    pub completed: u64,
    /// Failed attempts that were re-queued.
    pub requeued: u64,
    /// Flush requests received.
    pub flushes: u64,
    /// Locations currently pending.
    pub pending: u64,
    /// Writebacks currently with a writer.
    pub in_flight: u64,
    /// Current concurrency ceiling.
    pub max_parallel: u64,
}

/// A caller waiting for one location to be flushed.
struct FlushRequest {
    location: Location,
    flushed: oneshot::Sender<()>,
}

struct Scheduler {
    /// Pending requests per endpoint. Only this task touches it.
    by_endpoint: HashMap<Endpoint, EndpointQueue>,
    /// Every pending location, with its accumulated flush waiters.
    /// A location is a key here iff exactly one request for it exists
    /// across the queues and writers.
    queued: HashMap<Location, Vec<oneshot::Sender<()>>>,
    parallelism: Parallelism,
    retry_interval: Duration,
    submit_rx: mpsc::Receiver<Request>,
    flush_rx: mpsc::Receiver<FlushRequest>,
    done_rx: mpsc::Receiver<Request>,
    retry_rx: mpsc::Receiver<Endpoint>,
    retry_tx: mpsc::Sender<Endpoint>,
    ready_tx: mpsc::Sender<Request>,
    shutdown_rx: watch::Receiver<bool>,
    terminated_tx: mpsc::Sender<()>,
    stats: WritebackStats,
    stats_tx: watch::Sender<WritebackStats>,
}

impl Scheduler {
    async fn run(mut self) {
        loop {
            // Biased: submissions are drained before flushes, so a flush
            // sent after a submit for the same location always observes it.
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    info!("writeback scheduler stopping");
                    let _ = self.terminated_tx.send(()).await;
                    return;
                }
                Some(request) = self.submit_rx.recv() => self.handle_submit(request),
                Some(request) = self.done_rx.recv() => self.handle_done(request),
                Some(endpoint) = self.retry_rx.recv() => self.handle_retry(endpoint),
                Some(flush) = self.flush_rx.recv() => self.handle_flush(flush),
            }
            self.dispatch();
            self.publish_stats();
        }
    }

    fn handle_submit(&mut self, request: Request) {
        if self.queued.contains_key(&request.location) {
            // Already pending; the existing request covers this one.
            debug!(location = %request.location, "duplicate writeback submit");
            return;
        }
        debug!(location = %request.location, "writeback queued");
        self.queued.insert(request.location.clone(), Vec::new());
        self.stats.submitted += 1;
        self.by_endpoint
            .entry(request.location.endpoint.clone())
            .or_default()
            .queue
            .push_back(request);
    }

    fn handle_flush(&mut self, flush: FlushRequest) {
        self.stats.flushes += 1;
        match self.queued.get_mut(&flush.location) {
            // Nothing pending for this location.
            None => {
                let _ = flush.flushed.send(());
            }
            Some(waiters) => waiters.push(flush.flushed),
        }
    }

    fn handle_done(&mut self, mut request: Request) {
        let endpoint = request.location.endpoint.clone();
        let Some(queue) = self.by_endpoint.get_mut(&endpoint) else {
            // A completion implies a prior submit; nothing sane to do.
            warn!(endpoint = %endpoint, "completion for unknown endpoint");
            return;
        };

        if let Some(err) = request.err.take() {
            self.stats.requeued += 1;
            self.parallelism.failure(&err);
            queue.queue.push_back(request);
            queue.state = EndpointState::Dead;
            let arm = !queue.retry_armed;
            queue.retry_armed = true;
            if arm {
                self.arm_retry(endpoint);
            }
            return;
        }

        queue.state = EndpointState::Live;
        self.parallelism.success();
        if let Some(waiters) = self.queued.remove(&request.location) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
        self.stats.completed += 1;
        debug!(location = %request.location, "writeback done");
    }

    fn handle_retry(&mut self, endpoint: Endpoint) {
        if let Some(queue) = self.by_endpoint.get_mut(&endpoint) {
            queue.retry_armed = false;
            if queue.state == EndpointState::Dead {
                // The next dispatch pass sends a single probe.
                queue.state = EndpointState::Unknown;
            }
        }
    }

    fn arm_retry(&self, endpoint: Endpoint) {
        debug!(endpoint = %endpoint, delay = ?self.retry_interval, "endpoint dead, retry armed");
        let retry_tx = self.retry_tx.clone();
        let delay = self.retry_interval;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = retry_tx.send(endpoint).await;
        });
    }

    /// One or more round-robin sweeps over the endpoint queues, sending
    /// each queue's head to the writers, until the ceiling is reached, the
    /// ready channel fills, or a whole sweep sends nothing.
    fn dispatch(&mut self) {
        loop {
            let mut sent = false;
            let parallelism = &mut self.parallelism;
            let ready_tx = &self.ready_tx;
            for queue in self.by_endpoint.values_mut() {
                if !parallelism.ok() {
                    return;
                }
                if queue.state == EndpointState::Dead || queue.queue.is_empty() {
                    continue;
                }
                let Some(request) = queue.queue.pop_front() else {
                    continue;
                };
                match ready_tx.try_send(request) {
                    Ok(()) => {
                        parallelism.add();
                        if queue.state == EndpointState::Unknown {
                            // Probe: presumed dead until it reports back.
                            queue.state = EndpointState::Dead;
                        }
                        sent = true;
                    }
                    Err(TrySendError::Full(request)) | Err(TrySendError::Closed(request)) => {
                        queue.queue.push_front(request);
                        return;
                    }
                }
            }
            if !sent {
                return;
            }
        }
    }

    fn publish_stats(&mut self) {
        self.stats.pending = self.queued.len() as u64;
        self.stats.in_flight = self.parallelism.in_flight() as u64;
        self.stats.max_parallel = self.parallelism.max() as u64;
        let _ = self.stats_tx.send(self.stats.clone());
    }
}

/// Handle to a running writeback queue.
///
/// Owns the channels into the scheduler. Dropping the handle without
/// calling [`close`] stops the scheduler and writers but does not wait for
/// them.
///
/// [`close`]: WritebackQueue::close
pub struct WritebackQueue {
    layout: Arc<CacheLayout>,
    submit_tx: mpsc::Sender<Request>,
    flush_tx: mpsc::Sender<FlushRequest>,
    shutdown_tx: watch::Sender<bool>,
    terminated_rx: Mutex<Option<mpsc::Receiver<()>>>,
    stats_rx: watch::Receiver<WritebackStats>,
    writers: usize,
}

impl WritebackQueue {
    /// Start the scheduler and writer pool. Must be called on a tokio
    /// runtime.
    pub fn start(
        config: WritebackConfig,
        layout: CacheLayout,
        binder: Arc<dyn StoreBinder>,
    ) -> Self {
        let writers = config.writers.max(1);
        let layout = Arc::new(layout);
        let (submit_tx, submit_rx) = mpsc::channel(writers);
        let (flush_tx, flush_rx) = mpsc::channel(writers);
        let (ready_tx, ready_rx) = mpsc::channel(writers);
        let (done_tx, done_rx) = mpsc::channel(writers);
        let (retry_tx, retry_rx) = mpsc::channel(writers);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (terminated_tx, terminated_rx) = mpsc::channel(writers + 1);
        let (stats_tx, stats_rx) = watch::channel(WritebackStats::default());

        let scheduler = Scheduler {
            by_endpoint: HashMap::new(),
            queued: HashMap::new(),
            parallelism: Parallelism::new(config.initial_max_parallel, writers),
            retry_interval: config.retry_interval,
            submit_rx,
            flush_rx,
            done_rx,
            retry_rx,
            retry_tx,
            ready_tx,
            shutdown_rx: shutdown_rx.clone(),
            terminated_tx: terminated_tx.clone(),
            stats: WritebackStats::default(),
            stats_tx,
        };
        tokio::spawn(scheduler.run());

        let ready_rx = Arc::new(Mutex::new(ready_rx));
        for id in 0..writers {
            let writer = Writer {
                id,
                layout: Arc::clone(&layout),
                binder: Arc::clone(&binder),
                ready_rx: Arc::clone(&ready_rx),
                done_tx: done_tx.clone(),
                shutdown_rx: shutdown_rx.clone(),
                terminated_tx: terminated_tx.clone(),
            };
            tokio::spawn(writer.run());
        }

        Self {
            layout,
            submit_tx,
            flush_tx,
            shutdown_tx,
            terminated_rx: Mutex::new(Some(terminated_rx)),
            stats_rx,
            writers,
        }
    }

    /// Record a writeback for a freshly cached object and queue it.
    ///
    /// The durable link is created before the request is submitted, so the
    /// writeback survives a crash between this call and the eventual put.
    /// A link that already exists means an identical writeback is pending
    /// and the call is a no-op.
    pub async fn request_writeback(
        &self,
        reference: Reference,
        endpoint: Endpoint,
    ) -> WritebackResult<()> {
        if !self.layout.create_link(&reference, &endpoint)? {
            return Ok(());
        }
        self.submit(Location::new(reference, endpoint)).await
    }

    /// Re-queue every writeback link found under the cache root.
    ///
    /// Called once at startup; returns how many links were re-queued.
    pub async fn recover(&self) -> WritebackResult<usize> {
        let locations = self.layout.scan()?;
        let count = locations.len();
        for location in locations {
            self.submit(location).await?;
        }
        if count > 0 {
            info!(count, "recovered pending writebacks");
        }
        Ok(count)
    }

    async fn submit(&self, location: Location) -> WritebackResult<()> {
        self.submit_tx
            .send(Request::new(location))
            .await
            .map_err(|_| WritebackError::Shutdown)
    }

    /// Wait until `location` has no pending writeback: either it completed
    /// successfully or it was never queued.
    pub async fn flush(&self, location: Location) {
        let (flushed_tx, flushed_rx) = oneshot::channel();
        let request = FlushRequest {
            location,
            flushed: flushed_tx,
        };
        if self.flush_tx.send(request).await.is_err() {
            // Scheduler is gone; nothing is in flight anymore.
            return;
        }
        let _ = flushed_rx.await;
    }

    /// Shut down the scheduler and writers and wait for all of them.
    /// Idempotent; later calls return immediately.
    pub async fn close(&self) {
        let Some(mut terminated_rx) = self.terminated_rx.lock().await.take() else {
            return;
        };
        let _ = self.shutdown_tx.send(true);
        for _ in 0..self.writers + 1 {
            if terminated_rx.recv().await.is_none() {
                break;
            }
        }
    }

    /// Snapshot of the scheduler's counters.
    pub fn stats(&self) -> WritebackStats {
        self.stats_rx.borrow().clone()
    }

    /// Whether the scheduler is still accepting work.
    pub fn is_running(&self) -> bool {
        !self.submit_tx.is_closed()
    }

    /// The path schema this queue records links under.
    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }
}
