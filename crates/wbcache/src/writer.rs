//! Writer pool: the tasks that perform the actual remote puts.

use std::io;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use crate::error::{WritebackError, WritebackResult};
use crate::links::CacheLayout;
use crate::location::Location;
use crate::queue::Request;
use crate::store::StoreBinder;

/// One writer task: pulls ready requests, performs the put, reports back.
///
/// Writers share a single ready receiver behind a mutex; whichever writer
/// is idle first takes the next request.
pub(crate) struct Writer {
    pub(crate) id: usize,
    pub(crate) layout: Arc<CacheLayout>,
    pub(crate) binder: Arc<dyn StoreBinder>,
    pub(crate) ready_rx: Arc<Mutex<mpsc::Receiver<Request>>>,
    pub(crate) done_tx: mpsc::Sender<Request>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    pub(crate) terminated_tx: mpsc::Sender<()>,
}

impl Writer {
    pub(crate) async fn run(mut self) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown_rx.changed() => None,
                request = Self::next_ready(&self.ready_rx) => request,
            };
            let Some(mut request) = next else { break };

            request.err = self.write_back(&request.location).await.err();
            if let Some(err) = &request.err {
                error!(writer = self.id, location = %request.location, error = %err, "writeback failed");
            }
            if self.done_tx.send(request).await.is_err() {
                // Scheduler is gone; nothing left to report to.
                break;
            }
        }
        let _ = self.terminated_tx.send(()).await;
    }

    async fn next_ready(ready_rx: &Arc<Mutex<mpsc::Receiver<Request>>>) -> Option<Request> {
        ready_rx.lock().await.recv().await
    }

    async fn write_back(&self, location: &Location) -> WritebackResult<()> {
        let data = match self
            .layout
            .read_back(&location.reference, &location.endpoint)
        {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Evicted or already written back; nothing left to send.
                warn!(location = %location, "object gone before writeback, discharging");
                let _ = self
                    .layout
                    .remove_link(&location.reference, &location.endpoint);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let store = self.binder.bind(&location.endpoint)?;
        let refdata = store.put(data).await?;
        if refdata.reference != location.reference {
            return Err(WritebackError::ReferenceMismatch {
                expected: location.reference.to_string(),
                returned: refdata.reference.to_string(),
            });
        }

        if let Err(e) = self
            .layout
            .remove_link(&location.reference, &location.endpoint)
        {
            info!(location = %location, error = %e, "could not remove writeback link");
        }
        Ok(())
    }
}
