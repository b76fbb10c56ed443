use crate::error::StoreError;
use crate::queue::UpdateSerializationQueue;
use crate::telemetry::{StoreEvent, StoreEventListener};
use crate::types::Notification;
use crate::values::WindowedValueStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Entry point for "value changed" notifications.
///
/// Each notification is queued under its source tag. Group samples and samples for group
/// members both use the group owner, so writes to one tag's documents never interleave while
/// different tags proceed in parallel.
#[derive(Debug, Clone)]
pub struct SampleIngestor {
    values: Arc<WindowedValueStore>,
    queue: UpdateSerializationQueue<Notification>,
    events: Arc<dyn StoreEventListener>,
}

impl SampleIngestor {
    pub fn new(
        values: Arc<WindowedValueStore>,
        wait_timeout: Option<Duration>,
        events: Arc<dyn StoreEventListener>,
    ) -> Self {
        SampleIngestor {
            values,
            queue: UpdateSerializationQueue::new(wait_timeout, Arc::clone(&events)),
            events,
        }
    }

    pub fn queue(&self) -> &UpdateSerializationQueue<Notification> {
        &self.queue
    }

    /// Queues `notification` and returns immediately. The handle resolves once it has been
    /// written (or rejected).
    pub async fn submit(
        &self,
        notification: Notification,
    ) -> Result<JoinHandle<Result<(), StoreError>>, StoreError> {
        let source = self.values.serialization_key(&notification).await?;
        let values = Arc::clone(&self.values);
        let events = Arc::clone(&self.events);
        self.queue.dispatch(&source, notification, move |n| async move {
            match values.apply(&n).await {
                Ok(docs) => {
                    tracing::trace!(source = %n.source(), documents = docs.len(), "notification applied");
                    Ok(())
                }
                Err(e) => {
                    events.on_event(StoreEvent::SampleRejected {
                        source: n.source().to_string(),
                        error: e.to_string(),
                    });
                    Err(e)
                }
            }
        })
    }

    /// Submits and waits for the write to finish.
    pub async fn ingest(&self, notification: Notification) -> Result<(), StoreError> {
        self.submit(notification)
            .await?
            .await
            .map_err(|e| StoreError::BackgroundTaskError(e.to_string()))?
    }
}
