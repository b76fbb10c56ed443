//! Per-source FIFO serialization of asynchronous work, plus a drop-if-busy gate.
//!
//! [`QueueManager`] owns named FIFO queues of `{token, payload}` entries. Only the holder of
//! the head token is admitted. Waiters park on a per-queue [`Notify`] that fires whenever an
//! entry leaves the queue, and recheck the head after registering so no wakeup is lost.
//!
//! An entry leaves the queue when its [`QueueSlot`] drops (after success, error or panic
//! unwind) or when a waiter gives up (timeout or cancellation).

use crate::error::StoreError;
use crate::telemetry::{store_metrics, StoreEvent, StoreEventListener};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Admission ticket, unique across one manager and increasing in enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

#[derive(Debug)]
struct NamedQueue<T> {
    entries: VecDeque<(Token, Option<T>)>,
    notify: Arc<Notify>,
}

impl<T> NamedQueue<T> {
    fn new() -> Self {
        NamedQueue {
            entries: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

enum Admission<T> {
    Admitted(Option<T>),
    Wait(Arc<Notify>),
}

#[derive(Debug)]
pub struct QueueManager<T> {
    queues: Mutex<HashMap<String, NamedQueue<T>>>,
    next_token: AtomicU64,
}

impl<T> Default for QueueManager<T> {
    fn default() -> Self {
        QueueManager {
            queues: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }
}

impl<T: Send + 'static> QueueManager<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends an entry to the tail of `name` and returns its token without waiting.
    pub fn enqueue(&self, name: &str, payload: T) -> Result<Token, StoreError> {
        let mut queues = self.queues.lock()?;
        // Drawn under the lock so token order matches queue order.
        let token = Token(self.next_token.fetch_add(1, Ordering::SeqCst));
        queues
            .entry(name.to_string())
            .or_insert_with(NamedQueue::new)
            .entries
            .push_back((token, Some(payload)));
        Ok(token)
    }

    /// Number of pending and admitted entries in `name`.
    pub fn len(&self, name: &str) -> Result<usize, StoreError> {
        Ok(self
            .queues
            .lock()?
            .get(name)
            .map_or(0, |q| q.entries.len()))
    }

    pub fn is_empty(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.len(name)? == 0)
    }

    /// Waits until `token` is at the head of `name` and returns the slot holding its payload.
    ///
    /// With a `timeout`, giving up returns [`StoreError::QueueTimeout`]. Timing out or
    /// dropping this future withdraws the entry so later tokens are not blocked.
    pub async fn admit(
        self: &Arc<Self>,
        name: &str,
        token: Token,
        timeout: Option<Duration>,
    ) -> Result<QueueSlot<T>, StoreError> {
        let mut pending = Pending {
            manager: Arc::clone(self),
            name: name.to_string(),
            token,
            armed: true,
        };
        let payload = match timeout {
            None => self.wait_for_head(name, token).await?,
            Some(limit) => tokio::time::timeout(limit, self.wait_for_head(name, token))
                .await
                .map_err(|_| StoreError::QueueTimeout {
                    queue: name.to_string(),
                    token: token.0,
                })??,
        };
        pending.armed = false;
        Ok(QueueSlot {
            manager: Arc::clone(self),
            name: name.to_string(),
            token,
            payload,
        })
    }

    async fn wait_for_head(&self, name: &str, token: Token) -> Result<Option<T>, StoreError> {
        loop {
            let notify = match self.poll_head(name, token)? {
                Admission::Admitted(payload) => return Ok(payload),
                Admission::Wait(notify) => notify,
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Admission::Admitted(payload) = self.poll_head(name, token)? {
                return Ok(payload);
            }
            notified.await;
        }
    }

    fn poll_head(&self, name: &str, token: Token) -> Result<Admission<T>, StoreError> {
        let mut queues = self.queues.lock()?;
        let queue = queues
            .get_mut(name)
            .filter(|q| q.entries.iter().any(|(t, _)| *t == token))
            .ok_or_else(|| StoreError::not_found("queue entry", format!("{}#{}", name, token.0)))?;
        match queue.entries.front_mut() {
            Some((head, payload)) if *head == token => Ok(Admission::Admitted(payload.take())),
            _ => Ok(Admission::Wait(Arc::clone(&queue.notify))),
        }
    }

    /// Removes `token` from `name` and wakes the remaining waiters.
    fn withdraw(&self, name: &str, token: Token) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(queue) = queues.get_mut(name) else {
            return;
        };
        queue.entries.retain(|(t, _)| *t != token);
        queue.notify.notify_waiters();
        if queue.entries.is_empty() {
            queues.remove(name);
        }
    }
}

/// Withdraws a not-yet-admitted entry when the waiting future goes away.
struct Pending<T: Send + 'static> {
    manager: Arc<QueueManager<T>>,
    name: String,
    token: Token,
    armed: bool,
}

impl<T: Send + 'static> Drop for Pending<T> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(queue = %self.name, token = self.token.0, "queue entry withdrawn");
            self.manager.withdraw(&self.name, self.token);
        }
    }
}

/// Exclusive admission to a queue. Dropping it lets the next entry in.
#[derive(Debug)]
pub struct QueueSlot<T: Send + 'static> {
    manager: Arc<QueueManager<T>>,
    name: String,
    token: Token,
    payload: Option<T>,
}

impl<T: Send + 'static> QueueSlot<T> {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn queue(&self) -> &str {
        &self.name
    }

    /// The enqueued payload. `None` once taken.
    pub fn take_payload(&mut self) -> Option<T> {
        self.payload.take()
    }
}

impl<T: Send + 'static> Drop for QueueSlot<T> {
    fn drop(&mut self) {
        self.manager.withdraw(&self.name, self.token);
    }
}

/// Runs handlers for the same source strictly one at a time in dispatch order, without
/// blocking the caller.
#[derive(Debug)]
pub struct UpdateSerializationQueue<T: Send + 'static> {
    manager: Arc<QueueManager<T>>,
    wait_timeout: Option<Duration>,
    events: Arc<dyn StoreEventListener>,
}

impl<T: Send + 'static> Clone for UpdateSerializationQueue<T> {
    fn clone(&self) -> Self {
        UpdateSerializationQueue {
            manager: Arc::clone(&self.manager),
            wait_timeout: self.wait_timeout,
            events: Arc::clone(&self.events),
        }
    }
}

impl<T: Send + 'static> UpdateSerializationQueue<T> {
    pub fn new(wait_timeout: Option<Duration>, events: Arc<dyn StoreEventListener>) -> Self {
        UpdateSerializationQueue {
            manager: QueueManager::new(),
            wait_timeout,
            events,
        }
    }

    pub fn manager(&self) -> &Arc<QueueManager<T>> {
        &self.manager
    }

    /// Enqueues `payload` under `source` now and spawns a task that runs `handler` once every
    /// earlier entry of `source` has finished.
    ///
    /// A failing handler is reported and does not hold up the entries behind it.
    pub fn dispatch<F, Fut>(
        &self,
        source: &str,
        payload: T,
        handler: F,
    ) -> Result<JoinHandle<Result<(), StoreError>>, StoreError>
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        let token = self.manager.enqueue(source, payload)?;
        let manager = Arc::clone(&self.manager);
        let events = Arc::clone(&self.events);
        let wait_timeout = self.wait_timeout;
        let source = source.to_string();

        Ok(tokio::spawn(async move {
            let result = async {
                let mut slot = manager.admit(&source, token, wait_timeout).await?;
                let payload = slot.take_payload().ok_or_else(|| {
                    StoreError::Internal(format!("queue {} token {} lost its payload", source, token.0))
                })?;
                handler(payload).await
            }
            .await;

            if let Err(e) = &result {
                events.on_event(StoreEvent::QueueHandlerFailed {
                    queue: source.clone(),
                    token: token.0,
                    error: e.to_string(),
                });
            }
            result
        }))
    }
}

/// Drop-if-busy gate: at most one in-flight handler per resource, extra notifications are
/// ignored rather than queued.
#[derive(Debug)]
pub struct BusyGate {
    busy: Mutex<HashSet<String>>,
    events: Arc<dyn StoreEventListener>,
}

impl BusyGate {
    pub fn new(events: Arc<dyn StoreEventListener>) -> Arc<Self> {
        Arc::new(BusyGate {
            busy: Mutex::new(HashSet::new()),
            events,
        })
    }

    pub fn is_busy(&self, resource: &str) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(resource)
    }

    /// Marks `resource` busy, or returns `None` (and records the drop) if it already is.
    pub fn try_acquire(self: &Arc<Self>, resource: &str) -> Option<BusyGuard> {
        let inserted = self
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.to_string());
        if !inserted {
            store_metrics::record_notification_dropped();
            self.events.on_event(StoreEvent::NotificationDropped {
                resource: resource.to_string(),
            });
            return None;
        }
        Some(BusyGuard {
            gate: Arc::clone(self),
            resource: resource.to_string(),
        })
    }

    /// Spawns `handler` if `resource` is idle. Returns whether it was accepted.
    pub fn dispatch<F, Fut>(self: &Arc<Self>, resource: &str, handler: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        let Some(guard) = self.try_acquire(resource) else {
            return false;
        };
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            if let Err(e) = handler().await {
                events.on_event(StoreEvent::QueueHandlerFailed {
                    queue: guard.resource.clone(),
                    token: 0,
                    error: e.to_string(),
                });
            }
            drop(guard);
        });
        true
    }
}

/// Clears the busy flag of its resource on drop.
#[derive(Debug)]
pub struct BusyGuard {
    gate: Arc<BusyGate>,
    resource: String,
}

impl BusyGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.gate
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.resource);
    }
}
