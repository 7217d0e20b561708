//! Pairing synchronization bridge
//!
//! Hands an out-of-band value discovered by one task (typically the stdout
//! monitor) to another task that suspends until it arrives (typically a
//! pairing delegate). The two may run in either order: a value resolved
//! before anyone waits is kept, and a waiter that arrives first parks until
//! the value is resolved.
//!
//! Two shapes are provided:
//!
//! - [`Relay`]: a single slot, resolved at most once. Any number of readers
//!   may wait on it and each receives a clone of the same value.
//! - [`RelayQueue`]: a bounded multi-shot queue for sequences of values,
//!   consumed one per [`RelayQueue::next`] in the order they were pushed.
//!
//! Neither shape times out. Callers put their own deadline around `wait()`
//! and `next()`.

use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Relay closed before a value arrived")]
    Closed,
}

/// What happened to a value handed to `resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Stored; current and future readers will see it.
    Delivered,
    /// The slot already held a value. The new one was dropped.
    AlreadyResolved,
    /// The relay was closed or has no readers left. The value was dropped.
    Discarded,
    /// The queue was at capacity. The value was dropped.
    Full,
}

#[derive(Debug, Clone)]
enum SlotState<T> {
    Pending,
    Resolved(T),
    Closed,
}

// ---------------------------------------------------------------------------
// Single slot
// ---------------------------------------------------------------------------

/// Single-slot relay. Cloning yields another reader of the same slot.
#[derive(Clone)]
pub struct Relay<T> {
    tx: Arc<watch::Sender<SlotState<T>>>,
    rx: watch::Receiver<SlotState<T>>,
}

/// Write end of a [`Relay`] that does not keep the relay alive. Once every
/// reader is gone, resolving is a silent no-op.
#[derive(Clone)]
pub struct RelayResolver<T> {
    tx: Weak<watch::Sender<SlotState<T>>>,
}

impl<T> Relay<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(SlotState::Pending);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn resolver(&self) -> RelayResolver<T> {
        RelayResolver {
            tx: Arc::downgrade(&self.tx),
        }
    }

    /// Store `value` if the slot is still empty.
    pub fn resolve(&self, value: T) -> Resolution {
        resolve_slot(&self.tx, value)
    }

    /// Wait for the value. Returns immediately if it has already arrived.
    pub async fn wait(&self) -> Result<T, RelayError> {
        let mut rx = self.rx.clone();
        loop {
            let settled = match &*rx.borrow_and_update() {
                SlotState::Pending => None,
                SlotState::Resolved(value) => Some(Ok(value.clone())),
                SlotState::Closed => Some(Err(RelayError::Closed)),
            };
            if let Some(result) = settled {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(RelayError::Closed);
            }
        }
    }

    /// The value, if it has arrived, without waiting.
    pub fn peek(&self) -> Option<T> {
        match &*self.rx.borrow() {
            SlotState::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(&*self.rx.borrow(), SlotState::Resolved(_))
    }

    /// Give up on the value. Pending waiters return [`RelayError::Closed`]
    /// and later resolves are discarded. A relay that already holds a value
    /// keeps it.
    pub fn close(&self) {
        self.tx.send_if_modified(|state| match state {
            SlotState::Pending => {
                *state = SlotState::Closed;
                true
            }
            _ => false,
        });
    }
}

impl<T> Default for Relay<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RelayResolver<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn resolve(&self, value: T) -> Resolution {
        match self.tx.upgrade() {
            Some(tx) => resolve_slot(&tx, value),
            None => {
                log::debug!("relay has no readers left; value discarded");
                Resolution::Discarded
            }
        }
    }
}

fn resolve_slot<T>(tx: &watch::Sender<SlotState<T>>, value: T) -> Resolution {
    let mut value = Some(value);
    let mut outcome = Resolution::Delivered;
    tx.send_if_modified(|state| match state {
        SlotState::Pending => {
            if let Some(v) = value.take() {
                *state = SlotState::Resolved(v);
            }
            true
        }
        SlotState::Resolved(_) => {
            outcome = Resolution::AlreadyResolved;
            false
        }
        SlotState::Closed => {
            outcome = Resolution::Discarded;
            false
        }
    });
    match outcome {
        Resolution::AlreadyResolved => log::debug!("relay already resolved; value ignored"),
        Resolution::Discarded => log::debug!("relay closed; value discarded"),
        _ => {}
    }
    outcome
}

// ---------------------------------------------------------------------------
// Multi-shot queue
// ---------------------------------------------------------------------------

/// Bounded queue of out-of-band values, consumed in push order.
pub struct RelayQueue<T> {
    tx: std::sync::Mutex<Option<WriteEnd<T>>>,
    rx: Mutex<mpsc::Receiver<T>>,
    closed: watch::Sender<bool>,
}

/// The queue holds its own sender only until the first resolver is handed
/// out, so the channel ends once every resolver is dropped.
enum WriteEnd<T> {
    Unclaimed(mpsc::Sender<T>),
    Claimed(mpsc::WeakSender<T>),
}

/// Write end of a [`RelayQueue`]. Never blocks.
#[derive(Clone)]
pub struct QueueResolver<T> {
    tx: mpsc::Sender<T>,
}

impl<T: Send + 'static> RelayQueue<T> {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            tx: std::sync::Mutex::new(Some(WriteEnd::Unclaimed(tx))),
            rx: Mutex::new(rx),
            closed,
        }
    }

    /// A new write end, or `None` once the queue is closed or every
    /// earlier write end has been dropped.
    pub fn resolver(&self) -> Option<QueueResolver<T>> {
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let tx = match guard.as_ref()? {
            WriteEnd::Unclaimed(tx) => tx.clone(),
            WriteEnd::Claimed(weak) => weak.upgrade()?,
        };
        *guard = Some(WriteEnd::Claimed(tx.downgrade()));
        Some(QueueResolver { tx })
    }

    /// Next value in push order. Returns `None` once the queue is closed
    /// (or every resolver is dropped) and drained.
    pub async fn next(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            value = rx.recv() => value,
            _ = until_closed(self.closed.subscribe()) => {
                rx.close();
                rx.recv().await
            }
        }
    }

    /// Stop accepting values. Anything already queued can still be read.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.closed.send_replace(true);
        // A parked reader holds the receiver and closes it when it wakes.
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
    }
}

async fn until_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

impl<T> QueueResolver<T> {
    pub fn resolve(&self, value: T) -> Resolution {
        match self.tx.try_send(value) {
            Ok(()) => Resolution::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Relay queue full; value dropped");
                Resolution::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("relay queue closed; value discarded");
                Resolution::Discarded
            }
        }
    }
}
