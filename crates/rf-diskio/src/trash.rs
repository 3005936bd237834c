//! Deferred reclamation
//!
//! Objects that may still be referenced by another thread when they are
//! retired (old channel list snapshots, removed tracks) are pushed here and
//! dropped by the butler once it holds the last reference.

use std::any::Any;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

pub type Garbage = Arc<dyn Any + Send + Sync>;

/// Producer side, cloned into everything that retires shared objects
#[derive(Clone)]
pub struct TrashQueue {
    tx: Sender<Garbage>,
    rx: Receiver<Garbage>,
}

impl TrashQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Hand an object over for deferred drop. If the queue is full the
    /// object is released on the calling thread.
    pub fn push(&self, item: Garbage) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) | Err(TrySendError::Disconnected(item)) => {
                log::debug!("Trash queue full, releasing in place");
                drop(item);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn collector(&self) -> TrashCollector {
        TrashCollector {
            rx: self.rx.clone(),
            pending: Vec::new(),
        }
    }
}

impl Default for TrashQueue {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Consumer side, owned by the butler
pub struct TrashCollector {
    rx: Receiver<Garbage>,
    pending: Vec<Garbage>,
}

impl TrashCollector {
    /// Take queued objects and drop every held object nobody else references.
    /// Returns how many were dropped.
    pub fn collect(&mut self) -> usize {
        self.pending.extend(self.rx.try_iter());
        let before = self.pending.len();
        self.pending.retain(|item| Arc::strong_count(item) > 1);
        before - self.pending.len()
    }

    /// Objects still referenced elsewhere
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
