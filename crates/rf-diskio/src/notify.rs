//! Notifications from the streaming engine
//!
//! Raised on the audio thread (underrun, overrun) and on the butler (I/O
//! errors). Delivery never blocks or allocates: events go through a bounded
//! channel with `try_send`, and a full channel drops the event and bumps a
//! counter instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::track::TrackId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskEvent {
    /// Playback buffer could not supply a cycle
    Underrun { track: TrackId },
    /// Capture buffer could not accept a cycle
    Overrun { track: TrackId },
    /// Refill failed; the track stays silent until the next locate
    ReadError { track: TrackId },
    /// Flush failed; the take is at risk
    WriteError { track: TrackId },
    RecordEnableChanged { track: TrackId, enabled: bool },
    RecordSafeChanged { track: TrackId, safe: bool },
    AlignmentStyleChanged { track: TrackId },
    /// The butler asked for the transport to stop after a write error
    TransportStopRequested,
}

#[derive(Clone)]
pub struct EventSender {
    tx: Sender<DiskEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Non-blocking send; returns false if the event was dropped
    #[inline]
    pub fn send(&self, event: DiskEvent) -> bool {
        if self.tx.try_send(event).is_ok() {
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Bounded notification channel
pub fn event_channel(capacity: usize) -> (EventSender, Receiver<DiskEvent>) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        EventSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_channel_drops_and_counts() {
        let (tx, rx) = event_channel(2);
        assert!(tx.send(DiskEvent::Underrun { track: 1 }));
        assert!(tx.send(DiskEvent::Overrun { track: 1 }));
        assert!(!tx.send(DiskEvent::Underrun { track: 2 }));
        assert_eq!(tx.dropped(), 1);

        assert_eq!(rx.try_recv().unwrap(), DiskEvent::Underrun { track: 1 });
        assert!(tx.send(DiskEvent::TransportStopRequested));
    }
}
