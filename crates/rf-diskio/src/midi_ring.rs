//! MIDI event ring buffer
//!
//! Events are stored with absolute (monotonic) timestamps. The consumer
//! pulls the events belonging to a time window and rebases them to buffer
//! offsets.

use rf_core::{MidiBuffer, MidiEvent, NoteTracker, SamplePos};

use crate::ringbuf::RingBuffer;

pub struct MidiRingBuffer {
    rb: RingBuffer<MidiEvent>,
}

impl MidiRingBuffer {
    pub fn new(events: usize) -> Self {
        Self {
            rb: RingBuffer::new(events, 0),
        }
    }

    /// Producer: append one event; false if full
    #[inline]
    pub fn write(&self, ev: MidiEvent) -> bool {
        self.rb.write(std::slice::from_ref(&ev)) == 1
    }

    #[inline]
    pub fn read_space(&self) -> usize {
        self.rb.read_space()
    }

    #[inline]
    pub fn write_space(&self) -> usize {
        self.rb.write_space()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.rb.capacity()
    }

    pub fn reset(&self) {
        self.rb.reset();
    }

    /// Consumer: next event without consuming it
    #[inline]
    pub fn front(&self) -> Option<MidiEvent> {
        let mut ev = [MidiEvent::default()];
        (self.rb.read(&mut ev, 1, false, 0) == 1).then_some(ev[0])
    }

    /// Consumer: discard events earlier than `start`; returns how many
    pub fn skip_to(&self, start: SamplePos) -> usize {
        let mut skipped = 0;
        while let Some(ev) = self.front() {
            if ev.time >= start {
                break;
            }
            self.rb.increment_read_ptr(1);
            skipped += 1;
        }
        skipped
    }

    /// Consumer: move the events with time in `[start, end)` into `dst`,
    /// timed relative to `start` plus `dst_offset`. Earlier events are
    /// discarded. Every delivered event is fed to `tracker`. Events that do
    /// not fit in `dst` are dropped. Returns the number delivered.
    pub fn read(
        &self,
        dst: &mut MidiBuffer,
        start: SamplePos,
        end: SamplePos,
        dst_offset: SamplePos,
        tracker: &mut NoteTracker,
    ) -> usize {
        let mut delivered = 0;
        while let Some(ev) = self.front() {
            if ev.time >= end {
                break;
            }
            self.rb.increment_read_ptr(1);
            if ev.time < start {
                continue;
            }
            let ev = ev.with_time(ev.time - start + dst_offset);
            if dst.push(ev) {
                tracker.track(&ev);
                delivered += 1;
            }
        }
        delivered
    }

    /// Consumer (non-RT): move events earlier than `end` into `dst`
    pub fn drain_until(&self, dst: &mut Vec<MidiEvent>, end: SamplePos) -> usize {
        let before = dst.len();
        while let Some(ev) = self.front() {
            if ev.time >= end {
                break;
            }
            self.rb.increment_read_ptr(1);
            dst.push(ev);
        }
        dst.len() - before
    }
}
