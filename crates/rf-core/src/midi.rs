//! MIDI Types and Events
//!
//! Everything here is fixed-size so events can travel through lock-free ring
//! buffers and be handled on the process thread without allocation:
//! - [`MidiEvent`]: a timestamped channel message of up to three bytes
//! - [`MidiBuffer`]: a per-cycle event list with preallocated capacity
//! - [`NoteTracker`]: active note bookkeeping used to resolve stuck notes

use serde::{Deserialize, Serialize};

use crate::time::SamplePos;

// ═══════════════════════════════════════════════════════════════════════════════
// MIDI CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// MIDI 1.0 status bytes
pub mod status {
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    pub const POLY_PRESSURE: u8 = 0xA0;
    pub const CONTROL_CHANGE: u8 = 0xB0;
    pub const PROGRAM_CHANGE: u8 = 0xC0;
    pub const CHANNEL_PRESSURE: u8 = 0xD0;
    pub const PITCH_BEND: u8 = 0xE0;
    pub const SYSTEM: u8 = 0xF0;
}

/// Largest message carried by [`MidiEvent`]
pub const MAX_MIDI_EVENT_SIZE: usize = 3;

/// Data length (excluding status) for a channel voice status byte
fn message_size(status_byte: u8) -> Option<usize> {
    match status_byte & 0xF0 {
        status::NOTE_OFF
        | status::NOTE_ON
        | status::POLY_PRESSURE
        | status::CONTROL_CHANGE
        | status::PITCH_BEND => Some(3),
        status::PROGRAM_CHANGE | status::CHANNEL_PRESSURE => Some(2),
        _ => match status_byte {
            // clock, start, continue, stop, active sensing, reset
            0xF8..=0xFF => Some(1),
            _ => None,
        },
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MIDI EVENT
// ═══════════════════════════════════════════════════════════════════════════════

/// Timestamped MIDI message
///
/// `time` is either a sample offset within the current process cycle or an
/// absolute position, depending on the buffer holding the event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub time: SamplePos,
    pub size: u8,
    pub data: [u8; MAX_MIDI_EVENT_SIZE],
}

impl MidiEvent {
    /// Build an event from raw bytes. Returns `None` for running status,
    /// sysex and anything that does not fit in three bytes.
    pub fn from_bytes(time: SamplePos, bytes: &[u8]) -> Option<Self> {
        let first = *bytes.first()?;
        let size = message_size(first)?;
        if bytes.len() < size {
            return None;
        }
        let mut data = [0u8; MAX_MIDI_EVENT_SIZE];
        data[..size].copy_from_slice(&bytes[..size]);
        Some(Self {
            time,
            size: size as u8,
            data,
        })
    }

    pub fn note_on(time: SamplePos, channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            time,
            size: 3,
            data: [status::NOTE_ON | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
        }
    }

    pub fn note_off(time: SamplePos, channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            time,
            size: 3,
            data: [status::NOTE_OFF | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
        }
    }

    pub fn control_change(time: SamplePos, channel: u8, controller: u8, value: u8) -> Self {
        Self {
            time,
            size: 3,
            data: [
                status::CONTROL_CHANGE | (channel & 0x0F),
                controller & 0x7F,
                value & 0x7F,
            ],
        }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }

    #[inline]
    pub fn status(&self) -> u8 {
        self.data[0] & 0xF0
    }

    #[inline]
    pub fn channel(&self) -> u8 {
        self.data[0] & 0x0F
    }

    #[inline]
    pub fn note(&self) -> u8 {
        self.data[1]
    }

    #[inline]
    pub fn velocity(&self) -> u8 {
        self.data[2]
    }

    #[inline]
    pub fn is_note_on(&self) -> bool {
        self.status() == status::NOTE_ON && self.velocity() > 0
    }

    /// Note off, including note on with velocity zero
    #[inline]
    pub fn is_note_off(&self) -> bool {
        self.status() == status::NOTE_OFF
            || (self.status() == status::NOTE_ON && self.velocity() == 0)
    }

    /// Same message with a different timestamp
    #[inline]
    pub fn with_time(mut self, time: SamplePos) -> Self {
        self.time = time;
        self
    }

    /// Same message bytes, ignoring the timestamp
    #[inline]
    pub fn same_message(&self, other: &MidiEvent) -> bool {
        self.bytes() == other.bytes()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MIDI BUFFER
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-cycle MIDI event list, kept sorted by time
///
/// Capacity is fixed at construction; `push` and `merge_from` never grow the
/// allocation, so a buffer can be used from the process thread.
#[derive(Debug, Clone)]
pub struct MidiBuffer {
    events: Vec<MidiEvent>,
}

impl MidiBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Insert an event after any events with the same or earlier time.
    /// Returns false (dropping the event) when the buffer is full.
    pub fn push(&mut self, ev: MidiEvent) -> bool {
        if self.events.len() == self.events.capacity() {
            return false;
        }
        let idx = self.events.partition_point(|e| e.time <= ev.time);
        self.events.insert(idx, ev);
        true
    }

    /// Merge all events of `other` into this buffer. Returns the number of
    /// events that did not fit.
    pub fn merge_from(&mut self, other: &MidiBuffer) -> usize {
        let mut dropped = 0;
        for ev in other.iter() {
            if !self.push(*ev) {
                dropped += 1;
            }
        }
        dropped
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MidiEvent> {
        self.events.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, MidiEvent> {
        self.events.iter_mut()
    }

    pub fn as_slice(&self) -> &[MidiEvent] {
        &self.events
    }
}

impl Default for MidiBuffer {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NOTE TRACKER
// ═══════════════════════════════════════════════════════════════════════════════

/// Counts note-ons per channel and note so that every sounding note can be
/// turned off at a discontinuity (loop wrap, locate, end of capture).
#[derive(Debug, Clone)]
pub struct NoteTracker {
    active: [[u8; 128]; 16],
    on: u32,
}

impl NoteTracker {
    pub fn new() -> Self {
        Self {
            active: [[0; 128]; 16],
            on: 0,
        }
    }

    /// Number of notes currently sounding
    #[inline]
    pub fn on(&self) -> u32 {
        self.on
    }

    pub fn track(&mut self, ev: &MidiEvent) {
        let chan = ev.channel() as usize;
        let note = (ev.note() & 0x7F) as usize;
        if ev.is_note_on() {
            let count = &mut self.active[chan][note];
            *count = count.saturating_add(1);
            self.on += 1;
        } else if ev.is_note_off() {
            let count = &mut self.active[chan][note];
            if *count > 0 {
                *count -= 1;
                self.on -= 1;
            }
        }
    }

    /// Write one note-off per outstanding note-on into `dst` at `time`,
    /// then forget them. Stops early if `dst` is full.
    pub fn resolve(&mut self, dst: &mut MidiBuffer, time: SamplePos) {
        if self.on == 0 {
            return;
        }
        for chan in 0..16 {
            for note in 0..128 {
                while self.active[chan][note] > 0 {
                    if !dst.push(MidiEvent::note_off(time, chan as u8, note as u8, 0)) {
                        return;
                    }
                    self.active[chan][note] -= 1;
                    self.on -= 1;
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.active = [[0; 128]; 16];
        self.on = 0;
    }
}

impl Default for NoteTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes() {
        let ev = MidiEvent::from_bytes(12, &[0x91, 60, 100]).unwrap();
        assert_eq!(ev.size, 3);
        assert_eq!(ev.channel(), 1);
        assert!(ev.is_note_on());

        let pc = MidiEvent::from_bytes(0, &[0xC0, 5]).unwrap();
        assert_eq!(pc.bytes(), &[0xC0, 5]);

        assert!(MidiEvent::from_bytes(0, &[0xF0, 1, 2, 0xF7]).is_none());
        assert!(MidiEvent::from_bytes(0, &[0x90, 60]).is_none());
    }

    #[test]
    fn test_velocity_zero_note_on_is_note_off() {
        let ev = MidiEvent::from_bytes(0, &[0x90, 60, 0]).unwrap();
        assert!(ev.is_note_off());
        assert!(!ev.is_note_on());
    }

    #[test]
    fn test_buffer_keeps_time_order() {
        let mut buf = MidiBuffer::with_capacity(8);
        buf.push(MidiEvent::note_on(10, 0, 60, 90));
        buf.push(MidiEvent::note_on(2, 0, 61, 90));
        buf.push(MidiEvent::note_off(10, 0, 60, 0));

        let times: Vec<_> = buf.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![2, 10, 10]);
        // equal times keep insertion order
        assert!(buf.as_slice()[2].is_note_off());
    }

    #[test]
    fn test_buffer_never_grows() {
        let mut buf = MidiBuffer::with_capacity(2);
        assert!(buf.push(MidiEvent::note_on(0, 0, 1, 1)));
        assert!(buf.push(MidiEvent::note_on(0, 0, 2, 1)));
        assert!(!buf.push(MidiEvent::note_on(0, 0, 3, 1)));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.capacity(), 2);
    }

    #[test]
    fn test_tracker_resolves_stuck_notes() {
        let mut tracker = NoteTracker::new();
        tracker.track(&MidiEvent::note_on(0, 0, 60, 100));
        tracker.track(&MidiEvent::note_on(0, 2, 64, 100));
        tracker.track(&MidiEvent::note_on(5, 0, 67, 100));
        tracker.track(&MidiEvent::note_off(9, 0, 67, 0));
        assert_eq!(tracker.on(), 2);

        let mut out = MidiBuffer::with_capacity(16);
        tracker.resolve(&mut out, 128);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|e| e.is_note_off() && e.time == 128));
        assert_eq!(tracker.on(), 0);
    }
}
