//! Regions and playlists
//!
//! A playlist renders any timeline range of one channel into a buffer,
//! producing silence wherever no region covers the timeline. Regions are
//! opaque: a region added later sits on top of the ones below it.

use std::sync::Arc;

use parking_lot::RwLock;
use rf_core::{Gain, MidiEvent, Sample, SampleCnt, SamplePos};

use crate::{AudioSource, FileError, FileResult};

// ═══════════════════════════════════════════════════════════════════════════════
// AUDIO REGIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// A window onto per-channel sources placed on the timeline
#[derive(Clone)]
pub struct AudioRegion {
    pub name: String,
    /// Timeline position of the first sample
    pub position: SamplePos,
    /// Offset into the sources
    pub start: SampleCnt,
    pub length: SampleCnt,
    /// One mono source per channel
    pub sources: Vec<Arc<dyn AudioSource>>,
    pub gain: Gain,
    pub fade_in: SampleCnt,
    pub fade_out: SampleCnt,
}

impl AudioRegion {
    pub fn new(
        name: impl Into<String>,
        sources: Vec<Arc<dyn AudioSource>>,
        start: SampleCnt,
        length: SampleCnt,
        position: SamplePos,
    ) -> Self {
        Self {
            name: name.into(),
            position,
            start,
            length,
            sources,
            gain: 1.0,
            fade_in: 0,
            fade_out: 0,
        }
    }

    /// Region covering a whole set of sources from their beginning
    pub fn whole_file(name: impl Into<String>, sources: Vec<Arc<dyn AudioSource>>) -> Self {
        let length = sources.iter().map(|s| s.length()).max().unwrap_or(0);
        Self::new(name, sources, 0, length, 0)
    }

    #[inline]
    pub fn end(&self) -> SamplePos {
        self.position + self.length
    }

    #[inline]
    pub fn n_channels(&self) -> usize {
        self.sources.len()
    }

    /// Envelope value at `offset` samples into the region
    fn envelope(&self, offset: SampleCnt) -> Gain {
        let mut g = self.gain;
        if self.fade_in > 0 && offset < self.fade_in {
            g *= offset as Gain / self.fade_in as Gain;
        }
        let from_end = self.length - 1 - offset;
        if self.fade_out > 0 && from_end < self.fade_out {
            g *= from_end as Gain / self.fade_out as Gain;
        }
        g
    }

    /// Render `buf.len()` samples of `channel` starting at timeline position
    /// `pos`, which must lie inside the region. Channels beyond the region's
    /// source count reuse the last source.
    fn read_at(
        &self,
        buf: &mut [Sample],
        mixdown: &mut [Sample],
        gain: &mut [Gain],
        pos: SamplePos,
        channel: usize,
    ) -> FileResult<()> {
        let Some(source) = self.sources.get(channel).or_else(|| self.sources.last()) else {
            return Ok(());
        };
        let cnt = buf.len();
        let internal = pos - self.position;

        source.read(&mut mixdown[..cnt], self.start + internal)?;

        let plain = self.gain == 1.0
            && (self.fade_in == 0 || internal >= self.fade_in)
            && (self.fade_out == 0 || self.length - (internal + cnt as SampleCnt) >= self.fade_out);

        if plain {
            buf.copy_from_slice(&mixdown[..cnt]);
        } else {
            for (i, g) in gain[..cnt].iter_mut().enumerate() {
                *g = self.envelope(internal + i as SampleCnt);
            }
            for ((out, s), g) in buf.iter_mut().zip(&mixdown[..cnt]).zip(&gain[..cnt]) {
                *out = *s * *g;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AudioRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioRegion")
            .field("name", &self.name)
            .field("position", &self.position)
            .field("start", &self.start)
            .field("length", &self.length)
            .field("channels", &self.sources.len())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AUDIO PLAYLIST
// ═══════════════════════════════════════════════════════════════════════════════

/// Timeline of audio regions for one track
pub trait AudioPlaylist: Send + Sync {
    /// Render `cnt` samples of `channel` from timeline position `start` into
    /// `buf`. `mixdown` and `gain` are scratch space of at least `cnt`
    /// samples. Returns the number of samples produced, which is `cnt` unless
    /// the request itself is invalid.
    fn read(
        &self,
        buf: &mut [Sample],
        mixdown: &mut [Sample],
        gain: &mut [Gain],
        start: SamplePos,
        cnt: SampleCnt,
        channel: usize,
    ) -> FileResult<SampleCnt>;

    fn add_region(&self, region: AudioRegion);

    fn regions(&self) -> Vec<AudioRegion>;
}

/// In-memory region list with opaque layering
#[derive(Default)]
pub struct RegionPlaylist {
    name: String,
    regions: RwLock<Vec<AudioRegion>>,
}

impl RegionPlaylist {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            regions: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }
}

impl AudioPlaylist for RegionPlaylist {
    fn read(
        &self,
        buf: &mut [Sample],
        mixdown: &mut [Sample],
        gain: &mut [Gain],
        start: SamplePos,
        cnt: SampleCnt,
        channel: usize,
    ) -> FileResult<SampleCnt> {
        if cnt < 0 {
            return Err(FileError::ReadError(format!(
                "{}: negative read length {}",
                self.name, cnt
            )));
        }
        let n = cnt as usize;
        if buf.len() < n || mixdown.len() < n || gain.len() < n {
            return Err(FileError::ReadError(format!(
                "{}: {} samples requested, buffers hold {}/{}/{}",
                self.name,
                cnt,
                buf.len(),
                mixdown.len(),
                gain.len()
            )));
        }

        let out = &mut buf[..n];
        out.fill(0.0);
        let end = start + cnt;

        // bottom to top; later regions overwrite earlier ones
        for region in self.regions.read().iter() {
            let from = region.position.max(start);
            let to = region.end().min(end);
            if from >= to {
                continue;
            }
            let offset = (from - start) as usize;
            let len = (to - from) as usize;
            region.read_at(
                &mut out[offset..offset + len],
                mixdown,
                gain,
                from,
                channel,
            )?;
        }

        Ok(cnt)
    }

    fn add_region(&self, region: AudioRegion) {
        log::debug!(
            "{}: add region {} at {} ({} samples)",
            self.name,
            region.name,
            region.position,
            region.length
        );
        self.regions.write().push(region);
    }

    fn regions(&self) -> Vec<AudioRegion> {
        self.regions.read().clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MIDI REGIONS / PLAYLIST
// ═══════════════════════════════════════════════════════════════════════════════

/// Window onto a MIDI event list whose times are relative to the source start
#[derive(Debug, Clone)]
pub struct MidiRegion {
    pub name: String,
    pub position: SamplePos,
    pub start: SampleCnt,
    pub length: SampleCnt,
    pub events: Arc<Vec<MidiEvent>>,
}

impl MidiRegion {
    #[inline]
    pub fn end(&self) -> SamplePos {
        self.position + self.length
    }
}

pub trait MidiPlaylist: Send + Sync {
    /// Append the events in `[start, start + cnt)` to `dst` with absolute
    /// timeline times, in time order. Returns `cnt`.
    fn read(&self, dst: &mut Vec<MidiEvent>, start: SamplePos, cnt: SampleCnt)
    -> FileResult<SampleCnt>;

    fn add_region(&self, region: MidiRegion);

    fn regions(&self) -> Vec<MidiRegion>;
}

#[derive(Default)]
pub struct MidiRegionPlaylist {
    name: String,
    regions: RwLock<Vec<MidiRegion>>,
}

impl MidiRegionPlaylist {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            regions: RwLock::new(Vec::new()),
        }
    }
}

impl MidiPlaylist for MidiRegionPlaylist {
    fn read(
        &self,
        dst: &mut Vec<MidiEvent>,
        start: SamplePos,
        cnt: SampleCnt,
    ) -> FileResult<SampleCnt> {
        let end = start + cnt;
        let first = dst.len();

        for region in self.regions.read().iter() {
            let from = region.position.max(start);
            let to = region.end().min(end);
            if from >= to {
                continue;
            }
            let src_from = region.start + (from - region.position);
            let src_to = region.start + (to - region.position);
            dst.extend(
                region
                    .events
                    .iter()
                    .filter(|ev| ev.time >= src_from && ev.time < src_to)
                    .map(|ev| ev.with_time(region.position + ev.time - region.start)),
            );
        }

        dst[first..].sort_by_key(|ev| ev.time);
        Ok(cnt)
    }

    fn add_region(&self, region: MidiRegion) {
        log::debug!(
            "{}: add MIDI region {} at {} ({} events)",
            self.name,
            region.name,
            region.position,
            region.events.len()
        );
        self.regions.write().push(region);
    }

    fn regions(&self) -> Vec<MidiRegion> {
        self.regions.read().clone()
    }
}
