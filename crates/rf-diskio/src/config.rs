//! Disk I/O configuration
//!
//! Buffering presets, loop fade policy and the limits that size the
//! preallocated buffers. Serialized as JSON alongside session settings.

use serde::{Deserialize, Serialize};

use rf_core::SampleCnt;

use crate::error::{DiskIoError, DiskIoResult};
use crate::ringbuf::DEFAULT_RESERVATION;

// ═══════════════════════════════════════════════════════════════════════════
// BUFFERING
// ═══════════════════════════════════════════════════════════════════════════

/// Named buffering trade-offs between latency of reaction and robustness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BufferingPreset {
    Small,
    #[default]
    Medium,
    Large,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferingParameters {
    /// Samples the butler tries to read per refill pass
    pub read_chunk_samples: usize,
    /// Samples the butler writes per flush pass
    pub write_chunk_samples: usize,
    pub read_buffer_seconds: f64,
    pub write_buffer_seconds: f64,
}

impl BufferingParameters {
    pub const SMALL: Self = Self {
        read_chunk_samples: 32768,
        write_chunk_samples: 32768,
        read_buffer_seconds: 5.0,
        write_buffer_seconds: 5.0,
    };

    pub const MEDIUM: Self = Self {
        read_chunk_samples: 65536,
        write_chunk_samples: 65536,
        read_buffer_seconds: 10.0,
        write_buffer_seconds: 10.0,
    };

    pub const LARGE: Self = Self {
        read_chunk_samples: 131072,
        write_chunk_samples: 131072,
        read_buffer_seconds: 20.0,
        write_buffer_seconds: 20.0,
    };

    pub fn validate(&self, sample_rate: u32) -> DiskIoResult<()> {
        if self.read_chunk_samples == 0 || self.write_chunk_samples == 0 {
            return Err(DiskIoError::InvalidConfig(
                "chunk sizes must be non-zero".into(),
            ));
        }
        if !(self.read_buffer_seconds > 0.0 && self.write_buffer_seconds > 0.0) {
            return Err(DiskIoError::InvalidConfig(
                "buffer durations must be positive".into(),
            ));
        }
        let read_samples = self.read_buffer_seconds * sample_rate as f64;
        if (self.read_chunk_samples as f64) > read_samples {
            return Err(DiskIoError::InvalidConfig(format!(
                "read chunk of {} samples exceeds {:.1}s playback buffer",
                self.read_chunk_samples, self.read_buffer_seconds
            )));
        }
        let write_samples = self.write_buffer_seconds * sample_rate as f64;
        if (self.write_chunk_samples as f64) > write_samples {
            return Err(DiskIoError::InvalidConfig(format!(
                "write chunk of {} samples exceeds {:.1}s capture buffer",
                self.write_chunk_samples, self.write_buffer_seconds
            )));
        }
        Ok(())
    }
}

impl Default for BufferingParameters {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl BufferingPreset {
    /// Parameters for a named preset; `None` for `Custom`
    pub fn parameters(self) -> Option<BufferingParameters> {
        match self {
            BufferingPreset::Small => Some(BufferingParameters::SMALL),
            BufferingPreset::Medium => Some(BufferingParameters::MEDIUM),
            BufferingPreset::Large => Some(BufferingParameters::LARGE),
            BufferingPreset::Custom => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOOP FADES
// ═══════════════════════════════════════════════════════════════════════════

/// How the playback stream is shaped around the loop boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopFadeMode {
    /// Hard cut at the loop point
    NoFade,
    /// Fade out before the loop end only
    EndFade,
    /// Fade out before the loop end and fade in after the loop start
    BothFades,
    /// Crossfade the loop tail with the material leading into the loop start
    #[default]
    Crossfade,
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskIoConfig {
    pub sample_rate: u32,
    pub buffering_preset: BufferingPreset,
    /// Used when `buffering_preset` is `Custom`
    pub custom_buffering: BufferingParameters,
    pub loop_fade_mode: LoopFadeMode,
    /// How far ahead of the playhead MIDI is read
    pub midi_readahead: SampleCnt,
    /// Width of a sample on disk, used to size refill reads in bytes
    pub native_sample_bits: u32,
    /// Largest process cycle the audio thread will ask for
    pub max_block_size: usize,
    /// Largest varispeed ratio the playback scratch buffers are sized for
    pub max_speed: f64,
    /// Rewind history kept behind the playback read pointer
    pub playback_reservation: usize,
    /// Events held by each MIDI ring buffer
    pub midi_ring_events: usize,
    /// Pending notifications before further ones are dropped
    pub event_queue_capacity: usize,
}

impl Default for DiskIoConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            buffering_preset: BufferingPreset::Medium,
            custom_buffering: BufferingParameters::MEDIUM,
            loop_fade_mode: LoopFadeMode::Crossfade,
            midi_readahead: 4096,
            native_sample_bits: 32,
            max_block_size: 8192,
            max_speed: 8.0,
            playback_reservation: DEFAULT_RESERVATION,
            midi_ring_events: 16384,
            event_queue_capacity: 256,
        }
    }
}

impl DiskIoConfig {
    /// Active buffering parameters
    pub fn buffering(&self) -> BufferingParameters {
        self.buffering_preset
            .parameters()
            .unwrap_or(self.custom_buffering)
    }

    /// Samples of playback ring buffer requested per channel
    pub fn playback_buffer_samples(&self) -> usize {
        (self.buffering().read_buffer_seconds * self.sample_rate as f64).ceil() as usize
    }

    /// Samples of capture ring buffer requested per channel
    pub fn capture_buffer_samples(&self) -> usize {
        (self.buffering().write_buffer_seconds * self.sample_rate as f64).ceil() as usize
    }

    /// Scratch length for one varispeed cycle, including interpolation
    /// lookahead
    pub fn varispeed_scratch_samples(&self) -> usize {
        (self.max_block_size as f64 * self.max_speed.abs().max(1.0)).ceil() as usize + 4
    }

    pub fn validate(&self) -> DiskIoResult<()> {
        if self.sample_rate == 0 {
            return Err(DiskIoError::InvalidConfig("sample rate must be non-zero".into()));
        }
        if self.native_sample_bits == 0 || self.native_sample_bits % 8 != 0 {
            return Err(DiskIoError::InvalidConfig(format!(
                "unsupported native sample width: {} bits",
                self.native_sample_bits
            )));
        }
        if self.max_block_size == 0 {
            return Err(DiskIoError::InvalidConfig("max block size must be non-zero".into()));
        }
        if self.midi_readahead <= 0 {
            return Err(DiskIoError::InvalidConfig("MIDI readahead must be positive".into()));
        }
        self.buffering().validate(self.sample_rate)
    }

    pub fn from_json(json: &str) -> DiskIoResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> DiskIoResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let mut config = DiskIoConfig::default();
        assert_eq!(config.buffering().read_chunk_samples, 65536);
        assert_eq!(config.playback_buffer_samples(), 480_000);

        config.buffering_preset = BufferingPreset::Small;
        assert_eq!(config.buffering(), BufferingParameters::SMALL);
        assert_eq!(config.capture_buffer_samples(), 240_000);

        config.buffering_preset = BufferingPreset::Custom;
        config.custom_buffering = BufferingParameters {
            read_chunk_samples: 4096,
            write_chunk_samples: 8192,
            read_buffer_seconds: 1.0,
            write_buffer_seconds: 2.0,
        };
        assert_eq!(config.buffering().write_chunk_samples, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_custom_buffering() {
        let config = DiskIoConfig {
            buffering_preset: BufferingPreset::Custom,
            custom_buffering: BufferingParameters {
                read_chunk_samples: 1 << 20,
                write_chunk_samples: 1024,
                read_buffer_seconds: 1.0,
                write_buffer_seconds: 1.0,
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DiskIoError::InvalidConfig(_))));
    }

    #[test]
    fn test_json_round_trip_with_defaults() {
        let config = DiskIoConfig::from_json(r#"{ "buffering_preset": "Large", "sample_rate": 44100 }"#)
            .unwrap();
        assert_eq!(config.buffering_preset, BufferingPreset::Large);
        assert_eq!(config.midi_readahead, 4096);
        assert_eq!(config.loop_fade_mode, LoopFadeMode::Crossfade);

        let json = config.to_json().unwrap();
        assert_eq!(DiskIoConfig::from_json(&json).unwrap(), config);
    }
}
