//! Engine-wide context shared by every disk reader and writer

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use rf_core::SampleCnt;
use rf_file::CaptureSinkFactory;

use crate::config::DiskIoConfig;
use crate::notify::EventSender;
use crate::transport::TransportState;
use crate::trash::TrashQueue;

pub struct DiskIoContext {
    config: RwLock<DiskIoConfig>,
    // hot values the process thread reads without locking
    read_chunk: AtomicUsize,
    write_chunk: AtomicUsize,
    midi_readahead: AtomicI64,
    transport: Arc<TransportState>,
    events: EventSender,
    trash: TrashQueue,
    sinks: Arc<dyn CaptureSinkFactory>,
}

impl DiskIoContext {
    pub fn new(
        config: DiskIoConfig,
        transport: Arc<TransportState>,
        events: EventSender,
        trash: TrashQueue,
        sinks: Arc<dyn CaptureSinkFactory>,
    ) -> Self {
        let buffering = config.buffering();
        Self {
            read_chunk: AtomicUsize::new(buffering.read_chunk_samples),
            write_chunk: AtomicUsize::new(buffering.write_chunk_samples),
            midi_readahead: AtomicI64::new(config.midi_readahead),
            config: RwLock::new(config),
            transport,
            events,
            trash,
            sinks,
        }
    }

    /// Copy of the current configuration (non-RT)
    pub fn config(&self) -> DiskIoConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: DiskIoConfig) {
        let buffering = config.buffering();
        self.read_chunk
            .store(buffering.read_chunk_samples, Ordering::Release);
        self.write_chunk
            .store(buffering.write_chunk_samples, Ordering::Release);
        self.midi_readahead
            .store(config.midi_readahead, Ordering::Release);
        *self.config.write() = config;
    }

    #[inline]
    pub fn read_chunk(&self) -> usize {
        self.read_chunk.load(Ordering::Acquire)
    }

    #[inline]
    pub fn write_chunk(&self) -> usize {
        self.write_chunk.load(Ordering::Acquire)
    }

    #[inline]
    pub fn midi_readahead(&self) -> SampleCnt {
        self.midi_readahead.load(Ordering::Acquire)
    }

    #[inline]
    pub fn transport(&self) -> &TransportState {
        &self.transport
    }

    pub fn transport_handle(&self) -> Arc<TransportState> {
        self.transport.clone()
    }

    #[inline]
    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn trash(&self) -> &TrashQueue {
        &self.trash
    }

    pub fn sinks(&self) -> &dyn CaptureSinkFactory {
        self.sinks.as_ref()
    }
}
