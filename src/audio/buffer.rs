use super::AudioFrame;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

struct Shared {
    ring: Mutex<HeapRb<AudioFrame>>,
    dropped: AtomicU64,
    closed: AtomicBool,
    failure: Mutex<Option<String>>,
}

/// Bounded frame queue between an audio source and the engine.
///
/// The writer never blocks: when the ring is full the oldest frame is
/// overwritten. The reader is woken through a one-slot signal channel that
/// can be used inside `crossbeam_channel::select!`.
pub struct FrameBuffer;

impl FrameBuffer {
    /// Create a connected writer/reader pair holding at most `capacity` frames
    pub fn new(capacity: usize) -> (FrameWriter, FrameReader) {
        let shared = Arc::new(Shared {
            ring: Mutex::new(HeapRb::new(capacity.max(1))),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            failure: Mutex::new(None),
        });
        let (ready_tx, ready_rx) = bounded(1);

        (
            FrameWriter {
                shared: Arc::clone(&shared),
                ready_tx,
            },
            FrameReader { shared, ready_rx },
        )
    }
}

/// Producer half, owned by the audio source
#[derive(Clone)]
pub struct FrameWriter {
    shared: Arc<Shared>,
    ready_tx: Sender<()>,
}

impl FrameWriter {
    /// Push a frame, overwriting the oldest one if the buffer is full
    pub fn push(&self, frame: AudioFrame) {
        let overwritten = self.shared.ring.lock().push_overwrite(frame);
        if overwritten.is_some() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        let _ = self.ready_tx.try_send(());
    }

    /// Mark the end of the stream
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let _ = self.ready_tx.try_send(());
    }

    /// End the stream because the device failed; the first reason is kept
    pub fn fail(&self, reason: impl Into<String>) {
        self.shared.failure.lock().get_or_insert_with(|| reason.into());
        self.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Consumer half, owned by the orchestrator
pub struct FrameReader {
    shared: Arc<Shared>,
    ready_rx: Receiver<()>,
}

impl FrameReader {
    /// Signal channel that fires whenever frames were pushed or the stream closed
    pub fn ready(&self) -> &Receiver<()> {
        &self.ready_rx
    }

    /// Take every buffered frame in arrival order
    pub fn drain(&self) -> Vec<AudioFrame> {
        let mut ring = self.shared.ring.lock();
        let mut frames = Vec::with_capacity(ring.occupied_len());
        while let Some(frame) = ring.try_pop() {
            frames.push(frame);
        }
        frames
    }

    /// Drop every buffered frame, returning how many were discarded
    pub fn discard(&self) -> usize {
        self.drain().len()
    }

    pub fn len(&self) -> usize {
        self.shared.ring.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the stream ended (explicitly or because every writer is gone)
    /// and all frames were consumed
    pub fn is_finished(&self) -> bool {
        let writers_gone = Arc::strong_count(&self.shared) == 1;
        (self.shared.closed.load(Ordering::SeqCst) || writers_gone) && self.is_empty()
    }

    /// Why the stream ended, when it ended through [`FrameWriter::fail`]
    pub fn failure(&self) -> Option<String> {
        self.shared.failure.lock().clone()
    }

    /// Frames lost to overflow since creation
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
