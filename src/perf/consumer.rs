use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::frame::{encode_aux_frames, DataFrameBuilder};
use super::ringbuf::RingBufferMmap;
use crate::ipc::{IpcSink, Message};
use crate::runtime::Notifier;

#[derive(Debug, thiserror::Error)]
pub enum AddRingbufferError {
    #[error("invalid ring buffer: {0}")]
    InvalidConfig(#[from] super::ringbuf::BufferConfigError),
    #[error("ring buffer has no data region")]
    NoDataRegion,
    #[error("cpu {0} already has a ring buffer")]
    Duplicate(i32),
}

struct ConsumerState {
    mmaps: BTreeMap<i32, Arc<RingBufferMmap>>,
    busy_cpus: BTreeSet<i32>,
    removed_cpus: BTreeSet<i32>,
}

struct Inner {
    sink: IpcSink,
    one_shot_limit: AtomicU64,
    cumulative_bytes_sent: AtomicU64,
    one_shot_notifier: Notifier,
    state: Mutex<ConsumerState>,
}

/// Drains the per-cpu perf ring buffers into `PERF_DATA` / `PERF_AUX` APC
/// frames on the IPC sink, and keeps the one-shot byte budget.
///
/// Fd monitoring and the periodic timer live elsewhere (the ring-buffer
/// monitor); this type only acts when a poll is requested.
#[derive(Clone)]
pub struct BufferConsumer {
    inner: Arc<Inner>,
}

impl BufferConsumer {
    pub fn new(sink: IpcSink, one_shot_limit: u64) -> Self {
        BufferConsumer {
            inner: Arc::new(Inner {
                sink,
                one_shot_limit: AtomicU64::new(one_shot_limit),
                cumulative_bytes_sent: AtomicU64::new(0),
                one_shot_notifier: Notifier::new("one-shot mode"),
                state: Mutex::new(ConsumerState {
                    mmaps: BTreeMap::new(),
                    busy_cpus: BTreeSet::new(),
                    removed_cpus: BTreeSet::new(),
                }),
            }),
        }
    }

    /// Register a cpu's ring buffer.
    pub async fn add_ringbuffer(
        &self,
        cpu: i32,
        mmap: RingBufferMmap,
    ) -> Result<(), AddRingbufferError> {
        log::debug!("adding ring buffer for cpu {cpu}");
        mmap.config().validate()?;
        if mmap.config().data_buffer_size == 0 {
            return Err(AddRingbufferError::NoDataRegion);
        }
        let mut state = self.inner.state.lock().await;
        if state.mmaps.contains_key(&cpu) {
            return Err(AddRingbufferError::Duplicate(cpu));
        }
        state.mmaps.insert(cpu, Arc::new(mmap));
        Ok(())
    }

    /// Drain the cpu's ring into the capture. Completes successfully without
    /// doing anything if the cpu has no ring buffer or is already being
    /// polled (concurrent polls coalesce).
    pub async fn poll(&self, cpu: i32) -> io::Result<()> {
        let mmap = {
            let mut state = self.inner.state.lock().await;
            let Some(mmap) = state.mmaps.get(&cpu).cloned() else {
                log::trace!("no ring buffer for cpu {cpu}");
                return Ok(());
            };
            if !state.busy_cpus.insert(cpu) {
                log::trace!("already polling cpu {cpu}");
                return Ok(());
            }
            mmap
        };

        let result = self.drain(cpu, &mmap).await;

        {
            let mut state = self.inner.state.lock().await;
            state.busy_cpus.remove(&cpu);
            if state.removed_cpus.remove(&cpu) {
                log::debug!("unmapped cpu {cpu}");
                state.mmaps.remove(&cpu);
            }
        }
        result
    }

    /// Poll every tracked cpu in ascending order. Busy cpus are skipped; the
    /// overall poll still completes successfully.
    pub async fn poll_all(&self) -> io::Result<()> {
        let cpus: Vec<i32> = {
            let state = self.inner.state.lock().await;
            state.mmaps.keys().copied().collect()
        };
        for cpu in cpus {
            self.poll(cpu).await?;
        }
        Ok(())
    }

    /// Drain the cpu one final time and unmap its ring.
    pub async fn remove_ringbuffer(&self, cpu: i32) -> io::Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            if !state.mmaps.contains_key(&cpu) {
                return Ok(());
            }
            state.removed_cpus.insert(cpu);
        }
        // If another poll is mid-flight the coalesced no-op returns and that
        // poll's cleanup performs the removal.
        self.poll(cpu).await
    }

    /// Whether the one-shot byte budget has been reached.
    pub fn is_one_shot_full(&self) -> bool {
        let limit = self.inner.one_shot_limit.load(Ordering::Acquire);
        limit > 0 && self.inner.cumulative_bytes_sent.load(Ordering::Acquire) >= limit
    }

    /// Force one-shot mode to read as full, resuming the waiter.
    pub fn trigger_one_shot_mode(&self) {
        self.inner.one_shot_limit.store(1, Ordering::Release);
        self.inner.cumulative_bytes_sent.store(1, Ordering::Release);
        self.inner.one_shot_notifier.notify();
    }

    /// Resolve once the one-shot byte budget is reached. Never resolves when
    /// one-shot mode is disabled. At most one waiter.
    pub async fn wait_one_shot_full(&self) {
        if self.is_one_shot_full() {
            return;
        }
        self.inner.one_shot_notifier.wait().await;
    }

    /// Test hook: the tracked mmap for a cpu, standing in for the kernel
    /// side.
    #[cfg(test)]
    pub(crate) async fn mmap_for_test(&self, cpu: i32) -> Arc<RingBufferMmap> {
        self.inner.state.lock().await.mmaps[&cpu].clone()
    }

    async fn send_frame(&self, frame: Vec<u8>) -> io::Result<()> {
        let frame_len = frame.len() as u64;
        self.inner.sink.send(Message::ApcFrameData { bytes: frame }).await?;

        let total = self
            .inner
            .cumulative_bytes_sent
            .fetch_add(frame_len, Ordering::AcqRel)
            + frame_len;
        let limit = self.inner.one_shot_limit.load(Ordering::Acquire);
        if limit > 0 && total >= limit {
            log::debug!("one shot limit reached ({total} >= {limit})");
            self.inner.one_shot_notifier.notify();
        }
        Ok(())
    }

    async fn drain(&self, cpu: i32, mmap: &RingBufferMmap) -> io::Result<()> {
        let snapshot = mmap.snapshot();

        // AUX bytes go out first so the consumer of the stream never sees a
        // record referencing aux data it does not have yet. Positions were
        // snapshotted data-before-aux for the same reason.
        if let Some(region) = mmap.aux_region() {
            if snapshot.aux.head > snapshot.aux.tail {
                let mut frames = Vec::new();
                encode_aux_frames(cpu, snapshot.aux.tail, snapshot.aux.head, region, |frame| {
                    frames.push(frame);
                    Ok(())
                })?;
                let mut send_result = Ok(());
                for frame in frames {
                    if let Err(e) = self.send_frame(frame).await {
                        send_result = Err(e);
                        break;
                    }
                }
                // The space goes back to the kernel either way; on a send
                // failure the bytes are dropped.
                mmap.store_aux_tail(snapshot.aux.head);
                send_result?;
            }
        }

        if snapshot.data.head > snapshot.data.tail {
            let result = self.drain_data(cpu, mmap, snapshot.data.tail, snapshot.data.head).await;
            mmap.store_data_tail(snapshot.data.head);
            result?;
        }

        Ok(())
    }

    async fn drain_data(
        &self,
        cpu: i32,
        mmap: &RingBufferMmap,
        tail: u64,
        head: u64,
    ) -> io::Result<()> {
        let region = mmap.data_region();
        let size = region.len() as u64;
        let mask = size - 1;

        // If the kernel lapped us the oldest bytes are gone; skip to the
        // start of what survives.
        let mut tail = if head - tail > size { head - size } else { tail };

        let mut frames: Vec<Vec<u8>> = Vec::new();
        let mut builder = DataFrameBuilder::new(cpu);
        {
            let mut emit = |frame: Vec<u8>| {
                frames.push(frame);
                Ok(())
            };
            while tail < head {
                let size_lo = region[((tail + 6) & mask) as usize];
                let size_hi = region[((tail + 7) & mask) as usize];
                let record_size = u16::from_le_bytes([size_lo, size_hi]) as u64;
                // Step in 8-byte units, as the kernel does.
                let record_size = (record_size + 7) & !7;
                if record_size == 0 || record_size > size {
                    log::warn!(
                        "cpu {cpu}: corrupt record size {record_size} at {tail}, dropping rest"
                    );
                    break;
                }

                let base_masked = (tail & mask) as usize;
                let first = record_size.min(size - base_masked as u64) as usize;
                let second = record_size as usize - first;
                builder.push_record(
                    &region[base_masked..base_masked + first],
                    &region[..second],
                    &mut emit,
                )?;

                tail += record_size;
            }
            builder.flush(&mut emit)?;
        }

        for frame in frames {
            self.send_frame(frame).await?;
        }
        Ok(())
    }
}
