use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;

use super::consumer::{AddRingbufferError, BufferConsumer};
use super::ringbuf::RingBufferMmap;
use super::sys::perf_event_ioc_enable;
use crate::runtime::{spawn_logged, Notifier};

const LIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOCAL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One perf event fd to watch: the descriptor plus whether it is an AUX fd
/// (AUX fds get re-enabled after a drain, the kernel disables them when
/// their buffer fills).
pub struct EventFd {
    pub fd: OwnedFd,
    pub is_aux: bool,
}

struct MonState {
    // The pending-cpu list is split into a read and a write half that swap,
    // so the drain loop is never starved of its removal phase by fds
    // re-queueing themselves.
    pending_read: VecDeque<i32>,
    pending_write: VecDeque<i32>,
    aux_reenable_read: BTreeMap<i32, BTreeSet<RawFd>>,
    aux_reenable_write: BTreeMap<i32, BTreeSet<RawFd>>,
    removed_cpus: VecDeque<i32>,
    cpu_fd_counter: BTreeMap<i32, usize>,
    cpu_tokens: BTreeMap<i32, CancellationToken>,
    mmap_removed: BTreeMap<i32, Arc<Notifier>>,
    primary_streams: usize,
    supplementary_streams: usize,
    busy_polling: bool,
    poll_all: bool,
    any_added: bool,
    terminate_complete: bool,
}

struct Inner {
    consumer: BufferConsumer,
    live_mode: bool,
    cancel: CancellationToken,
    terminated_notifier: Notifier,
    state: Mutex<MonState>,
}

/// Watches the per-cpu perf event fds and a periodic timer; whenever an fd
/// becomes readable or the timer fires, the affected ring buffers are
/// drained through the buffer consumer. Also owns clean termination: once
/// every observed stream has closed and the removal queue has drained, the
/// termination waiter is resumed.
#[derive(Clone)]
pub struct RingbufferMonitor {
    inner: Arc<Inner>,
}

impl RingbufferMonitor {
    pub fn new(consumer: BufferConsumer, live_mode: bool) -> Self {
        RingbufferMonitor {
            inner: Arc::new(Inner {
                consumer,
                live_mode,
                cancel: CancellationToken::new(),
                terminated_notifier: Notifier::new("ring buffer termination"),
                state: Mutex::new(MonState {
                    pending_read: VecDeque::new(),
                    pending_write: VecDeque::new(),
                    aux_reenable_read: BTreeMap::new(),
                    aux_reenable_write: BTreeMap::new(),
                    removed_cpus: VecDeque::new(),
                    cpu_fd_counter: BTreeMap::new(),
                    cpu_tokens: BTreeMap::new(),
                    mmap_removed: BTreeMap::new(),
                    primary_streams: 0,
                    supplementary_streams: 0,
                    busy_polling: false,
                    poll_all: false,
                    any_added: false,
                    terminate_complete: false,
                }),
            }),
        }
    }

    pub fn consumer(&self) -> &BufferConsumer {
        &self.inner.consumer
    }

    pub fn is_terminate_requested(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Register a cpu's ring buffer and begin observing its event fds.
    pub async fn add_ringbuffer(
        &self,
        cpu: i32,
        primary_fds: Vec<EventFd>,
        supplementary_fds: Vec<EventFd>,
        mmap: RingBufferMmap,
    ) -> Result<(), AddRingbufferError> {
        log::trace!(
            "add_ringbuffer(cpu={cpu}, primary={}, supplementary={})",
            primary_fds.len(),
            supplementary_fds.len()
        );
        assert!(
            !self.inner.state.lock().cpu_fd_counter.contains_key(&cpu),
            "a ring buffer is already tracked for cpu {cpu}"
        );
        self.inner.consumer.add_ringbuffer(cpu, mmap).await?;
        self.add_event_fds(cpu, primary_fds, supplementary_fds);
        Ok(())
    }

    /// Observe additional event fds (events bound after capture start).
    pub fn add_event_fds(
        &self,
        cpu: i32,
        primary_fds: Vec<EventFd>,
        supplementary_fds: Vec<EventFd>,
    ) {
        for event_fd in primary_fds {
            self.spawn_observer(cpu, event_fd, true);
        }
        for event_fd in supplementary_fds {
            self.spawn_observer(cpu, event_fd, false);
        }
    }

    /// Start the periodic drain tick.
    pub fn start_timer(&self) {
        let inner = self.inner.clone();
        spawn_logged("perf buffer timer", async move {
            let interval = if inner.live_mode {
                LIVE_POLL_INTERVAL
            } else {
                LOCAL_POLL_INTERVAL
            };
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let should_poll = {
                            let mut state = inner.state.lock();
                            state.poll_all = true;
                            !state.busy_polling
                        };
                        if should_poll {
                            Inner::try_poll(&inner).await;
                        }
                    }
                    _ = inner.cancel.cancelled() => {
                        // One final flush of whatever remains.
                        let should_poll = {
                            let mut state = inner.state.lock();
                            state.poll_all = true;
                            !state.busy_polling
                        };
                        if should_poll {
                            Inner::try_poll(&inner).await;
                        }
                        return Ok::<(), io::Error>(());
                    }
                }
            }
        });
    }

    /// Stop observing: closes every stream, drains what is left, and lets
    /// `wait_terminated` resolve once the removal queue is empty.
    pub fn terminate(&self) {
        log::trace!("terminating ring buffer monitor");
        self.inner.cancel.cancel();

        let inner = self.inner.clone();
        spawn_logged("stop perf event monitor", async move {
            let no_streams = {
                let state = inner.state.lock();
                state.primary_streams == 0 && state.supplementary_streams == 0
            };
            if no_streams {
                // No observer will run the final drain, so do it here.
                Inner::try_poll(&inner).await;
            }
            Ok::<(), io::Error>(())
        });
    }

    /// Close every stream of one cpu; its ring is drained and removed once
    /// the observers have unregistered.
    pub fn close_cpu(&self, cpu: i32) {
        let token = self.inner.state.lock().cpu_tokens.get(&cpu).cloned();
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Resolve once the given cpu's ring has been drained and unregistered.
    pub async fn await_mmap_removed(&self, cpu: i32) {
        let notifier = {
            let mut state = self.inner.state.lock();
            if !state.cpu_fd_counter.contains_key(&cpu) {
                log::trace!("mmap {cpu} is already removed");
                return;
            }
            state
                .mmap_removed
                .entry(cpu)
                .or_insert_with(|| Arc::new(Notifier::new("mmap removal")))
                .clone()
        };
        notifier.wait().await;
    }

    /// Resolve once `terminate` has been called and every stream and queued
    /// removal has been processed.
    pub async fn wait_terminated(&self) {
        if self.inner.state.lock().terminate_complete {
            return;
        }
        self.inner.terminated_notifier.wait().await;
    }

    pub async fn wait_one_shot_full(&self) {
        self.inner.consumer.wait_one_shot_full().await;
    }

    fn spawn_observer(&self, cpu: i32, event_fd: EventFd, primary: bool) {
        let inner = self.inner.clone();
        let EventFd { fd, is_aux } = event_fd;

        let registered = {
            let mut state = self.inner.state.lock();
            if self.inner.cancel.is_cancelled() {
                false
            } else {
                if primary {
                    state.primary_streams += 1;
                    *state.cpu_fd_counter.entry(cpu).or_insert(0) += 1;
                    state.any_added = true;
                } else {
                    state.supplementary_streams += 1;
                }
                true
            }
        };
        if !registered {
            return;
        }
        let cpu_token = {
            let mut state = self.inner.state.lock();
            state
                .cpu_tokens
                .entry(cpu)
                .or_insert_with(CancellationToken::new)
                .clone()
        };

        spawn_logged("perf buffer monitor for event fd", async move {
            let raw_fd = fd.as_raw_fd();
            log::trace!("observing new fd {raw_fd} for cpu {cpu} (primary={primary})");
            let result = Inner::observe_fd(&inner, cpu, fd, is_aux, &cpu_token).await;
            Inner::deregister_fd(&inner, cpu, raw_fd, primary, is_aux).await;
            result
        });
    }
}

fn poll_revents(fd: RawFd) -> i16 {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ok = unsafe { libc::poll(&mut pollfd, 1, 0) };
    if ok < 0 {
        return libc::POLLERR;
    }
    pollfd.revents
}

impl Inner {
    async fn observe_fd(
        inner: &Arc<Inner>,
        cpu: i32,
        fd: OwnedFd,
        is_aux: bool,
        cpu_token: &CancellationToken,
    ) -> io::Result<()> {
        let async_fd = AsyncFd::new(fd)?;
        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => return Ok(()),
                _ = cpu_token.cancelled() => return Ok(()),
                guard = async_fd.readable() => {
                    let mut guard = guard?;
                    let raw_fd = async_fd.get_ref().as_raw_fd();
                    let revents = poll_revents(raw_fd);
                    log::trace!(
                        "fd notification for cpu={cpu}, fd={raw_fd}, revents={revents:#x}"
                    );

                    let should_poll = {
                        let mut state = inner.state.lock();
                        if !state.pending_write.contains(&cpu) {
                            state.pending_write.push_back(cpu);
                        }
                        if is_aux {
                            state
                                .aux_reenable_write
                                .entry(cpu)
                                .or_default()
                                .insert(raw_fd);
                        }
                        !state.busy_polling
                    };
                    if should_poll {
                        Self::try_poll(inner).await;
                    }

                    if revents & (libc::POLLHUP | libc::POLLERR) != 0 {
                        // The kernel closed its end; the process behind the
                        // event is gone.
                        return Ok(());
                    }
                    guard.clear_ready();
                }
            }
        }
    }

    async fn deregister_fd(inner: &Arc<Inner>, cpu: i32, raw_fd: RawFd, primary: bool, is_aux: bool) {
        log::trace!("removing fd {raw_fd} for cpu {cpu}");
        let should_poll = {
            let mut state = inner.state.lock();
            if primary {
                state.primary_streams -= 1;
                let counter = state.cpu_fd_counter.entry(cpu).or_insert(1);
                *counter -= 1;
                if *counter == 0 {
                    state.removed_cpus.push_back(cpu);
                }
            } else {
                state.supplementary_streams -= 1;
            }
            if is_aux {
                if let Some(set) = state.aux_reenable_read.get_mut(&cpu) {
                    set.remove(&raw_fd);
                }
                if let Some(set) = state.aux_reenable_write.get_mut(&cpu) {
                    set.remove(&raw_fd);
                }
            }
            !state.busy_polling
        };
        if should_poll {
            Self::try_poll(inner).await;
        }
    }

    /// The drain loop. Swaps the pending queues, polls, re-enables AUX fds,
    /// processes removals, then repeats until nothing new arrived.
    async fn try_poll(inner: &Arc<Inner>) {
        {
            let mut state = inner.state.lock();
            if state.busy_polling {
                return;
            }
            state.busy_polling = true;
        }

        loop {
            let (cpus, poll_all, aux_fds) = {
                let mut state = inner.state.lock();
                let state = &mut *state;
                std::mem::swap(&mut state.pending_read, &mut state.pending_write);
                std::mem::swap(&mut state.aux_reenable_read, &mut state.aux_reenable_write);
                let poll_all = std::mem::take(&mut state.poll_all);
                let mut cpus: VecDeque<i32> = std::mem::take(&mut state.pending_read);
                if poll_all {
                    cpus.clear();
                }
                let aux_fds = std::mem::take(&mut state.aux_reenable_read);
                (cpus, poll_all, aux_fds)
            };

            if poll_all {
                if let Err(e) = inner.consumer.poll_all().await {
                    log::debug!("poll all failed: {e}");
                }
            } else {
                for cpu in &cpus {
                    if let Err(e) = inner.consumer.poll(*cpu).await {
                        log::debug!("poll of cpu {cpu} failed: {e}");
                    }
                }
            }

            // The kernel disables an AUX fd when its buffer fills; now that
            // there is space again, switch it back on.
            for (_cpu, fds) in aux_fds {
                for fd in fds {
                    if let Err(e) = perf_event_ioc_enable(fd) {
                        log::debug!("re-enabling aux fd {fd} failed: {e}");
                    }
                }
            }

            Self::process_removals(inner).await;

            let done = {
                let mut state = inner.state.lock();
                if state.pending_write.is_empty()
                    && state.removed_cpus.is_empty()
                    && !state.poll_all
                {
                    state.busy_polling = false;
                    true
                } else {
                    false
                }
            };
            if done {
                log::trace!("drain loop complete");
                return;
            }
        }
    }

    async fn process_removals(inner: &Arc<Inner>) {
        loop {
            let cpu = {
                let mut state = inner.state.lock();
                state.removed_cpus.pop_front()
            };
            let Some(cpu) = cpu else { break };

            log::trace!("removing ring buffer for cpu {cpu}");
            if let Err(e) = inner.consumer.remove_ringbuffer(cpu).await {
                log::debug!("final drain of cpu {cpu} failed: {e}");
            }
            let notifier = {
                let mut state = inner.state.lock();
                state.cpu_fd_counter.remove(&cpu);
                state.cpu_tokens.remove(&cpu);
                state.mmap_removed.remove(&cpu)
            };
            if let Some(notifier) = notifier {
                log::trace!("notifying that mmap {cpu} is removed");
                notifier.notify();
            }
        }

        // Completion states: fully terminated, or "every traced process
        // exited" which flips one-shot mode.
        let (complete, all_exited) = {
            let mut state = inner.state.lock();
            let streams_gone = state.primary_streams == 0 && state.removed_cpus.is_empty();
            if inner.cancel.is_cancelled() {
                let complete = streams_gone
                    && state.supplementary_streams == 0
                    && !state.terminate_complete;
                if complete {
                    state.terminate_complete = true;
                }
                (complete, false)
            } else {
                (false, state.any_added && streams_gone)
            }
        };
        if complete {
            log::trace!("ring buffer monitor fully terminated");
            inner.terminated_notifier.notify();
        } else if all_exited {
            log::trace!("all primary streams closed, triggering one-shot mode");
            inner.consumer.trigger_one_shot_mode();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::frame::frame_type;
    use super::super::ringbuf::BufferConfig;
    use super::*;
    use crate::ipc::{sink_from_fd, source_from_fd, IpcSource, Message};
    use crate::proc::pipe_pair;

    const PAGE: u64 = 4096;

    struct Harness {
        monitor: RingbufferMonitor,
        source: IpcSource<tokio::net::unix::pipe::Receiver>,
    }

    fn harness(live_mode: bool) -> Harness {
        let (read_fd, write_fd) = pipe_pair().unwrap();
        let consumer = BufferConsumer::new(sink_from_fd(write_fd).unwrap(), 0);
        Harness {
            monitor: RingbufferMonitor::new(consumer, live_mode),
            source: source_from_fd(read_fd).unwrap(),
        }
    }

    fn test_mmap() -> RingBufferMmap {
        RingBufferMmap::anonymous(BufferConfig {
            page_size: PAGE,
            data_buffer_size: PAGE,
            aux_buffer_size: 0,
        })
    }

    fn produce_record(mmap: &RingBufferMmap, payload_len: usize) {
        let size = 8 + payload_len;
        assert_eq!(size % 8, 0);
        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(&9u32.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&(size as u16).to_le_bytes());
        bytes.resize(size, 0x42);
        mmap.produce_data(&bytes);
    }

    async fn next_frame(harness: &mut Harness) -> Vec<u8> {
        match tokio::time::timeout(Duration::from_secs(10), harness.source.recv())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .unwrap()
        {
            Message::ApcFrameData { bytes } => bytes,
            other => panic!("unexpected message {}", other.name()),
        }
    }

    #[tokio::test]
    async fn fd_readiness_triggers_a_drain() {
        let mut harness = harness(true);
        let mmap = test_mmap();
        produce_record(&mmap, 24);

        let (event_read, event_write) = pipe_pair().unwrap();
        harness
            .monitor
            .add_ringbuffer(
                0,
                vec![EventFd {
                    fd: event_read,
                    is_aux: false,
                }],
                vec![],
                mmap,
            )
            .await
            .unwrap();

        // Simulate the kernel waking the event fd.
        nix::unistd::write(&event_write, &[1]).unwrap();

        let frame = next_frame(&mut harness).await;
        assert_eq!(
            u32::from_le_bytes(frame[..4].try_into().unwrap()),
            frame_type::PERF_DATA
        );
    }

    #[tokio::test]
    async fn timer_polls_even_without_fd_activity() {
        let mut harness = harness(true);
        let mmap = test_mmap();

        let (event_read, _event_write) = pipe_pair().unwrap();
        harness
            .monitor
            .add_ringbuffer(
                1,
                vec![EventFd {
                    fd: event_read,
                    is_aux: false,
                }],
                vec![],
                mmap,
            )
            .await
            .unwrap();
        harness.monitor.start_timer();

        {
            let mmap = harness.monitor.inner.consumer.mmap_for_test(1).await;
            produce_record(&mmap, 24);
        }

        let frame = next_frame(&mut harness).await;
        assert_eq!(
            u32::from_le_bytes(frame[..4].try_into().unwrap()),
            frame_type::PERF_DATA
        );
    }

    #[tokio::test]
    async fn closing_the_last_primary_fd_removes_the_cpu_and_triggers_one_shot() {
        let mut harness = harness(true);
        let mmap = test_mmap();
        produce_record(&mmap, 16);

        let (event_read, event_write) = pipe_pair().unwrap();
        harness
            .monitor
            .add_ringbuffer(
                2,
                vec![EventFd {
                    fd: event_read,
                    is_aux: false,
                }],
                vec![],
                mmap,
            )
            .await
            .unwrap();

        // Process exit: the kernel hangs up the event fd.
        drop(event_write);

        // The final drain must still deliver the pending record.
        let frame = next_frame(&mut harness).await;
        assert_eq!(
            u32::from_le_bytes(frame[..4].try_into().unwrap()),
            frame_type::PERF_DATA
        );

        tokio::time::timeout(Duration::from_secs(10), harness.monitor.await_mmap_removed(2))
            .await
            .unwrap();
        // All primary streams closed without terminate(): the traced app
        // exited, so one-shot mode fires.
        tokio::time::timeout(Duration::from_secs(10), harness.monitor.wait_one_shot_full())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminate_completes_cleanly() {
        let harness = harness(false);
        let mmap = test_mmap();
        let (event_read, event_write) = pipe_pair().unwrap();
        harness
            .monitor
            .add_ringbuffer(
                3,
                vec![EventFd {
                    fd: event_read,
                    is_aux: false,
                }],
                vec![],
                mmap,
            )
            .await
            .unwrap();
        harness.monitor.start_timer();

        harness.monitor.terminate();
        assert!(harness.monitor.is_terminate_requested());
        tokio::time::timeout(Duration::from_secs(10), harness.monitor.wait_terminated())
            .await
            .unwrap();
        drop(event_write);
    }

    #[tokio::test]
    async fn terminate_with_no_streams_completes_immediately() {
        let harness = harness(false);
        harness.monitor.terminate();
        tokio::time::timeout(Duration::from_secs(10), harness.monitor.wait_terminated())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn close_cpu_drains_and_removes() {
        let mut harness = harness(true);
        let mmap = test_mmap();
        produce_record(&mmap, 32);
        let (event_read, _event_write) = pipe_pair().unwrap();
        harness
            .monitor
            .add_ringbuffer(
                4,
                vec![EventFd {
                    fd: event_read,
                    is_aux: false,
                }],
                vec![],
                mmap,
            )
            .await
            .unwrap();

        harness.monitor.close_cpu(4);
        let frame = next_frame(&mut harness).await;
        assert_eq!(
            u32::from_le_bytes(frame[..4].try_into().unwrap()),
            frame_type::PERF_DATA
        );
        tokio::time::timeout(Duration::from_secs(10), harness.monitor.await_mmap_removed(4))
            .await
            .unwrap();
    }
}
