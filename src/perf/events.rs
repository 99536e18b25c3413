use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::monitor::{EventFd, RingbufferMonitor};
use super::ringbuf::{BufferConfig, RingBufferMmap};
use super::sys::*;
use crate::ipc::CaptureConfig;

/// One perf event selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSpec {
    pub event_type: u32,
    pub event_config: u64,
}

/// The session's event plan: the timeline event every core samples, any
/// additional counters routed into the same ring, and the optional AUX
/// trace event.
#[derive(Debug, Clone)]
pub struct EventConfig {
    pub sample_frequency: u64,
    pub include_kernel: bool,
    pub extra_counters: Vec<CounterSpec>,
    pub aux_event: Option<CounterSpec>,
    pub buffer: BufferConfig,
}

fn page_size() -> u64 {
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value <= 0 {
        4096
    } else {
        value as u64
    }
}

/// PMUs whose records go to the AUX ring, in preference order.
const AUX_TRACE_PMUS: &[&str] = &["arm_spe_0", "cs_etm"];

/// Find a hardware-trace PMU by its dynamic perf event type.
fn probe_aux_trace_pmu() -> Option<CounterSpec> {
    probe_aux_trace_pmu_in(Path::new("/sys/bus/event_source/devices"))
}

fn probe_aux_trace_pmu_in(devices: &Path) -> Option<CounterSpec> {
    for name in AUX_TRACE_PMUS {
        let Ok(contents) = std::fs::read_to_string(devices.join(name).join("type")) else {
            continue;
        };
        let Ok(event_type) = contents.trim().parse::<u32>() else {
            continue;
        };
        log::debug!("using {name} (type {event_type}) as the aux trace source");
        return Some(CounterSpec {
            event_type,
            event_config: 0,
        });
    }
    None
}

/// Pair the requested aux ring size with a trace PMU. Without a PMU to feed
/// it the ring is disabled outright, not left mapped and idle.
fn resolve_aux_trace(requested: u64, pmu: Option<CounterSpec>) -> (u64, Option<CounterSpec>) {
    if requested == 0 {
        return (0, None);
    }
    match pmu {
        Some(spec) => (requested, Some(spec)),
        None => {
            log::warn!("aux buffer requested but no hardware trace PMU is available, disabling");
            (0, None)
        }
    }
}

impl EventConfig {
    pub fn from_capture_config(config: &CaptureConfig) -> Self {
        let page = page_size();
        let data = if config.data_buffer_size > 0 {
            config.data_buffer_size
        } else {
            // A sensible default: 1 MiB worth of pages.
            (1 << 20).max(page)
        };
        let (aux_buffer_size, aux_event) =
            resolve_aux_trace(config.aux_buffer_size, probe_aux_trace_pmu());
        EventConfig {
            sample_frequency: if config.sample_frequency > 0 {
                config.sample_frequency
            } else {
                1000
            },
            include_kernel: true,
            extra_counters: Vec::new(),
            aux_event,
            buffer: BufferConfig {
                page_size: page,
                data_buffer_size: data,
                aux_buffer_size,
            },
        }
    }

    /// The attr for the per-core timeline event.
    fn timeline_attr(&self, enable_on_exec: bool) -> PerfEventAttr {
        let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
        attr.size = mem::size_of::<PerfEventAttr>() as u32;
        attr.kind = PERF_TYPE_SOFTWARE;
        attr.config = PERF_COUNT_SW_CPU_CLOCK;
        attr.sample_period_or_freq = self.sample_frequency;
        attr.sample_type = PERF_SAMPLE_IP
            | PERF_SAMPLE_TID
            | PERF_SAMPLE_TIME
            | PERF_SAMPLE_CPU
            | PERF_SAMPLE_PERIOD
            | PERF_SAMPLE_IDENTIFIER;
        attr.clock_id = libc::CLOCK_MONOTONIC_RAW;
        attr.flags = PERF_ATTR_FLAG_DISABLED
            | PERF_ATTR_FLAG_MMAP
            | PERF_ATTR_FLAG_MMAP2
            | PERF_ATTR_FLAG_MMAP_DATA
            | PERF_ATTR_FLAG_COMM
            | PERF_ATTR_FLAG_COMM_EXEC
            | PERF_ATTR_FLAG_TASK
            | PERF_ATTR_FLAG_FREQ
            | PERF_ATTR_FLAG_SAMPLE_ID_ALL
            | PERF_ATTR_FLAG_USE_CLOCKID
            | PERF_ATTR_FLAG_CONTEXT_SWITCH;
        if !self.include_kernel {
            attr.flags |= PERF_ATTR_FLAG_EXCLUDE_KERNEL;
        }
        if enable_on_exec {
            attr.flags |= PERF_ATTR_FLAG_ENABLE_ON_EXEC;
        }
        attr
    }

    /// The attr for a supplementary counter or the AUX event.
    fn counter_attr(&self, spec: CounterSpec) -> PerfEventAttr {
        let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
        attr.size = mem::size_of::<PerfEventAttr>() as u32;
        attr.kind = spec.event_type;
        attr.config = spec.event_config;
        attr.sample_period_or_freq = self.sample_frequency;
        attr.sample_type = PERF_SAMPLE_TIME
            | PERF_SAMPLE_CPU
            | PERF_SAMPLE_PERIOD
            | PERF_SAMPLE_IDENTIFIER;
        attr.clock_id = libc::CLOCK_MONOTONIC_RAW;
        attr.flags = PERF_ATTR_FLAG_DISABLED
            | PERF_ATTR_FLAG_FREQ
            | PERF_ATTR_FLAG_SAMPLE_ID_ALL
            | PERF_ATTR_FLAG_USE_CLOCKID;
        if !self.include_kernel {
            attr.flags |= PERF_ATTR_FLAG_EXCLUDE_KERNEL;
        }
        attr
    }
}

fn open_event(attr: &PerfEventAttr, pid: i32, cpu: i32, group_fd: i32) -> io::Result<OwnedFd> {
    let fd = sys_perf_event_open(attr, pid, cpu, group_fd, PERF_FLAG_FD_CLOEXEC);
    if fd < 0 {
        return Err(io::Error::from_raw_os_error(-fd));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn event_id(fd: RawFd) -> io::Result<u64> {
    let mut id: u64 = 0;
    if unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ID as _, &mut id) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(id)
}

struct BoundCore {
    /// The fd whose mmap carries this core's ring.
    ring_fd: RawFd,
    /// Every fd opened for this core, for enable/disable ioctls.
    all_fds: Vec<RawFd>,
    /// `(key, kernel event id)` for the keys frame.
    key_mappings: Vec<(u32, u64)>,
}

/// Opens and closes the per-core perf events as cores come and go, wiring
/// their fds and ring mmaps into the ring-buffer monitor.
pub struct CoreBinder {
    config: EventConfig,
    monitor: RingbufferMonitor,
    counters_enabled: AtomicBool,
    bound: Mutex<BTreeMap<i32, BoundCore>>,
    next_key: std::sync::atomic::AtomicU32,
}

impl CoreBinder {
    pub fn new(config: EventConfig, monitor: RingbufferMonitor) -> Self {
        CoreBinder {
            config,
            monitor,
            counters_enabled: AtomicBool::new(false),
            bound: Mutex::new(BTreeMap::new()),
            next_key: std::sync::atomic::AtomicU32::new(1),
        }
    }

    pub fn is_bound(&self, cpu: i32) -> bool {
        self.bound.lock().contains_key(&cpu)
    }

    fn next_key(&self) -> u32 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Open this core's events, map its ring and hand everything to the
    /// monitor. Online-path half of a hot-plug transition.
    pub async fn bind_core(&self, cpu: i32) -> io::Result<()> {
        if self.is_bound(cpu) {
            return Ok(());
        }

        let timeline_attr = self.config.timeline_attr(false);
        let timeline_fd = open_event(&timeline_attr, -1, cpu, -1)?;
        let ring_fd = timeline_fd.as_raw_fd();
        let mut mmap = RingBufferMmap::map(ring_fd, self.config.buffer)?;

        let mut all_fds = vec![ring_fd];
        let mut key_mappings = vec![(self.next_key(), event_id(ring_fd).unwrap_or(0))];
        let mut primary_fds = vec![EventFd {
            fd: timeline_fd,
            is_aux: false,
        }];

        for spec in &self.config.extra_counters {
            let attr = self.config.counter_attr(*spec);
            let fd = open_event(&attr, -1, cpu, -1)?;
            perf_event_ioc_set_output(fd.as_raw_fd(), ring_fd)?;
            all_fds.push(fd.as_raw_fd());
            key_mappings.push((self.next_key(), event_id(fd.as_raw_fd()).unwrap_or(0)));
            primary_fds.push(EventFd { fd, is_aux: false });
        }

        if let Some(aux_spec) = self.config.aux_event {
            let attr = self.config.counter_attr(aux_spec);
            let fd = open_event(&attr, -1, cpu, -1)?;
            mmap.attach_aux(fd.as_raw_fd())?;
            all_fds.push(fd.as_raw_fd());
            primary_fds.push(EventFd { fd, is_aux: true });
        }

        self.monitor
            .add_ringbuffer(cpu, primary_fds, Vec::new(), mmap)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        if self.counters_enabled.load(Ordering::Acquire) {
            for fd in &all_fds {
                perf_event_ioc_enable(*fd)?;
            }
        }

        self.bound.lock().insert(
            cpu,
            BoundCore {
                ring_fd,
                all_fds,
                key_mappings,
            },
        );
        Ok(())
    }

    /// Close this core's events and wait for its ring to drain out.
    /// Offline-path half of a hot-plug transition.
    pub async fn remove_core(&self, cpu: i32) {
        if self.bound.lock().remove(&cpu).is_none() {
            return;
        }
        self.monitor.close_cpu(cpu);
        self.monitor.await_mmap_removed(cpu).await;
    }

    /// Attach per-process events for an additional pid on every bound core,
    /// routed into each core's existing ring.
    pub async fn bind_process(&self, pid: i32) -> io::Result<()> {
        let targets: Vec<(i32, RawFd)> = self
            .bound
            .lock()
            .iter()
            .map(|(cpu, core)| (*cpu, core.ring_fd))
            .collect();

        for (cpu, ring_fd) in targets {
            let attr = self.config.timeline_attr(true);
            let fd = open_event(&attr, pid, cpu, -1)?;
            perf_event_ioc_set_output(fd.as_raw_fd(), ring_fd)?;
            if self.counters_enabled.load(Ordering::Acquire) {
                perf_event_ioc_enable(fd.as_raw_fd())?;
            }
            {
                let mut bound = self.bound.lock();
                if let Some(core) = bound.get_mut(&cpu) {
                    core.all_fds.push(fd.as_raw_fd());
                    core.key_mappings
                        .push((self.next_key(), event_id(fd.as_raw_fd()).unwrap_or(0)));
                }
            }
            self.monitor
                .add_event_fds(cpu, Vec::new(), vec![EventFd { fd, is_aux: false }]);
        }
        Ok(())
    }

    /// Switch the counters on: everything already bound is enabled now, and
    /// cores bound from here on start enabled.
    pub fn enable_counters(&self) {
        self.counters_enabled.store(true, Ordering::Release);
        let fds: Vec<RawFd> = self
            .bound
            .lock()
            .values()
            .flat_map(|core| core.all_fds.iter().copied())
            .collect();
        for fd in fds {
            if let Err(e) = perf_event_ioc_enable(fd) {
                log::debug!("enabling event fd {fd} failed: {e}");
            }
        }
    }

    /// The key-to-event-id table accumulated so far.
    pub fn key_mappings(&self) -> Vec<(u32, u64)> {
        self.bound
            .lock()
            .values()
            .flat_map(|core| core.key_mappings.iter().copied())
            .collect()
    }
}
