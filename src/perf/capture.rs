use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::consumer::BufferConsumer;
use super::events::{CoreBinder, EventConfig};
use super::frame;
use super::monitor::RingbufferMonitor;
use crate::cpu::{
    find_all_cpu_paths, CoalescingCpuMonitor, PollingCpuMonitor, RawCpuMonitor, UeventCpuMonitor,
};
use crate::ipc::{CaptureConfig, CaptureFailedReason, IpcSink, Message};
use crate::proc::{LaunchOptions, RunningProcess, SuspendedProcess};
use crate::runtime::{consume_all_bytes, spawn_logged, ChunkReader, Notifier};

/// How often /proc is rescanned while waiting for the target process.
const WAIT_PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Grace period for in-flight buffer drains on a deferred terminate.
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

fn monotonic_ns(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(clock, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

fn uname_string() -> String {
    let mut info: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut info) } != 0 {
        return String::new();
    }
    let field = |bytes: &[libc::c_char]| {
        let bytes: Vec<u8> = bytes
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    };
    format!(
        "{} {} {} {}",
        field(&info.sysname),
        field(&info.release),
        field(&info.version),
        field(&info.machine)
    )
}

/// The midr_el1 identification register, where exposed.
fn read_cpuid(cpu: i32) -> Option<u32> {
    let path = format!("/sys/devices/system/cpu/cpu{cpu}/regs/identification/midr_el1");
    let contents = std::fs::read_to_string(path).ok()?;
    let trimmed = contents.trim().trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).ok().map(|v| v as u32)
}

/// Current frequency in Hz, from cpufreq (reported in kHz).
fn read_cpu_frequency(cpu: i32) -> Option<u64> {
    let path = format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq/cpuinfo_cur_freq");
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse::<u64>().ok().map(|khz| khz * 1000)
}

/// Scan /proc for processes whose command name or executable matches
/// `target` (by full path or by basename).
pub fn find_matching_pids(target: &str) -> Vec<i32> {
    find_matching_pids_in(Path::new("/proc"), target)
}

fn find_matching_pids_in(proc_root: &Path, target: &str) -> Vec<i32> {
    let target_name = Path::new(target)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| target.to_owned());
    let mut pids = Vec::new();

    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return pids;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<i32>() else {
            continue;
        };

        let matches_cmdline = std::fs::read(entry.path().join("cmdline"))
            .ok()
            .and_then(|cmdline| {
                let first = cmdline.split(|&b| b == 0).next()?;
                let first = String::from_utf8_lossy(first).into_owned();
                let basename = Path::new(&first)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())?;
                Some(first == target || basename == target_name)
            })
            .unwrap_or(false);

        let matches_exe = std::fs::read_link(entry.path().join("exe"))
            .ok()
            .map(|exe| {
                exe.as_os_str().to_string_lossy() == target
                    || exe
                        .file_name()
                        .map(|n| n.to_string_lossy() == target_name)
                        .unwrap_or(false)
            })
            .unwrap_or(false);

        if matches_cmdline || matches_exe {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    pids
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture terminated before all cores were ready")]
    CoresNotReady,
    #[error("capture terminated while waiting for start")]
    StartAborted,
    #[error(transparent)]
    Io(#[from] io::Error),
}

struct Inner {
    sink: IpcSink,
    config: CaptureConfig,
    monitor: RingbufferMonitor,
    binder: CoreBinder,
    coalescing: CoalescingCpuMonitor,
    raw_monitor: Mutex<Option<Arc<RawCpuMonitor>>>,
    monotonic_start: u64,
    cpu_count: usize,
    cores_seen: Mutex<BTreeSet<i32>>,
    cores_ready: Notifier,
    start_requested: Notifier,
    terminate: CancellationToken,
    terminate_deferred: AtomicBool,
    command: Mutex<Option<SuspendedProcess>>,
}

/// Sequences one capture inside the perf agent: summary and core frames,
/// CPU monitoring, per-core event binding, target process preparation, the
/// ready/start handshake with the shell, and teardown.
#[derive(Clone)]
pub struct CaptureOrchestrator {
    inner: Arc<Inner>,
}

impl CaptureOrchestrator {
    pub fn new(sink: IpcSink, config: CaptureConfig) -> Self {
        let consumer = BufferConsumer::new(sink.clone(), config.one_shot_limit);
        let monitor = RingbufferMonitor::new(consumer, config.live_mode);
        let event_config = EventConfig::from_capture_config(&config);
        let binder = CoreBinder::new(event_config, monitor.clone());
        let cpu_count = num_cpus::get();

        CaptureOrchestrator {
            inner: Arc::new(Inner {
                sink,
                config,
                monitor,
                binder,
                coalescing: CoalescingCpuMonitor::new(),
                raw_monitor: Mutex::new(None),
                monotonic_start: monotonic_ns(libc::CLOCK_MONOTONIC_RAW),
                cpu_count,
                cores_seen: Mutex::new(BTreeSet::new()),
                cores_ready: Notifier::new("all-cores-ready"),
                start_requested: Notifier::new("capture start"),
                terminate: CancellationToken::new(),
                terminate_deferred: AtomicBool::new(false),
                command: Mutex::new(None),
            }),
        }
    }

    /// The shell asked for the capture to begin.
    pub fn notify_start(&self) {
        self.inner.start_requested.notify();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminate.is_cancelled()
    }

    /// Tear the capture down. With `defer` a one-second grace period lets
    /// in-flight buffer drains finish first.
    pub fn terminate(&self, defer: bool) {
        if self.is_terminated() {
            return;
        }
        let inner = self.inner.clone();
        if defer && !inner.terminate_deferred.swap(true, Ordering::SeqCst) {
            spawn_logged("deferred capture terminate", async move {
                tokio::time::sleep(TERMINATE_GRACE).await;
                Inner::do_terminate(&inner);
                Ok::<(), io::Error>(())
            });
        } else {
            Inner::do_terminate(&inner);
        }
    }

    /// Run the capture from first frame to teardown. Resolves with the
    /// traced command's exit code (0 when there is none).
    pub async fn run(&self) -> Result<i32, CaptureError> {
        let inner = &self.inner;

        self.send_summary_frames().await?;
        self.send_initial_counter_values().await?;
        self.start_monitoring();

        if !self.wait_for_all_cores_ready().await {
            self.send_capture_failed(CaptureFailedReason::WaitForCoresReadyFailed)
                .await;
            self.terminate(false);
            self.finish(None).await;
            return Err(CaptureError::CoresNotReady);
        }

        self.send_kallsyms().await?;

        let pids = self.prepare_process().await?;
        self.send_process_properties(&pids).await;

        let keys = inner.binder.key_mappings();
        self.send_frame(frame::keys_frame(&keys)).await?;
        inner
            .sink
            .send(Message::CaptureReady { pids: pids.clone() })
            .await?;

        // The host decides when to go.
        tokio::select! {
            _ = inner.start_requested.wait() => {}
            _ = inner.terminate.cancelled() => {
                self.finish(None).await;
                return Err(CaptureError::StartAborted);
            }
        }

        inner.sink.send(Message::CaptureStarted).await?;
        inner.binder.enable_counters();
        inner.monitor.start_timer();

        for pid in &pids {
            if let Err(e) = inner.binder.bind_process(*pid).await {
                log::warn!("failed to attach events to pid {pid}: {e}");
            }
        }

        // Finally release the forked command, if any.
        let command = inner.command.lock().take();
        let running = match command {
            Some(command) => match command.resume_and_exec() {
                Ok(running) => Some(running),
                Err(e) => {
                    log::error!("target command failed to exec: {e}");
                    self.send_capture_failed(CaptureFailedReason::CommandExecFailed)
                        .await;
                    self.terminate(false);
                    None
                }
            },
            None => None,
        };

        // One-shot full ends the capture.
        {
            let this = self.clone();
            spawn_logged("one-shot observer", async move {
                tokio::select! {
                    _ = this.inner.monitor.wait_one_shot_full() => {
                        log::debug!("one-shot budget reached, stopping capture");
                        this.terminate(true);
                    }
                    _ = this.inner.terminate.cancelled() => {}
                }
                Ok::<(), io::Error>(())
            });
        }

        inner.terminate.cancelled().await;
        Ok(self.finish(running).await)
    }

    async fn send_frame(&self, frame: Vec<u8>) -> io::Result<()> {
        self.inner
            .sink
            .send(Message::ApcFrameData { bytes: frame })
            .await
    }

    async fn send_capture_failed(&self, reason: CaptureFailedReason) {
        if let Err(e) = self
            .inner
            .sink
            .send(Message::CaptureFailed { reason })
            .await
        {
            log::debug!("failed to report capture failure: {e}");
        }
    }

    fn monotonic_delta(&self) -> u64 {
        monotonic_ns(libc::CLOCK_MONOTONIC_RAW).saturating_sub(self.inner.monotonic_start)
    }

    async fn send_summary_frames(&self) -> io::Result<()> {
        let page_size = self.inner.binder_page_size();
        self.send_frame(frame::summary_frame(
            self.inner.monotonic_start,
            monotonic_ns(libc::CLOCK_MONOTONIC),
            page_size,
            &uname_string(),
        ))
        .await?;

        for cpu in 0..self.inner.cpu_count as i32 {
            self.send_core_name(cpu).await?;
        }
        Ok(())
    }

    async fn send_core_name(&self, cpu: i32) -> io::Result<()> {
        let cpuid = read_cpuid(cpu).unwrap_or(0);
        let name = if cpuid != 0 {
            format!("Cluster 0x{:03x}", (cpuid >> 4) & 0xfff)
        } else {
            "Unknown".to_owned()
        };
        self.send_frame(frame::core_name_frame(cpu, cpuid, &name))
            .await
    }

    async fn send_initial_counter_values(&self) -> io::Result<()> {
        for cpu in 0..self.inner.cpu_count as i32 {
            self.send_initial_counter_value(cpu).await?;
        }
        Ok(())
    }

    /// Probe and emit the cpu frequency sample; key 0 is the frequency
    /// pseudo-counter.
    async fn send_initial_counter_value(&self, cpu: i32) -> io::Result<()> {
        if let Some(frequency) = read_cpu_frequency(cpu) {
            self.send_frame(frame::counter_frame(
                self.monotonic_delta(),
                cpu,
                0,
                frequency,
            ))
            .await?;
        }
        Ok(())
    }

    /// Stream /proc/kallsyms onto the capture so the host can symbolize
    /// kernel addresses. Absent or unreadable (kptr_restrict) is not fatal.
    async fn send_kallsyms(&self) -> io::Result<()> {
        let file = match tokio::fs::File::open("/proc/kallsyms").await {
            Ok(file) => file,
            Err(e) => {
                log::debug!("/proc/kallsyms unavailable: {e}");
                return Ok(());
            }
        };
        let mut reader = ChunkReader::new(file);
        let mut offset = 0u64;
        loop {
            let chunk = reader.read_some().await?;
            if chunk.is_empty() {
                return Ok(());
            }
            let frame = frame::kallsyms_frame(offset, chunk);
            offset += chunk.len() as u64;
            self.inner
                .sink
                .send(Message::ApcFrameData { bytes: frame })
                .await?;
        }
    }

    /// Emit the comm/cmdline/maps snapshot for every traced pid. Processes
    /// that disappear mid-read are skipped.
    async fn send_process_properties(&self, pids: &[i32]) {
        for &pid in pids {
            let comm = std::fs::read(format!("/proc/{pid}/comm")).unwrap_or_default();
            let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).unwrap_or_default();
            let mut maps = Vec::new();
            match tokio::fs::File::open(format!("/proc/{pid}/maps")).await {
                Ok(file) => {
                    if let Err(e) =
                        consume_all_bytes(file, |chunk| maps.extend_from_slice(chunk)).await
                    {
                        log::debug!("reading maps of pid {pid} failed: {e}");
                    }
                }
                Err(e) => {
                    log::debug!("no maps for pid {pid}: {e}");
                }
            }
            if let Err(e) = self
                .send_frame(frame::process_frame(pid, &comm, &cmdline, &maps))
                .await
            {
                log::debug!("process frame for pid {pid} failed: {e}");
            }
        }
    }

    /// Pre-inject an online edge for every cpu, pick the raw monitor, and
    /// spawn the two forwarding loops.
    fn start_monitoring(&self) {
        let inner = &self.inner;

        for cpu in 0..inner.cpu_count as i32 {
            inner.coalescing.update_state(cpu, true);
        }

        let raw = match UeventCpuMonitor::open() {
            Ok(monitor) => {
                log::debug!("using netlink uevents for CPU hot-plug monitoring");
                Arc::new(RawCpuMonitor::Uevent(monitor))
            }
            Err(e) => {
                log::debug!("netlink unavailable ({e}), falling back to sysfs polling");
                let polling = PollingCpuMonitor::new(find_all_cpu_paths());
                polling.start();
                Arc::new(RawCpuMonitor::Polling(polling))
            }
        };
        *inner.raw_monitor.lock() = Some(raw.clone());

        // Raw events feed the coalescing monitor...
        {
            let inner = inner.clone();
            spawn_logged("cpu event forwarder", async move {
                loop {
                    let event = raw.receive_one().await;
                    if event.cpu_no < 0 {
                        return Ok::<(), io::Error>(());
                    }
                    inner.coalescing.update_state(event.cpu_no, event.online);
                }
            });
        }

        // ...and one consumer per cpu applies the coalesced edges.
        for cpu in 0..inner.cpu_count as i32 {
            let this = self.clone();
            spawn_logged("cpu state applier", async move {
                loop {
                    let event = this.inner.coalescing.receive_one(cpu).await;
                    if event.cpu_no < 0 {
                        return Ok::<(), io::Error>(());
                    }
                    this.update_cpu_state(event.cpu_no, event.online).await;
                }
            });
        }
    }

    /// Apply one coalesced hot-plug edge: bind or unbind the core's events
    /// and announce the change on both the capture stream and the IPC
    /// channel.
    async fn update_cpu_state(&self, cpu: i32, online: bool) {
        if self.is_terminated() {
            return;
        }
        log::debug!("cpu {cpu} is now {}", if online { "online" } else { "offline" });
        if !self
            .inner
            .coalescing
            .is_safe_to_bring_online_or_offline(cpu, online)
        {
            // Another edge is already queued behind this one; the follow-up
            // event will put things right.
            log::debug!("cpu {cpu} flipped again while applying the edge");
        }

        let went_online = if online {
            // Re-read identification: a different core type may have come up
            // in this slot.
            if let Err(e) = self.send_core_name(cpu).await {
                log::debug!("core name frame failed: {e}");
            }
            match self.inner.binder.bind_core(cpu).await {
                Ok(()) => true,
                Err(e) => {
                    // The core vanished while we were activating it; fall
                    // through to the offline path.
                    log::debug!("binding events for cpu {cpu} failed: {e}");
                    false
                }
            }
        } else {
            false
        };

        if went_online {
            if let Err(e) = self.send_initial_counter_value(cpu).await {
                log::debug!("initial counter frame failed: {e}");
            }
        } else {
            self.inner.binder.remove_core(cpu).await;
        }

        let delta = self.monotonic_delta();
        if let Err(e) = self
            .send_frame(frame::cpu_online_frame(delta, cpu, went_online))
            .await
        {
            log::debug!("cpu online frame failed: {e}");
        }
        if let Err(e) = self
            .inner
            .sink
            .send(Message::CpuStateChange {
                monotonic_delta_ns: delta,
                cpu,
                online: went_online,
            })
            .await
        {
            log::debug!("cpu state change message failed: {e}");
        }

        // First edge for this cpu counts towards readiness.
        {
            let mut seen = self.inner.cores_seen.lock();
            seen.insert(cpu);
            if seen.len() >= self.inner.cpu_count {
                self.inner.cores_ready.notify();
            }
        }
    }

    /// True once every cpu has received its first state event; false if the
    /// capture terminated first.
    async fn wait_for_all_cores_ready(&self) -> bool {
        tokio::select! {
            _ = self.inner.cores_ready.wait() => true,
            _ = self.inner.terminate.cancelled() => false,
        }
    }

    /// Find or create the processes to trace, per the session config.
    async fn prepare_process(&self) -> Result<Vec<i32>, CaptureError> {
        let config = &self.inner.config;

        if let Some(target) = &config.wait_process {
            log::debug!("waiting for process {target:?} to appear");
            self.inner.sink.send(Message::ExecTargetApp).await?;
            loop {
                if self.is_terminated() {
                    return Err(CaptureError::StartAborted);
                }
                let pids = find_matching_pids(target);
                if !pids.is_empty() {
                    return Ok(pids);
                }
                tokio::time::sleep(WAIT_PROCESS_POLL_INTERVAL).await;
            }
        }

        if let Some(command) = &config.command {
            let (program, args) = command
                .split_first()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
            let args: Vec<OsString> = args.iter().map(OsString::from).collect();
            let process = SuspendedProcess::fork(
                OsString::from(program).as_os_str(),
                &args,
                LaunchOptions::default(),
            )?;
            let pid = process.pid();
            log::debug!("forked target command as pid {pid}, held until start");
            *self.inner.command.lock() = Some(process);
            return Ok(vec![pid]);
        }

        // System-wide capture.
        Ok(Vec::new())
    }

    /// Drain everything, stop the sub-systems, and reap the command.
    async fn finish(&self, running: Option<RunningProcess>) -> i32 {
        let inner = &self.inner;

        inner.monitor.terminate();
        inner.monitor.wait_terminated().await;

        match running {
            Some(running) => {
                let status = tokio::task::spawn_blocking(move || running.wait())
                    .await
                    .ok()
                    .and_then(|r| r.ok());
                match status {
                    Some(nix::sys::wait::WaitStatus::Exited(_, code)) => code,
                    Some(nix::sys::wait::WaitStatus::Signaled(_, signal, _)) => {
                        128 + signal as i32
                    }
                    _ => 0,
                }
            }
            None => 0,
        }
    }
}

impl Inner {
    fn binder_page_size(&self) -> u32 {
        // The binder's buffer config carries the system page size.
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u32 }
    }

    fn do_terminate(inner: &Arc<Inner>) {
        if inner.terminate.is_cancelled() {
            return;
        }
        log::debug!("terminating capture");
        inner.terminate.cancel();
        inner.cores_ready.notify();
        inner.coalescing.stop();
        if let Some(raw) = inner.raw_monitor.lock().as_ref() {
            raw.stop();
        }
        if let Some(command) = inner.command.lock().take() {
            command.abort();
        }
        inner.monitor.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_pids_finds_processes_by_name() {
        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_string_lossy().into_owned();
        let pids = find_matching_pids(&name);
        assert!(pids.contains(&std::process::id().try_into().unwrap()));
    }

    #[test]
    fn matching_pids_ignores_non_numeric_proc_entries() {
        let pids = find_matching_pids_in(Path::new("/proc"), "definitely-no-such-process-91x");
        assert!(pids.is_empty());
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ns(libc::CLOCK_MONOTONIC_RAW);
        let b = monotonic_ns(libc::CLOCK_MONOTONIC_RAW);
        assert!(b >= a);
    }

    #[test]
    fn uname_is_populated() {
        let value = uname_string();
        assert!(value.contains("Linux") || !value.is_empty());
    }

    #[tokio::test]
    async fn terminate_before_start_aborts_the_wait() {
        let (read_fd, write_fd) = crate::proc::pipe_pair().unwrap();
        let sink = crate::ipc::sink_from_fd(write_fd).unwrap();
        let mut source = crate::ipc::source_from_fd(read_fd).unwrap();

        let orchestrator = CaptureOrchestrator::new(
            sink,
            CaptureConfig {
                live_mode: true,
                ..Default::default()
            },
        );

        // All cores report ready straight away because of the pre-injected
        // online edges (the binder may fail to open real perf events here;
        // the state machine still advances through the offline path).
        let runner = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run().await })
        };

        // Drive the run up to the ready handshake, then cancel.
        let ready = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                match source.recv().await.unwrap().unwrap() {
                    Message::CaptureReady { .. } => break,
                    Message::CaptureFailed { .. } => panic!("capture failed unexpectedly"),
                    _ => {}
                }
            }
        })
        .await;
        assert!(ready.is_ok(), "capture never reached ready");

        // Keep draining so teardown is never blocked on sink backpressure.
        tokio::spawn(async move { while let Ok(Some(_)) = source.recv().await {} });

        orchestrator.terminate(false);
        let result = tokio::time::timeout(Duration::from_secs(30), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(CaptureError::StartAborted)));
    }
}
