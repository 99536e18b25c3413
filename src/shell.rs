//! The shell session: owns the agent manager, implements the data sinks the
//! typed workers forward into, and drives the capture lifecycle from the
//! shell side.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::io::AsyncWrite;

use crate::agents::annotation::{AnnotationSessionConsumer, AnnotationSession};
use crate::agents::ext_source::{ExtSourceConnection, ExternalSource};
use crate::agents::perf_worker::{PerfCaptureObserver, PerfWorkerHandle};
use crate::agents::perfetto::PerfettoSource;
use crate::agents::{
    annotation, ext_source, manager::AgentManager, perf_worker, perfetto, AgentSpawner,
    AndroidPackageSpawner, ManagerParent, PrivilegeLevel, SimpleSpawner, AGENT_ID_ANNOTATION,
    AGENT_ID_EXTERNAL, AGENT_ID_PERF, AGENT_ID_PERFETTO,
};
use crate::cli::Opt;
use crate::ipc::{AnnotationUid, CaptureConfig, CaptureFailedReason, GpuTimelineConfig, Message};
use crate::proc::ProcessMonitor;
use crate::runtime::{spawn_logged, Notifier};

/// Everything the typed workers call back into on the shell side.
pub struct ShellSession {
    capture_dir: PathBuf,
    capture_file: Mutex<BufWriter<File>>,
    manager: OnceLock<AgentManager>,
    perf_handle: OnceLock<PerfWorkerHandle>,
    exit_code: AtomicI32,
    terminal_signal: Notifier,
}

impl ShellSession {
    pub fn new(capture_dir: PathBuf) -> io::Result<Arc<Self>> {
        std::fs::create_dir_all(&capture_dir)?;
        let capture_file = File::create(capture_dir.join("capture.bin"))?;
        Ok(Arc::new(ShellSession {
            capture_dir,
            capture_file: Mutex::new(BufWriter::new(capture_file)),
            manager: OnceLock::new(),
            perf_handle: OnceLock::new(),
            exit_code: AtomicI32::new(0),
            terminal_signal: Notifier::new("terminal signal"),
        }))
    }

    fn manager(&self) -> &AgentManager {
        self.manager.get().expect("manager is wired before agents run")
    }

    fn new_output_file(&self, name: &str) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let file = File::create(self.capture_dir.join(name))?;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }
}

impl ManagerParent for ShellSession {
    fn on_terminal_signal(&self, signo: i32) {
        log::info!("received signal {signo}, shutting down");
        self.terminal_signal.notify();
    }

    fn on_agent_thread_terminated(&self) {
        log::debug!("agent manager terminated");
    }
}

impl PerfCaptureObserver for ShellSession {
    fn on_capture_ready(&self, pids: &[i32]) {
        log::info!("capture ready (pids {pids:?}), starting");
        // There is no separate host connection in local mode; ready means go.
        if let Some(handle) = self.perf_handle.get() {
            let handle = handle.clone();
            spawn_logged("capture start request", async move {
                handle.start_capture().await
            });
        }
    }

    fn on_capture_started(&self) {
        log::info!("capture started");
    }

    fn on_capture_failed(&self, reason: CaptureFailedReason) {
        log::error!("capture failed: {reason:?}");
        self.exit_code.store(1, Ordering::SeqCst);
        self.manager().shutdown();
    }

    fn on_exec_target_app(&self) {
        log::info!("waiting for the target process to appear");
    }

    fn on_cpu_state_change(&self, monotonic_delta_ns: u64, cpu: i32, online: bool) {
        log::debug!("cpu {cpu} {} at +{monotonic_delta_ns}ns", if online { "online" } else { "offline" });
    }

    fn on_apc_frame(&self, bytes: Vec<u8>) {
        // Length-prefixed frames on the local capture stream.
        let mut file = self.capture_file.lock();
        let result = file
            .write_all(&(bytes.len() as u32).to_le_bytes())
            .and_then(|()| file.write_all(&bytes))
            .and_then(|()| file.flush());
        if let Err(e) = result {
            log::error!("failed to write capture frame: {e}");
        }
    }
}

impl ExternalSource for ShellSession {
    fn add_agent_pipe(
        &self,
        uid: AnnotationUid,
        _connection: ExtSourceConnection,
    ) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        self.new_output_file(&format!("external-{uid}.bin"))
    }
}

impl PerfettoSource for ShellSession {
    fn add_agent_pipe(&self) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        self.new_output_file("perfetto.trace")
    }
}

impl AnnotationSessionConsumer for ShellSession {
    fn consume_session(&self, session: AnnotationSession) {
        let path = self
            .capture_dir
            .join(format!("annotation-{}.bin", session.uid()));
        std::thread::spawn(move || {
            let Ok(file) = File::create(path) else {
                session.close();
                return;
            };
            let mut file = BufWriter::new(file);
            let mut buf = [0u8; 4096];
            loop {
                let n = session.read_some(&mut buf);
                if n == 0 {
                    break;
                }
                if file.write_all(&buf[..n]).is_err() {
                    session.close();
                    break;
                }
            }
            let _ = file.flush();
        });
    }
}

fn capture_config(opt: &Opt) -> CaptureConfig {
    CaptureConfig {
        sample_frequency: opt.sample_frequency,
        data_buffer_size: opt.buffer_size,
        aux_buffer_size: opt.aux_buffer_size,
        one_shot_limit: opt.one_shot_limit,
        live_mode: opt.live,
        command: if opt.command.is_empty() {
            None
        } else {
            Some(opt.command.clone())
        },
        wait_process: opt.wait_process.clone(),
        android_package: opt.android_package.clone(),
    }
}

/// Run the shell session to completion; the process exit code.
pub async fn run(opt: Opt) -> i32 {
    let session = match ShellSession::new(opt.output.clone()) {
        Ok(session) => session,
        Err(e) => {
            log::error!("cannot create capture directory {:?}: {e}", opt.output);
            return 1;
        }
    };

    let lo_priv_spawner: Arc<dyn AgentSpawner> = match &opt.android_package {
        Some(package) => Arc::new(AndroidPackageSpawner::new(package.clone())),
        None => Arc::new(SimpleSpawner),
    };
    let manager = AgentManager::new(
        session.clone(),
        ProcessMonitor::new(),
        Arc::new(SimpleSpawner),
        lo_priv_spawner,
    );
    session
        .manager
        .set(manager.clone())
        .unwrap_or_else(|_| unreachable!("manager wired once"));
    if let Err(e) = manager.spawn_signal_handlers() {
        log::error!("cannot install signal handlers: {e}");
        return 1;
    }

    // Spawn the agent set. The leaf agents are allowed to fail (their data
    // sources may not exist on this device); the perf agent is not.
    let gpu_timeline = GpuTimelineConfig {
        enabled: opt.android_package.is_some(),
        layer_libs: Vec::new(),
        package_name: opt.android_package.clone(),
    };
    let ready = manager
        .add_agent(AGENT_ID_EXTERNAL, PrivilegeLevel::Low, {
            let session = session.clone();
            move |core, source| ext_source::start(core, source, session, gpu_timeline)
        })
        .await;
    if !ready {
        log::warn!("external annotation agent failed to start");
    }

    let ready = manager
        .add_agent(AGENT_ID_ANNOTATION, PrivilegeLevel::Low, {
            let session = session.clone();
            move |core, source| annotation::start(core, source, session)
        })
        .await;
    if !ready {
        log::warn!("annotation agent failed to start");
    }

    if opt.perfetto {
        let ready = manager
            .add_agent(AGENT_ID_PERFETTO, PrivilegeLevel::High, {
                let session = session.clone();
                move |core, source| perfetto::start(core, source, session)
            })
            .await;
        if !ready {
            log::warn!("perfetto agent failed to start");
        }
    }

    let perf_ready = manager
        .add_agent(AGENT_ID_PERF, PrivilegeLevel::Low, {
            let session = session.clone();
            move |core, source| {
                let handle = perf_worker::start(core, source, session.clone());
                session
                    .perf_handle
                    .set(handle)
                    .unwrap_or_else(|_| unreachable!("perf worker wired once"));
            }
        })
        .await;
    if !perf_ready {
        log::error!("perf agent failed to start, aborting");
        manager.shutdown();
        manager.wait_terminated().await;
        return 1;
    }

    manager
        .broadcast_when_ready(Message::CaptureConfiguration(capture_config(&opt)))
        .await;

    if let Some(duration) = opt.duration {
        let manager = manager.clone();
        spawn_logged("capture duration timer", async move {
            tokio::time::sleep(duration).await;
            log::info!("capture duration elapsed, shutting down");
            manager.shutdown();
            Ok::<(), io::Error>(())
        });
    }

    // Wind down on the first terminal signal, or once every agent is gone.
    tokio::select! {
        _ = session.terminal_signal.wait() => {
            manager.shutdown();
            manager.wait_terminated().await;
        }
        _ = manager.wait_terminated() => {}
    }

    session.exit_code.load(Ordering::SeqCst)
}
