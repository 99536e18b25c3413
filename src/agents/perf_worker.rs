use std::io;
use std::sync::Arc;

use tokio::net::unix::pipe;

use super::worker::{AgentState, WorkerCore};
use crate::ipc::{CaptureFailedReason, IpcSource, Message, WireError};
use crate::runtime::spawn_logged;

/// Receives the capture lifecycle and the capture stream from the perf
/// agent. Implemented by the shell session that owns the host connection.
pub trait PerfCaptureObserver: Send + Sync + 'static {
    fn on_capture_ready(&self, pids: &[i32]);
    fn on_capture_started(&self);
    fn on_capture_failed(&self, reason: CaptureFailedReason);
    fn on_exec_target_app(&self);
    fn on_cpu_state_change(&self, monotonic_delta_ns: u64, cpu: i32, online: bool);
    fn on_apc_frame(&self, bytes: Vec<u8>);
}

/// Shell-side control handle for the perf agent.
#[derive(Clone)]
pub struct PerfWorkerHandle {
    core: Arc<WorkerCore>,
}

impl PerfWorkerHandle {
    /// Tell the agent to begin the capture. Sent when the host requests
    /// capture start.
    pub async fn start_capture(&self) -> io::Result<()> {
        self.core.send_message(Message::Start).await
    }
}

struct PerfWorker {
    core: Arc<WorkerCore>,
    observer: Arc<dyn PerfCaptureObserver>,
}

/// Start the shell-side worker for the perf agent.
pub fn start(
    core: Arc<WorkerCore>,
    source: IpcSource<pipe::Receiver>,
    observer: Arc<dyn PerfCaptureObserver>,
) -> PerfWorkerHandle {
    let handle = PerfWorkerHandle { core: core.clone() };
    let worker = PerfWorker { core, observer };
    spawn_logged("perf agent message loop", worker.run(source));
    handle
}

impl PerfWorker {
    async fn run(self, mut source: IpcSource<pipe::Receiver>) -> io::Result<()> {
        let error = loop {
            match source.recv().await {
                Ok(Some(message)) => self.on_message(message),
                Ok(None) => break true,
                Err(WireError::Io(e)) => {
                    log::debug!("perf agent receive failed: {e}");
                    break true;
                }
                Err(e) => {
                    log::warn!("perf agent protocol violation: {e}");
                    break true;
                }
            }
        };

        log::debug!("perf agent receive loop ended");
        self.core.set_message_loop_terminated();
        if error {
            self.core.shutdown();
        }
        Ok(())
    }

    fn on_message(&self, message: Message) {
        match message {
            Message::Ready => {
                if self.core.transition_state(AgentState::Ready) {
                    log::debug!("perf agent is now ready");
                }
            }
            Message::Shutdown => {
                if self.core.transition_state(AgentState::ShutdownReceived) {
                    log::debug!("perf agent is now shut down");
                }
            }
            Message::CaptureReady { pids } => self.observer.on_capture_ready(&pids),
            Message::CaptureStarted => self.observer.on_capture_started(),
            Message::CaptureFailed { reason } => self.observer.on_capture_failed(reason),
            Message::ExecTargetApp => self.observer.on_exec_target_app(),
            Message::CpuStateChange {
                monotonic_delta_ns,
                cpu,
                online,
            } => self
                .observer
                .on_cpu_state_change(monotonic_delta_ns, cpu, online),
            Message::ApcFrameData { bytes } => self.observer.on_apc_frame(bytes),
            other => {
                log::warn!("perf agent: unexpected {} message dropped", other.name());
            }
        }
    }
}
