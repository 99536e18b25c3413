use std::sync::Arc;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

/// What happened to a monitored pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEventState {
    TerminatedExit(i32),
    TerminatedSignal(i32),
    NoSuchProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEvent {
    pub pid: i32,
    pub state: ProcessEventState,
}

#[derive(Default)]
struct Inner {
    watchers: Mutex<FxHashMap<i32, mpsc::UnboundedSender<ProcessEvent>>>,
}

/// Reaps children on SIGCHLD and fans terminal events out to per-pid
/// subscribers.
///
/// One instance per process; whoever owns the signal loop calls
/// `on_sigchld` whenever the signal is observed. Interest in a pid must be
/// registered before the child can exit (in practice: before it is released
/// from its suspended state), otherwise its exit is reaped without an event.
#[derive(Clone, Default)]
pub struct ProcessMonitor {
    inner: Arc<Inner>,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a pid. A pid that is already gone produces an
    /// immediate `NoSuchProcess` event.
    pub fn monitor(&self, pid: i32) -> MonitorHandle {
        let (tx, rx) = mpsc::unbounded_channel();

        let alive = nix::sys::signal::kill(Pid::from_raw(pid), None).is_ok();
        if alive {
            self.inner.watchers.lock().insert(pid, tx);
        } else {
            let _ = tx.send(ProcessEvent {
                pid,
                state: ProcessEventState::NoSuchProcess,
            });
        }

        MonitorHandle { pid, rx }
    }

    /// Synchronous SIGCHLD hook: reap every terminated *monitored* child
    /// without blocking and notify its subscriber. Children that are waited
    /// elsewhere (`RunningProcess::wait`) are deliberately left alone.
    pub fn on_sigchld(&self) {
        let pids: Vec<i32> = self.inner.watchers.lock().keys().copied().collect();
        for pid in pids {
            match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.dispatch(pid, ProcessEventState::TerminatedExit(code));
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.dispatch(pid, ProcessEventState::TerminatedSignal(signal as i32));
                }
                Ok(WaitStatus::StillAlive) => {}
                Ok(_) => {}
                Err(nix::errno::Errno::ECHILD) => {
                    // Reaped elsewhere, or never a child of ours.
                    self.dispatch(pid, ProcessEventState::NoSuchProcess);
                }
                Err(e) => {
                    log::warn!("waitpid({pid}) failed in SIGCHLD handler: {e}");
                }
            }
        }
    }

    fn dispatch(&self, pid: i32, state: ProcessEventState) {
        if let Some(tx) = self.inner.watchers.lock().remove(&pid) {
            let _ = tx.send(ProcessEvent { pid, state });
        }
    }
}

/// The receive side of one pid registration.
pub struct MonitorHandle {
    pid: i32,
    rx: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl MonitorHandle {
    /// The terminal event for this pid. `None` if the monitor itself went
    /// away first.
    pub async fn wait_event(&mut self) -> Option<ProcessEvent> {
        self.rx.recv().await
    }
}
