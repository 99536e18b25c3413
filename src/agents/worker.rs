use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::ipc::{is_closed_error, IpcSink, Message};
use crate::runtime::spawn_logged;

/// The lifecycle states of one agent process, as seen from the shell.
///
/// `TerminatedPendingMessageLoop` exists because the IPC receive loop may
/// still be draining buffered messages after the child has died; the worker
/// is only fully terminated once both SIGCHLD has been observed and the loop
/// has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AgentState {
    Launched,
    Ready,
    ShutdownRequested,
    ShutdownReceived,
    TerminatedPendingMessageLoop,
    Terminated,
}

/// Fired on the accepting worker for every state change: `(pid, old, new)`.
pub type StateChangeObserver = Arc<dyn Fn(i32, AgentState, AgentState) + Send + Sync>;

struct CoreState {
    state: AgentState,
    message_loop_terminated: bool,
    launch_notifier: Option<oneshot::Sender<bool>>,
    notified_launched: bool,
}

/// State tracking and IPC access shared by every agent worker variant.
pub struct WorkerCore {
    pid: i32,
    agent_id: &'static str,
    sink: IpcSink,
    observer: StateChangeObserver,
    state: Mutex<CoreState>,
}

impl WorkerCore {
    pub fn new(
        pid: i32,
        agent_id: &'static str,
        sink: IpcSink,
        observer: StateChangeObserver,
    ) -> Arc<Self> {
        Arc::new(WorkerCore {
            pid,
            agent_id,
            sink,
            observer,
            state: Mutex::new(CoreState {
                state: AgentState::Launched,
                message_loop_terminated: false,
                launch_notifier: None,
                notified_launched: false,
            }),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn state(&self) -> AgentState {
        self.state.lock().state
    }

    fn is_valid_state_transition(
        old_state: AgentState,
        new_state: AgentState,
        message_loop_terminated: bool,
    ) -> bool {
        if old_state == new_state {
            return false;
        }
        match new_state {
            AgentState::Launched => false,
            AgentState::Ready => old_state == AgentState::Launched,
            AgentState::ShutdownRequested => {
                matches!(old_state, AgentState::Launched | AgentState::Ready)
            }
            AgentState::ShutdownReceived => matches!(
                old_state,
                AgentState::Launched | AgentState::Ready | AgentState::ShutdownRequested
            ),
            AgentState::TerminatedPendingMessageLoop => !message_loop_terminated,
            AgentState::Terminated => message_loop_terminated,
        }
    }

    /// Request a state transition. Idempotent transitions are no-ops, invalid
    /// ones are logged and ignored; both return false. An accepted transition
    /// fires the state-change observer and, the first time the worker leaves
    /// `Launched`, resumes the launch notifier with `new == Ready`.
    pub fn transition_state(&self, new_state: AgentState) -> bool {
        let (old_state, new_state, notifier) = {
            let mut guard = self.state.lock();
            let old_state = guard.state;

            // The two terminated states are two halves of the same request;
            // pick the right one for the current message-loop progress.
            let mut new_state = new_state;
            if new_state == AgentState::TerminatedPendingMessageLoop
                && guard.message_loop_terminated
            {
                new_state = AgentState::Terminated;
            } else if new_state == AgentState::Terminated && !guard.message_loop_terminated {
                new_state = AgentState::TerminatedPendingMessageLoop;
            }

            if old_state == new_state {
                return false;
            }
            if !Self::is_valid_state_transition(old_state, new_state, guard.message_loop_terminated)
            {
                log::debug!(
                    "agent {} ({}): invalid transition {:?} -> {:?}",
                    self.pid,
                    self.agent_id,
                    old_state,
                    new_state
                );
                return false;
            }

            log::debug!(
                "agent {} ({}): {:?} -> {:?}",
                self.pid,
                self.agent_id,
                old_state,
                new_state
            );
            guard.state = new_state;

            let notifier = guard.launch_notifier.take();
            if notifier.is_some() {
                guard.notified_launched = true;
            }
            (old_state, new_state, notifier)
        };

        (self.observer)(self.pid, old_state, new_state);
        if let Some(notifier) = notifier {
            let _ = notifier.send(new_state == AgentState::Ready);
        }
        true
    }

    /// Wait for the first transition out of `Launched`; resolves with true
    /// iff the agent reached `Ready`. At most one waiter, ever.
    pub async fn wait_launched(self: &Arc<Self>) -> bool {
        let rx = {
            let mut guard = self.state.lock();
            assert!(
                guard.launch_notifier.is_none() && !guard.notified_launched,
                "cannot queue multiple launch notifications"
            );
            if guard.state != AgentState::Launched {
                guard.notified_launched = true;
                let ready = guard.state == AgentState::Ready;
                drop(guard);
                return ready;
            }
            let (tx, rx) = oneshot::channel();
            guard.launch_notifier = Some(tx);
            rx
        };
        rx.await.unwrap_or(false)
    }

    /// Called by the message loop when it finishes draining.
    pub fn set_message_loop_terminated(&self) {
        let promote = {
            let mut guard = self.state.lock();
            guard.message_loop_terminated = true;
            guard.state == AgentState::TerminatedPendingMessageLoop
        };
        if promote {
            self.transition_state(AgentState::Terminated);
        }
    }

    /// Send a message to the agent. A closed pipe means the agent is gone:
    /// the state advances to terminated and the error is swallowed.
    pub async fn send_message(self: &Arc<Self>, message: Message) -> std::io::Result<()> {
        match self.sink.send(message).await {
            Ok(()) => Ok(()),
            Err(e) if is_closed_error(&e) => {
                self.transition_state(AgentState::Terminated);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Ask the agent to shut down: transition to `ShutdownRequested` and send
    /// the shutdown message.
    pub async fn request_shutdown(self: &Arc<Self>) {
        if !self.transition_state(AgentState::ShutdownRequested) {
            return;
        }
        log::debug!(
            "requesting agent {} ({}) to shut down",
            self.pid,
            self.agent_id
        );
        if let Err(e) = self.send_message(Message::Shutdown).await {
            log::debug!("failed to send shutdown to agent {}: {e}", self.pid);
        }
    }

    /// Fire-and-forget variant of `request_shutdown`.
    pub fn shutdown(self: &Arc<Self>) {
        let core = self.clone();
        spawn_logged("shutdown request", async move {
            core.request_shutdown().await;
            Ok::<(), std::io::Error>(())
        });
    }

    /// Called when SIGCHLD has been observed for the agent process.
    pub fn on_sigchld(&self) {
        self.transition_state(AgentState::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::ipc::{sink_from_fd, source_from_fd};
    use crate::proc::pipe_pair;

    fn test_core(observer: StateChangeObserver) -> (Arc<WorkerCore>, crate::ipc::IpcSource<tokio::net::unix::pipe::Receiver>) {
        let (read_fd, write_fd) = pipe_pair().unwrap();
        let sink = sink_from_fd(write_fd).unwrap();
        let source = source_from_fd(read_fd).unwrap();
        (WorkerCore::new(1234, "agent-test", sink, observer), source)
    }

    fn noop_observer() -> StateChangeObserver {
        Arc::new(|_, _, _| {})
    }

    #[tokio::test]
    async fn valid_transition_table() {
        use AgentState::*;
        let cases: &[(AgentState, AgentState, bool)] = &[
            (Launched, Ready, true),
            (Ready, Launched, false),
            (Launched, ShutdownRequested, true),
            (Ready, ShutdownRequested, true),
            (ShutdownRequested, Ready, false),
            (Launched, ShutdownReceived, true),
            (Ready, ShutdownReceived, true),
            (ShutdownRequested, ShutdownReceived, true),
            (ShutdownReceived, ShutdownRequested, false),
        ];
        for &(old, new, expected) in cases {
            assert_eq!(
                WorkerCore::is_valid_state_transition(old, new, false),
                expected,
                "{old:?} -> {new:?}"
            );
        }
        // Terminated is reachable from anywhere; which half depends on the
        // message loop.
        for old in [Launched, Ready, ShutdownRequested, ShutdownReceived] {
            assert!(WorkerCore::is_valid_state_transition(
                old,
                TerminatedPendingMessageLoop,
                false
            ));
            assert!(WorkerCore::is_valid_state_transition(old, Terminated, true));
            assert!(!WorkerCore::is_valid_state_transition(
                old, Terminated, false
            ));
        }
    }

    #[tokio::test]
    async fn observer_fires_once_per_accepted_transition() {
        let count = Arc::new(AtomicUsize::new(0));
        let observer: StateChangeObserver = {
            let count = count.clone();
            Arc::new(move |_, _, _| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let (core, _source) = test_core(observer);

        assert!(core.transition_state(AgentState::Ready));
        // idempotent: no-op, no observer call
        assert!(!core.transition_state(AgentState::Ready));
        // invalid: ignored
        assert!(!core.transition_state(AgentState::Launched));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminated_waits_for_message_loop() {
        let (core, _source) = test_core(noop_observer());
        assert!(core.transition_state(AgentState::Terminated));
        // The message loop is still running, so we only got halfway.
        assert_eq!(core.state(), AgentState::TerminatedPendingMessageLoop);
        core.set_message_loop_terminated();
        assert_eq!(core.state(), AgentState::Terminated);
    }

    #[tokio::test]
    async fn message_loop_end_first_then_sigchld() {
        let (core, _source) = test_core(noop_observer());
        core.set_message_loop_terminated();
        assert_eq!(core.state(), AgentState::Launched);
        core.on_sigchld();
        assert_eq!(core.state(), AgentState::Terminated);
    }

    #[tokio::test]
    async fn launch_notifier_resolves_true_on_ready() {
        let (core, _source) = test_core(noop_observer());
        let waiter = {
            let core = core.clone();
            tokio::spawn(async move { core.wait_launched().await })
        };
        tokio::task::yield_now().await;
        core.transition_state(AgentState::Ready);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn launch_notifier_resolves_false_on_termination() {
        let (core, _source) = test_core(noop_observer());
        core.transition_state(AgentState::Terminated);
        core.set_message_loop_terminated();
        // Registered after the fact: resolves immediately, with false.
        assert!(!core.wait_launched().await);
    }

    #[tokio::test]
    async fn send_after_peer_close_terminates_quietly() {
        // E4: SIGCHLD arrives while a send is in flight; the send completes
        // with EOF which is swallowed, and the observer sees each distinct
        // transition exactly once.
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let observer: StateChangeObserver = {
            let transitions = transitions.clone();
            Arc::new(move |_, old, new| transitions.lock().push((old, new)))
        };
        let (core, source) = test_core(observer);
        core.transition_state(AgentState::Ready);
        drop(source);

        // Writes fail with EPIPE once the kernel buffer is gone; loop like a
        // real caller would keep sending messages.
        for _ in 0..64 {
            core.send_message(Message::CpuStateChange {
                monotonic_delta_ns: 0,
                cpu: 0,
                online: true,
            })
            .await
            .unwrap();
            if core.state() != AgentState::Ready {
                break;
            }
        }
        assert_eq!(core.state(), AgentState::TerminatedPendingMessageLoop);
        core.set_message_loop_terminated();
        assert_eq!(
            transitions.lock().as_slice(),
            &[
                (AgentState::Launched, AgentState::Ready),
                (
                    AgentState::Ready,
                    AgentState::TerminatedPendingMessageLoop
                ),
                (
                    AgentState::TerminatedPendingMessageLoop,
                    AgentState::Terminated
                ),
            ]
        );
    }
}
