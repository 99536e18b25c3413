use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::unix::pipe;

use super::spawner::{spawn_agent, AgentSpawner, PrivilegeLevel};
use super::worker::{AgentState, StateChangeObserver, WorkerCore};
use crate::ipc::{IpcSource, Message};
use crate::proc::ProcessMonitor;
use crate::runtime::{spawn_logged, Notifier, SerialQueue};

/// Receives the manager's upward notifications.
pub trait ManagerParent: Send + Sync + 'static {
    /// A terminal signal (SIGHUP/SIGINT/SIGTERM/SIGABRT) was observed.
    fn on_terminal_signal(&self, signo: i32);
    /// The last agent terminated; the shell can wind down.
    fn on_agent_thread_terminated(&self);
}

struct AgentEntry {
    core: Arc<WorkerCore>,
    /// Broadcasts that arrived before the agent was ready, delivered FIFO
    /// once it is.
    cached_messages: VecDeque<Message>,
    is_ready: bool,
}

struct Inner {
    queue: SerialQueue,
    agents: Mutex<FxHashMap<i32, AgentEntry>>,
    created_any: AtomicBool,
    terminated: AtomicBool,
    sigalrm_counter: AtomicUsize,
    parent: Arc<dyn ManagerParent>,
    process_monitor: ProcessMonitor,
    hi_priv_spawner: Arc<dyn AgentSpawner>,
    lo_priv_spawner: Arc<dyn AgentSpawner>,
    terminated_notifier: Notifier,
}

/// Owns the set of live agent workers: spawns agent processes, relays
/// SIGCHLD, broadcasts messages with per-agent caching until ready, and
/// notifies the parent once every agent has gone away.
#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<Inner>,
}

impl AgentManager {
    pub fn new(
        parent: Arc<dyn ManagerParent>,
        process_monitor: ProcessMonitor,
        hi_priv_spawner: Arc<dyn AgentSpawner>,
        lo_priv_spawner: Arc<dyn AgentSpawner>,
    ) -> Self {
        AgentManager {
            inner: Arc::new(Inner {
                queue: SerialQueue::new("agent manager"),
                agents: Mutex::new(FxHashMap::default()),
                created_any: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                sigalrm_counter: AtomicUsize::new(0),
                parent,
                process_monitor,
                hi_priv_spawner,
                lo_priv_spawner,
                terminated_notifier: Notifier::new("manager termination"),
            }),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Resolves once the agent set has emptied out and the manager stopped.
    pub async fn wait_terminated(&self) {
        self.inner.terminated_notifier.wait().await;
    }

    /// Spawn an agent process, construct its typed worker via `start_loop`,
    /// begin monitoring its pid and wait for the launch outcome. Resolves
    /// with true iff the agent reached ready.
    pub async fn add_agent<F>(
        &self,
        agent_id: &'static str,
        privilege: PrivilegeLevel,
        start_loop: F,
    ) -> bool
    where
        F: FnOnce(Arc<WorkerCore>, IpcSource<pipe::Receiver>),
    {
        if self.is_terminated() {
            return false;
        }

        log::debug!("creating agent process for {agent_id}");
        let spawner = match privilege {
            PrivilegeLevel::High => &self.inner.hi_priv_spawner,
            PrivilegeLevel::Low => &self.inner.lo_priv_spawner,
        };
        let agent = match spawn_agent(spawner.as_ref(), agent_id) {
            Ok(agent) => agent,
            Err(e) => {
                log::error!("failed to spawn {agent_id}: {e}");
                return false;
            }
        };
        let pid = agent.pid;

        let core = WorkerCore::new(pid, agent_id, agent.sink, self.state_observer());
        self.attach_worker(core.clone()).await;

        // Register interest in the pid before the child gets to exec.
        let mut monitor_handle = self.inner.process_monitor.monitor(pid);
        {
            let core = core.clone();
            spawn_logged("agent pid observer", async move {
                if let Some(event) = monitor_handle.wait_event().await {
                    log::debug!("agent process {pid} terminated ({:?})", event.state);
                    core.on_sigchld();
                }
                Ok::<(), std::io::Error>(())
            });
        }

        start_loop(core.clone(), agent.source);

        match agent.process.resume_and_exec() {
            Ok(_running) => {}
            Err(e) => {
                // The pid observer will see the child die; just report it.
                log::error!("agent process created, but exec failed: {e}");
            }
        }

        core.wait_launched().await
    }

    /// Send `message` to every tracked agent: immediately to ready agents,
    /// cached in FIFO order for the rest.
    pub async fn broadcast_when_ready(&self, message: Message) {
        let inner = self.inner.clone();
        self.inner
            .queue
            .run(async move {
                let pids: Vec<i32> = inner.agents.lock().keys().copied().collect();
                for pid in pids {
                    let core = {
                        let mut agents = inner.agents.lock();
                        let Some(entry) = agents.get_mut(&pid) else {
                            continue;
                        };
                        if !entry.is_ready {
                            log::debug!(
                                "agent process {pid} not ready, caching broadcast {}",
                                message.name()
                            );
                            entry.cached_messages.push_back(message.clone());
                            continue;
                        }
                        entry.core.clone()
                    };
                    log::debug!("sending broadcast {} to agent process {pid}", message.name());
                    if let Err(e) = core.send_message(message.clone()).await {
                        log::warn!("broadcast to agent {pid} failed: {e}");
                    }
                }
            })
            .await;
    }

    /// Ask every agent to shut down; with no agents the manager stops right
    /// away.
    pub fn shutdown(&self) {
        let inner = self.inner.clone();
        self.inner.queue.post(async move {
            let cores: Vec<Arc<WorkerCore>> =
                inner.agents.lock().values().map(|e| e.core.clone()).collect();
            if cores.is_empty() {
                Inner::terminate(&inner);
            } else {
                log::debug!("requesting all agents to shut down");
                for core in cores {
                    core.shutdown();
                }
            }
        });
    }

    /// Signal dispatch for the shell process.
    pub fn on_signal(&self, signo: i32) {
        match signo {
            libc::SIGHUP | libc::SIGINT | libc::SIGTERM | libc::SIGABRT => {
                log::debug!("received signal {signo}");
                self.inner.parent.on_terminal_signal(signo);
            }
            libc::SIGALRM => {
                let count = self.inner.sigalrm_counter.fetch_add(1, Ordering::SeqCst);
                if count == 0 {
                    log::warn!(
                        "alarm received, sender running slowly, possible bottleneck in transmission path"
                    );
                } else {
                    log::debug!("alarm received again (#{})", count + 1);
                }
            }
            other => {
                log::warn!("unexpected signal # {other}");
            }
        }
    }

    /// Spawn the signal handler tasks: SIGCHLD feeds the process monitor,
    /// everything else goes through `on_signal`.
    pub fn spawn_signal_handlers(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let kinds = [
            SignalKind::hangup(),
            SignalKind::interrupt(),
            SignalKind::terminate(),
            SignalKind::from_raw(libc::SIGABRT),
            SignalKind::alarm(),
            SignalKind::child(),
        ];
        for kind in kinds {
            let mut stream = signal(kind)?;
            let manager = self.clone();
            spawn_logged("signal handler loop", async move {
                while stream.recv().await.is_some() {
                    if manager.is_terminated() {
                        break;
                    }
                    if kind == SignalKind::child() {
                        manager.inner.process_monitor.on_sigchld();
                    } else {
                        manager.on_signal(kind.as_raw_value());
                    }
                }
                Ok::<(), std::io::Error>(())
            });
        }
        Ok(())
    }

    /// Track a constructed worker. Split out from `add_agent` so the state
    /// machine plumbing is testable without forking processes.
    pub(crate) async fn attach_worker(&self, core: Arc<WorkerCore>) {
        let inner = self.inner.clone();
        self.inner
            .queue
            .run(async move {
                inner.created_any.store(true, Ordering::SeqCst);
                inner.agents.lock().insert(
                    core.pid(),
                    AgentEntry {
                        core,
                        cached_messages: VecDeque::new(),
                        is_ready: false,
                    },
                );
            })
            .await;
    }

    /// The observer wired into every worker core; routes ready/terminated
    /// transitions back into manager bookkeeping.
    pub(crate) fn state_observer(&self) -> StateChangeObserver {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |pid, _old, new| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match new {
                AgentState::Ready => {
                    let inner2 = inner.clone();
                    inner.queue.post(async move {
                        Inner::on_agent_ready(&inner2, pid).await;
                    });
                }
                AgentState::Terminated => {
                    let inner2 = inner.clone();
                    inner.queue.post(async move {
                        log::debug!("received agent terminated notification for {pid}");
                        inner2.agents.lock().remove(&pid);
                        Inner::check_terminated(&inner2);
                    });
                }
                _ => {}
            }
        })
    }
}

impl Inner {
    async fn on_agent_ready(inner: &Arc<Inner>, pid: i32) {
        {
            let mut agents = inner.agents.lock();
            let Some(entry) = agents.get_mut(&pid) else {
                log::warn!("unknown agent pid: {pid}");
                return;
            };
            entry.is_ready = true;
        }

        // Drain the cached broadcasts in order. If the agent is erased while
        // we're at it, the remainder is discarded.
        loop {
            let next = {
                let mut agents = inner.agents.lock();
                let Some(entry) = agents.get_mut(&pid) else {
                    log::debug!("not sending cached message: agent {pid} was terminated");
                    break;
                };
                match entry.cached_messages.pop_front() {
                    Some(message) => (entry.core.clone(), message),
                    None => break,
                }
            };
            let (core, message) = next;
            log::debug!(
                "sending cached broadcast {} to agent process {pid}",
                message.name()
            );
            if let Err(e) = core.send_message(message).await {
                log::warn!("cached broadcast to agent {pid} failed: {e}");
            }
        }
    }

    fn check_terminated(inner: &Arc<Inner>) {
        if inner.created_any.load(Ordering::SeqCst) && inner.agents.lock().is_empty() {
            Self::terminate(inner);
        }
    }

    fn terminate(inner: &Arc<Inner>) {
        if inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("all agents exited, terminating");
        inner.parent.on_agent_thread_terminated();
        inner.terminated_notifier.notify();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::super::spawner::SimpleSpawner;
    use super::*;
    use crate::ipc::{sink_from_fd, source_from_fd};
    use crate::proc::pipe_pair;

    #[derive(Default)]
    struct TestParent {
        terminal_signals: Mutex<Vec<i32>>,
        terminated: AtomicUsize,
    }

    impl ManagerParent for TestParent {
        fn on_terminal_signal(&self, signo: i32) {
            self.terminal_signals.lock().push(signo);
        }
        fn on_agent_thread_terminated(&self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeAgent {
        core: Arc<WorkerCore>,
        agent_source: crate::ipc::IpcSource<pipe::Receiver>,
    }

    fn test_manager() -> (AgentManager, Arc<TestParent>) {
        let parent = Arc::new(TestParent::default());
        let manager = AgentManager::new(
            parent.clone(),
            ProcessMonitor::new(),
            Arc::new(SimpleSpawner),
            Arc::new(SimpleSpawner),
        );
        (manager, parent)
    }

    async fn fake_agent(manager: &AgentManager, pid: i32) -> FakeAgent {
        let (agent_read, worker_write) = pipe_pair().unwrap();
        let core = WorkerCore::new(
            pid,
            "agent-test",
            sink_from_fd(worker_write).unwrap(),
            manager.state_observer(),
        );
        manager.attach_worker(core.clone()).await;
        FakeAgent {
            core,
            agent_source: source_from_fd(agent_read).unwrap(),
        }
    }

    async fn settle(manager: &AgentManager) {
        manager.inner.queue.run(async {}).await;
    }

    #[tokio::test]
    async fn broadcast_is_cached_until_ready() {
        // Two agents: A still launched, B already ready. The broadcast goes
        // to B immediately and is cached for A until it becomes ready.
        let (manager, _parent) = test_manager();
        let mut agent_a = fake_agent(&manager, 101).await;
        let mut agent_b = fake_agent(&manager, 102).await;
        agent_b.core.transition_state(AgentState::Ready);
        settle(&manager).await;

        let message = Message::CpuStateChange {
            monotonic_delta_ns: 5,
            cpu: 0,
            online: true,
        };
        manager.broadcast_when_ready(message.clone()).await;

        assert_eq!(
            agent_b.agent_source.recv().await.unwrap().unwrap(),
            message
        );
        {
            let agents = manager.inner.agents.lock();
            assert_eq!(agents[&101].cached_messages.len(), 1);
            assert!(!agents[&101].is_ready);
        }

        agent_a.core.transition_state(AgentState::Ready);
        settle(&manager).await;
        assert_eq!(
            agent_a.agent_source.recv().await.unwrap().unwrap(),
            message
        );
        assert!(manager.inner.agents.lock()[&101]
            .cached_messages
            .is_empty());
    }

    #[tokio::test]
    async fn cached_messages_drain_in_broadcast_order() {
        let (manager, _parent) = test_manager();
        let mut agent = fake_agent(&manager, 201).await;

        for cpu in 0..5 {
            manager
                .broadcast_when_ready(Message::CpuStateChange {
                    monotonic_delta_ns: 0,
                    cpu,
                    online: true,
                })
                .await;
        }
        agent.core.transition_state(AgentState::Ready);
        settle(&manager).await;

        for cpu in 0..5 {
            match agent.agent_source.recv().await.unwrap().unwrap() {
                Message::CpuStateChange { cpu: got, .. } => assert_eq!(got, cpu),
                other => panic!("unexpected {}", other.name()),
            }
        }
    }

    #[tokio::test]
    async fn manager_terminates_when_the_last_agent_goes() {
        let (manager, parent) = test_manager();
        let agent = fake_agent(&manager, 301).await;

        agent.core.transition_state(AgentState::Ready);
        agent.core.set_message_loop_terminated();
        agent.core.on_sigchld();
        settle(&manager).await;

        tokio::time::timeout(Duration::from_secs(5), manager.wait_terminated())
            .await
            .unwrap();
        assert!(manager.is_terminated());
        assert_eq!(parent.terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_with_no_agents_terminates_immediately() {
        let (manager, parent) = test_manager();
        manager.shutdown();
        tokio::time::timeout(Duration::from_secs(5), manager.wait_terminated())
            .await
            .unwrap();
        assert_eq!(parent.terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_requests_reach_every_agent() {
        let (manager, _parent) = test_manager();
        let mut agent = fake_agent(&manager, 401).await;
        agent.core.transition_state(AgentState::Ready);
        settle(&manager).await;

        manager.shutdown();
        assert_eq!(
            agent.agent_source.recv().await.unwrap().unwrap(),
            Message::Shutdown
        );
        assert_eq!(agent.core.state(), AgentState::ShutdownRequested);
    }

    #[tokio::test]
    async fn signals_are_classified() {
        let (manager, parent) = test_manager();
        manager.on_signal(libc::SIGTERM);
        manager.on_signal(libc::SIGALRM);
        manager.on_signal(libc::SIGALRM);
        assert_eq!(parent.terminal_signals.lock().as_slice(), &[libc::SIGTERM]);
        assert_eq!(manager.inner.sigalrm_counter.load(Ordering::SeqCst), 2);
    }
}
