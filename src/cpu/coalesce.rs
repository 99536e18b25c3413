use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{CpuEvent, STOP_SENTINEL};

/// The compound per-CPU state: the latched online/offline status plus any
/// pending transition that a consumer has not picked up yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    InitialUnknown,
    InitialPendingOffline,
    InitialPendingOnline,
    Offline,
    Online,
    PendingOffline,
    PendingOnline,
    PendingOfflineOnline,
    PendingOnlineOffline,
}

/// Next state for a raw on/off edge.
fn transition(current: State, online: bool) -> State {
    match current {
        State::InitialUnknown | State::InitialPendingOffline | State::InitialPendingOnline => {
            if online {
                State::InitialPendingOnline
            } else {
                State::InitialPendingOffline
            }
        }
        State::Online => {
            if online {
                State::Online
            } else {
                State::PendingOffline
            }
        }
        State::Offline => {
            if online {
                State::PendingOnline
            } else {
                State::Offline
            }
        }
        State::PendingOnline => {
            if online {
                State::PendingOnline
            } else {
                State::PendingOnlineOffline
            }
        }
        State::PendingOffline => {
            if online {
                State::PendingOfflineOnline
            } else {
                State::PendingOffline
            }
        }
        State::PendingOnlineOffline => {
            if online {
                State::PendingOnline
            } else {
                State::PendingOnlineOffline
            }
        }
        State::PendingOfflineOnline => {
            if online {
                State::PendingOfflineOnline
            } else {
                State::PendingOffline
            }
        }
    }
}

/// States for which an event will be generated to the consumer.
fn is_pending(state: State) -> bool {
    !matches!(
        state,
        State::InitialUnknown | State::Online | State::Offline
    )
}

/// The (new state, consumer event) pair for consuming one pending edge.
/// Emits the *older* edge first and keeps the newer one pending, so a quick
/// off-on or on-off pair is observed in order, while long same-state bursts
/// collapse.
fn consume_pending(current: State) -> (State, bool) {
    match current {
        State::InitialPendingOnline | State::PendingOnline => (State::Online, true),
        State::InitialPendingOffline | State::PendingOffline => (State::Offline, false),
        State::PendingOnlineOffline => (State::PendingOffline, true),
        State::PendingOfflineOnline => (State::PendingOnline, false),
        State::InitialUnknown | State::Online | State::Offline => {
            unreachable!("not a pending state")
        }
    }
}

struct PerCoreState {
    pending_handler: Option<oneshot::Sender<CpuEvent>>,
    current_state: State,
    transition_pending: bool,
}

impl Default for PerCoreState {
    fn default() -> Self {
        PerCoreState {
            pending_handler: None,
            current_state: State::InitialUnknown,
            transition_pending: false,
        }
    }
}

struct MonitorState {
    cores: Vec<PerCoreState>,
    terminated: bool,
}

/// Coalesces raw CPU hot-plug events so that each consumer sees at most one
/// pending before/after edge per CPU per read, however bursty the raw
/// producer is. One pending read per CPU; a second read cancels the first
/// with the sentinel.
#[derive(Clone)]
pub struct CoalescingCpuMonitor {
    state: Arc<Mutex<MonitorState>>,
}

impl Default for CoalescingCpuMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CoalescingCpuMonitor {
    pub fn new() -> Self {
        CoalescingCpuMonitor {
            state: Arc::new(Mutex::new(MonitorState {
                cores: Vec::new(),
                terminated: false,
            })),
        }
    }

    /// Feed one raw event into the monitor. Negative cpu numbers are
    /// ignored.
    pub fn update_state(&self, cpu_no: i32, online: bool) {
        if cpu_no < 0 {
            return;
        }

        let handler_and_event = {
            let mut state = self.state.lock();
            if state.terminated {
                return;
            }
            let core = get_or_create(&mut state.cores, cpu_no);

            let current = core.current_state;
            let new_state = transition(current, online);
            let was_pending = is_pending(current);
            let now_pending = is_pending(new_state);

            log::trace!(
                "cpu {cpu_no}: coalesced state {current:?} -> {new_state:?} ({was_pending}/{now_pending})"
            );
            core.current_state = new_state;

            if now_pending && !was_pending {
                core.transition_pending = true;
                core.pending_handler
                    .take()
                    .map(|handler| (handler, find_next_pending_event(cpu_no, core)))
            } else {
                None
            }
        };

        if let Some((handler, event)) = handler_and_event {
            let _ = handler.send(event);
        }
    }

    /// Receive the next coalesced edge for `cpu_no`.
    pub async fn receive_one(&self, cpu_no: i32) -> CpuEvent {
        assert!(cpu_no >= 0, "invalid cpu number");

        let rx = {
            let mut state = self.state.lock();
            let terminated = state.terminated;
            let core = get_or_create(&mut state.cores, cpu_no);

            // Displace any earlier reader.
            if let Some(previous) = core.pending_handler.take() {
                let _ = previous.send(STOP_SENTINEL);
            }

            if !core.transition_pending {
                if terminated {
                    return STOP_SENTINEL;
                }
                let (tx, rx) = oneshot::channel();
                core.pending_handler = Some(tx);
                rx
            } else {
                return find_next_pending_event(cpu_no, core);
            }
        };
        rx.await.unwrap_or(STOP_SENTINEL)
    }

    /// Stop the monitor and cancel all pending reads.
    pub fn stop(&self) {
        let handlers: Vec<oneshot::Sender<CpuEvent>> = {
            let mut state = self.state.lock();
            state.terminated = true;
            state
                .cores
                .iter_mut()
                .filter_map(|core| core.pending_handler.take())
                .collect()
        };
        for handler in handlers {
            let _ = handler.send(STOP_SENTINEL);
        }
    }

    /// Whether activating/deactivating per-core events for the given edge is
    /// consistent with the latched state.
    pub fn is_safe_to_bring_online_or_offline(&self, cpu_no: i32, online: bool) -> bool {
        let state = self.state.lock();
        let Some(core) = state.cores.get(cpu_no as usize) else {
            return false;
        };
        match core.current_state {
            State::InitialPendingOnline
            | State::PendingOfflineOnline
            | State::PendingOnline
            | State::Online => online,
            State::InitialPendingOffline
            | State::PendingOnlineOffline
            | State::PendingOffline
            | State::Offline => !online,
            State::InitialUnknown => false,
        }
    }
}

fn get_or_create(cores: &mut Vec<PerCoreState>, cpu_no: i32) -> &mut PerCoreState {
    let index = cpu_no as usize;
    if index >= cores.len() {
        cores.resize_with(index + 1, PerCoreState::default);
    }
    &mut cores[index]
}

fn find_next_pending_event(cpu_no: i32, core: &mut PerCoreState) -> CpuEvent {
    assert!(core.transition_pending, "no pending transition to consume");
    let current = core.current_state;
    assert!(is_pending(current), "unexpected core state");

    let (new_state, online) = consume_pending(current);
    core.current_state = new_state;
    core.transition_pending = is_pending(new_state);

    log::trace!("cpu {cpu_no}: consuming coalesced edge {current:?} -> {new_state:?} ({online})");
    CpuEvent { cpu_no, online }
}
