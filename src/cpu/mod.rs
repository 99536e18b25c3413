//! CPU hot-plug monitoring: raw online/offline event producers (netlink
//! uevents, sysfs polling) and the coalescing monitor that collapses event
//! bursts into one pending edge per CPU.

mod coalesce;
mod sysfs;
mod uevent;

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

pub use coalesce::CoalescingCpuMonitor;
pub use sysfs::{find_all_cpu_paths, PollingCpuMonitor};
pub use uevent::UeventCpuMonitor;

/// One raw hot-plug edge. `cpu_no == -1` is the sentinel delivered to
/// cancelled or stopped readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuEvent {
    pub cpu_no: i32,
    pub online: bool,
}

pub const STOP_SENTINEL: CpuEvent = CpuEvent {
    cpu_no: -1,
    online: false,
};

/// Either raw monitor; the capture orchestrator picks whichever is
/// available.
pub enum RawCpuMonitor {
    Uevent(UeventCpuMonitor),
    Polling(PollingCpuMonitor),
}

impl RawCpuMonitor {
    pub async fn receive_one(&self) -> CpuEvent {
        match self {
            RawCpuMonitor::Uevent(monitor) => monitor.receive_one().await,
            RawCpuMonitor::Polling(monitor) => monitor.receive_one().await,
        }
    }

    pub fn stop(&self) {
        match self {
            RawCpuMonitor::Uevent(monitor) => monitor.stop(),
            RawCpuMonitor::Polling(monitor) => monitor.stop(),
        }
    }
}

struct QueueState {
    pending_events: VecDeque<CpuEvent>,
    pending_handler: Option<oneshot::Sender<CpuEvent>>,
    terminated: bool,
}

/// Shared plumbing of the raw monitors: a FIFO of produced events and at
/// most one pending reader, cancelled with the sentinel when displaced.
struct EventQueue {
    state: Mutex<QueueState>,
}

impl EventQueue {
    fn new() -> Self {
        EventQueue {
            state: Mutex::new(QueueState {
                pending_events: VecDeque::new(),
                pending_handler: None,
                terminated: false,
            }),
        }
    }

    fn enqueue(&self, event: CpuEvent) {
        let handler = {
            let mut state = self.state.lock();
            match state.pending_handler.take() {
                Some(handler) => Some(handler),
                None => {
                    state.pending_events.push_back(event);
                    None
                }
            }
        };
        if let Some(handler) = handler {
            let _ = handler.send(event);
        }
    }

    async fn receive_one(&self) -> CpuEvent {
        let rx = {
            let mut state = self.state.lock();
            // A newer reader displaces any previous one.
            if let Some(previous) = state.pending_handler.take() {
                let _ = previous.send(STOP_SENTINEL);
            }
            if let Some(event) = state.pending_events.pop_front() {
                return event;
            }
            if state.terminated {
                return STOP_SENTINEL;
            }
            let (tx, rx) = oneshot::channel();
            state.pending_handler = Some(tx);
            rx
        };
        rx.await.unwrap_or(STOP_SENTINEL)
    }

    /// Mark terminated; returns true on the first call.
    fn terminate(&self) -> bool {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.terminated, true)
        };
        if first {
            self.enqueue(STOP_SENTINEL);
        }
        first
    }

    fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }
}
