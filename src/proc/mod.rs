//! Child process plumbing: CLOEXEC pipe helpers, fork-now-exec-later
//! launching, and the SIGCHLD-driven process monitor.

mod launch;
mod monitor;
mod pipes;

pub use launch::{LaunchOptions, RunningProcess, SuspendedProcess};
pub use monitor::{MonitorHandle, ProcessEvent, ProcessEventState, ProcessMonitor};
pub use pipes::pipe_pair;
