use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{CpuEvent, EventQueue};
use crate::runtime::spawn_logged;

// Short interval while any core is offline, to catch the re-online quickly;
// longer once everything is up.
const SHORT_POLL_INTERVAL: Duration = Duration::from_micros(200);
const LONG_POLL_INTERVAL: Duration = Duration::from_micros(1000);

/// Find all the `cpu<N>/online` sysfs paths.
pub fn find_all_cpu_paths() -> Vec<(PathBuf, i32)> {
    find_cpu_paths_in(Path::new("/sys/devices/system/cpu"))
}

fn find_cpu_paths_in(root: &Path) -> Vec<(PathBuf, i32)> {
    let mut result = Vec::new();
    let Ok(entries) = std::fs::read_dir(root) else {
        return result;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(number) = name.strip_prefix("cpu") else {
            continue;
        };
        let Ok(cpu_no) = number.parse::<i32>() else {
            continue;
        };
        result.push((entry.path().join("online"), cpu_no));
    }
    result.sort_by_key(|(_, cpu_no)| *cpu_no);
    result
}

struct PollState {
    online_cpus: BTreeSet<i32>,
    first_pass: bool,
}

struct Inner {
    monitor_paths: Vec<(PathBuf, i32)>,
    queue: EventQueue,
    poll_state: Mutex<PollState>,
    cancel: CancellationToken,
}

/// Monitors CPU online state by polling the `cpu<N>/online` sysfs files.
/// Emits an event for every change, and for every CPU on the first pass.
#[derive(Clone)]
pub struct PollingCpuMonitor {
    inner: Arc<Inner>,
}

impl PollingCpuMonitor {
    pub fn new(monitor_paths: Vec<(PathBuf, i32)>) -> Self {
        PollingCpuMonitor {
            inner: Arc::new(Inner {
                monitor_paths,
                queue: EventQueue::new(),
                poll_state: Mutex::new(PollState {
                    online_cpus: BTreeSet::new(),
                    first_pass: true,
                }),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Start the polling loop.
    pub fn start(&self) {
        let inner = self.inner.clone();
        spawn_logged("raw cpu event monitor", async move {
            loop {
                if inner.queue.is_terminated() {
                    break;
                }
                let any_offline = inner.poll_once();
                let interval = if any_offline {
                    SHORT_POLL_INTERVAL
                } else {
                    LONG_POLL_INTERVAL
                };
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = inner.cancel.cancelled() => {
                        log::debug!("polling CPU monitor is now terminated");
                        inner.queue.terminate();
                        break;
                    }
                }
            }
            Ok::<(), std::io::Error>(())
        });
    }

    pub async fn receive_one(&self) -> CpuEvent {
        self.inner.queue.receive_one().await
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.queue.terminate();
    }
}

impl Inner {
    /// Read every monitored file once; returns true if any CPU is offline.
    fn poll_once(&self) -> bool {
        let mut any_offline = false;
        for (path, cpu_no) in &self.monitor_paths {
            let Ok(contents) = std::fs::read_to_string(path) else {
                continue;
            };
            let Ok(value) = contents.trim().parse::<u32>() else {
                continue;
            };
            let is_online = value != 0;
            any_offline |= !is_online;
            self.process_one(*cpu_no, is_online);
        }
        self.poll_state.lock().first_pass = false;
        any_offline
    }

    fn process_one(&self, cpu_no: i32, online: bool) {
        let changed = {
            let mut state = self.poll_state.lock();
            let changed = if online {
                state.online_cpus.insert(cpu_no)
            } else {
                state.online_cpus.remove(&cpu_no)
            };
            changed || state.first_pass
        };
        if changed {
            self.queue.enqueue(CpuEvent { cpu_no, online });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::STOP_SENTINEL;
    use super::*;

    fn write_cpu_dir(dir: &Path, cpu_no: i32, online: bool) -> PathBuf {
        let cpu_dir = dir.join(format!("cpu{cpu_no}"));
        std::fs::create_dir_all(&cpu_dir).unwrap();
        let path = cpu_dir.join("online");
        std::fs::write(&path, if online { "1\n" } else { "0\n" }).unwrap();
        path
    }

    #[test]
    fn cpu_paths_are_discovered_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_cpu_dir(dir.path(), 2, true);
        write_cpu_dir(dir.path(), 0, true);
        write_cpu_dir(dir.path(), 10, false);
        std::fs::create_dir_all(dir.path().join("cpufreq")).unwrap();

        let paths = find_cpu_paths_in(dir.path());
        let cpu_nos: Vec<i32> = paths.iter().map(|(_, n)| *n).collect();
        assert_eq!(cpu_nos, vec![0, 2, 10]);
    }

    #[tokio::test]
    async fn first_pass_reports_every_cpu() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            (write_cpu_dir(dir.path(), 0, true), 0),
            (write_cpu_dir(dir.path(), 1, false), 1),
        ];
        let monitor = PollingCpuMonitor::new(paths);
        monitor.start();

        let mut events = vec![monitor.receive_one().await, monitor.receive_one().await];
        events.sort_by_key(|e| e.cpu_no);
        assert_eq!(
            events,
            vec![
                CpuEvent {
                    cpu_no: 0,
                    online: true
                },
                CpuEvent {
                    cpu_no: 1,
                    online: false
                },
            ]
        );
        monitor.stop();
    }

    #[tokio::test]
    async fn changes_are_reported_on_later_passes() {
        let dir = tempfile::tempdir().unwrap();
        let online_path = write_cpu_dir(dir.path(), 0, true);
        let monitor = PollingCpuMonitor::new(vec![(online_path.clone(), 0)]);
        monitor.start();
        assert_eq!(
            monitor.receive_one().await,
            CpuEvent {
                cpu_no: 0,
                online: true
            }
        );

        std::fs::write(&online_path, "0\n").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), monitor.receive_one())
            .await
            .unwrap();
        assert_eq!(
            event,
            CpuEvent {
                cpu_no: 0,
                online: false
            }
        );
        monitor.stop();
    }

    #[tokio::test]
    async fn stop_enqueues_the_sentinel() {
        let monitor = PollingCpuMonitor::new(Vec::new());
        monitor.start();
        monitor.stop();
        assert_eq!(monitor.receive_one().await, STOP_SENTINEL);
    }
}
