use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;

use super::{CpuEvent, EventQueue};
use crate::runtime::spawn_logged;

const RECV_BUF_SIZE: usize = 8 * 1024;

/// Parse one kernel uevent datagram
/// (`ACTION@DEVPATH\0KEY=VALUE\0...`) into a CPU hot-plug event, if it is
/// one.
fn parse_uevent(datagram: &[u8]) -> Option<CpuEvent> {
    let mut action: Option<&str> = None;
    let mut devpath: Option<&str> = None;
    let mut subsystem: Option<&str> = None;

    for segment in datagram.split(|&b| b == 0) {
        let Ok(segment) = std::str::from_utf8(segment) else {
            continue;
        };
        if let Some(value) = segment.strip_prefix("ACTION=") {
            action = Some(value);
        } else if let Some(value) = segment.strip_prefix("DEVPATH=") {
            devpath = Some(value);
        } else if let Some(value) = segment.strip_prefix("SUBSYSTEM=") {
            subsystem = Some(value);
        }
    }

    if subsystem? != "cpu" {
        return None;
    }
    let online = match action? {
        "add" | "online" => true,
        "remove" | "offline" => false,
        _ => return None,
    };
    let cpu_no = devpath?
        .rsplit('/')
        .next()?
        .strip_prefix("cpu")?
        .parse::<i32>()
        .ok()?;

    Some(CpuEvent { cpu_no, online })
}

fn open_uevent_socket() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            libc::NETLINK_KOBJECT_UEVENT,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_pid = 0;
    addr.nl_groups = 1;
    let ok = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if ok < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

struct Inner {
    queue: EventQueue,
    cancel: CancellationToken,
}

/// Monitors CPU online state via the kernel object uevent netlink socket.
/// `open` fails where the socket is unavailable (no privilege, no netlink);
/// the caller then falls back to the polling monitor.
#[derive(Clone)]
pub struct UeventCpuMonitor {
    inner: Arc<Inner>,
}

impl UeventCpuMonitor {
    pub fn open() -> io::Result<Self> {
        let fd = open_uevent_socket()?;
        let monitor = UeventCpuMonitor {
            inner: Arc::new(Inner {
                queue: EventQueue::new(),
                cancel: CancellationToken::new(),
            }),
        };

        let inner = monitor.inner.clone();
        spawn_logged("uevent cpu monitor", async move {
            let async_fd = AsyncFd::new(fd)?;
            let mut buf = vec![0u8; RECV_BUF_SIZE];
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => {
                        log::debug!("uevent CPU monitor is now terminated");
                        inner.queue.terminate();
                        return Ok(());
                    }
                    guard = async_fd.readable() => {
                        let mut guard = guard?;
                        let result = guard.try_io(|fd| {
                            let n = unsafe {
                                libc::recv(
                                    fd.get_ref().as_raw_fd(),
                                    buf.as_mut_ptr().cast(),
                                    buf.len(),
                                    0,
                                )
                            };
                            if n < 0 {
                                Err(io::Error::last_os_error())
                            } else {
                                Ok(n as usize)
                            }
                        });
                        match result {
                            Ok(Ok(n)) => {
                                if let Some(event) = parse_uevent(&buf[..n]) {
                                    inner.queue.enqueue(event);
                                }
                            }
                            Ok(Err(e)) => {
                                log::debug!("uevent socket read failed: {e}");
                                inner.queue.terminate();
                                return Err(e);
                            }
                            // Spurious readiness; wait again.
                            Err(_would_block) => continue,
                        }
                    }
                }
            }
        });

        Ok(monitor)
    }

    pub async fn receive_one(&self) -> CpuEvent {
        self.inner.queue.receive_one().await
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.queue.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(parts: &[&str]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for part in parts {
            bytes.extend_from_slice(part.as_bytes());
            bytes.push(0);
        }
        bytes
    }

    #[test]
    fn online_and_offline_actions_parse() {
        let event = parse_uevent(&datagram(&[
            "online@/devices/system/cpu/cpu2",
            "ACTION=online",
            "DEVPATH=/devices/system/cpu/cpu2",
            "SUBSYSTEM=cpu",
            "SEQNUM=1234",
        ]))
        .unwrap();
        assert_eq!(
            event,
            CpuEvent {
                cpu_no: 2,
                online: true
            }
        );

        let event = parse_uevent(&datagram(&[
            "offline@/devices/system/cpu/cpu11",
            "ACTION=offline",
            "DEVPATH=/devices/system/cpu/cpu11",
            "SUBSYSTEM=cpu",
        ]))
        .unwrap();
        assert_eq!(
            event,
            CpuEvent {
                cpu_no: 11,
                online: false
            }
        );
    }

    #[test]
    fn add_and_remove_map_to_online_state() {
        assert_eq!(
            parse_uevent(&datagram(&[
                "ACTION=add",
                "DEVPATH=/devices/system/cpu/cpu0",
                "SUBSYSTEM=cpu",
            ]))
            .unwrap()
            .online,
            true
        );
        assert_eq!(
            parse_uevent(&datagram(&[
                "ACTION=remove",
                "DEVPATH=/devices/system/cpu/cpu0",
                "SUBSYSTEM=cpu",
            ]))
            .unwrap()
            .online,
            false
        );
    }

    #[test]
    fn non_cpu_subsystems_are_ignored() {
        assert_eq!(
            parse_uevent(&datagram(&[
                "ACTION=online",
                "DEVPATH=/devices/foo/bar",
                "SUBSYSTEM=block",
            ])),
            None
        );
        assert_eq!(
            parse_uevent(&datagram(&["ACTION=bind", "SUBSYSTEM=cpu"])),
            None
        );
        assert_eq!(parse_uevent(b"garbage"), None);
    }

    #[test]
    fn devpath_must_name_a_cpu() {
        assert_eq!(
            parse_uevent(&datagram(&[
                "ACTION=online",
                "DEVPATH=/devices/system/cpu/cpufreq",
                "SUBSYSTEM=cpu",
            ])),
            None
        );
    }
}
