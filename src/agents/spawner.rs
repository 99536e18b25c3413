use std::ffi::OsString;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::path::PathBuf;

use parking_lot::Mutex;
use tokio::net::unix::pipe;

use crate::android;
use crate::ipc::{sink_from_fd, source_from_fd, IpcSink, IpcSource};
use crate::proc::{pipe_pair, LaunchOptions, SuspendedProcess};
use crate::runtime::{consume_all_lines, spawn_logged};

pub const AGENT_ID_EXTERNAL: &str = "agent-external";
pub const AGENT_ID_ANNOTATION: &str = "agent-annotation";
pub const AGENT_ID_PERFETTO: &str = "agent-perfetto";
pub const AGENT_ID_PERF: &str = "agent-perf";

/// The fds the agent child finds its IPC channel on.
pub const AGENT_IPC_READ_FD: RawFd = 3;
pub const AGENT_IPC_WRITE_FD: RawFd = 4;

/// Whether an agent must run in the (privileged) shell session or inside the
/// target app's (unprivileged) sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    High,
    Low,
}

/// What a spawner hands back: the forked-but-not-yet-exec'd child plus the
/// shell-side ends of its pipes.
pub struct SpawnedAgent {
    pub process: SuspendedProcess,
    pub ipc_read: OwnedFd,
    pub ipc_write: OwnedFd,
    pub log_read: OwnedFd,
}

/// Spawns an agent helper process.
pub trait AgentSpawner: Send + Sync {
    fn spawn_agent_process(&self, agent_id: &str) -> io::Result<SpawnedAgent>;
}

fn fork_agent(
    command: OsString,
    args: Vec<OsString>,
) -> io::Result<SpawnedAgent> {
    // shell -> agent on child fd 3, agent -> shell on child fd 4, child
    // stderr feeds the log reader.
    let (child_ipc_read, shell_ipc_write) = pipe_pair()?;
    let (shell_ipc_read, child_ipc_write) = pipe_pair()?;
    let (shell_log_read, child_log_write) = pipe_pair()?;

    let process = SuspendedProcess::fork(
        &command,
        &args,
        LaunchOptions {
            stderr: Some(child_log_write),
            extra_fds: vec![
                (AGENT_IPC_READ_FD, child_ipc_read),
                (AGENT_IPC_WRITE_FD, child_ipc_write),
            ],
            ..Default::default()
        },
    )?;

    Ok(SpawnedAgent {
        process,
        ipc_read: shell_ipc_read,
        ipc_write: shell_ipc_write,
        log_read: shell_log_read,
    })
}

/// Forks/execs the current executable with the agent id as its only
/// argument, inheriting the current environment.
pub struct SimpleSpawner;

impl AgentSpawner for SimpleSpawner {
    fn spawn_agent_process(&self, agent_id: &str) -> io::Result<SpawnedAgent> {
        let exe = std::env::current_exe()?;
        fork_agent(exe.into_os_string(), vec![OsString::from(agent_id)])
    }
}

/// Copies the current executable into the target package's data directory
/// with `run-as` and launches the agent inside the package sandbox. The
/// copied binary is removed again when the spawner is dropped.
pub struct AndroidPackageSpawner {
    package: String,
    remote_exe: Mutex<Option<String>>,
}

impl AndroidPackageSpawner {
    pub fn new(package: String) -> Self {
        AndroidPackageSpawner {
            package,
            remote_exe: Mutex::new(None),
        }
    }

    fn ensure_remote_exe(&self) -> io::Result<String> {
        let mut guard = self.remote_exe.lock();
        if let Some(path) = guard.as_ref() {
            return Ok(path.clone());
        }

        let local_exe = std::env::current_exe()?;
        let local_exe = local_exe
            .to_str()
            .ok_or_else(|| io::Error::other("executable path is not UTF-8"))?
            .to_owned();
        let remote = format!("/data/data/{}/capshell", self.package);

        android::run_as(&self.package, &["cp", "-f", &local_exe, &remote])?;
        android::run_as(&self.package, &["chmod", "700", &remote])?;

        *guard = Some(remote.clone());
        Ok(remote)
    }
}

impl AgentSpawner for AndroidPackageSpawner {
    fn spawn_agent_process(&self, agent_id: &str) -> io::Result<SpawnedAgent> {
        let remote_exe = self.ensure_remote_exe()?;
        fork_agent(
            OsString::from("run-as"),
            vec![
                OsString::from(&self.package),
                OsString::from(remote_exe),
                OsString::from(agent_id),
            ],
        )
    }
}

impl Drop for AndroidPackageSpawner {
    fn drop(&mut self) {
        if let Some(remote) = self.remote_exe.get_mut().take() {
            if let Err(e) = android::run_as(&self.package, &["rm", "-f", &remote]) {
                log::warn!("failed to remove {remote}: {e}");
            }
        }
    }
}

/// An agent process with its channel ends wrapped for async use, ready to be
/// handed to a worker. The child is still suspended; the worker releases it
/// once its message loop is wired up.
pub struct AgentProcess {
    pub pid: i32,
    pub process: SuspendedProcess,
    pub source: IpcSource<pipe::Receiver>,
    pub sink: IpcSink,
}

/// Spawn an agent and attach the default log consumer, which re-logs each
/// stderr line under the agent's pid.
pub fn spawn_agent(spawner: &dyn AgentSpawner, agent_id: &'static str) -> io::Result<AgentProcess> {
    let spawned = spawner.spawn_agent_process(agent_id)?;
    let pid = spawned.process.pid();

    let source = source_from_fd(spawned.ipc_read)?;
    let sink = sink_from_fd(spawned.ipc_write)?;

    let log_read = log_reader_from_fd(spawned.log_read)?;
    spawn_logged("agent log reader", async move {
        consume_all_lines(log_read, |line| {
            log::info!("[{agent_id}:{pid}] {}", String::from_utf8_lossy(line));
        })
        .await
    });

    Ok(AgentProcess {
        pid,
        process: spawned.process,
        source,
        sink,
    })
}

fn log_reader_from_fd(fd: OwnedFd) -> io::Result<pipe::Receiver> {
    use std::os::fd::AsRawFd;
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    pipe::Receiver::from_owned_fd(fd)
}
