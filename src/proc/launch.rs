use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::raw::c_char;
use std::os::unix::prelude::OsStrExt;
use std::path::PathBuf;

use nix::unistd::Pid;

/// Launches a command in a suspended state, so that the pid is known and perf
/// events can be attached before the command starts executing.
///
/// The child forks immediately but blocks on a pipe before calling exec. The
/// parent releases it with `resume_and_exec`, which also learns (through a
/// second, CLOEXEC pipe) whether the exec itself succeeded.
pub struct SuspendedProcess {
    pid: Pid,
    send_end_of_resume_pipe: OwnedFd,
    recv_end_of_execerr_pipe: OwnedFd,
}

/// Everything that is applied inside the child between fork and exec.
#[derive(Default)]
pub struct LaunchOptions {
    /// Override for argv[0]; the command path is used when absent.
    pub argv0: Option<OsString>,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Drop to this uid/gid before exec.
    pub uid_gid: Option<(u32, u32)>,
    /// Replacements for fds 0/1/2.
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
    /// Additional fds to install at fixed numbers (IPC pipe ends). dup2
    /// clears CLOEXEC on the installed copy.
    pub extra_fds: Vec<(RawFd, OwnedFd)>,
    /// Extra environment variables (current environment is inherited).
    pub env: Vec<(OsString, OsString)>,
}

impl SuspendedProcess {
    const EXECERR_MSG_FOOTER: [u8; 4] = *b"NOEX";

    pub fn fork(
        command_name: &OsStr,
        command_args: &[OsString],
        options: LaunchOptions,
    ) -> io::Result<Self> {
        let LaunchOptions {
            argv0,
            cwd,
            uid_gid,
            stdin,
            stdout,
            stderr,
            extra_fds,
            env,
        } = options;

        let argv0 = argv0.as_deref().unwrap_or(command_name);
        let argv: Vec<CString> = std::iter::once(argv0)
            .chain(command_args.iter().map(|s| s.as_os_str()))
            .map(|os_str| {
                CString::new(os_str.as_bytes().to_vec())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul byte in argv"))
            })
            .collect::<io::Result<Vec<_>>>()?;
        // PATH resolution goes through the command name, not argv[0], so an
        // argv[0] override never changes which binary is executed.
        let command = CString::new(command_name.as_bytes().to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul byte in command"))?;
        let argv_ptrs: Vec<*const c_char> = argv
            .iter()
            .map(|c| c.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let envp = if env.is_empty() {
            None
        } else {
            let mut vars: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
            for (name, value) in env {
                vars.insert(name, value);
            }
            Some(construct_envp(vars)?)
        };

        let cwd = cwd
            .as_ref()
            .map(|p| {
                CString::new(p.as_os_str().as_bytes().to_vec())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul byte in cwd"))
            })
            .transpose()?;

        // Move fds that are about to be dup2'd clear of every target slot,
        // so that installing one fd cannot clobber another's source.
        let max_target = extra_fds.iter().map(|(t, _)| *t).max().unwrap_or(2);
        let extra_fds = extra_fds
            .into_iter()
            .map(|(target, fd)| {
                if fd.as_raw_fd() > max_target {
                    return Ok((target, fd));
                }
                let duped = unsafe {
                    libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, max_target + 1)
                };
                if duped < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok((target, unsafe {
                    std::os::fd::FromRawFd::from_raw_fd(duped)
                }))
            })
            .collect::<io::Result<Vec<(RawFd, OwnedFd)>>>()?;

        let (resume_rp, resume_sp) = super::pipe_pair()?;
        let (execerr_rp, execerr_sp) = super::pipe_pair()?;

        match unsafe { nix::unistd::fork() }.map_err(io::Error::from)? {
            nix::unistd::ForkResult::Child => {
                drop(resume_sp);
                drop(execerr_rp);
                Self::run_child(
                    resume_rp,
                    execerr_sp,
                    &command,
                    &argv_ptrs,
                    envp.as_ref(),
                    cwd.as_ref(),
                    stdin.as_ref(),
                    stdout.as_ref(),
                    stderr.as_ref(),
                    &extra_fds,
                    uid_gid,
                )
            }
            nix::unistd::ForkResult::Parent { child } => {
                drop(resume_rp);
                drop(execerr_sp);
                Ok(Self {
                    pid: child,
                    send_end_of_resume_pipe: resume_sp,
                    recv_end_of_execerr_pipe: execerr_rp,
                })
            }
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Release the child and wait for the exec verdict. On success the child
    /// is now running the target command; on failure the exec errno is
    /// returned and the child has already been reaped.
    pub fn resume_and_exec(self) -> io::Result<RunningProcess> {
        nix::unistd::write(&self.send_end_of_resume_pipe, &[0x42])?;
        drop(self.send_end_of_resume_pipe);

        loop {
            let mut bytes = [0; 8];
            match nix::unistd::read(&self.recv_end_of_execerr_pipe, &mut bytes) {
                Ok(0) => {
                    // Pipe closed by a successful exec (it is CLOEXEC).
                    break;
                }
                Ok(8) => {
                    let (errno, footer) = bytes.split_at(4);
                    if footer != Self::EXECERR_MSG_FOOTER {
                        let _ = nix::sys::wait::waitpid(self.pid, None);
                        return Err(io::Error::other("garbled exec error report"));
                    }
                    let errno = i32::from_be_bytes([errno[0], errno[1], errno[2], errno[3]]);
                    let _ = nix::sys::wait::waitpid(self.pid, None);
                    return Err(io::Error::from_raw_os_error(errno));
                }
                Ok(_) => {
                    // Pipe I/O below PIPE_BUF is atomic; a short read here
                    // means the protocol was violated.
                    let _ = nix::sys::wait::waitpid(self.pid, None);
                    return Err(io::Error::other("short read on the exec error pipe"));
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(io::Error::from(e)),
            }
        }

        Ok(RunningProcess { pid: self.pid })
    }

    /// Abandon the child without ever executing the command. Closing the
    /// resume pipe makes the child exit on its own; the SIGKILL covers a
    /// child that is not yet blocked on the pipe.
    pub fn abort(self) {
        let _ = nix::sys::signal::kill(self.pid, nix::sys::signal::Signal::SIGKILL);
        drop(self.send_end_of_resume_pipe);
        drop(self.recv_end_of_execerr_pipe);
        let _ = nix::sys::wait::waitpid(self.pid, None);
    }

    /// Runs in the forked child; never returns. Only async-signal-safe calls
    /// from here on.
    #[allow(clippy::too_many_arguments)]
    fn run_child(
        recv_end_of_resume_pipe: OwnedFd,
        send_end_of_execerr_pipe: OwnedFd,
        command: &CString,
        argv: &[*const c_char],
        envp: Option<&CStringArray>,
        cwd: Option<&CString>,
        stdin: Option<&OwnedFd>,
        stdout: Option<&OwnedFd>,
        stderr: Option<&OwnedFd>,
        extra_fds: &[(RawFd, OwnedFd)],
        uid_gid: Option<(u32, u32)>,
    ) -> ! {
        unsafe {
            if let Some(fd) = stdin {
                libc::dup2(fd.as_raw_fd(), 0);
            }
            if let Some(fd) = stdout {
                libc::dup2(fd.as_raw_fd(), 1);
            }
            if let Some(fd) = stderr {
                libc::dup2(fd.as_raw_fd(), 2);
            }
            for (target, fd) in extra_fds {
                if libc::dup2(fd.as_raw_fd(), *target) < 0 {
                    libc::_exit(127);
                }
            }
            if let Some(cwd) = cwd {
                if libc::chdir(cwd.as_ptr()) < 0 {
                    libc::_exit(127);
                }
            }
            if let Some((uid, gid)) = uid_gid {
                if libc::setgid(gid) < 0 || libc::setuid(uid) < 0 {
                    libc::_exit(127);
                }
            }
        }

        loop {
            let mut buf = [0];
            match nix::unistd::read(&recv_end_of_resume_pipe, &mut buf) {
                Ok(0) => {
                    // The parent closed the pipe without releasing us: it hit
                    // a problem while setting up. Exit quietly.
                    unsafe { libc::_exit(0) }
                }
                Ok(_) => {
                    unsafe {
                        if let Some(envp) = envp {
                            libc::execvpe(command.as_ptr(), argv.as_ptr(), envp.as_ptr());
                        } else {
                            libc::execvp(command.as_ptr(), argv.as_ptr());
                        }
                    }

                    // exec failed; report errno through the pipe. Writes of
                    // up to PIPE_BUF bytes are atomic.
                    let errno = nix::errno::Errno::last_raw().to_be_bytes();
                    let bytes = [
                        errno[0],
                        errno[1],
                        errno[2],
                        errno[3],
                        Self::EXECERR_MSG_FOOTER[0],
                        Self::EXECERR_MSG_FOOTER[1],
                        Self::EXECERR_MSG_FOOTER[2],
                        Self::EXECERR_MSG_FOOTER[3],
                    ];
                    let _ = nix::unistd::write(&send_end_of_execerr_pipe, &bytes);
                    unsafe { libc::_exit(1) }
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(_) => unsafe { libc::_exit(1) },
            }
        }
    }
}

/// A launched child that has passed its exec.
#[derive(Debug)]
pub struct RunningProcess {
    pid: Pid,
}

impl RunningProcess {
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Blocking wait for the child to exit. Only used when the caller owns
    /// the reaping of this pid (the process monitor must not also track it).
    pub fn wait(self) -> Result<nix::sys::wait::WaitStatus, nix::errno::Errno> {
        nix::sys::wait::waitpid(self.pid, None)
    }
}

// Owns the strings referenced by a C-style environment array.
struct CStringArray {
    _items: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl CStringArray {
    fn as_ptr(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }
}

fn construct_envp(env: BTreeMap<OsString, OsString>) -> io::Result<CStringArray> {
    let mut items = Vec::with_capacity(env.len());
    for (mut name, value) in env {
        use std::os::unix::ffi::OsStringExt;
        name.reserve_exact(value.len() + 2);
        name.push("=");
        name.push(&value);
        items.push(CString::new(name.into_vec()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "nul byte in environment")
        })?);
    }
    let ptrs = items
        .iter()
        .map(|item| item.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    Ok(CStringArray {
        _items: items,
        ptrs,
    })
}
