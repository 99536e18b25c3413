use std::io;
use std::os::fd::OwnedFd;

use nix::fcntl::OFlag;

/// A CLOEXEC pipe: `(read end, write end)`. Ends that must survive an exec
/// are re-established on specific child fds with dup2, which clears the
/// close-on-exec flag on the duplicate.
pub fn pipe_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)
}
