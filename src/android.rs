//! Thin wrapper around `run-as`, which the agent spawner uses to place and
//! launch the agent binary inside an app sandbox.

use std::ffi::OsStr;
use std::io;
use std::process::Command;

/// Run `run-as <package> <args...>` to completion. Non-zero exit becomes an
/// error carrying the command's stderr.
pub fn run_as<S: AsRef<OsStr>>(package: &str, args: &[S]) -> io::Result<Vec<u8>> {
    let output = Command::new("run-as").arg(package).args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(io::Error::other(format!(
            "run-as {} exited with {}: {}",
            package,
            output.status,
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}
