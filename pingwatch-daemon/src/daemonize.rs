//! Daemonization and PID-file handling (spec §6): fork, detach from the
//! controlling terminal, and record the child's PID, using `nix::unistd`
//! since `std` exposes no `fork(2)`.

use anyhow::{Context, Result};
use nix::unistd::{self, ForkResult};
use std::fs;
use std::io::Write;
use std::os::unix::io::AsRawFd;

/// Forks, lets the parent exit immediately, and detaches the child into
/// its own session so it survives the terminal closing. The child's PID
/// (which, after `fork`, is also the session leader's PID) is written to
/// `pid_file` once daemonization completes.
pub fn daemonize(pid_file: &str) -> Result<()> {
    match unsafe { unistd::fork() }.context("fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    unistd::setsid().context("setsid failed")?;
    redirect_standard_fds().context("redirecting standard file descriptors to /dev/null")?;
    write_pid_file(pid_file, std::process::id())
}

fn redirect_standard_fds() -> Result<()> {
    let devnull = fs::OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    for target in [0, 1, 2] {
        unistd::dup2(fd, target)?;
    }
    Ok(())
}

/// Writes the PID file: one decimal PID followed by a newline (spec §6).
pub fn write_pid_file(path: &str, pid: u32) -> Result<()> {
    let mut f = fs::File::create(path).with_context(|| format!("creating pid file {:?}", path))?;
    writeln!(f, "{}", pid).with_context(|| format!("writing pid file {:?}", path))
}

/// Truncates (rather than removes) the PID file on a clean exit, per
/// spec §6: "truncated (not necessarily removed) on exit". A missing file
/// is not an error — nothing to truncate.
pub fn truncate_pid_file(path: &str) -> Result<()> {
    match fs::OpenOptions::new().write(true).truncate(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("truncating pid file {:?} on exit", path)),
    }
}
