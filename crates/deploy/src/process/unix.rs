use std::io;

use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tokio::process::Command;

use super::{CommandLine, ProcessControl};

/// Runs the child as leader of a fresh process group and signals the whole group.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcessGroup;

impl ProcessControl for UnixProcessGroup {
    fn command(&self, line: &CommandLine) -> Command {
        let mut cmd = Command::new(&line.program);
        cmd.args(&line.args).process_group(0);
        cmd
    }

    fn signal_graceful(&self, pid: u32) -> io::Result<()> {
        signal_group(pid, Signal::SIGTERM)
    }

    fn force_kill(&self, pid: u32) -> io::Result<()> {
        signal_group(pid, Signal::SIGKILL)
    }
}

/// Send `signal` to the process group led by `pid`. A group that no longer exists is not an
/// error.
fn signal_group(pid: u32, signal: Signal) -> io::Result<()> {
    let pgid = i32::try_from(pid).map_err(io::Error::other)?;
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_group_is_not_an_error() {
        // Far above any default pid_max.
        assert!(UnixProcessGroup.force_kill(4_000_000).is_ok());
    }

    #[test]
    fn test_pid_out_of_range_is_an_error() {
        assert!(UnixProcessGroup.signal_graceful(u32::MAX).is_err());
    }
}
