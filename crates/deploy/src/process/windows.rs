use std::{io, process::Stdio};

use tokio::process::Command;

use super::{CommandLine, ProcessControl};

/// `CREATE_NEW_PROCESS_GROUP` from the Win32 process creation flags.
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Runs the child through `cmd /C` in a new process group and stops the tree with `taskkill`.
///
/// Going through the shell lets `.cmd` shims such as `npx` resolve.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsProcessTree;

impl ProcessControl for WindowsProcessTree {
    fn command(&self, line: &CommandLine) -> Command {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C")
            .arg(&line.program)
            .args(&line.args)
            .creation_flags(CREATE_NEW_PROCESS_GROUP);
        cmd
    }

    fn signal_graceful(&self, pid: u32) -> io::Result<()> {
        taskkill(&["/PID", &pid.to_string(), "/T"])
    }

    fn force_kill(&self, pid: u32) -> io::Result<()> {
        taskkill(&["/F", "/PID", &pid.to_string(), "/T"])
    }
}

fn taskkill(args: &[&str]) -> io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;

    // 128: no such process.
    if status.success() || status.code() == Some(128) {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill exited with {}", status)))
    }
}
