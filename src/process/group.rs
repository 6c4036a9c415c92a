//! # Platform process-group control.
//!
//! Decoders are started as leaders of their own process group so that helper
//! processes they fork die with them. Two operations are exposed, each with one
//! implementation per platform family:
//!
//! - [`configure_process_group`] applied to a command before spawn
//! - [`kill_process_group`] signals the whole group
//!
//! **Unix:** `setpgid(0, 0)` at spawn, `killpg(pgid, SIGTERM | SIGKILL)`.
//!
//! **Windows:** `CREATE_NEW_PROCESS_GROUP` at spawn, `taskkill /PID <pid> /T [/F]`.

use std::io;

use tokio::process::Command;

/// Strength of a group termination request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupSignal {
    /// Ask the group to exit (SIGTERM / `taskkill /T`).
    Terminate,
    /// Force the group down (SIGKILL / `taskkill /T /F`).
    Kill,
}

/// Makes the spawned process the leader of a new process group.
pub fn configure_process_group(cmd: &mut Command) {
    imp::configure(cmd);
}

/// Sends `signal` to every process in the group led by `pid`.
pub async fn kill_process_group(pid: u32, signal: GroupSignal) -> io::Result<()> {
    imp::kill(pid, signal).await
}

#[cfg(unix)]
mod imp {
    use super::GroupSignal;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    use std::io;
    use tokio::process::Command;

    pub(super) fn configure(cmd: &mut Command) {
        cmd.process_group(0);
    }

    pub(super) async fn kill(pid: u32, signal: GroupSignal) -> io::Result<()> {
        let pgid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        let signal = match signal {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        killpg(Pid::from_raw(pgid), signal).map_err(io::Error::from)
    }
}

#[cfg(windows)]
mod imp {
    use super::GroupSignal;
    use std::io;
    use std::process::Stdio;
    use tokio::process::Command;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    pub(super) fn configure(cmd: &mut Command) {
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    pub(super) async fn kill(pid: u32, signal: GroupSignal) -> io::Result<()> {
        let mut taskkill = Command::new("taskkill");
        taskkill.args(["/PID", &pid.to_string(), "/T"]);
        if signal == GroupSignal::Kill {
            taskkill.arg("/F");
        }
        let status = taskkill
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("taskkill exited with {status}"),
            ))
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod imp {
    use super::GroupSignal;
    use std::io;
    use tokio::process::Command;

    pub(super) fn configure(_cmd: &mut Command) {}

    pub(super) async fn kill(_pid: u32, _signal: GroupSignal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process groups not supported on this platform",
        ))
    }
}
