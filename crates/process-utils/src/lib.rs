//! Small process-related helpers shared across the workspace.
//!
//! Stage executables are external programs; these helpers spawn them without
//! flashing a console window on Windows, put each one in a process group of
//! its own, and make sure the whole group is gone when a run is canceled.

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
pub use self::tokio_impl::*;

#[cfg(feature = "tokio")]
mod tokio_impl {
    use std::ffi::OsStr;
    use std::io;
    use std::process::ExitStatus;
    use std::time::Duration;

    use super::NoWindowExt;

    impl NoWindowExt for tokio::process::Command {
        fn no_window(&mut self) {
            #[cfg(windows)]
            {
                use std::os::windows::process::CommandExt;
                self.as_std_mut().creation_flags(super::CREATE_NO_WINDOW);
            }
        }
    }

    /// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
    pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(program);
        cmd.no_window();
        cmd
    }

    /// Create a command for a supervised child: no console window, and the
    /// child is killed if its handle is dropped before it was reaped.
    ///
    /// On unix the child leads a new process group (pgid == pid), so
    /// [`kill_process_tree`] reaches everything it spawns.
    pub fn supervised_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
        let mut cmd = tokio_command(program);
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Kill every process in the tree rooted at `pid`.
    ///
    /// `pid` must be the id of a child spawned by [`supervised_command`].
    /// A tree that is already gone is not an error.
    #[cfg(unix)]
    pub fn kill_process_tree(pid: u32) -> io::Result<()> {
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"));
        };
        // SAFETY: killpg has no memory-safety preconditions.
        let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Ok(()),
            _ => Err(err),
        }
    }

    /// Kill every process in the tree rooted at `pid`.
    ///
    /// Uses `taskkill /T`, which walks the parent-child links.
    #[cfg(windows)]
    pub fn kill_process_tree(pid: u32) -> io::Result<()> {
        let mut cmd = std::process::Command::new("taskkill");
        cmd.args(["/T", "/F", "/PID", &pid.to_string()])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(super::CREATE_NO_WINDOW);
        }
        // A non-zero status means the tree was already gone.
        cmd.status().map(|_| ())
    }

    /// How a child ended after [`terminate`] was called.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Termination {
        /// The child had already exited on its own.
        Exited(ExitStatus),
        /// The child was killed and reaped within the grace period.
        Killed(ExitStatus),
        /// The kill was sent but the child was not reaped within the grace period.
        Unreaped,
    }

    impl Termination {
        /// Whether the child is known to be gone.
        pub fn is_reaped(&self) -> bool {
            !matches!(self, Termination::Unreaped)
        }
    }

    /// Kill `child` together with everything it spawned, and wait up to
    /// `grace` for the child to be reaped.
    pub async fn terminate(
        child: &mut tokio::process::Child,
        grace: Duration,
    ) -> io::Result<Termination> {
        // Taken before any reap; `id()` is None afterwards.
        let tree = child.id();

        if let Some(status) = child.try_wait()? {
            // Stragglers the child left behind. The exit status is the
            // answer here, so a failed sweep is not reported.
            if let Some(pid) = tree {
                let _ = kill_process_tree(pid);
            }
            return Ok(Termination::Exited(status));
        }

        // The direct kill below still applies if the tree kill fails.
        let tree_killed = tree.map(kill_process_tree).transpose();

        match child.start_kill() {
            Ok(()) => {}
            // Raced with a natural exit.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                if let Some(status) = child.try_wait()? {
                    return Ok(Termination::Exited(status));
                }
            }
            Err(e) => return Err(e),
        }

        tree_killed?;

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => Ok(Termination::Killed(status)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(Termination::Unreaped),
        }
    }
}

#[cfg(all(test, unix, feature = "tokio"))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_terminate_kills_long_running_child() {
        let mut child = supervised_command("sleep").arg("30").spawn().unwrap();

        let outcome = terminate(&mut child, Duration::from_secs(5)).await.unwrap();

        assert!(matches!(outcome, Termination::Killed(_)));
        assert!(outcome.is_reaped());
    }

    #[cfg(target_os = "linux")]
    /// Alive and not a zombie waiting for init to reap it.
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // The state letter follows the parenthesised command name.
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z' && state != 'X'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_kills_background_grandchild() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!("sleep 300 & echo $! > '{}'; wait", pid_file.display());
        let mut child = supervised_command("sh").arg("-c").arg(script).spawn().unwrap();

        let mut grandchild = None;
        for _ in 0..100 {
            if let Some(pid) = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
            {
                grandchild = Some(pid);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let grandchild = grandchild.expect("grandchild pid written");
        assert!(is_running(grandchild));

        let outcome = terminate(&mut child, Duration::from_secs(5)).await.unwrap();
        assert!(outcome.is_reaped());

        let mut gone = false;
        for _ in 0..100 {
            if !is_running(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "grandchild {grandchild} survived terminate");
    }

    #[tokio::test]
    async fn test_kill_process_tree_of_finished_child() {
        let mut child = supervised_command("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        assert!(kill_process_tree(pid).is_ok());
    }

    #[tokio::test]
    async fn test_terminate_reports_natural_exit() {
        let mut child = supervised_command("true").spawn().unwrap();
        child.wait().await.unwrap();

        let outcome = terminate(&mut child, Duration::from_secs(1)).await.unwrap();

        match outcome {
            Termination::Exited(status) => assert!(status.success()),
            other => panic!("unexpected termination: {other:?}"),
        }
    }
}
