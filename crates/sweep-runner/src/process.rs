use std::io;
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A child process that leads its own process group and takes the whole
/// group down when dropped.
///
/// Dropping kills every process still in the group (SIGKILL on unix) and
/// reaps the leader if it has not been waited on yet, so nothing launched
/// through a `ScopedProcess` outlives it.
#[derive(Debug)]
pub struct ScopedProcess {
    child: Child,
    status: Option<ExitStatus>,
}

impl ScopedProcess {
    pub fn spawn(mut command: Command) -> io::Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = command.spawn()?;
        debug!("spawned process group {}", child.id());
        Ok(Self {
            child,
            status: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Polls the leader until it exits or `limit` elapses.
    ///
    /// Returns `None` on timeout; the process is left running.
    pub fn wait_timeout(
        &mut self,
        limit: Duration,
        poll_interval: Duration,
    ) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let started = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.status = Some(status);
                return Ok(Some(status));
            }
            let elapsed = started.elapsed();
            if elapsed >= limit {
                return Ok(None);
            }
            thread::sleep(poll_interval.min(limit - elapsed));
        }
    }

    /// Kills the group and reaps the leader.
    pub fn terminate(&mut self) -> io::Result<ExitStatus> {
        self.kill_group();
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait()?;
        self.status = Some(status);
        Ok(status)
    }

    #[cfg(unix)]
    fn kill_group(&mut self) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(self.child.id() as i32);
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => debug!("sent SIGKILL to process group {}", pgid),
            // Group already empty.
            Err(Errno::ESRCH) => {}
            Err(err) => warn!("failed to kill process group {}: {}", pgid, err),
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&mut self) {
        if self.status.is_none() {
            if let Err(err) = self.child.kill() {
                warn!("failed to kill process {}: {}", self.child.id(), err);
            }
        }
    }
}

impl Drop for ScopedProcess {
    fn drop(&mut self) {
        self.kill_group();
        if self.status.is_none() {
            match self.child.wait() {
                Ok(status) => self.status = Some(status),
                Err(err) => warn!("failed to reap process {}: {}", self.child.id(), err),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn pid_alive(pid: i32) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid), Option::<Signal>::None).is_err() {
            return false;
        }
        // Zombies still answer signal 0 until their parent reaps them.
        match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => true,
        }
    }

    fn wait_until_dead(pid: i32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if !pid_alive(pid) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    fn read_pid(path: &Path) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(raw) = fs::read_to_string(path) {
                if let Ok(pid) = raw.trim().parse() {
                    return pid;
                }
            }
            assert!(Instant::now() < deadline, "pid file never written");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn wait_timeout_returns_exit_status() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        let mut process = ScopedProcess::spawn(cmd).expect("spawn");
        let status = process
            .wait_timeout(Duration::from_secs(5), Duration::from_millis(10))
            .expect("wait")
            .expect("exited");
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn wait_timeout_gives_up_and_terminate_kills() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        let mut process = ScopedProcess::spawn(cmd).expect("spawn");
        let started = Instant::now();
        let waited = process
            .wait_timeout(Duration::from_millis(200), Duration::from_millis(10))
            .expect("wait");
        assert!(waited.is_none());
        let status = process.terminate().expect("terminate");
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn drop_kills_background_descendants() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &script]);
        let process = ScopedProcess::spawn(cmd).expect("spawn");
        let leader = process.id() as i32;
        let grandchild = read_pid(&pid_file);
        assert!(pid_alive(grandchild));
        drop(process);
        assert!(wait_until_dead(leader), "leader survived drop");
        assert!(wait_until_dead(grandchild), "grandchild survived drop");
    }

    #[test]
    fn drop_after_exit_still_clears_the_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("orphan.pid");
        let script = format!("sleep 30 & echo $! > {}", pid_file.display());
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &script]);
        let mut process = ScopedProcess::spawn(cmd).expect("spawn");
        let status = process
            .wait_timeout(Duration::from_secs(5), Duration::from_millis(10))
            .expect("wait")
            .expect("leader exits immediately");
        assert!(status.success());
        let orphan = read_pid(&pid_file);
        drop(process);
        assert!(wait_until_dead(orphan), "orphaned sleep survived drop");
    }
}
