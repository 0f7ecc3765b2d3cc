use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::fuzzers::plugin::KILLED_EXIT_CODE;

/// One external fuzzer run, in its own process group so the solver
/// processes it forks can be signalled together.
#[derive(Debug)]
pub struct FuzzProcess {
    child: Child,
    pid: i32,
    started: Instant,
    reaped: bool,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Exited(i32),
    /// Terminated by a signal the engine did not send.
    Signaled(i32),
    /// Terminated by the engine (timeout, resource cap, forced shutdown).
    Killed,
}

impl ExecutionStatus {
    /// The integer handed to the plugin's exit-code table.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionStatus::Exited(code) => *code,
            ExecutionStatus::Signaled(signal) => -signal,
            ExecutionStatus::Killed => KILLED_EXIT_CODE,
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match (status.code(), status.signal()) {
            (Some(code), _) => ExecutionStatus::Exited(code),
            (None, Some(signal)) => ExecutionStatus::Signaled(signal),
            (None, None) => ExecutionStatus::Exited(KILLED_EXIT_CODE),
        }
    }
}

impl FuzzProcess {
    /// Spawn `argv`. With a `log_dir`, stdout and stderr land in
    /// `fuzzer.stdout` / `fuzzer.stderr` there; otherwise they are discarded.
    pub fn spawn(argv: &[String], log_dir: Option<&Path>) -> anyhow::Result<FuzzProcess> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command line"))?;

        let (stdout, stderr) = match log_dir {
            Some(dir) => {
                let out = File::create(dir.join("fuzzer.stdout"))
                    .with_context(|| format!("failed to create stdout log in {:?}", dir))?;
                let err = File::create(dir.join("fuzzer.stderr"))
                    .with_context(|| format!("failed to create stderr log in {:?}", dir))?;
                (Stdio::from(out), Stdio::from(err))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);

        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {:?}", program))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("spawned process has no pid"))? as i32;
        debug!(pid, program = %program, "spawned fuzzer process");

        Ok(Self {
            child,
            pid,
            started: Instant::now(),
            reaped: false,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// The process group id; equal to the pid since the child leads its group.
    pub fn pgid(&self) -> i32 {
        self.pid
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Wait for a natural exit, then kill whatever the leader left running
    /// in its group. Cancel safe.
    pub async fn wait(&mut self) -> io::Result<ExecutionStatus> {
        let status = self.child.wait().await?;
        self.signal_group(libc::SIGKILL);
        self.reaped = true;
        Ok(ExecutionStatus::from_status(status))
    }

    /// SIGTERM the whole group, then SIGKILL it if the leader is still alive
    /// after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> ExecutionStatus {
        if self.reaped {
            return ExecutionStatus::Killed;
        }
        self.signal_group(libc::SIGTERM);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                debug!(pid = self.pid, "process ignored SIGTERM, killing");
                self.signal_group(libc::SIGKILL);
                let _ = self.child.wait().await;
            }
        }
        // stragglers that outlived the leader
        self.signal_group(libc::SIGKILL);
        self.reaped = true;
        ExecutionStatus::Killed
    }

    fn signal_group(&self, signal: libc::c_int) {
        unsafe {
            libc::kill(-self.pgid(), signal);
        }
    }
}

impl Drop for FuzzProcess {
    fn drop(&mut self) {
        if !self.reaped {
            self.signal_group(libc::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let mut process = FuzzProcess::spawn(&sh("exit 10"), None).unwrap();
        let status = process.wait().await.unwrap();
        assert_eq!(status, ExecutionStatus::Exited(10));
        assert_eq!(status.exit_code(), 10);
    }

    /// Alive unless gone from /proc or a zombie.
    fn running(pid: i32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|line| {
                let rest = &line[line.rfind(')')? + 1..];
                rest.split_whitespace().next().map(|state| state != "Z")
            })
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn natural_exit_kills_leftover_children() {
        if !Path::new("/proc/self/stat").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let script = format!("sleep 30 & echo $! > {}; exit 0", pid_file.display());
        let mut process = FuzzProcess::spawn(&sh(&script), None).unwrap();
        assert_eq!(process.wait().await.unwrap(), ExecutionStatus::Exited(0));

        let child: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while running(child) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!running(child));
    }

    #[tokio::test]
    async fn output_goes_to_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut process =
            FuzzProcess::spawn(&sh("echo out; echo err >&2"), Some(dir.path())).unwrap();
        process.wait().await.unwrap();
        let out = std::fs::read_to_string(dir.path().join("fuzzer.stdout")).unwrap();
        let err = std::fs::read_to_string(dir.path().join("fuzzer.stderr")).unwrap();
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
    }

    #[tokio::test]
    async fn terminate_escalates_to_sigkill() {
        let mut process =
            FuzzProcess::spawn(&sh("trap '' TERM; sleep 30 & wait"), None).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        let status = process.terminate(Duration::from_millis(200)).await;
        assert_eq!(status, ExecutionStatus::Killed);
        assert_eq!(status.exit_code(), KILLED_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn empty_command_is_an_error() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            assert!(FuzzProcess::spawn(&[], None).is_err());
        });
    }

    #[test]
    fn signal_exit_is_negative() {
        assert_eq!(ExecutionStatus::Signaled(9).exit_code(), -9);
    }
}
