use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{LoadedExperiment, DEFAULT_FILE_FLAG, DEFAULT_TIMEOUT_FLAG};

/// Reported when the solver outlives its deadline and is killed.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Reported when the solver could not be launched or died from a signal.
pub const ABNORMAL_EXIT_CODE: i32 = -1;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long pipe readers may keep draining once the solver is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// What one solver process left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub wall_time: Duration,
}

impl RawResult {
    pub fn abnormal(wall_time: Duration) -> Self {
        Self {
            exit_code: ABNORMAL_EXIT_CODE,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            wall_time,
        }
    }
}

/// Runs the solver once against one puzzle file.
///
/// Implementations never fail: every launch, exit, or deadline problem is
/// folded into the returned [`RawResult`] so one bad trial cannot stop a
/// batch.
pub trait Invoke: Sync {
    fn invoke(&self, puzzle: &Path, timeout_secs: u64) -> RawResult;
}

#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    command: Vec<String>,
    file_flag: String,
    timeout_flag: String,
    kill_grace: Duration,
    work_dir: Option<PathBuf>,
}

impl ProcessInvoker {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            file_flag: DEFAULT_FILE_FLAG.to_string(),
            timeout_flag: DEFAULT_TIMEOUT_FLAG.to_string(),
            kill_grace: Duration::from_secs(crate::config::DEFAULT_KILL_GRACE_SECONDS),
            work_dir: None,
        }
    }

    pub fn from_experiment(loaded: &LoadedExperiment) -> Self {
        let solver = &loaded.config.solver;
        Self::new(loaded.solver_command())
            .with_flags(&solver.file_flag, &solver.timeout_flag)
            .with_kill_grace(Duration::from_secs(solver.kill_grace_seconds))
            .with_work_dir(&loaded.exp_dir)
    }

    pub fn with_flags(mut self, file_flag: &str, timeout_flag: &str) -> Self {
        self.file_flag = file_flag.to_string();
        self.timeout_flag = timeout_flag.to_string();
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_work_dir(mut self, dir: &Path) -> Self {
        self.work_dir = Some(dir.to_path_buf());
        self
    }

    fn build_command(&self, puzzle: &Path, timeout_secs: u64) -> Option<Command> {
        let (program, args) = self.command.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.arg(&self.file_flag).arg(puzzle);
        cmd.arg(&self.timeout_flag).arg(timeout_secs.to_string());
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        Some(cmd)
    }
}

impl Invoke for ProcessInvoker {
    fn invoke(&self, puzzle: &Path, timeout_secs: u64) -> RawResult {
        let start = Instant::now();
        let Some(mut cmd) = self.build_command(puzzle, timeout_secs) else {
            tracing::warn!("solver command is empty");
            return RawResult::abnormal(start.elapsed());
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(
                    solver = %self.command[0],
                    puzzle = %puzzle.display(),
                    "failed to launch solver: {}",
                    err
                );
                return RawResult::abnormal(start.elapsed());
            }
        };

        let (tx, rx) = mpsc::channel::<(Stream, Vec<u8>)>();
        let mut pending = 0;
        if let Some(out) = child.stdout.take() {
            spawn_drain(Stream::Stdout, out, tx.clone());
            pending += 1;
        }
        if let Some(err) = child.stderr.take() {
            spawn_drain(Stream::Stderr, err, tx.clone());
            pending += 1;
        }
        drop(tx);

        let deadline = start + Duration::from_secs(timeout_secs) + self.kill_grace;
        let mut timed_out = false;
        let exit_code = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status.code().unwrap_or(ABNORMAL_EXIT_CODE),
                Ok(None) if Instant::now() >= deadline => {
                    timed_out = true;
                    kill_tree(&mut child);
                    break TIMEOUT_EXIT_CODE;
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => {
                    tracing::warn!(puzzle = %puzzle.display(), "failed waiting on solver: {}", err);
                    kill_tree(&mut child);
                    break ABNORMAL_EXIT_CODE;
                }
            }
        };

        // A descendant that escaped the kill may still hold the pipes open.
        let drain_until = deadline.max(Instant::now()) + DRAIN_GRACE;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while pending > 0 {
            let wait = drain_until.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok((Stream::Stdout, bytes)) => stdout = bytes,
                Ok((Stream::Stderr, bytes)) => stderr = bytes,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        puzzle = %puzzle.display(),
                        "solver output still open after exit; keeping what was read"
                    );
                    break;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            pending -= 1;
        }
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        if timed_out {
            tracing::warn!(
                puzzle = %puzzle.display(),
                timeout_secs,
                "solver exceeded its deadline and was killed"
            );
        }

        RawResult {
            exit_code,
            stdout,
            stderr,
            timed_out,
            wall_time: start.elapsed(),
        }
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_drain<R: Read + Send + 'static>(
    stream: Stream,
    mut source: R,
    tx: mpsc::Sender<(Stream, Vec<u8>)>,
) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        let _ = tx.send((stream, buf));
    });
}

/// Kills the solver and, on unix, every process left in its group.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{}", child.id()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();
    let _ = child.wait();
}
