//! Subprocess supervision: non-blocking stream multiplexing, idle and
//! wall-clock timeouts, cooperative-then-forceful termination.
//!
//! One reader thread per pipe feeds a channel of lines; the supervising loop
//! polls `recv_timeout` in short intervals so both deadlines are observable
//! within a second. Reader threads are joined on every exit path, which is
//! what guarantees the pipe handles are released.

use std::error::Error;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const TERM_WAIT: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(2);
const REAP_WAIT: Duration = Duration::from_secs(30);

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Total,
    Idle,
}

/// Raised when a supervised subprocess exceeded a deadline and was killed.
#[derive(Debug)]
pub struct SubprocessTimeout {
    pub command: String,
    pub kind: TimeoutKind,
    pub limit: Duration,
}

impl fmt::Display for SubprocessTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            TimeoutKind::Total => "total timeout",
            TimeoutKind::Idle => "idle timeout",
        };
        write!(
            f,
            "'{}' exceeded {} of {}s",
            self.command,
            what,
            self.limit.as_secs()
        )
    }
}

impl Error for SubprocessTimeout {}

/// What to run and under which limits.
#[derive(Debug, Clone)]
pub struct SuperviseSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Wall-clock ceiling from process start.
    pub timeout: Duration,
    /// No-output inactivity cutoff; resets on every line received.
    pub idle_timeout: Duration,
    /// Echo child output through the logger as it arrives.
    pub stream_output: bool,
}

impl SuperviseSpec {
    fn command_line(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

/// Exit code plus captured stdout (stderr is logged, not captured; verdict
/// parsing reads stdout only).
#[derive(Debug)]
pub struct SuperviseOutcome {
    pub exit_code: i32,
    pub stdout: String,
}

/// Run a subprocess under supervision.
///
/// `on_start` fires with the PID the instant the child is spawned;
/// `on_end` fires exactly once on every exit path, timeout included.
pub fn supervise(
    spec: &SuperviseSpec,
    on_start: impl FnOnce(u32),
    on_end: impl FnOnce(),
) -> Result<SuperviseOutcome> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Own process group, so termination reaches grandchildren too. Without
    // this, a grandchild inheriting the pipes would keep the readers alive
    // long after the direct child was killed.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn '{}'", spec.command_line()))?;
    on_start(child.id());
    let result = drive(&mut child, spec);
    on_end();
    result
}

enum Line {
    Stdout(String),
    Stderr(String),
}

fn drive(child: &mut Child, spec: &SuperviseSpec) -> Result<SuperviseOutcome> {
    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let (tx, rx) = mpsc::channel::<Line>();
    let tx_err = tx.clone();
    let out_reader = thread::spawn(move || forward_lines(stdout, tx, Line::Stdout));
    let err_reader = thread::spawn(move || forward_lines(stderr, tx_err, Line::Stderr));

    let start = Instant::now();
    let mut last_activity = start;
    let mut stdout_buf = String::new();

    let expired = loop {
        let now = Instant::now();
        if now.duration_since(start) >= spec.timeout {
            break Some(TimeoutKind::Total);
        }
        if now.duration_since(last_activity) >= spec.idle_timeout {
            break Some(TimeoutKind::Idle);
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                last_activity = Instant::now();
                match line {
                    Line::Stdout(l) => {
                        if spec.stream_output {
                            debug!("[{}] {l}", spec.program);
                        }
                        stdout_buf.push_str(&l);
                        stdout_buf.push('\n');
                    }
                    Line::Stderr(l) => {
                        if spec.stream_output {
                            debug!("[{}!] {l}", spec.program);
                        }
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            // Both readers hit EOF: the child has closed its pipes.
            Err(mpsc::RecvTimeoutError::Disconnected) => break None,
        }
    };

    match expired {
        Some(kind) => {
            terminate_child(child, &spec.command_line());
            // Drain whatever the readers got before the kill.
            for line in rx.try_iter() {
                if let Line::Stdout(l) = line {
                    stdout_buf.push_str(&l);
                    stdout_buf.push('\n');
                }
            }
            let _ = out_reader.join();
            let _ = err_reader.join();
            let limit = match kind {
                TimeoutKind::Total => spec.timeout,
                TimeoutKind::Idle => spec.idle_timeout,
            };
            bail!(SubprocessTimeout {
                command: spec.command_line(),
                kind,
                limit,
            });
        }
        None => {
            let _ = out_reader.join();
            let _ = err_reader.join();
            // Pipes are closed but a wedged child may still be unreaped;
            // bounded wait so that surfaces as a warning, not a hang.
            let status = match wait_with_deadline(child, REAP_WAIT) {
                Some(status) => status,
                None => {
                    warn!(
                        "'{}' closed its pipes but did not exit within {}s",
                        spec.command_line(),
                        REAP_WAIT.as_secs()
                    );
                    let _ = child.kill();
                    child.wait().context("reaping killed child")?
                }
            };
            Ok(SuperviseOutcome {
                exit_code: status.code().unwrap_or(-1),
                stdout: stdout_buf,
            })
        }
    }
}

fn forward_lines(pipe: impl Read, tx: mpsc::Sender<Line>, wrap: fn(String) -> Line) {
    let reader = BufReader::new(pipe);
    for line in reader.lines() {
        match line {
            Ok(l) => {
                if tx.send(wrap(l)).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> Option<std::process::ExitStatus> {
    let deadline = Instant::now() + limit;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    return None;
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return None,
        }
    }
}

/// SIGTERM, a bounded wait, then SIGKILL and another bounded wait. Signals
/// go to the child's process group.
fn terminate_child(child: &mut Child, command: &str) {
    let pid = child.id();
    debug!("terminating '{command}' (pid {pid})");
    signal_tree(pid, libc::SIGTERM);
    if wait_with_deadline(child, TERM_WAIT).is_some() {
        return;
    }
    warn!("'{command}' ignored SIGTERM, sending SIGKILL");
    signal_tree(pid, libc::SIGKILL);
    if wait_with_deadline(child, KILL_WAIT).is_none() {
        warn!("'{command}' (pid {pid}) not reaped after SIGKILL");
    }
}

/// Send a signal to a PID. Returns true if delivery succeeded.
pub fn send_signal(pid: u32, signal: i32) -> bool {
    unsafe { libc::kill(pid as i32, signal) == 0 }
}

/// Signal the process group led by `pid`, falling back to the PID itself
/// when it leads no group.
pub fn signal_tree(pid: u32, signal: i32) -> bool {
    let group_hit = unsafe { libc::kill(-(pid as i32), signal) == 0 };
    if group_hit {
        return true;
    }
    send_signal(pid, signal)
}

/// Signal-0 liveness probe.
pub fn is_pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Cooperative-then-forceful termination of an arbitrary tracked PID:
/// SIGTERM, wait up to `term_wait`, SIGKILL, wait up to `kill_wait`.
pub fn terminate_pid(pid: u32, term_wait: Duration, kill_wait: Duration) {
    if !is_pid_alive(pid) {
        return;
    }
    signal_tree(pid, libc::SIGTERM);
    if poll_until_dead(pid, term_wait) {
        return;
    }
    warn!("pid {pid} ignored SIGTERM, sending SIGKILL");
    signal_tree(pid, libc::SIGKILL);
    if !poll_until_dead(pid, kill_wait) {
        warn!("pid {pid} still alive after SIGKILL");
    }
}

fn poll_until_dead(pid: u32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if !is_pid_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    !is_pid_alive(pid)
}
