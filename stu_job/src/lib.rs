// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Subprocess lifecycle and signal-safe cleanup.
//!
//! A child gets its own process group so it can be killed as a unit, the
//! same idea as a `ManagedChild`. The engine here is single-threaded and
//! cooperative, not `tokio`-driven, so this module forks and waits
//! synchronously via `nix::unistd::fork` / `nix::sys::wait` directly
//! rather than through `tokio::process::Command` — one layer lower, but
//! still squarely within the same dependency stack (`nix`, `libc`).

pub mod signals;

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::OnceLock;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::sys::wait::WaitStatus;
use nix::unistd::{close, dup2, execve, fork, getpid, setpgid, ForkResult, Pid};

use stu_place::{Failure, Place};

/// Resolve the shell once per process from `STU_SHELL`, falling back to
/// `/bin/sh`.
pub fn resolve_shell() -> &'static CString {
    static SHELL: OnceLock<CString> = OnceLock::new();
    SHELL.get_or_init(|| {
        let path = std::env::var_os("STU_SHELL")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".into());
        CString::new(path.as_bytes()).expect("STU_SHELL must not contain NUL bytes")
    })
}

/// `STU_STATUS` must be unset on entry; its presence means this process is
/// itself running as a job spawned by another `stu` invocation, which is
/// refused as a fatal error.
pub fn check_not_recursive_invocation() -> Result<(), Failure> {
    if std::env::var_os("STU_STATUS").is_some() {
        return Err(Failure::fatal(
            "STU_STATUS is already set in the environment: refusing recursive invocation",
        ));
    }
    Ok(())
}

/// Running totals of jobs started/succeeded/failed, printed on exit. Owned
/// by the `Scheduler`, not a process-wide static, so it consolidates into
/// a single value rather than scattering across globals.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    pub executed: u32,
    pub succeeded: u32,
    pub failed: u32,
}

impl Statistics {
    pub fn job_started(&mut self) {
        self.executed += 1;
    }

    pub fn job_succeeded(&mut self) {
        self.succeeded += 1;
    }

    pub fn job_failed(&mut self) {
        self.failed += 1;
    }

    /// Matches `Job::Statistics::print`'s wording (original `job.hh`),
    /// minus `getrusage` timing, which needs no core semantics.
    pub fn render(&self, allow_unterminated: bool) -> String {
        if allow_unterminated {
            format!(
                "STATISTICS  number of jobs started = {} ({} succeeded, {} failed, {} interrupted)",
                self.executed,
                self.succeeded,
                self.failed,
                self.executed - self.succeeded - self.failed,
            )
        } else {
            format!(
                "STATISTICS  number of jobs started = {} ({} succeeded, {} failed)",
                self.executed, self.succeeded, self.failed,
            )
        }
    }
}

/// How a finished job's wait status is reported to the user: "failed with
/// exit code N" / "received signal NAME" / "failed with status code N".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Success,
    ExitCode(i32),
    Signal(String),
    Other,
}

impl WaitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WaitOutcome::Success)
    }

    pub fn describe(&self) -> String {
        match self {
            WaitOutcome::Success => "succeeded".to_string(),
            WaitOutcome::ExitCode(code) => format!("failed with exit code {code}"),
            WaitOutcome::Signal(name) => format!("received signal {name}"),
            WaitOutcome::Other => "failed with an unrecognized status".to_string(),
        }
    }
}

pub fn interpret_wait_status(status: WaitStatus) -> WaitOutcome {
    match status {
        WaitStatus::Exited(_, 0) => WaitOutcome::Success,
        WaitStatus::Exited(_, code) => WaitOutcome::ExitCode(code),
        WaitStatus::Signaled(_, sig, _) => WaitOutcome::Signal(sig.to_string()),
        _ => WaitOutcome::Other,
    }
}

/// Block waiting for any child to terminate (`Job::wait`, the scheduler's
/// only blocking call).
pub fn wait_any() -> Result<(Pid, WaitStatus), Failure> {
    nix::sys::wait::wait()
        .map(|status| (status.pid().expect("wait() always reports a pid"), status))
        .map_err(|e| Failure::system(format!("wait: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    /// Mirrors the original `pid == -2`.
    NotStarted,
    /// Mirrors `pid >= 0`.
    Started(Pid),
    /// Mirrors `pid == -1`.
    Waited,
}

/// One subprocess slot on an `ExecutionNode`: subprocess state, initially
/// "not started".
#[derive(Debug, Clone)]
pub struct Job {
    state: JobState,
    /// Pre-converted (non-allocating at signal time) output path, set only
    /// when this job redirects to a file, so `remove_if_existing` can run
    /// from a context that must not allocate.
    output_path: Option<CString>,
}

impl Job {
    pub fn new() -> Self {
        Job {
            state: JobState::NotStarted,
            output_path: None,
        }
    }

    pub fn started(&self) -> bool {
        matches!(self.state, JobState::Started(_))
    }

    pub fn started_or_waited(&self) -> bool {
        !matches!(self.state, JobState::NotStarted)
    }

    pub fn pid(&self) -> Option<Pid> {
        match self.state {
            JobState::Started(pid) => Some(pid),
            _ => None,
        }
    }

    pub fn output_path(&self) -> Option<&CStr> {
        self.output_path.as_deref()
    }

    /// Fork and exec `command` under the resolved shell.
    ///
    /// `mapping` is the environment delta (parameter + variable bindings);
    /// `STU_STATUS=1` is always appended on top of it. `output`/`input` are
    /// opened for `>`/`<` redirection; the input file is opened here, in the
    /// parent, "to fail fast" before committing to a fork.
    pub fn start(
        &mut self,
        command: &str,
        mapping: &HashMap<String, String>,
        output: Option<&Path>,
        input: Option<&Path>,
        place_command: &Place,
        registry: &signals::PidRegistry,
        stats: &mut Statistics,
    ) -> Result<(), Failure> {
        assert!(matches!(self.state, JobState::NotStarted));

        let fd_input = match input {
            Some(path) => Some(
                open(path, OFlag::O_RDONLY, Mode::empty())
                    .map_err(|e| Failure::build(format!("{}: {e}", path.display())))?,
            ),
            None => None,
        };

        let output_path = match output {
            Some(path) => Some(
                CString::new(path.as_os_str().as_bytes())
                    .map_err(|_| Failure::system("output path contains a NUL byte"))?,
            ),
            None => None,
        };

        let shell = resolve_shell().clone();
        let argv0 = place_command.as_argv0();
        let env = assemble_env(mapping);

        let guard = signals::block_terminating()?;
        // SAFETY: between `fork` and registering the child's PID, signals
        // that would otherwise run the handler concurrently with PID
        // bookkeeping are blocked.
        let fork_result = unsafe { fork() }.map_err(|e| Failure::system(format!("fork: {e}")))?;

        match fork_result {
            ForkResult::Child => {
                child_exec(&shell, &argv0, command, &env, output_path.as_deref(), fd_input);
                // child_exec never returns.
            }
            ForkResult::Parent { child } => {
                let _ = setpgid(child, child);
                registry.register(child)?;
                drop(guard);
                if let Some(fd) = fd_input {
                    let _ = close(fd);
                }
                self.state = JobState::Started(child);
                self.output_path = output_path;
                stats.job_started();
                Ok(())
            }
        }
    }

    /// Transition to `Waited` and update `stats` (mirrors `waited`).
    /// `outcome`'s success/failure decides `count_jobs_success`/`_fail`.
    pub fn mark_waited(&mut self, pid: Pid, outcome: &WaitOutcome, stats: &mut Statistics) {
        match self.state {
            JobState::Started(p) => assert_eq!(p, pid, "Job::mark_waited pid mismatch"),
            other => panic!("Job::mark_waited called in state {other:?}, expected Started"),
        }
        self.state = JobState::Waited;
        if outcome.is_success() {
            stats.job_succeeded();
        } else {
            stats.job_failed();
        }
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

fn assemble_env(mapping: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = std::env::vars().collect();
    for (key, value) in mapping {
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.clone(),
            None => entries.push((key.clone(), value.clone())),
        }
    }
    entries.push(("STU_STATUS".to_string(), "1".to_string()));
    entries
}

/// Never returns: execs the shell, or exits with the system-error code on
/// any failure along the way. Runs entirely in the forked child, so it must
/// not unwind back into the parent's Rust state.
fn child_exec(
    shell: &CStr,
    argv0: &str,
    command: &str,
    env: &[(String, String)],
    output: Option<&CStr>,
    fd_input: Option<std::os::fd::RawFd>,
) -> ! {
    if setpgid(getpid(), getpid()).is_err() {
        // Harmless: can only fail if the parent already reaped us.
    }

    let argv0_c = CString::new(argv0).unwrap_or_else(|_| CString::new("stu").unwrap());
    let mut args = vec![argv0_c, CString::new("-e").unwrap(), CString::new("-c").unwrap()];
    if command.starts_with('-') || command.starts_with('+') {
        args.push(CString::new("--").unwrap());
    }
    args.push(CString::new(command).unwrap_or_else(|_| {
        fail_child("command contains a NUL byte");
    }));

    let envp: Vec<CString> = env
        .iter()
        .map(|(k, v)| {
            CString::new(format!("{k}={v}")).unwrap_or_else(|_| {
                fail_child("environment value contains a NUL byte");
            })
        })
        .collect();

    if let Some(path) = output {
        match open(path, OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(fd) => {
                if dup2(fd, 1).is_err() {
                    fail_child("dup2 on output redirection failed");
                }
            }
            Err(_) => fail_child("could not open output redirection file"),
        }
    }

    if let Some(fd) = fd_input {
        if dup2(fd, 0).is_err() {
            fail_child("dup2 on input redirection failed");
        }
    }

    match execve(shell, &args, &envp) {
        Ok(_) => unreachable!("execve only returns on error"),
        Err(_) => fail_child("execve failed"),
    }
}

fn fail_child(message: &str) -> ! {
    // No allocation-free requirement here (unlike `cleanup::remove_if_existing`):
    // this path only runs once, right before `_exit`, and never races the
    // signal handler over shared state.
    eprintln!("stu: *** {message}");
    std::process::exit(4);
}

/// Async-signal-safe partial-file removal: restricted to async-signal-safe
/// primitives — no allocation, no stdio formatting; only `stat`, `unlink`,
/// and fixed-string `write` to fd 2.
pub mod cleanup {
    use std::ffi::CStr;

    /// Remove `path` if it exists, using only `stat`/`unlink`/`write(2)`.
    /// Safe to call from a signal handler or from ordinary build-failure
    /// cleanup alike.
    pub fn remove_if_existing(path: &CStr) {
        unsafe {
            let mut st: libc::stat = std::mem::zeroed();
            if libc::stat(path.as_ptr(), &mut st) == 0 {
                libc::unlink(path.as_ptr());
                let msg = b"stu: *** Removing file\n";
                libc::write(2, msg.as_ptr().cast(), msg.len());
            }
        }
    }
}

#[cfg(test)]
mod tests;
