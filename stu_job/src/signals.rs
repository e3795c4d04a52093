// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The terminating-signal path: the same process-group-kill idea as a
//! `ManagedChild::signal_pg`, but synchronous and static. There is no
//! async runtime here, and the handler itself must be a plain
//! `extern "C" fn` with access only to process-wide state, so the live-PID
//! view is a fixed-size array of atomics rather than anything owned by the
//! `Scheduler` — a minimal lock-free view the handler can scan with only
//! async-signal-safe operations.

use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{self, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

/// Bound on concurrently live jobs; matches the `-j` slot budget in
/// practice, since there is never an unbounded number of forked children
/// at once.
pub const CAPACITY: usize = 4096;

const EMPTY_SLOT: AtomicI32 = AtomicI32::new(0);

/// A lock-free, fixed-capacity set of live child PIDs, safe for the signal
/// handler to scan without allocating.
pub struct PidRegistry {
    slots: [AtomicI32; CAPACITY],
}

impl PidRegistry {
    pub const fn new() -> Self {
        PidRegistry {
            slots: [EMPTY_SLOT; CAPACITY],
        }
    }

    /// Record `pid` as live. Must be called with terminating signals
    /// blocked, spanning the `fork` call itself.
    pub fn register(&self, pid: Pid) -> Result<(), stu_place::Failure> {
        let raw = pid.as_raw();
        for slot in &self.slots {
            if slot
                .compare_exchange(0, raw, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(stu_place::Failure::system(
            "too many concurrently live jobs (PID registry exhausted)",
        ))
    }

    /// Drop `pid` from the live set. Must also be called with terminating
    /// signals blocked around fork/register and around erase/wait.
    pub fn unregister(&self, pid: Pid) {
        let raw = pid.as_raw();
        for slot in &self.slots {
            if slot
                .compare_exchange(raw, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Visit every live PID. Used by the signal handler (async-signal-safe:
    /// only loads atomics and calls `libc::kill`) and, in tests, to assert
    /// on the registered set.
    pub fn for_each(&self, mut f: impl FnMut(Pid)) {
        for slot in &self.slots {
            let raw = slot.load(Ordering::SeqCst);
            if raw != 0 {
                f(Pid::from_raw(raw));
            }
        }
    }
}

impl Default for PidRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide live-PID view. A `static` is the one deliberate
/// exception to "no process-wide statics": signal handlers cannot capture
/// a `Scheduler` reference.
static REGISTRY: PidRegistry = PidRegistry::new();

pub fn registry() -> &'static PidRegistry {
    &REGISTRY
}

/// An RAII guard restoring the previous signal mask on drop. Held across
/// `fork` + PID registration.
pub struct BlockedSignalsGuard {
    old: SigSet,
}

impl Drop for BlockedSignalsGuard {
    fn drop(&mut self) {
        let _ = signal::sigprocmask(signal::SigmaskHow::SIG_SETMASK, Some(&self.old), None);
    }
}

fn terminating_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set
}

/// Block `SIGINT`/`SIGTERM` until the returned guard is dropped.
pub fn block_terminating() -> Result<BlockedSignalsGuard, stu_place::Failure> {
    let mut old = SigSet::empty();
    signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&terminating_set()), Some(&mut old))
        .map_err(|e| stu_place::Failure::system(format!("sigprocmask: {e}")))?;
    Ok(BlockedSignalsGuard { old })
}

extern "C" fn handle_terminating(sig: libc::c_int) {
    unsafe {
        let _ = signal::signal(
            Signal::try_from(sig).unwrap_or(Signal::SIGTERM),
            SigHandler::SigDfl,
        );
    }
    REGISTRY.for_each(|pid| {
        let _ = signal::kill(Pid::from_raw(-pid.as_raw()), Signal::SIGTERM);
    });
    unsafe {
        libc::raise(sig);
    }
}

/// Install the terminating-signal handler: restores default disposition
/// for the caught signal, kills every known process group with `SIGTERM`,
/// invokes cleanup, then re-raises the signal. The cleanup step itself is
/// the caller's `remove_if_existing` policy, run synchronously by
/// `crate::waited` rather than from inside this handler, since it needs the
/// per-job output path which the registry does not track.
pub fn install() -> Result<(), stu_place::Failure> {
    let handler = SigHandler::Handler(handle_terminating);
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe { signal::signal(sig, handler) }
            .map_err(|e| stu_place::Failure::system(format!("sigaction({sig}): {e}")))?;
    }
    Ok(())
}
