//! The tri-state phase mutex.
//!
//! To perform an operation the build goes through three phases: `load` (read
//! buildfile declarations into the model), `match` (search prerequisites and
//! match rules), and `execute` (run the matched recipes). During match the
//! external state (filesystem entries, mtimes) is read-only and captured
//! into the dependency graph; during execute it is written. The two cannot
//! overlap safely, so all threads are kept in one phase at a time.
//!
//! `load` is exclusive. `match` and `execute` are shared. A match thread may
//! interrupt itself to an exclusive load (to read an additional buildfile
//! discovered mid-match) or to a parallel execute (to build an ingredient of
//! matching, such as a generated source file); both go through
//! [`PhaseSwitch`].
//!
//! An exclusive load entered by interrupting match may only perform "island
//! appends": create new nodes (scopes, variables, targets) without changing
//! or invalidating existing ones. Islands are identified by the load
//! generation, which is 0 for the initial serial load and bumped on every
//! switch into load.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::sched::Scheduler;

/// The phase a thread holds a lock on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    Load,
    Match,
    Execute,
}

impl RunPhase {
    fn index(self) -> usize {
        match self {
            RunPhase::Load => 0,
            RunPhase::Match => 1,
            RunPhase::Execute => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RunPhase::Load => "load",
            RunPhase::Match => "match",
            RunPhase::Execute => "execute",
        }
    }
}

struct PhaseState {
    phase: RunPhase,
    /// Lock holders per phase.
    counts: [usize; 3],
    /// Threads waiting to switch to exclusive load; fresh match/execute
    /// acquisitions hold off while one is pending so the switch can drain.
    pending_load: usize,
}

thread_local! {
    /// Phase locks held by this thread, innermost last, keyed by the
    /// mutex's address so independent engines don't interfere.
    static PHASE_STACK: RefCell<Vec<(usize, RunPhase)>> = const { RefCell::new(Vec::new()) };
}

/// The phase mutex. When all lock counts reach zero the phase defaults
/// back to `load`.
pub struct PhaseMutex {
    inner: Mutex<PhaseState>,
    cv: Condvar,
    /// Second-level lock serializing exclusive load holders.
    load_serial: Mutex<()>,
    generation: AtomicUsize,
}

impl Default for PhaseMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMutex {
    pub fn new() -> Self {
        PhaseMutex {
            inner: Mutex::new(PhaseState {
                phase: RunPhase::Load,
                counts: [0; 3],
                pending_load: 0,
            }),
            cv: Condvar::new(),
            load_serial: Mutex::new(()),
            generation: AtomicUsize::new(0),
        }
    }

    /// The current phase.
    pub fn phase(&self) -> RunPhase {
        self.inner.lock().unwrap().phase
    }

    /// The current load generation (0 for the initial serial load).
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    /// Restart the generation (part of `reset()` between batches).
    pub fn reset_generation(&self) {
        self.generation.store(0, Ordering::Release);
    }

    fn addr(&self) -> usize {
        self as *const _ as usize
    }

    fn admissible(&self, s: &PhaseState, p: RunPhase) -> bool {
        if p != RunPhase::Load && s.pending_load > 0 {
            return false;
        }
        s.phase == p || s.counts[s.phase.index()] == 0
    }

    fn do_acquire(&self, s: &mut PhaseState, p: RunPhase) {
        if s.phase != p {
            s.phase = p;
        }
        s.counts[p.index()] += 1;
    }

    /// Acquire a phase count, blocking (deactivated) until the phase is
    /// current or switchable. Does not touch the TLS stack or the load
    /// serial lock; the guards do.
    fn lock_raw(&self, sched: &Scheduler, p: RunPhase) {
        {
            let mut s = self.inner.lock().unwrap();
            if self.admissible(&s, p) {
                self.do_acquire(&mut s, p);
                return;
            }
        }

        sched.deactivate();
        {
            let mut s = self.inner.lock().unwrap();
            if p == RunPhase::Load {
                s.pending_load += 1;
            }
            while !self.admissible(&s, p) {
                s = self.cv.wait(s).unwrap();
            }
            if p == RunPhase::Load {
                s.pending_load -= 1;
            }
            self.do_acquire(&mut s, p);
        }
        sched.activate(false);
    }

    fn unlock_raw(&self, p: RunPhase) {
        let mut s = self.inner.lock().unwrap();
        debug_assert!(s.counts[p.index()] > 0, "phase underflow");
        s.counts[p.index()] -= 1;

        if s.counts[p.index()] == 0 {
            if s.counts == [0; 3] {
                s.phase = RunPhase::Load;
            }
            self.cv.notify_all();
        }
    }

    /// Atomic unlock of `from` + lock of `to`. Returns the serial-load
    /// guard when `to` is load; the caller keeps it until it unlocks.
    fn relock_raw(&self, sched: &Scheduler, from: RunPhase, to: RunPhase) -> Option<MutexGuard<'_, ()>> {
        self.unlock_raw(from);

        // The old count is released before taking the serial lock so a
        // concurrent match -> load switcher is not waiting on our count
        // while we are waiting on its serial lock.
        let guard = if to == RunPhase::Load {
            Some(self.lock_load_serial(sched))
        } else {
            None
        };

        self.lock_raw(sched, to);

        // A switch into load is by definition a reentered load: what it
        // creates are island nodes of a new generation.
        if to == RunPhase::Load {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }

        guard
    }

    fn lock_load_serial(&self, sched: &Scheduler) -> MutexGuard<'_, ()> {
        if let Ok(g) = self.load_serial.try_lock() {
            return g;
        }
        sched.deactivate();
        let g = self.load_serial.lock().unwrap();
        sched.activate(false);
        g
    }
}

fn tls_top(addr: usize) -> Option<RunPhase> {
    PHASE_STACK.with(|s| {
        s.borrow().iter().rev().find(|(a, _)| *a == addr).map(|(_, p)| *p)
    })
}

fn tls_push(addr: usize, p: RunPhase) {
    PHASE_STACK.with(|s| s.borrow_mut().push((addr, p)));
}

fn tls_pop(addr: usize, p: RunPhase) {
    PHASE_STACK.with(|s| {
        let mut s = s.borrow_mut();
        let top = s.pop();
        debug_assert_eq!(top, Some((addr, p)), "phase lock drop out of order");
    });
}

/// A held phase lock, released on drop on all exit paths.
///
/// If the thread already holds a lock on the same phase, the new instance
/// simply references it: locks are acquired once a task starts executing,
/// and a task executed synchronously inside `spawn` runs under its caller's
/// lock.
pub struct PhaseLock<'e> {
    pm: &'e PhaseMutex,
    phase: RunPhase,
    owning: bool,
    load_guard: Option<MutexGuard<'e, ()>>,
}

impl<'e> PhaseLock<'e> {
    pub fn new(pm: &'e PhaseMutex, sched: &'e Scheduler, p: RunPhase) -> Self {
        if tls_top(pm.addr()) == Some(p) {
            tls_push(pm.addr(), p);
            return PhaseLock { pm, phase: p, owning: false, load_guard: None };
        }

        let load_guard =
            if p == RunPhase::Load { Some(pm.lock_load_serial(sched)) } else { None };

        pm.lock_raw(sched, p);
        tls_push(pm.addr(), p);

        PhaseLock { pm, phase: p, owning: true, load_guard }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }
}

impl Drop for PhaseLock<'_> {
    fn drop(&mut self) {
        tls_pop(self.pm.addr(), self.phase);
        if self.owning {
            self.pm.unlock_raw(self.phase);
            self.load_guard.take();
        }
    }
}

/// A temporary switch to another phase, switched back on drop.
///
/// The common uses are `match -> execute` (build a generated source the
/// matcher needs) and `match -> load` (read an additional buildfile
/// discovered mid-match; exclusive, island appends only).
pub struct PhaseSwitch<'e> {
    pm: &'e PhaseMutex,
    sched: &'e Scheduler,
    from: RunPhase,
    to: RunPhase,
    load_guard: Option<MutexGuard<'e, ()>>,
}

impl<'e> PhaseSwitch<'e> {
    pub fn new(pm: &'e PhaseMutex, sched: &'e Scheduler, to: RunPhase) -> Self {
        let from = tls_top(pm.addr()).expect("phase switch without a held phase lock");
        assert_ne!(from, to, "switching to the held phase");

        let load_guard = pm.relock_raw(sched, from, to);
        tls_push(pm.addr(), to);

        PhaseSwitch { pm, sched, from, to, load_guard }
    }
}

impl Drop for PhaseSwitch<'_> {
    fn drop(&mut self) {
        tls_pop(self.pm.addr(), self.to);
        let back = self.pm.relock_raw(self.sched, self.to, self.from);
        debug_assert!(back.is_none(), "switching back into load");
        self.load_guard.take();
    }
}

/// Temporarily release the held phase lock (around a `wait()`), reacquired
/// on drop. This is the safe point where a pending exclusive load can
/// drain shared holders.
pub struct PhaseUnlock<'e> {
    pm: &'e PhaseMutex,
    sched: &'e Scheduler,
    phase: RunPhase,
}

impl<'e> PhaseUnlock<'e> {
    pub fn new(pm: &'e PhaseMutex, sched: &'e Scheduler) -> Self {
        let phase = tls_top(pm.addr()).expect("phase unlock without a held phase lock");
        debug_assert_ne!(phase, RunPhase::Load, "unlocking an exclusive load around a wait");
        // The TLS entry comes off too: tasks executed while we wait must
        // acquire the phase for real, not reference the released lock.
        tls_pop(pm.addr(), phase);
        pm.unlock_raw(phase);
        PhaseUnlock { pm, sched, phase }
    }
}

impl Drop for PhaseUnlock<'_> {
    fn drop(&mut self) {
        self.pm.lock_raw(self.sched, self.phase);
        tls_push(self.pm.addr(), self.phase);
    }
}
