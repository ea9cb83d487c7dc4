//! Task and thread scheduler.
//!
//! Built for "substantial" tasks (running a process, matching a subtree)
//! where synchronization cost is amortized over the work. A master thread
//! schedules tasks with [`Scheduler::spawn`] and awaits them with
//! [`Scheduler::wait`]; if a helper thread is available the task runs
//! asynchronously, otherwise the master works through its own queue. Only
//! `max_active` threads are ever runnable at a time: a master suspending in
//! `wait()` releases its active slot so a helper or a ready master can take
//! it.
//!
//! Suspended masters are not reused as helpers (they could be blocked on a
//! nested wait further down their stack); a fresh helper is created instead,
//! so the total thread count normally exceeds `max_active`. The soft ceiling
//! is `max_threads`.

mod queue;

pub use queue::TaskDeque;

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Scheduler failure.
#[derive(Debug, Error)]
pub enum SchedError {
    /// The scheduler was shut down while the operation was in flight.
    #[error("scheduler shut down")]
    Cancelled,

    /// A helper thread could not be created.
    #[error("unable to create helper thread")]
    Helper(#[from] io::Error),
}

/// A shared task counter.
///
/// `spawn` increments it; the task decrements it on completion, resuming
/// waiters when the count crosses the start threshold. A producer that sets
/// an alternative start value by hand must call [`Scheduler::resume`]
/// itself.
#[derive(Clone, Debug, Default)]
pub struct TaskCount(Arc<AtomicUsize>);

impl TaskCount {
    pub fn new() -> Self {
        TaskCount(Arc::new(AtomicUsize::new(0)))
    }

    pub fn with_value(v: usize) -> Self {
        TaskCount(Arc::new(AtomicUsize::new(v)))
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl Deref for TaskCount {
    type Target = AtomicUsize;

    fn deref(&self) -> &AtomicUsize {
        &self.0
    }
}

/// How `wait()` treats the caller's own task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkQueue {
    /// Don't work own queue. Required when waiting on a foreign task count
    /// to avoid blocking on a task that may in turn wait on us.
    None,
    /// Work own queue, rechecking the task count after every task.
    One,
    /// Work own queue dry before rechecking the task count.
    All,
}

/// Scheduling statistics, returned by [`Scheduler::shutdown`].
#[derive(Debug, Clone, Default)]
pub struct SchedStats {
    pub thread_max_active: usize,
    pub thread_max_total: usize,
    pub thread_helpers: usize,
    pub thread_max_waiting: usize,

    pub task_queue_depth: usize,
    pub task_queue_full: usize,
    pub task_queue_remain: usize,

    pub wait_queue_slots: usize,
    pub wait_queue_collisions: usize,
}

struct Task {
    start: usize,
    count: TaskCount,
    thunk: Box<dyn FnOnce() + Send>,
}

type SharedDeque = Arc<Mutex<TaskDeque<Task>>>;

struct WaitSlot {
    lock: Mutex<SlotInner>,
    condv: Condvar,
}

struct SlotInner {
    waiters: usize,
    count_addr: usize,
    shutdown: bool,
}

struct Counters {
    active: usize,
    idle: usize,
    waiting: usize,
    ready: usize,
    starting: usize,
    helpers: usize,
    stat_max_waiting: usize,
}

struct MonitorState {
    count: TaskCount,
    init: usize,
    func: Box<dyn Fn(usize) -> usize + Send + Sync>,
}

struct Inner {
    id: u64,

    max_active: usize,
    init_active: usize,
    max_threads: usize,
    queue_depth: usize,
    max_stack: Option<usize>,

    state: Mutex<Counters>,
    idle_condv: Condvar,
    ready_condv: Condvar,

    wait_slots: Box<[WaitSlot]>,
    stat_wait_collisions: AtomicUsize,

    queues: Mutex<Vec<SharedDeque>>,
    queued: AtomicUsize,

    // Incremented on every active -> waiting -> ready -> active transition;
    // a watchdog seeing no change across all threads has found a livelock.
    progress: AtomicUsize,

    shutdown: AtomicBool,

    monitor: Mutex<Option<MonitorState>>,
    monitor_threshold: AtomicUsize,

    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

static NEXT_SCHED_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static OWN_QUEUE: RefCell<Option<(u64, SharedDeque)>> = const { RefCell::new(None) };
}

/// The bounded-concurrency task scheduler.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler with `max_active` runnable threads and defaults
    /// for everything else (one initially-active caller thread, about
    /// 8 x `max_active` total threads, a queue depth proportional to
    /// `max_active`).
    pub fn new(max_active: usize) -> Self {
        Self::with_tuning(max_active, 1, 0, 0, None)
    }

    /// Create a scheduler with explicit tuning. Zero `max_threads` or
    /// `queue_depth` selects the default.
    pub fn with_tuning(
        max_active: usize,
        init_active: usize,
        max_threads: usize,
        queue_depth: usize,
        max_stack: Option<usize>,
    ) -> Self {
        assert!(max_active >= 1);
        assert!(init_active >= 1, "someone has to schedule the first task");

        let max_threads = if max_threads != 0 {
            max_threads.max(init_active)
        } else if max_active == 1 {
            init_active
        } else {
            max_active * 8
        };

        let queue_depth = if queue_depth != 0 { queue_depth } else { (max_active * 8).max(4) };

        // One slot per potential waiter keeps collisions bounded.
        let slots = max_threads.next_power_of_two().max(4);
        let wait_slots = (0..slots)
            .map(|_| WaitSlot {
                lock: Mutex::new(SlotInner { waiters: 0, count_addr: 0, shutdown: false }),
                condv: Condvar::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Scheduler {
            inner: Arc::new(Inner {
                id: NEXT_SCHED_ID.fetch_add(1, Ordering::Relaxed),
                max_active,
                init_active,
                max_threads,
                queue_depth,
                max_stack,
                state: Mutex::new(Counters {
                    active: init_active,
                    idle: 0,
                    waiting: 0,
                    ready: 0,
                    starting: 0,
                    helpers: 0,
                    stat_max_waiting: 0,
                }),
                idle_condv: Condvar::new(),
                ready_condv: Condvar::new(),
                wait_slots,
                stat_wait_collisions: AtomicUsize::new(0),
                queues: Mutex::new(Vec::new()),
                queued: AtomicUsize::new(0),
                progress: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                monitor: Mutex::new(None),
                monitor_threshold: AtomicUsize::new(0),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Number of hardware threads, or 1 if it cannot be determined.
    pub fn hardware_concurrency() -> usize {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }

    /// True if the scheduler runs tasks serially.
    pub fn serial(&self) -> bool {
        self.inner.max_active == 1
    }

    pub fn max_active(&self) -> usize {
        self.inner.max_active
    }

    /// The progress counter (see the livelock note on the type).
    pub fn progress(&self) -> usize {
        self.inner.progress.load(Ordering::Relaxed)
    }

    /// A prime shard size appropriate for this scheduler's concurrency.
    /// Use power-of-two `mul` for higher-contention shards and `div` for
    /// lower-contention ones. Always 1 for serial execution.
    pub fn shard_size(&self, mul: usize, div: usize) -> usize {
        if self.serial() {
            return 1;
        }

        const PRIMES: &[usize] =
            &[3, 7, 13, 23, 41, 67, 109, 177, 287, 463, 751, 1217, 1973, 3191, 5163];

        let n = (self.inner.max_active * mul) / div.max(1);
        PRIMES.iter().copied().find(|&p| p >= n).unwrap_or(*PRIMES.last().unwrap())
    }

    /// Schedule a task.
    ///
    /// If a helper is available the task is queued for asynchronous
    /// execution and `Ok(true)` is returned. If the thread budget is
    /// exhausted and the caller's queue is full (or execution is serial),
    /// the task runs synchronously here and `Ok(false)` is returned. The
    /// task count is incremented before returning in all cases; the task's
    /// completion decrements it and resumes waiters at the start count.
    pub fn spawn<F>(
        &self,
        start_count: usize,
        task_count: &TaskCount,
        f: F,
    ) -> Result<bool, SchedError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(SchedError::Cancelled);
        }

        task_count.fetch_add(1, Ordering::AcqRel);

        let task =
            Task { start: start_count, count: task_count.clone(), thunk: Box::new(f) };

        if self.serial() {
            self.run_task(task);
            return Ok(false);
        }

        let q = self.own_queue();
        let pushed = {
            let mut q = q.lock().unwrap();
            q.push(task)
        };

        match pushed {
            Ok(()) => {
                self.inner.queued.fetch_add(1, Ordering::Release);
                self.activate_helper()?;
                Ok(true)
            }
            Err(task) => {
                // Queue full: execute synchronously in this thread.
                self.run_task(task);
                Ok(false)
            }
        }
    }

    /// Wait until the task count drops to the start count or below.
    ///
    /// The caller first works its own queue according to `wq` (only tasks
    /// queued below its own frame; see [`TaskDeque`]), then suspends,
    /// releasing its active slot. Returns the observed count. This is a
    /// synchronization point: the count is read with acquire ordering, so
    /// completed tasks' writes are visible.
    pub fn wait(
        &self,
        start_count: usize,
        task_count: &TaskCount,
        wq: WorkQueue,
    ) -> Result<usize, SchedError> {
        if wq != WorkQueue::None {
            let q = self.own_queue();
            loop {
                let n = task_count.load(Ordering::Acquire);
                if n <= start_count {
                    return Ok(n);
                }

                if wq == WorkQueue::All {
                    // Drain own-level tasks dry before rechecking.
                    if !self.work_own_queue_all(&q) {
                        break;
                    }
                } else if !self.work_own_queue_one(&q) {
                    break;
                }
            }
        }

        self.suspend(start_count, task_count)
    }

    /// Resume threads waiting on this task count.
    pub fn resume(&self, task_count: &TaskCount) {
        let slot = self.slot_for(task_count.addr());
        let g = slot.lock.lock().unwrap();
        if g.waiters > 0 {
            slot.condv.notify_all();
        }
    }

    /// Release the caller's active slot before blocking on something other
    /// than a task count (a file lock, a process wait).
    pub fn deactivate(&self) {
        if self.serial() {
            return;
        }

        let mut s = self.inner.state.lock().unwrap();
        s.active -= 1;
        self.wake_one(&mut s);
        self.inner.progress.fetch_add(1, Ordering::Relaxed);
    }

    /// Reacquire an active slot after [`deactivate`]. With
    /// `collision = true` the `max_active` ceiling may be overshot (the
    /// overshoot converges back as other threads suspend).
    ///
    /// [`deactivate`]: Scheduler::deactivate
    pub fn activate(&self, collision: bool) {
        if self.serial() {
            return;
        }

        let mut s = self.inner.state.lock().unwrap();
        if !collision {
            while s.active >= self.inner.max_active
                && !self.inner.shutdown.load(Ordering::Relaxed)
            {
                s = self.inner.ready_condv.wait(s).unwrap();
            }
        }
        s.active += 1;
        self.inner.progress.fetch_add(1, Ordering::Relaxed);
    }

    /// Deactivated sleep: may sleep significantly longer than requested
    /// while the thread reacquires its active slot.
    pub fn sleep(&self, d: Duration) {
        self.deactivate();
        thread::sleep(d);
        self.activate(false);
    }

    /// Account the calling thread, brought from outside the scheduler, as
    /// an additional active participant. The `init_active` threads are
    /// accounted at startup; any other thread that will take phase locks
    /// or wait on task counts must join first and [`leave`] when done.
    ///
    /// [`leave`]: Scheduler::leave
    pub fn join(&self) {
        if self.serial() {
            return;
        }
        let mut s = self.inner.state.lock().unwrap();
        s.active += 1;
    }

    /// Undo [`join`].
    ///
    /// [`join`]: Scheduler::join
    pub fn leave(&self) {
        if self.serial() {
            return;
        }
        let mut s = self.inner.state.lock().unwrap();
        s.active -= 1;
        self.wake_one(&mut s);
    }

    /// Register a progress monitor on a counter.
    ///
    /// The callback is invoked between tasks whenever the counter crosses
    /// the threshold in its established direction and returns the next
    /// threshold (0 disables). Set it before any tasks are queued and let
    /// the guard drop after all of them have completed.
    pub fn monitor<F>(&self, count: &TaskCount, threshold: usize, f: F) -> MonitorGuard<'_>
    where
        F: Fn(usize) -> usize + Send + Sync + 'static,
    {
        assert!(threshold != 0, "zero threshold is reserved");

        let init = count.load(Ordering::Relaxed);
        *self.inner.monitor.lock().unwrap() =
            Some(MonitorState { count: count.clone(), init, func: Box::new(f) });
        self.inner.monitor_threshold.store(threshold, Ordering::Release);

        MonitorGuard { sched: Some(self) }
    }

    /// Shut the scheduler down, cancelling in-flight and subsequent
    /// `spawn`/`wait` calls, and return the accumulated statistics.
    pub fn shutdown(&self) -> SchedStats {
        let was = self.inner.shutdown.swap(true, Ordering::AcqRel);

        // Unblock everyone.
        self.inner.idle_condv.notify_all();
        self.inner.ready_condv.notify_all();
        for slot in self.inner.wait_slots.iter() {
            let mut g = slot.lock.lock().unwrap();
            g.shutdown = true;
            slot.condv.notify_all();
        }

        if !was {
            let handles = std::mem::take(&mut *self.inner.handles.lock().unwrap());
            for h in handles {
                let _ = h.join();
            }
        }

        let mut stats = SchedStats {
            thread_max_active: self.inner.max_active,
            thread_max_total: self.inner.max_threads,
            task_queue_depth: self.inner.queue_depth,
            wait_queue_slots: self.inner.wait_slots.len(),
            wait_queue_collisions: self.inner.stat_wait_collisions.load(Ordering::Relaxed),
            ..SchedStats::default()
        };

        {
            let s = self.inner.state.lock().unwrap();
            stats.thread_helpers = s.helpers;
            stats.thread_max_waiting = s.stat_max_waiting;
        }

        for q in self.inner.queues.lock().unwrap().iter() {
            let mut q = q.lock().unwrap();
            stats.task_queue_full += q.stat_full;
            stats.task_queue_remain += q.len();
            // Abandoned tasks: drop the thunks, leave the counts; waiters
            // have been cancelled above.
            drop(q.drain());
        }

        stats
    }

    // Queue access.

    fn own_queue(&self) -> SharedDeque {
        let inner = &self.inner;
        OWN_QUEUE.with(|tls| {
            let mut tls = tls.borrow_mut();
            match tls.as_ref() {
                Some((id, q)) if *id == inner.id => q.clone(),
                _ => {
                    let q: SharedDeque = Arc::new(Mutex::new(TaskDeque::new(inner.queue_depth)));
                    inner.queues.lock().unwrap().push(q.clone());
                    *tls = Some((inner.id, q.clone()));
                    q
                }
            }
        })
    }

    /// Pop and run one own-level task. Returns false if there was none.
    fn work_own_queue_one(&self, q: &SharedDeque) -> bool {
        let popped = q.lock().unwrap().pop_back_begin();
        match popped {
            Some((task, token)) => {
                self.inner.queued.fetch_sub(1, Ordering::Release);
                self.run_task(task);
                q.lock().unwrap().pop_back_end(token);
                true
            }
            None => false,
        }
    }

    /// Run own-level tasks until none remain. Returns false if none ran.
    fn work_own_queue_all(&self, q: &SharedDeque) -> bool {
        let mut any = false;
        while self.work_own_queue_one(q) {
            any = true;
        }
        any
    }

    fn run_task(&self, task: Task) {
        let Task { start, count, thunk } = task;
        thunk();

        let prev = count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "task count underflow");
        if prev - 1 <= start {
            self.resume(&count);
        }

        self.monitor_check();
    }

    fn monitor_check(&self) {
        let t = self.inner.monitor_threshold.load(Ordering::Relaxed);
        if t == 0 {
            return;
        }

        // "Lock" the monitor by setting the threshold to 0.
        if self
            .inner
            .monitor_threshold
            .compare_exchange(t, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let mut next = t;
        if let Some(m) = self.inner.monitor.lock().unwrap().as_ref() {
            let v = m.count.load(Ordering::Relaxed);
            if v != m.init {
                // Crossed in the established direction?
                let crossed = if v > m.init { v >= t } else { v <= t };
                if crossed {
                    next = (m.func)(v);
                }
            }
        }

        self.inner.monitor_threshold.store(next, Ordering::Release);
    }

    // Thread management.

    fn activate_helper(&self) -> Result<(), SchedError> {
        let mut s = self.inner.state.lock().unwrap();

        if s.idle > 0 {
            self.inner.idle_condv.notify_one();
        } else if s.helpers + self.inner.init_active < self.inner.max_threads {
            // No idle helper: create one even if all active slots are
            // taken right now; it parks until a slot frees (a suspended
            // master is not reused as a helper).
            self.create_helper(&mut s)?;
        }

        Ok(())
    }

    fn create_helper(&self, s: &mut Counters) -> Result<(), SchedError> {
        s.helpers += 1;
        s.starting += 1;

        let inner = self.inner.clone();
        let mut builder =
            thread::Builder::new().name(format!("slipway-worker-{}", s.helpers));
        if let Some(stack) = self.inner.max_stack {
            builder = builder.stack_size(stack);
        }

        match builder.spawn(move || helper_main(inner)) {
            Ok(h) => {
                self.inner.handles.lock().unwrap().push(h);
                Ok(())
            }
            Err(e) => {
                s.helpers -= 1;
                s.starting -= 1;
                Err(SchedError::Helper(e))
            }
        }
    }

    /// Wake threads that can make use of a freed active slot: ready
    /// masters and activate() waiters recheck the ceiling, and an idle
    /// helper takes the slot when there is queued work.
    fn wake_one(&self, s: &mut Counters) {
        self.inner.ready_condv.notify_all();
        if s.idle > 0 && self.inner.queued.load(Ordering::Acquire) > 0 {
            self.inner.idle_condv.notify_one();
        }
    }

    fn slot_for(&self, addr: usize) -> &WaitSlot {
        let mut h = DefaultHasher::new();
        addr.hash(&mut h);
        let i = (h.finish() as usize) % self.inner.wait_slots.len();
        &self.inner.wait_slots[i]
    }

    fn suspend(&self, start: usize, count: &TaskCount) -> Result<usize, SchedError> {
        let slot = self.slot_for(count.addr());

        let mut g = slot.lock.lock().unwrap();

        // Collision statistic: the slot is already hosting a different
        // count's waiters.
        if g.waiters > 0 && g.count_addr != count.addr() {
            self.inner.stat_wait_collisions.fetch_add(1, Ordering::Relaxed);
        }
        g.count_addr = count.addr();
        g.waiters += 1;

        // Release our active slot so another thread can run.
        {
            let mut s = self.inner.state.lock().unwrap();
            s.active -= 1;
            s.waiting += 1;
            if s.waiting > s.stat_max_waiting {
                s.stat_max_waiting = s.waiting;
            }
            self.wake_one(&mut s);
        }

        while count.load(Ordering::Acquire) > start && !g.shutdown {
            g = slot.condv.wait(g).unwrap();
        }

        g.waiters -= 1;
        let cancelled = g.shutdown;
        drop(g);

        // Reacquire an active slot.
        {
            let mut s = self.inner.state.lock().unwrap();
            s.waiting -= 1;
            s.ready += 1;
            while s.active >= self.inner.max_active
                && !self.inner.shutdown.load(Ordering::Relaxed)
            {
                s = self.inner.ready_condv.wait(s).unwrap();
            }
            s.ready -= 1;
            s.active += 1;
        }
        self.inner.progress.fetch_add(1, Ordering::Relaxed);

        let n = count.load(Ordering::Acquire);
        if n <= start {
            Ok(n)
        } else {
            debug_assert!(cancelled);
            Err(SchedError::Cancelled)
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.inner.shutdown.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

/// Clears the monitor on drop.
pub struct MonitorGuard<'s> {
    sched: Option<&'s Scheduler>,
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        if let Some(s) = self.sched.take() {
            s.inner.monitor_threshold.store(0, Ordering::Release);
            *s.inner.monitor.lock().unwrap() = None;
        }
    }
}

fn helper_main(inner: Arc<Inner>) {
    let sched = Scheduler { inner };
    let mut first = true;

    loop {
        {
            let mut s = sched.inner.state.lock().unwrap();
            if first {
                s.starting -= 1;
                first = false;
            } else {
                s.active -= 1;
                // The freed slot may unblock a ready master.
                sched.wake_one(&mut s);
            }
            s.idle += 1;

            loop {
                if sched.inner.shutdown.load(Ordering::Acquire) {
                    s.idle -= 1;
                    return;
                }
                if sched.inner.queued.load(Ordering::Acquire) > 0
                    && s.active < sched.inner.max_active
                {
                    break;
                }
                s = sched.inner.idle_condv.wait(s).unwrap();
            }

            s.idle -= 1;
            s.active += 1;
        }

        // Steal from the front of any queue until nothing is left.
        while !sched.inner.shutdown.load(Ordering::Acquire) {
            match steal(&sched) {
                Some(task) => sched.run_task(task),
                None => break,
            }
        }
    }
}

fn steal(sched: &Scheduler) -> Option<Task> {
    let queues: Vec<SharedDeque> = sched.inner.queues.lock().unwrap().clone();
    for q in queues {
        let task = q.lock().unwrap().pop_front();
        if let Some(task) = task {
            sched.inner.queued.fetch_sub(1, Ordering::Release);
            return Some(task);
        }
    }
    None
}

// The helper clones Inner into a Scheduler value for code reuse; its Drop
// must not shut the scheduler down, which is why Drop checks the flag and
// shutdown() is idempotent on the join side.
