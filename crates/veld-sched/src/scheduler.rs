//! Global Scheduler - M:N Thread Multiplexing
//!
//! Threads are multiplexed onto native threads per ractor: a dedicated
//! native thread (DNT) serves exactly one thread, shared native threads
//! (SNT) serve the ready queues of ractors holding a serving slot. The
//! number of serving slots is capped by `min(live ractors, max_cpu)`;
//! ractors that cannot get a slot queue on the global ractor queue (GRQ)
//! until the timer thread or a slot release tops them up.
//!
//! The stop-the-world barrier: the initiator raises `barrier_waiting`,
//! interrupts every other running thread, and waits until all of them
//! have parked at a safepoint. Parked joiners resume only when the
//! barrier serial advances.
//!
//! Turn transfer is a structured hand-off through the Sched lock and the
//! threads' turn latches; a "coroutine transfer" is a grant on the
//! target followed by a wait on the source.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::{Result, SchedError};
use crate::hooks::{event, HookFn, HookHandle, HookRegistry};
use crate::sched::Sched;
use crate::stack::{StackPool, StackSlice};
use crate::thread::{interrupt, ThreadState, VeldThread};
use crate::timer::TimerThread;

pub(crate) struct GlobalInner {
    /// Threads currently executing (or parked at a barrier safepoint).
    pub running_threads: FxHashMap<u64, Arc<VeldThread>>,
    /// Running threads with contended ractors, due a time-slice tick.
    pub timeslice_threads: FxHashMap<u64, Arc<VeldThread>>,
    /// Ractors waiting for a shared-NT serving slot.
    pub grq: VecDeque<u64>,
    pub snt_cnt: usize,
    pub dnt_cnt: usize,
    pub live_ractor_cnt: usize,

    pub barrier_waiting: bool,
    pub barrier_waiting_cnt: usize,
    pub barrier_serial: u64,

    pub shutting_down: bool,
}

/// The process-wide scheduler for one VM.
pub struct Scheduler {
    pub(crate) inner: Mutex<GlobalInner>,
    pub(crate) barrier_complete: Condvar,
    pub(crate) barrier_release: Condvar,

    pub(crate) hooks: HookRegistry,
    pub(crate) ractors: RwLock<FxHashMap<u64, Arc<Sched>>>,
    pub(crate) stack_pool: Arc<StackPool>,
    pub(crate) timer: Mutex<Option<Arc<TimerThread>>>,
    join_handles: Mutex<FxHashMap<u64, std::thread::JoinHandle<()>>>,

    next_thread_id: AtomicU64,
    next_ractor_id: AtomicU64,
    max_cpu: usize,
}

impl Scheduler {
    /// Create a scheduler capping shared native threads at `max_cpu`.
    pub fn new(max_cpu: usize) -> Arc<Self> {
        let max_cpu = if max_cpu == 0 {
            num_cpus::get()
        } else {
            max_cpu
        };

        Arc::new(Self {
            inner: Mutex::new(GlobalInner {
                running_threads: FxHashMap::default(),
                timeslice_threads: FxHashMap::default(),
                grq: VecDeque::new(),
                snt_cnt: 0,
                dnt_cnt: 0,
                live_ractor_cnt: 0,
                barrier_waiting: false,
                barrier_waiting_cnt: 0,
                barrier_serial: 0,
                shutting_down: false,
            }),
            barrier_complete: Condvar::new(),
            barrier_release: Condvar::new(),
            hooks: HookRegistry::new(),
            ractors: RwLock::new(FxHashMap::default()),
            stack_pool: Arc::new(StackPool::new()),
            timer: Mutex::new(None),
            join_handles: Mutex::new(FxHashMap::default()),
            next_thread_id: AtomicU64::new(1),
            next_ractor_id: AtomicU64::new(0),
            max_cpu,
        })
    }

    /// Start the timer thread (time slices, sleepers, fd readiness).
    pub fn start_timer(self: &Arc<Self>) -> Result<()> {
        let mut timer = self.timer.lock();
        if timer.is_none() {
            *timer = Some(TimerThread::start(Arc::downgrade(self))?);
        }
        Ok(())
    }

    pub fn timer(&self) -> Option<Arc<TimerThread>> {
        self.timer.lock().clone()
    }

    pub fn max_cpu(&self) -> usize {
        self.max_cpu
    }

    // ========================================================================
    // Ractors
    // ========================================================================

    /// Create an execution unit with its own Sched.
    pub fn create_ractor(&self) -> u64 {
        let id = self.next_ractor_id.fetch_add(1, Ordering::Relaxed);
        self.ractors.write().insert(id, Sched::new(id));
        self.inner.lock().live_ractor_cnt += 1;
        id
    }

    pub fn sched(&self, ractor: u64) -> Result<Arc<Sched>> {
        self.ractors
            .read()
            .get(&ractor)
            .cloned()
            .ok_or(SchedError::UnknownRactor(ractor))
    }

    // ========================================================================
    // Spawning
    // ========================================================================

    /// Spawn a thread in `ractor`. `dedicated` pins it 1:1 to its native
    /// thread; otherwise it shares serving slots with its ractor peers.
    pub fn spawn<F>(
        self: &Arc<Self>,
        ractor: u64,
        dedicated: bool,
        body: F,
    ) -> Result<Arc<VeldThread>>
    where
        F: FnOnce(&mut ThreadContext) + Send + 'static,
    {
        self.sched(ractor)?;
        if self.inner.lock().shutting_down {
            return Err(SchedError::ShuttingDown);
        }

        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let slice = self.stack_pool.alloc_slice()?;
        let th = Arc::new(VeldThread::new(id, ractor, dedicated, slice));
        log::debug!(
            "spawn thread {} on ractor {} ({})",
            id,
            ractor,
            if dedicated { "dnt" } else { "snt" }
        );

        if dedicated {
            self.inner.lock().dnt_cnt += 1;
        }

        self.hooks.fire(event::STARTED, id);

        let scheduler = Arc::clone(self);
        let thread = Arc::clone(&th);
        let handle = std::thread::Builder::new()
            .name(format!("veld-thread-{}", id))
            .spawn(move || {
                scheduler.to_ready(&thread);
                thread.wait_turn();
                thread.set_state(ThreadState::Running);
                scheduler.hooks.fire(event::RESUMED, thread.id);
                scheduler.check_interrupts(&thread);

                let vm_stack = thread
                    .vm_stack
                    .lock()
                    .take()
                    .expect("thread body must own its stack slice");
                let mut ctx = ThreadContext {
                    scheduler: Arc::clone(&scheduler),
                    thread: Arc::clone(&thread),
                    vm_stack,
                };
                body(&mut ctx);
                let ThreadContext { vm_stack, .. } = ctx;
                thread.vm_stack.lock().replace(vm_stack);

                scheduler.to_dead(&thread);
            })
            .map_err(|e| SchedError::StackAllocation(e.to_string()))?;

        self.join_handles.lock().insert(id, handle);
        Ok(th)
    }

    /// Wait for a thread's native thread to finish.
    pub fn join(&self, th: &Arc<VeldThread>) {
        let handle = self.join_handles.lock().remove(&th.id);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    // ========================================================================
    // Sched operations (global lock, then sched lock)
    // ========================================================================

    /// Enqueue a thread; hand it the turn immediately when its ractor is
    /// idle.
    pub(crate) fn to_ready(&self, th: &Arc<VeldThread>) {
        let sched = match self.sched(th.ractor) {
            Ok(s) => s,
            Err(_) => return,
        };

        {
            let mut g = self.inner.lock();
            let mut s = sched.inner.lock();
            s.lock_owner = Some(th.id);

            th.set_state(ThreadState::Ready);

            if s.running.is_none() {
                self.acquire_serving_slot(&mut g, &mut s, th.ractor, th.is_dedicated());
                s.running = Some(Arc::clone(th));
                g.running_threads.insert(th.id, Arc::clone(th));
                if g.barrier_waiting {
                    th.set_interrupt(interrupt::BARRIER);
                }
                th.grant_turn();
            } else {
                s.readyq.push_back(Arc::clone(th));
                if let Some(running) = s.running.clone() {
                    g.timeslice_threads.insert(running.id, running);
                }
            }
            s.lock_owner = None;
        }

        self.hooks.fire(event::READY, th.id);
    }

    /// Give up the turn when peers are waiting; FIFO order.
    pub(crate) fn yield_now(&self, th: &Arc<VeldThread>) {
        let sched = match self.sched(th.ractor) {
            Ok(s) => s,
            Err(_) => return,
        };

        {
            let mut g = self.inner.lock();
            let mut s = sched.inner.lock();
            s.lock_owner = Some(th.id);

            if s.readyq.is_empty() {
                s.lock_owner = None;
                return;
            }

            let next = s.readyq.pop_front().unwrap();
            g.running_threads.remove(&th.id);
            g.running_threads.insert(next.id, Arc::clone(&next));
            if g.barrier_waiting {
                next.set_interrupt(interrupt::BARRIER);
            }
            s.running = Some(Arc::clone(&next));
            next.grant_turn();

            s.readyq.push_back(Arc::clone(th));
            th.set_state(ThreadState::Ready);
            s.lock_owner = None;
        }

        self.hooks.fire(event::SUSPENDED, th.id);
        th.wait_turn();
        th.set_state(ThreadState::Running);
        self.hooks.fire(event::RESUMED, th.id);
        // Resuming is a safepoint: a barrier raised while this thread
        // was queued must park it before user code continues.
        if th.take_interrupts(interrupt::BARRIER) != 0 {
            self.barrier_join(th);
        }
    }

    /// Leave the running seat without re-queueing (sleep, io wait,
    /// blocking region). The next ready peer takes over.
    pub(crate) fn leave_running(&self, th: &Arc<VeldThread>) {
        let sched = match self.sched(th.ractor) {
            Ok(s) => s,
            Err(_) => return,
        };

        {
            let mut g = self.inner.lock();
            let mut s = sched.inner.lock();
            s.lock_owner = Some(th.id);

            g.running_threads.remove(&th.id);
            g.timeslice_threads.remove(&th.id);

            match s.readyq.pop_front() {
                Some(next) => {
                    g.running_threads.insert(next.id, Arc::clone(&next));
                    if g.barrier_waiting {
                        next.set_interrupt(interrupt::BARRIER);
                    }
                    s.running = Some(Arc::clone(&next));
                    next.grant_turn();
                }
                None => {
                    s.running = None;
                    self.release_serving_slot(&mut g, &mut s, th.is_dedicated());
                }
            }

            th.set_state(ThreadState::Waiting);
            s.lock_owner = None;
        }

        self.hooks.fire(event::SUSPENDED, th.id);
    }

    /// Re-acquire a turn after `leave_running`.
    pub(crate) fn rejoin_running(&self, th: &Arc<VeldThread>) {
        self.to_ready(th);
        th.wait_turn();
        th.set_state(ThreadState::Running);
        self.hooks.fire(event::RESUMED, th.id);
        self.check_interrupts(th);
    }

    /// Final turn hand-off of a dying thread.
    pub(crate) fn to_dead(&self, th: &Arc<VeldThread>) {
        let sched = match self.sched(th.ractor) {
            Ok(s) => s,
            Err(_) => return,
        };

        {
            let mut g = self.inner.lock();
            let mut s = sched.inner.lock();

            g.running_threads.remove(&th.id);
            g.timeslice_threads.remove(&th.id);
            if th.is_dedicated() {
                g.dnt_cnt = g.dnt_cnt.saturating_sub(1);
            }

            match s.readyq.pop_front() {
                Some(next) => {
                    g.running_threads.insert(next.id, Arc::clone(&next));
                    if g.barrier_waiting {
                        next.set_interrupt(interrupt::BARRIER);
                    }
                    s.running = Some(Arc::clone(&next));
                    next.grant_turn();
                }
                None => {
                    s.running = None;
                    self.release_serving_slot(&mut g, &mut s, th.is_dedicated());
                }
            }

            th.set_state(ThreadState::Dead);

            if g.barrier_waiting {
                // One fewer running thread; the initiator may be waiting
                // on exactly this departure.
                self.barrier_complete.notify_one();
            }
        }

        self.hooks.fire(event::EXITED, th.id);
    }

    /// Grant a serving slot to a newly busy ractor, or queue it on the
    /// GRQ when the SNT budget is exhausted.
    fn acquire_serving_slot(
        &self,
        g: &mut GlobalInner,
        s: &mut crate::sched::SchedInner,
        ractor: u64,
        dedicated: bool,
    ) {
        if dedicated || s.serving {
            return;
        }
        let cap = self.max_cpu.min(g.live_ractor_cnt.max(1));
        if g.snt_cnt < cap {
            g.snt_cnt += 1;
            s.serving = true;
        } else if !g.grq.contains(&ractor) {
            // Served when a slot frees up or the timer tops up.
            g.grq.push_back(ractor);
        }
    }

    fn release_serving_slot(
        &self,
        g: &mut GlobalInner,
        s: &mut crate::sched::SchedInner,
        dedicated: bool,
    ) {
        if dedicated || !s.serving {
            return;
        }
        s.serving = false;
        g.snt_cnt = g.snt_cnt.saturating_sub(1);
        if let Some(next_ractor) = g.grq.pop_front() {
            if let Some(next_sched) = self.ractors.read().get(&next_ractor) {
                let mut ns = next_sched.inner.lock();
                if !ns.serving {
                    ns.serving = true;
                    g.snt_cnt += 1;
                }
            }
        }
    }

    /// Top up GRQ ractors with freed slots (timer-thread duty).
    pub(crate) fn grq_topup(&self) {
        let mut g = self.inner.lock();
        let cap = self.max_cpu.min(g.live_ractor_cnt.max(1));
        while g.snt_cnt < cap {
            let Some(ractor) = g.grq.pop_front() else { break };
            if let Some(sched) = self.ractors.read().get(&ractor) {
                let mut s = sched.inner.lock();
                if !s.serving {
                    s.serving = true;
                    g.snt_cnt += 1;
                }
            }
        }
    }

    /// Snapshot of threads due a time-slice interrupt; the registry is
    /// drained each tick and refilled by contention.
    pub(crate) fn take_timeslice_threads(&self) -> Vec<Arc<VeldThread>> {
        let mut g = self.inner.lock();
        g.timeslice_threads.drain().map(|(_, th)| th).collect()
    }

    // ========================================================================
    // Interrupt handling (safepoints)
    // ========================================================================

    /// The safepoint: honor barrier joins and time-slice yields.
    pub(crate) fn check_interrupts(&self, th: &Arc<VeldThread>) {
        if th.take_interrupts(interrupt::BARRIER) != 0 {
            self.barrier_join(th);
        }
        if th.take_interrupts(interrupt::TIMER) != 0 {
            self.yield_now(th);
        }
    }

    // ========================================================================
    // Stop-the-world barrier
    // ========================================================================

    /// Run `f` with every other thread stopped at a safepoint.
    pub(crate) fn barrier<R>(&self, th: &Arc<VeldThread>, f: impl FnOnce() -> R) -> R {
        let mut g = self.inner.lock();

        // One barrier at a time; a second initiator joins as a waiter
        // first.
        while g.barrier_waiting {
            let serial = g.barrier_serial;
            g.barrier_waiting_cnt += 1;
            self.barrier_complete.notify_one();
            while g.barrier_serial == serial {
                self.barrier_release.wait(&mut g);
            }
        }

        g.barrier_waiting = true;
        log::debug!(
            "barrier start by thread {} ({} running)",
            th.id,
            g.running_threads.len()
        );

        for other in g.running_threads.values() {
            if other.id != th.id {
                other.set_interrupt(interrupt::BARRIER);
            }
        }

        while g.running_threads.len() - g.barrier_waiting_cnt > 1 {
            self.barrier_complete.wait(&mut g);
        }
        drop(g);

        let result = f();

        let mut g = self.inner.lock();
        g.barrier_serial += 1;
        g.barrier_waiting_cnt = 0;
        g.barrier_waiting = false;
        log::debug!("barrier release, serial {}", g.barrier_serial);
        self.barrier_release.notify_all();
        drop(g);

        result
    }

    /// Park at the barrier until the initiator releases it.
    fn barrier_join(&self, _th: &Arc<VeldThread>) {
        let mut g = self.inner.lock();
        if !g.barrier_waiting {
            return;
        }
        g.barrier_waiting_cnt += 1;
        self.barrier_complete.notify_one();

        let serial = g.barrier_serial;
        while g.barrier_serial == serial {
            self.barrier_release.wait(&mut g);
        }
    }

    // ========================================================================
    // Event hooks
    // ========================================================================

    /// Register a thread-event hook; events in `mask` are delivered.
    pub fn add_event_hook(&self, mask: u32, callback: HookFn) -> HookHandle {
        self.hooks.add(mask, callback)
    }

    /// Remove a hook registration.
    pub fn remove_event_hook(&self, handle: HookHandle) -> bool {
        self.hooks.remove(handle)
    }

    // ========================================================================
    // Introspection and shutdown
    // ========================================================================

    pub fn running_count(&self) -> usize {
        self.inner.lock().running_threads.len()
    }

    pub fn snt_count(&self) -> usize {
        self.inner.lock().snt_cnt
    }

    pub fn dnt_count(&self) -> usize {
        self.inner.lock().dnt_cnt
    }

    /// Stop the timer thread and refuse new spawns.
    pub fn shutdown(&self) {
        self.inner.lock().shutting_down = true;
        if let Some(timer) = self.timer.lock().take() {
            timer.stop();
        }
    }
}

/// The handle a thread body uses to cooperate with the scheduler.
pub struct ThreadContext {
    scheduler: Arc<Scheduler>,
    thread: Arc<VeldThread>,
    vm_stack: StackSlice,
}

impl ThreadContext {
    pub fn thread(&self) -> &Arc<VeldThread> {
        &self.thread
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// This thread's VM value stack.
    pub fn vm_stack(&mut self) -> &mut [usize] {
        self.vm_stack.as_mut_slice()
    }

    /// Cooperative yield: pass the turn to the next ready peer, if any.
    pub fn yield_now(&self) {
        self.scheduler.yield_now(&self.thread);
    }

    /// Safepoint check: honor pending interrupts.
    pub fn check_safepoint(&self) {
        self.scheduler.check_interrupts(&self.thread);
    }

    /// Sleep for `dur`, releasing the running seat. Returns early when a
    /// waking party interrupts the sleep.
    pub fn sleep(&self, dur: Duration) {
        let deadline = Instant::now() + dur;
        // A stale pending bit from an earlier wait must not cut this
        // sleep short.
        self.thread.take_interrupts(interrupt::PENDING);
        if let Some(timer) = self.scheduler.timer() {
            timer.register_sleep(&self.thread, deadline);
        }

        self.scheduler.leave_running(&self.thread);
        loop {
            if self.thread.take_interrupts(interrupt::PENDING) != 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.thread.wait_turn_interruptible(Some(deadline - now));
        }
        if let Some(timer) = self.scheduler.timer() {
            timer.cancel_sleep(&self.thread);
        }
        self.scheduler.rejoin_running(&self.thread);
    }

    /// Run a blocking native call outside the scheduler: the native
    /// thread goes dedicated for the duration and the ractor's next
    /// ready thread takes the seat.
    pub fn blocking_region<R>(&self, f: impl FnOnce() -> R) -> R {
        self.thread.dedicated.fetch_add(1, Ordering::Relaxed);
        self.scheduler.leave_running(&self.thread);

        let result = f();

        self.scheduler.rejoin_running(&self.thread);
        self.thread.dedicated.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Stop every other thread at a safepoint, run `f`, release.
    pub fn barrier<R>(&self, f: impl FnOnce() -> R) -> R {
        self.scheduler.barrier(&self.thread, f)
    }

    /// Wait for fd readiness via the timer thread's multiplexer.
    /// Returns true when the wait timed out before the fd fired.
    #[cfg(unix)]
    pub fn wait_io(&self, fd: i32, readable: bool, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let timer = match self.scheduler.timer() {
            Some(t) => t,
            None => return true,
        };
        timer.register_io(fd, readable, &self.thread);
        if let Some(deadline) = deadline {
            timer.register_sleep(&self.thread, deadline);
        }

        self.scheduler.leave_running(&self.thread);
        let mut timed_out = false;
        loop {
            if self.thread.take_interrupts(interrupt::PENDING) != 0 {
                timed_out = !timer.take_io_ready(fd);
                break;
            }
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        timed_out = !timer.take_io_ready(fd);
                        break;
                    }
                    self.thread.wait_turn_interruptible(Some(d - now));
                }
                None => {
                    self.thread.wait_turn_interruptible(Some(Duration::from_millis(50)));
                }
            }
        }
        timer.deregister_io(fd);
        timer.cancel_sleep(&self.thread);
        self.scheduler.rejoin_running(&self.thread);
        timed_out
    }
}
