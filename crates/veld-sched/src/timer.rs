//! Timer Thread - Slices, Sleepers, Signals, FD Readiness
//!
//! One native thread drives everything time- or readiness-shaped:
//!
//! 1. Drain the self-pipe wakeup.
//! 2. Wake threads whose sleep deadline passed.
//! 3. Raise the time-slice interrupt on contended running threads.
//! 4. Forward pending process signals to the main thread.
//! 5. Top up GRQ ractors with freed serving slots.
//! 6. Wake threads parked on ready file descriptors.
//!
//! The multiplexer is epoll on Linux and poll elsewhere on unix;
//! non-unix builds fall back to a plain tick loop without fd support.
//! Any other thread wakes the loop by writing one byte to the pipe.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{Result, SchedError};
use crate::scheduler::Scheduler;
use crate::thread::{interrupt, VeldThread};

/// Idle tick when nothing is due sooner.
const TIMER_TICK: Duration = Duration::from_millis(10);

#[cfg(unix)]
struct IoWaiter {
    thread: Arc<VeldThread>,
    readable: bool,
    ready: bool,
}

struct TimerState {
    scheduler: Weak<Scheduler>,
    running: AtomicBool,

    #[cfg(unix)]
    wake_r: i32,
    #[cfg(unix)]
    wake_w: i32,
    #[cfg(target_os = "linux")]
    epfd: i32,

    /// Sleepers ordered by absolute deadline.
    sleepers: Mutex<BTreeMap<(Instant, u64), Arc<VeldThread>>>,
    #[cfg(unix)]
    io_waiters: Mutex<FxHashMap<i32, IoWaiter>>,
    /// Process signals awaiting forwarding to the main thread.
    signals: Mutex<Vec<i32>>,
    main_thread: Mutex<Option<Arc<VeldThread>>>,
}

/// Handle to the running timer thread.
pub struct TimerThread {
    state: Arc<TimerState>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl TimerThread {
    pub(crate) fn start(scheduler: Weak<Scheduler>) -> Result<Arc<TimerThread>> {
        let state = Arc::new(TimerState {
            scheduler,
            running: AtomicBool::new(true),
            #[cfg(unix)]
            wake_r: -1,
            #[cfg(unix)]
            wake_w: -1,
            #[cfg(target_os = "linux")]
            epfd: -1,
            sleepers: Mutex::new(BTreeMap::new()),
            #[cfg(unix)]
            io_waiters: Mutex::new(FxHashMap::default()),
            signals: Mutex::new(Vec::new()),
            main_thread: Mutex::new(None),
        });

        #[cfg(unix)]
        let state = {
            let mut state = state;
            let (r, w) = make_pipe()?;
            // The fds are set once before the loop starts.
            let s = Arc::get_mut(&mut state).expect("fresh state is unshared");
            s.wake_r = r;
            s.wake_w = w;
            #[cfg(target_os = "linux")]
            {
                s.epfd = epoll_create(r)?;
            }
            state
        };

        let loop_state = Arc::clone(&state);
        let handle = std::thread::Builder::new()
            .name("veld-timer".to_string())
            .spawn(move || timer_loop(loop_state))
            .map_err(|e| SchedError::Timer(e.to_string()))?;
        log::debug!("timer thread started");

        Ok(Arc::new(TimerThread {
            state,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Wake the loop: one byte down the self-pipe.
    pub fn wakeup(&self) {
        #[cfg(unix)]
        unsafe {
            let byte = 1u8;
            libc::write(
                self.state.wake_w,
                &byte as *const u8 as *const libc::c_void,
                1,
            );
        }
    }

    /// Park `th` until `deadline`; the loop raises its pending interrupt.
    pub fn register_sleep(&self, th: &Arc<VeldThread>, deadline: Instant) {
        self.state
            .sleepers
            .lock()
            .insert((deadline, th.id), Arc::clone(th));
        self.wakeup();
    }

    /// Cancel a sleep registration (wakeup raced the deadline).
    pub fn cancel_sleep(&self, th: &Arc<VeldThread>) {
        self.state.sleepers.lock().retain(|_, v| v.id != th.id);
    }

    /// Register an fd-readiness wait for `th`.
    #[cfg(unix)]
    pub fn register_io(&self, fd: i32, readable: bool, th: &Arc<VeldThread>) {
        self.state.io_waiters.lock().insert(
            fd,
            IoWaiter {
                thread: Arc::clone(th),
                readable,
                ready: false,
            },
        );
        #[cfg(target_os = "linux")]
        epoll_add(self.state.epfd, fd, readable);
        self.wakeup();
    }

    /// Whether the fd fired before its waiter gave up.
    #[cfg(unix)]
    pub(crate) fn take_io_ready(&self, fd: i32) -> bool {
        self.state
            .io_waiters
            .lock()
            .get(&fd)
            .is_some_and(|w| w.ready)
    }

    #[cfg(unix)]
    pub fn deregister_io(&self, fd: i32) {
        self.state.io_waiters.lock().remove(&fd);
        #[cfg(target_os = "linux")]
        epoll_del(self.state.epfd, fd);
    }

    /// Queue a process signal for delivery to the main thread.
    pub fn forward_signal(&self, signo: i32) {
        self.state.signals.lock().push(signo);
        self.wakeup();
    }

    /// Name the thread that receives forwarded signals.
    pub fn set_main_thread(&self, th: &Arc<VeldThread>) {
        *self.state.main_thread.lock() = Some(Arc::clone(th));
    }

    pub fn pending_sleepers(&self) -> usize {
        self.state.sleepers.lock().len()
    }

    /// Stop and join the loop.
    pub fn stop(&self) {
        self.state.running.store(false, Ordering::Release);
        self.wakeup();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.stop();
        #[cfg(unix)]
        unsafe {
            libc::close(self.state.wake_r);
            libc::close(self.state.wake_w);
            #[cfg(target_os = "linux")]
            libc::close(self.state.epfd);
        }
    }
}

fn timer_loop(state: Arc<TimerState>) {
    while state.running.load(Ordering::Acquire) {
        let timeout = next_timeout(&state);

        let ready_fds = wait_for_events(&state, timeout);

        if !state.running.load(Ordering::Acquire) {
            break;
        }

        // 2. Expired sleepers.
        let now = Instant::now();
        let expired: Vec<Arc<VeldThread>> = {
            let mut sleepers = state.sleepers.lock();
            let still: Vec<(Instant, u64)> = sleepers
                .range(..=(now, u64::MAX))
                .map(|(&k, _)| k)
                .collect();
            still
                .into_iter()
                .filter_map(|k| sleepers.remove(&k))
                .collect()
        };
        for th in expired {
            th.set_interrupt(interrupt::PENDING);
        }

        let Some(scheduler) = state.scheduler.upgrade() else {
            break;
        };

        // 3. Time-slice interrupts for contended ractors.
        for th in scheduler.take_timeslice_threads() {
            th.set_interrupt(interrupt::TIMER);
        }

        // 4. Forward signals to the main thread.
        let signals: Vec<i32> = state.signals.lock().drain(..).collect();
        if !signals.is_empty() {
            if let Some(main) = state.main_thread.lock().as_ref() {
                main.set_interrupt(interrupt::PENDING);
            }
        }

        // 5. Top up ractors waiting for a serving slot.
        scheduler.grq_topup();

        // 6. Wake fd waiters.
        #[cfg(unix)]
        {
            let mut waiters = state.io_waiters.lock();
            for fd in ready_fds {
                if let Some(waiter) = waiters.get_mut(&fd) {
                    waiter.ready = true;
                    waiter.thread.set_interrupt(interrupt::PENDING);
                }
            }
        }
        #[cfg(not(unix))]
        let _ = ready_fds;
    }
}

fn next_timeout(state: &TimerState) -> Duration {
    let sleepers = state.sleepers.lock();
    match sleepers.keys().next() {
        Some(&(deadline, _)) => {
            let now = Instant::now();
            if deadline <= now {
                Duration::ZERO
            } else {
                (deadline - now).min(TIMER_TICK)
            }
        }
        None => TIMER_TICK,
    }
}

// ============================================================================
// Platform multiplexers
// ============================================================================

#[cfg(unix)]
fn make_pipe() -> Result<(i32, i32)> {
    unsafe {
        let mut fds = [0i32; 2];
        if libc::pipe(fds.as_mut_ptr()) != 0 {
            return Err(SchedError::Timer("pipe() failed".to_string()));
        }
        for fd in fds {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        Ok((fds[0], fds[1]))
    }
}

#[cfg(unix)]
fn drain_pipe(fd: i32) {
    unsafe {
        let mut buf = [0u8; 64];
        while libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) > 0 {}
    }
}

#[cfg(target_os = "linux")]
fn epoll_create(wake_r: i32) -> Result<i32> {
    unsafe {
        let epfd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
        if epfd < 0 {
            return Err(SchedError::Multiplexer("epoll_create1 failed".to_string()));
        }
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_r as u64,
        };
        if libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_r, &mut ev) != 0 {
            return Err(SchedError::Multiplexer(
                "epoll_ctl(ADD, wake pipe) failed".to_string(),
            ));
        }
        Ok(epfd)
    }
}

#[cfg(target_os = "linux")]
fn epoll_add(epfd: i32, fd: i32, readable: bool) {
    unsafe {
        let interest = if readable { libc::EPOLLIN } else { libc::EPOLLOUT };
        let events = (interest | libc::EPOLLONESHOT) as u32;
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        if libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) != 0 {
            libc::epoll_ctl(epfd, libc::EPOLL_CTL_MOD, fd, &mut ev);
        }
    }
}

#[cfg(target_os = "linux")]
fn epoll_del(epfd: i32, fd: i32) {
    unsafe {
        libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
    }
}

/// Wait on the multiplexer; returns ready fds (wake pipe excluded).
#[cfg(target_os = "linux")]
fn wait_for_events(state: &TimerState, timeout: Duration) -> Vec<i32> {
    unsafe {
        let mut events: [libc::epoll_event; 16] = std::mem::zeroed();
        let n = libc::epoll_wait(
            state.epfd,
            events.as_mut_ptr(),
            events.len() as i32,
            timeout.as_millis() as i32,
        );
        let mut ready = Vec::new();
        for ev in events.iter().take(n.max(0) as usize) {
            let fd = ev.u64 as i32;
            if fd == state.wake_r {
                drain_pipe(state.wake_r);
            } else {
                ready.push(fd);
            }
        }
        ready
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn wait_for_events(state: &TimerState, timeout: Duration) -> Vec<i32> {
    unsafe {
        let mut fds: Vec<libc::pollfd> = vec![libc::pollfd {
            fd: state.wake_r,
            events: libc::POLLIN,
            revents: 0,
        }];
        {
            let waiters = state.io_waiters.lock();
            for (&fd, waiter) in waiters.iter() {
                fds.push(libc::pollfd {
                    fd,
                    events: if waiter.readable {
                        libc::POLLIN
                    } else {
                        libc::POLLOUT
                    },
                    revents: 0,
                });
            }
        }

        let n = libc::poll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            timeout.as_millis() as i32,
        );
        let mut ready = Vec::new();
        if n > 0 {
            for pfd in &fds {
                if pfd.revents == 0 {
                    continue;
                }
                if pfd.fd == state.wake_r {
                    drain_pipe(state.wake_r);
                } else {
                    ready.push(pfd.fd);
                }
            }
        }
        ready
    }
}

#[cfg(not(unix))]
fn wait_for_events(_state: &TimerState, timeout: Duration) -> Vec<i32> {
    std::thread::sleep(timeout);
    Vec::new()
}
