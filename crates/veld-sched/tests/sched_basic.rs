//! Scheduler Basics - Turn Passing, Fairness, Events, Sleeping

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use veld_sched::{event, Scheduler, ThreadState};

#[test]
fn test_single_thread_runs_to_completion() {
    let scheduler = Scheduler::new(2);
    let ractor = scheduler.create_ractor();

    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = Arc::clone(&ran);
    let th = scheduler
        .spawn(ractor, false, move |ctx| {
            ran2.store(true, Ordering::Release);
            assert!(!ctx.vm_stack().is_empty());
            ctx.vm_stack()[0] = 42;
        })
        .unwrap();

    scheduler.join(&th);
    assert!(ran.load(Ordering::Acquire));
    assert_eq!(th.state(), ThreadState::Dead);
}

#[test]
fn test_one_running_thread_per_ractor() {
    let scheduler = Scheduler::new(4);
    let ractor = scheduler.create_ractor();

    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for _ in 0..4 {
        let concurrent = Arc::clone(&concurrent);
        let peak = Arc::clone(&peak);
        threads.push(
            scheduler
                .spawn(ractor, false, move |ctx| {
                    for _ in 0..50 {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        ctx.yield_now();
                    }
                })
                .unwrap(),
        );
    }
    for th in &threads {
        scheduler.join(th);
    }

    assert_eq!(
        peak.load(Ordering::SeqCst),
        1,
        "two threads of one ractor ran at once"
    );
}

#[test]
fn test_yield_is_fifo_fair() {
    let scheduler = Scheduler::new(2);
    let ractor = scheduler.create_ractor();

    let order: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let go = Arc::new(AtomicBool::new(false));
    let mut threads = Vec::new();
    for _ in 0..4 {
        let order = Arc::clone(&order);
        let go = Arc::clone(&go);
        threads.push(
            scheduler
                .spawn(ractor, false, move |ctx| {
                    // Hold the rotation until every peer is enqueued.
                    while !go.load(Ordering::Acquire) {
                        std::thread::sleep(Duration::from_micros(500));
                        ctx.yield_now();
                    }
                    for _ in 0..10 {
                        order.lock().unwrap().push(ctx.thread().id);
                        ctx.yield_now();
                    }
                })
                .unwrap(),
        );
    }
    // All four must be in the rotation before the gate opens.
    let sched = scheduler.sched(ractor).unwrap();
    while sched.ready_count() < 3 || sched.running_thread().is_none() {
        std::thread::sleep(Duration::from_millis(1));
    }
    go.store(true, Ordering::Release);
    for th in &threads {
        scheduler.join(th);
    }

    // Once all four rotate, no thread repeats before its peers ran.
    let order = order.lock().unwrap();
    let ids: Vec<u64> = threads.iter().map(|t| t.id).collect();
    let window = &order[..16];
    for pair in window.windows(ids.len()) {
        let mut seen: Vec<u64> = pair.to_vec();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(
            seen.len(),
            ids.len(),
            "a thread repeated before its peers ran: {:?}",
            pair
        );
    }
}

#[test]
fn test_lifecycle_events_fire_in_order() {
    let scheduler = Scheduler::new(2);
    let ractor = scheduler.create_ractor();

    let events: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let events2 = Arc::clone(&events);
    let handle = scheduler.add_event_hook(
        event::ALL,
        Arc::new(move |bit, _| {
            events2.lock().unwrap().push(bit);
        }),
    );

    let th = scheduler.spawn(ractor, false, |ctx| ctx.yield_now()).unwrap();
    scheduler.join(&th);

    let seen = events.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&event::STARTED));
    assert!(seen.contains(&event::READY));
    assert!(seen.contains(&event::RESUMED));
    assert_eq!(seen.last(), Some(&event::EXITED));

    assert!(scheduler.remove_event_hook(handle));
    assert!(!scheduler.remove_event_hook(handle));
}

#[test]
fn test_sleep_honors_deadline() {
    let scheduler = Scheduler::new(2);
    scheduler.start_timer().unwrap();
    let ractor = scheduler.create_ractor();

    let elapsed: Arc<Mutex<Option<Duration>>> = Arc::new(Mutex::new(None));
    let elapsed2 = Arc::clone(&elapsed);
    let th = scheduler
        .spawn(ractor, false, move |ctx| {
            let start = Instant::now();
            ctx.sleep(Duration::from_millis(50));
            *elapsed2.lock().unwrap() = Some(start.elapsed());
        })
        .unwrap();
    scheduler.join(&th);
    scheduler.shutdown();

    let elapsed = elapsed.lock().unwrap().expect("thread must have slept");
    assert!(
        elapsed >= Duration::from_millis(40),
        "sleep returned after {:?}",
        elapsed
    );
}

#[test]
fn test_blocking_region_lets_peer_run() {
    let scheduler = Scheduler::new(2);
    let ractor = scheduler.create_ractor();

    let peer_ran = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let peer_ran2 = Arc::clone(&peer_ran);
    let blocker = {
        let release = Arc::clone(&release);
        scheduler
            .spawn(ractor, false, move |ctx| {
                ctx.blocking_region(|| {
                    // Simulated native call: spin until released.
                    while !release.load(Ordering::Acquire) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                });
            })
            .unwrap()
    };

    let peer = scheduler
        .spawn(ractor, false, move |_ctx| {
            peer_ran2.store(true, Ordering::Release);
        })
        .unwrap();

    // The peer must get the seat while the blocker is off in native
    // code.
    scheduler.join(&peer);
    assert!(peer_ran.load(Ordering::Acquire));

    release.store(true, Ordering::Release);
    scheduler.join(&blocker);
}

#[cfg(unix)]
#[test]
fn test_wait_io_wakes_on_readiness() {
    let scheduler = Scheduler::new(2);
    scheduler.start_timer().unwrap();
    let ractor = scheduler.create_ractor();

    let mut fds = [0i32; 2];
    unsafe {
        assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let timed_out = Arc::new(AtomicBool::new(true));
    let timed_out2 = Arc::clone(&timed_out);
    let th = scheduler
        .spawn(ractor, false, move |ctx| {
            let out = ctx.wait_io(read_fd, true, Some(Duration::from_secs(5)));
            timed_out2.store(out, Ordering::Release);
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(30));
    unsafe {
        let byte = 1u8;
        libc::write(write_fd, &byte as *const u8 as *const libc::c_void, 1);
    }

    scheduler.join(&th);
    scheduler.shutdown();
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }

    assert!(
        !timed_out.load(Ordering::Acquire),
        "readiness must win over the timeout"
    );
}
