// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end scenarios from the component design (S1-S6), plus a
//! randomized-interleaving stress pass.

use hdds_evpoll::{Pool, PoolConfig, Want};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

fn spawn_dispatch(pool: &Arc<Pool>, n: usize) {
    let pool = pool.clone();
    std::thread::spawn(move || pool.dispatch(n));
}

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
    assert_eq!(ret, 0);
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) {
    let byte = [1u8];
    unsafe {
        libc::write(fd, byte.as_ptr() as *const _, 1);
    }
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// S1: one write fires the handler exactly once; without `handled`, a
/// second write produces no further fire (one-shot arming holds).
#[test]
fn s1_one_shot_fires_once_until_handled() {
    let pool = Pool::new(PoolConfig::default()).expect("pool");
    spawn_dispatch(&pool, 1);

    let (r, w) = pipe_pair();
    let fires = Arc::new(AtomicUsize::new(0));
    let fires2 = fires.clone();
    let seen_out = Arc::new(AtomicBool::new(false));
    let seen_out2 = seen_out.clone();
    let seen_err = Arc::new(AtomicBool::new(false));
    let seen_err2 = seen_err.clone();

    let _handle = pool
        .register(
            r,
            Arc::new(move |ev: &hdds_evpoll::DispatchEvent| {
                fires2.fetch_add(1, Ordering::SeqCst);
                seen_out2.store(ev.writable, Ordering::SeqCst);
                seen_err2.store(ev.error, Ordering::SeqCst);
            }),
            Want::Enable,
            Want::Unchanged,
            false,
        )
        .expect("register");

    write_byte(w);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fires.load(Ordering::SeqCst), 1);
    assert!(!seen_out.load(Ordering::SeqCst));
    assert!(!seen_err.load(Ordering::SeqCst));

    write_byte(w);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(
        fires.load(Ordering::SeqCst),
        1,
        "no handled() call means no re-arm, so the second write must not fire"
    );

    pool.reconfigure_threads(0);
    close_fd(r);
    close_fd(w);
}

/// S2: a `select_on` issued while the handler is in flight is deferred and
/// takes effect only once `handled` re-arms the slot.
#[test]
fn s2_select_on_during_handler_takes_effect_after_handled() {
    let pool = Pool::new(PoolConfig::default()).expect("pool");
    spawn_dispatch(&pool, 2);

    let (r, w) = pipe_pair();
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let entered2 = entered.clone();
    let release2 = release.clone();
    let pool_for_handler = pool.clone();

    let handle = pool
        .register(
            r,
            Arc::new(move |ev: &hdds_evpoll::DispatchEvent| {
                entered2.wait();
                release2.wait();
                pool_for_handler.handled(ev.handle, ev.fd, ev.gen).unwrap();
            }),
            Want::Enable,
            Want::Unchanged,
            false,
        )
        .expect("register");

    write_byte(w);
    entered.wait();
    pool.select_on(handle, r, Want::Unchanged, Want::Enable)
        .expect("select_on while in flight");
    release.wait();
    std::thread::sleep(Duration::from_millis(50));

    pool.reconfigure_threads(0);
    close_fd(r);
    close_fd(w);
}

/// S3: stale events carrying a pre-unregister generation must never reach
/// the handler of a slot reused by a later registration.
#[test]
fn s3_stale_generation_never_invokes_new_registration() {
    let pool = Pool::new(PoolConfig::default()).expect("pool");
    spawn_dispatch(&pool, 1);

    let (r1, w1) = pipe_pair();
    let (r2, w2) = pipe_pair();

    let h1 = pool
        .register(r1, Arc::new(|_: &_| {}), Want::Enable, Want::Unchanged, false)
        .expect("register 1");
    pool.unregister_close(Some(h1), r1).expect("unregister 1");

    let fires = Arc::new(AtomicUsize::new(0));
    let fires2 = fires.clone();
    let h2 = pool
        .register(
            r2,
            Arc::new(move |_: &_| {
                fires2.fetch_add(1, Ordering::SeqCst);
            }),
            Want::Enable,
            Want::Unchanged,
            false,
        )
        .expect("register 2");

    write_byte(w1);
    write_byte(w2);
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(
        fires.load(Ordering::SeqCst),
        1,
        "only the live registration's handler should have fired"
    );

    pool.unregister_close(Some(h2), r2).expect("unregister 2");
    pool.reconfigure_threads(0);
    close_fd(w1);
    close_fd(w2);
}

/// S4: shrinking delivers poller-death to every interested registration,
/// and a subsequent grow brings the worker count back up.
#[test]
fn s4_reconfigure_shrink_notifies_then_regrows() {
    let pool = Pool::new(PoolConfig::default()).expect("pool");
    spawn_dispatch(&pool, 4);
    std::thread::sleep(Duration::from_millis(20));

    let (r, w) = pipe_pair();
    let died = Arc::new(AtomicBool::new(false));
    let died2 = died.clone();
    let _handle = pool
        .register(
            r,
            Arc::new(move |ev: &hdds_evpoll::DispatchEvent| {
                if ev.poller_died {
                    died2.store(true, Ordering::SeqCst);
                }
            }),
            Want::Enable,
            Want::Unchanged,
            true,
        )
        .expect("register");

    pool.reconfigure_threads(2);
    std::thread::sleep(Duration::from_millis(100));
    assert!(died.load(Ordering::SeqCst), "shrink must notify poller-death");

    pool.reconfigure_threads(6);
    std::thread::sleep(Duration::from_millis(50));

    pool.reconfigure_threads(0);
    std::thread::sleep(Duration::from_millis(100));
    close_fd(r);
    close_fd(w);
}

/// S5: an error-only delivery fires once, then is suppressed until the
/// registration is replaced.
#[test]
fn s5_error_storm_suppressed_after_first_delivery() {
    let pool = Pool::new(PoolConfig::default()).expect("pool");
    spawn_dispatch(&pool, 1);

    let (r, w) = pipe_pair();
    close_fd(w); // writer gone: reader now observes EPOLLHUP/EPOLLERR-ish state

    let error_fires = Arc::new(AtomicUsize::new(0));
    let error_fires2 = error_fires.clone();
    let _handle = pool
        .register(
            r,
            Arc::new(move |ev: &hdds_evpoll::DispatchEvent| {
                if ev.error {
                    error_fires2.fetch_add(1, Ordering::SeqCst);
                }
            }),
            Want::Enable,
            Want::Unchanged,
            false,
        )
        .expect("register");

    std::thread::sleep(Duration::from_millis(80));
    let first_count = error_fires.load(Ordering::SeqCst);
    assert!(first_count <= 1, "at most one error delivery before suppression");

    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(
        error_fires.load(Ordering::SeqCst),
        first_count,
        "error delivery must not repeat once handled_error is set"
    );

    pool.reconfigure_threads(0);
    close_fd(r);
}

/// S6: destroy refuses new registrations; draining workers lets
/// `pool_destroy` succeed.
#[test]
fn s6_destroy_drains_then_succeeds() {
    let pool = Pool::new(PoolConfig::default()).expect("pool");
    spawn_dispatch(&pool, 3);
    std::thread::sleep(Duration::from_millis(20));

    assert!(Arc::clone(&pool).pool_destroy().is_err());

    let (r, _w) = pipe_pair();
    let err = pool.register(r, Arc::new(|_: &_| {}), Want::Enable, Want::Unchanged, false);
    assert!(err.is_err(), "register after destroy must fail");
    close_fd(r);

    pool.reconfigure_threads(0);
    std::thread::sleep(Duration::from_millis(100));

    assert!(Arc::clone(&pool).pool_destroy().is_ok());
}

/// Randomized interleaving: many FDs, concurrent register/select_on/write
/// /unregister from several threads, worker count jittered throughout.
/// Nothing here checks for a specific outcome beyond "no panic, no hang" -
/// the invariants (exclusion, stale filtering) are exercised implicitly.
#[test]
fn randomized_interleaving_stress() {
    let pool = Pool::new(PoolConfig::default()).expect("pool");
    spawn_dispatch(&pool, 4);

    let total_fires = Arc::new(AtomicU32::new(0));
    let mut threads = Vec::new();

    for t in 0..4 {
        let pool = pool.clone();
        let total_fires = total_fires.clone();
        threads.push(std::thread::spawn(move || {
            let mut rng = fastrand::Rng::with_seed(1000 + t as u64);
            for _ in 0..200 {
                let (r, w) = pipe_pair();
                let total_fires = total_fires.clone();
                let handle = pool
                    .register(
                        r,
                        Arc::new(move |_: &_| {
                            total_fires.fetch_add(1, Ordering::Relaxed);
                        }),
                        Want::Enable,
                        Want::Unchanged,
                        rng.bool(),
                    )
                    .expect("register");

                if rng.bool() {
                    write_byte(w);
                }
                if rng.bool() {
                    let _ = pool.select_on(handle, r, Want::Unchanged, Want::Enable);
                }
                std::thread::yield_now();
                let _ = pool.unregister_close(Some(handle), r);
                close_fd(w);
            }
        }));
    }

    for jh in threads {
        jh.join().expect("worker thread panicked");
    }

    pool.reconfigure_threads(0);
    std::thread::sleep(Duration::from_millis(100));
}
