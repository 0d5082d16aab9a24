//! Timer queue behavior through a live loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reactor_net::{EventLoopThread, TimerId};

#[test]
fn test_one_shot_fires_once_and_not_early() {
    let t = EventLoopThread::start("timer-once").unwrap();
    let lp = t.event_loop().clone();

    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    lp.run_after(Duration::from_millis(100), move || {
        tx.send(Instant::now()).unwrap();
    });

    let fired_at = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(fired_at.duration_since(start) >= Duration::from_millis(100));

    // One-shot: no second firing.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn test_repeating_fires_on_cadence_until_cancelled() {
    let t = EventLoopThread::start("timer-repeat").unwrap();
    let lp = t.event_loop().clone();

    let (tx, rx) = mpsc::channel();
    let id = lp.run_every(Duration::from_millis(50), move || {
        let _ = tx.send(());
    });

    for _ in 0..3 {
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
    lp.cancel(id);

    // Let any in-flight ticks land, drain them, then expect silence.
    std::thread::sleep(Duration::from_millis(150));
    while rx.try_recv().is_ok() {}
    assert!(rx.recv_timeout(Duration::from_millis(250)).is_err());
}

#[test]
fn test_cancel_before_expiration() {
    let t = EventLoopThread::start("timer-cancel").unwrap();
    let lp = t.event_loop().clone();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let id = lp.run_after(Duration::from_millis(200), move || {
        f.fetch_add(1, Ordering::SeqCst);
    });
    lp.cancel(id);

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_repeating_timer_cancels_itself_from_callback() {
    let t = EventLoopThread::start("timer-suicide").unwrap();
    let lp = t.event_loop().clone();

    let count = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let (tx, rx) = mpsc::channel();
    let id = {
        let count = count.clone();
        let slot = slot.clone();
        let lp2 = lp.clone();
        lp.run_every(Duration::from_millis(30), move || {
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 2 {
                // Cancel from inside our own callback: the restart phase
                // must not reinstate the timer.
                if let Some(id) = *slot.lock() {
                    lp2.cancel(id);
                }
                tx.send(()).unwrap();
            }
        })
    };
    *slot.lock() = Some(id);

    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn test_timers_fire_in_expiration_order() {
    let t = EventLoopThread::start("timer-order").unwrap();
    let lp = t.event_loop().clone();

    let (tx, rx) = mpsc::channel();
    for (label, delay_ms) in [("late", 150u64), ("early", 50), ("mid", 100)] {
        let tx = tx.clone();
        lp.run_after(Duration::from_millis(delay_ms), move || {
            tx.send(label).unwrap();
        });
    }

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "early");
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "mid");
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "late");
}
