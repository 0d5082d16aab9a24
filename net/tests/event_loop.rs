//! Cross-thread submission and wakeup behavior.

use std::sync::mpsc;
use std::time::Duration;

use reactor_net::EventLoopThread;

#[test]
fn test_run_in_loop_from_other_thread() {
    let t = EventLoopThread::start("test-loop").unwrap();
    let lp = t.event_loop().clone();

    let (tx, rx) = mpsc::channel();
    assert!(!lp.is_in_loop_thread());
    lp.run_in_loop(move || {
        tx.send(std::thread::current().name().map(String::from)).unwrap();
    });

    let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(name.as_deref(), Some("test-loop"));
}

#[test]
fn test_queued_tasks_preserve_order() {
    let t = EventLoopThread::start("order-loop").unwrap();
    let lp = t.event_loop().clone();

    let (tx, rx) = mpsc::channel();
    for i in 0..100 {
        let tx = tx.clone();
        lp.run_in_loop(move || {
            tx.send(i).unwrap();
        });
    }

    for expected in 0..100 {
        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, expected);
    }
}

#[test]
fn test_enqueue_from_drain_pass_wakes_loop() {
    let t = EventLoopThread::start("requeue-loop").unwrap();
    let lp = t.event_loop().clone();

    let (tx, rx) = mpsc::channel();
    let lp2 = lp.clone();
    lp.run_in_loop(move || {
        // Enqueued from inside the drain pass: without the wakeup the loop
        // would block in epoll_wait until unrelated IO arrived.
        let tx = tx.clone();
        lp2.queue_in_loop(Box::new(move || {
            tx.send("second").unwrap();
        }));
    });

    let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(got, "second");
}

#[test]
fn test_quit_joins_thread() {
    let t = EventLoopThread::start("quit-loop").unwrap();
    let lp = t.event_loop().clone();
    drop(t); // quits + joins
    assert!(!lp.is_in_loop_thread());
}
