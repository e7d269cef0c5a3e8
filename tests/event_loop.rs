use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use teal::EventLoop;

mod util;

use util::{assert_send, assert_sync, init};

#[test]
fn loop_handle_is_send_and_sync() {
    assert_send::<Arc<EventLoop>>();
    assert_sync::<Arc<EventLoop>>();
}

#[test]
fn run_in_loop_runs_inline_on_the_owning_thread() {
    init();
    let event_loop = EventLoop::new().expect("unable to create event loop");
    assert!(event_loop.is_in_loop_thread());

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    event_loop.run_in_loop(move || flag.store(true, Ordering::Release));
    // No loop iteration happened; the task ran synchronously.
    assert!(ran.load(Ordering::Acquire));
}

#[test]
#[should_panic(expected = "another EventLoop")]
fn second_loop_on_one_thread_panics() {
    init();
    let _first = EventLoop::new().expect("unable to create event loop");
    let _second = EventLoop::new();
}

#[test]
fn queue_in_loop_from_foreign_thread_wakes_the_loop() {
    init();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("unable to create event loop");
        tx.send(Arc::clone(&event_loop)).unwrap();
        event_loop.run();
    });
    let event_loop = rx.recv().unwrap();
    assert!(!event_loop.is_in_loop_thread());

    // The loop sits in a 10 second poll; without the wake-up this would
    // time the recv out.
    let (task_tx, task_rx) = mpsc::channel();
    event_loop.queue_in_loop(move || {
        task_tx.send(thread::current().id()).unwrap();
    });
    let loop_thread = task_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("queued task did not run promptly");
    assert_ne!(loop_thread, thread::current().id());

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn tasks_queued_during_a_drain_run_on_the_next_iteration() {
    init();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("unable to create event loop");
        tx.send(Arc::clone(&event_loop)).unwrap();
        event_loop.run();
    });
    let event_loop = rx.recv().unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let inner_loop = Arc::clone(&event_loop);
    event_loop.queue_in_loop(move || {
        // Re-enqueue from inside the drain; must not deadlock and must run
        // without waiting out the poll timeout.
        let done_tx = done_tx.clone();
        inner_loop.queue_in_loop(move || done_tx.send(()).unwrap());
    });
    done_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("re-enqueued task did not run promptly");

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn quit_from_foreign_thread_stops_the_loop() {
    init();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("unable to create event loop");
        tx.send(Arc::clone(&event_loop)).unwrap();
        event_loop.run();
    });
    let event_loop = rx.recv().unwrap();
    event_loop.quit();
    handle.join().expect("loop thread did not stop");
}
