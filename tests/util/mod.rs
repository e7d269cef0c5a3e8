// Not all helpers are used by every test binary.
#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use teal::{EventLoop, InetAddress, TcpServer};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}

/// Polls `condition` every few milliseconds until it holds or the deadline
/// passes; returns the final verdict.
pub fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// A server on an ephemeral port, with its main loop running on a dedicated
/// thread. Dropping it quits the loop and joins the thread.
pub struct TestServer {
    pub event_loop: Arc<EventLoop>,
    pub addr: InetAddress,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    /// Starts a server with `threads` sub-reactors; `configure` runs on the
    /// main-loop thread right before `start`.
    pub fn start<F>(threads: usize, configure: F) -> TestServer
    where
        F: FnOnce(&Arc<TcpServer>) + Send + 'static,
    {
        init();
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let event_loop = EventLoop::new().expect("unable to create event loop");
            let server = TcpServer::new(
                &event_loop,
                "127.0.0.1:0".parse().unwrap(),
                "test",
                false,
            )
            .expect("unable to create server");
            server.set_thread_num(threads);
            configure(&server);
            server.start().expect("unable to start server");
            tx.send((Arc::clone(&event_loop), server.local_addr()))
                .expect("test thread is gone");
            event_loop.run();
        });
        let (event_loop, addr) = rx.recv().expect("server thread failed to start");
        TestServer {
            event_loop,
            addr,
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.event_loop.quit();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
