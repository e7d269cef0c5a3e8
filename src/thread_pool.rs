use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use log::debug;

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::EventLoop;

/// One sub-reactor: an OS thread whose body creates an [`EventLoop`], runs
/// the optional init callback with it and then drives it until quit.
pub(crate) struct EventLoopThread {
    event_loop: Arc<EventLoop>,
    join: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawns the thread and blocks until it has published its loop.
    pub(crate) fn spawn(
        name: String,
        init: Option<ThreadInitCallback>,
    ) -> io::Result<EventLoopThread> {
        let (tx, rx) = mpsc::channel();
        let join = thread::Builder::new().name(name).spawn(move || {
            let event_loop = match EventLoop::new() {
                Ok(event_loop) => event_loop,
                Err(err) => {
                    let _ = tx.send(Err(err));
                    return;
                }
            };
            if let Some(init) = &init {
                init(&event_loop);
            }
            let _ = tx.send(Ok(Arc::clone(&event_loop)));
            event_loop.run();
        })?;

        let event_loop = rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "event loop thread died at startup"))??;
        Ok(EventLoopThread {
            event_loop,
            join: Some(join),
        })
    }

    pub(crate) fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.event_loop.quit();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Owns the sub-reactor threads and hands their loops out round-robin.
///
/// With zero threads configured everything runs on the base loop; that is
/// the single-reactor mode.
pub(crate) struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl EventLoopThreadPool {
    pub(crate) fn new(base_loop: Arc<EventLoop>, name: String) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name,
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub(crate) fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub(crate) fn start(&mut self, init: Option<ThreadInitCallback>) -> io::Result<()> {
        self.base_loop.assert_in_loop_thread();
        assert!(!self.started, "thread pool started twice");
        self.started = true;
        for i in 0..self.num_threads {
            let name = format!("{}_{}", self.name, i);
            debug!("starting sub-reactor {}", name);
            let thread = EventLoopThread::spawn(name, init.clone())?;
            self.loops.push(Arc::clone(thread.event_loop()));
            self.threads.push(thread);
        }
        if self.num_threads == 0 {
            if let Some(init) = &init {
                init(&self.base_loop);
            }
        }
        Ok(())
    }

    /// Next sub-loop, round-robin; the base loop when there are none.
    pub(crate) fn next_loop(&mut self) -> Arc<EventLoop> {
        if self.loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }
        let event_loop = Arc::clone(&self.loops[self.next]);
        self.next = (self.next + 1) % self.loops.len();
        event_loop
    }

    /// Every sub-loop, or just the base loop when there are none.
    #[allow(dead_code)]
    pub(crate) fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.loops.is_empty() {
            vec![Arc::clone(&self.base_loop)]
        } else {
            self.loops.clone()
        }
    }
}
