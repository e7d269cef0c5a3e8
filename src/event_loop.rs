use std::cell::Cell;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::thread::{self, ThreadId};

use log::{debug, error, trace};

use crate::channel::{Channel, EventHandler};
use crate::poller::Poller;
use crate::timestamp::Timestamp;

/// Upper bound on one readiness wait; wake-ups cut it short.
const POLL_TIMEOUT_MS: libc::c_int = 10_000;

/// A zero-argument unit of work posted to a loop from any thread.
type Task = Box<dyn FnOnce() + Send>;

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the loop constructed on this thread, if any. Enforces
    /// one-loop-per-thread and backs the `is_in_loop_thread` check.
    static CURRENT_LOOP: Cell<Option<usize>> = const { Cell::new(None) };
}

/// A reactor: one poller, one wake-up descriptor, one pending-task queue,
/// driven by exactly one thread.
///
/// All channels registered with a loop have their events dispatched on the
/// loop's thread. Other threads interact with the loop only through
/// [`run_in_loop`]/[`queue_in_loop`] (which take the queue mutex and write
/// the wake-up descriptor) and [`quit`].
///
/// Constructing a second loop on a thread that already has a live one
/// panics.
///
/// [`run_in_loop`]: EventLoop::run_in_loop
/// [`queue_in_loop`]: EventLoop::queue_in_loop
/// [`quit`]: EventLoop::quit
pub struct EventLoop {
    id: usize,
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    poller: Mutex<Poller>,
    wake_fd: OwnedFd,
    wake_channel: Arc<Channel>,
    pending: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Creates a loop owned by the calling thread.
    pub fn new() -> io::Result<Arc<EventLoop>> {
        ignore_sigpipe();

        let poller = Poller::new()?;
        let wake_fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;
        let wake_fd = unsafe { OwnedFd::from_raw_fd(wake_fd) };

        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        CURRENT_LOOP.with(|current| {
            if let Some(existing) = current.get() {
                panic!(
                    "another EventLoop (id={}) already exists in thread {:?}",
                    existing,
                    thread::current().id()
                );
            }
            current.set(Some(id));
        });

        let event_loop = Arc::new_cyclic(|weak: &Weak<EventLoop>| EventLoop {
            id,
            thread_id: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            poller: Mutex::new(poller),
            wake_channel: Channel::new(weak.clone(), wake_fd.as_raw_fd()),
            wake_fd,
            pending: Mutex::new(Vec::new()),
        });
        debug!("EventLoop id={} created in {:?}", id, event_loop.thread_id);

        let weak: Weak<EventLoop> = Arc::downgrade(&event_loop);
        event_loop.wake_channel.set_handler(weak);
        event_loop.wake_channel.enable_reading();
        Ok(event_loop)
    }

    /// Runs the reactor until [`quit`](EventLoop::quit): wait for readiness,
    /// dispatch each ready channel with the poll's return time, then drain
    /// the pending tasks.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::Release);
        self.quit.store(false, Ordering::Release);
        debug!("EventLoop id={} start looping", self.id);

        let mut active = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let receive_time = self
                .poller
                .lock()
                .unwrap()
                .poll(POLL_TIMEOUT_MS, &mut active);
            for channel in &active {
                channel.handle_event(receive_time);
            }
            self.run_pending_tasks();
        }

        debug!("EventLoop id={} stop looping", self.id);
        self.looping.store(false, Ordering::Release);
    }

    /// Asks the loop to stop after its current iteration. Callable from any
    /// thread; a foreign caller also wakes the loop so the flag is seen
    /// promptly.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `task` immediately when called on the loop thread, otherwise
    /// enqueues it and wakes the loop.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always enqueues `task` for the next drain. The loop is woken when the
    /// caller is foreign, or when a drain is already in progress so the new
    /// task is picked up by the next iteration without extra latency.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.lock().unwrap().push(Box::new(task));
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        CURRENT_LOOP.with(|current| current.get() == Some(self.id))
    }

    /// Panics when called off the loop thread. Guards every entry point
    /// that touches loop-owned state.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop id={} owned by {:?} was used from {:?}",
                self.id,
                self.thread_id,
                thread::current().id()
            );
        }
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        let mut poller = self.poller.lock().unwrap();
        debug_assert!(poller.has_channel(channel));
        poller.remove_channel(channel);
    }

    fn wakeup(&self) {
        let one = 1u64.to_ne_bytes();
        match syscall!(write(
            self.wake_fd.as_raw_fd(),
            one.as_ptr() as *const libc::c_void,
            one.len(),
        )) {
            Ok(8) => {}
            Ok(n) => error!("wakeup wrote {} bytes instead of 8", n),
            Err(err) => error!("wakeup write failed: {}", err),
        }
    }

    /// Swap the queue under the mutex, then execute outside of it, so tasks
    /// may enqueue further tasks without deadlocking.
    fn run_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Release);
        let tasks = mem::take(&mut *self.pending.lock().unwrap());
        trace!("EventLoop id={} draining {} pending tasks", self.id, tasks.len());
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }
}

/// The wake-up descriptor's owner hooks: drain the eventfd counter.
impl EventHandler for EventLoop {
    fn on_read(&self, _receive_time: Timestamp) {
        let mut buf = [0u8; 8];
        match syscall!(read(
            self.wake_fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )) {
            Ok(8) => {}
            Ok(n) => error!("wakeup read {} bytes instead of 8", n),
            Err(err) => error!("wakeup read failed: {}", err),
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if self.looping.load(Ordering::Acquire) {
            error!("EventLoop id={} dropped while still looping", self.id);
        }
        // The last reference may be dropped by a foreign thread; only the
        // owning thread's slot refers to this loop.
        CURRENT_LOOP.with(|current| {
            if current.get() == Some(self.id) {
                current.set(None);
            }
        });
    }
}

/// Write errors must surface as `EPIPE` from the socket, not kill the
/// process.
fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}
