use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{error, warn};

use crate::channel::{Channel, EventHandler};
use crate::event_loop::EventLoop;
use crate::net::{InetAddress, Socket};
use crate::timestamp::Timestamp;

/// Handed each accepted descriptor together with its peer address.
pub(crate) type NewConnectionCallback = Box<dyn Fn(OwnedFd, InetAddress) + Send + Sync>;

/// Owns the listen socket and its channel, both living on the main loop.
///
/// On read-readiness it accepts until `EAGAIN` and hands every connected
/// descriptor to the server. A spare descriptor to `/dev/null` is kept in
/// reserve so that descriptor exhaustion (`EMFILE`) can be answered by
/// accepting and immediately closing the pending connection instead of
/// spinning on a level-triggered readable listen socket.
pub(crate) struct Acceptor {
    event_loop: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddress,
    on_new_connection: Mutex<Option<NewConnectionCallback>>,
    idle_fd: Mutex<Option<OwnedFd>>,
    listening: AtomicBool,
}

impl Acceptor {
    pub(crate) fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: &InetAddress,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new_stream()?;
        socket.set_reuse_addr(true);
        socket.set_reuse_port(reuse_port);
        socket.bind(listen_addr)?;
        let local_addr = socket.local_addr()?;
        let idle_fd = open_idle_fd()?;

        let channel = Channel::new(Arc::downgrade(event_loop), socket.as_raw_fd());
        let acceptor = Arc::new(Acceptor {
            event_loop: Arc::clone(event_loop),
            socket,
            channel,
            local_addr,
            on_new_connection: Mutex::new(None),
            idle_fd: Mutex::new(Some(idle_fd)),
            listening: AtomicBool::new(false),
        });
        let weak: Weak<Acceptor> = Arc::downgrade(&acceptor);
        acceptor.channel.set_handler(weak);
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.on_new_connection.lock().unwrap() = Some(callback);
    }

    /// The address the listen socket is actually bound to.
    pub(crate) fn local_addr(&self) -> InetAddress {
        self.local_addr
    }

    /// Starts listening and registers read interest on the main loop.
    /// Failure to listen is fatal.
    pub(crate) fn listen(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.listening.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.socket.listen() {
            error!("listen on {} failed: {}", self.local_addr, err);
            panic!("listen on {} failed: {}", self.local_addr, err);
        }
        self.channel.enable_reading();
    }

    #[allow(dead_code)]
    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Sheds one pending connection while out of descriptors: give the
    /// reserved descriptor back, accept-and-close the offender, re-arm the
    /// reserve.
    fn shed_connection(&self) {
        warn!(
            "accept on {} hit the descriptor limit, shedding one connection",
            self.local_addr
        );
        let mut idle = self.idle_fd.lock().unwrap();
        drop(idle.take());
        match syscall!(accept(self.socket.as_raw_fd(), ptr::null_mut(), ptr::null_mut())) {
            Ok(fd) => {
                let _ = syscall!(close(fd));
            }
            Err(err) => error!("accept while shedding failed: {}", err),
        }
        match open_idle_fd() {
            Ok(fd) => *idle = Some(fd),
            Err(err) => error!("re-opening the reserve descriptor failed: {}", err),
        }
    }
}

/// The reserve descriptor handed back to the kernel while shedding.
fn open_idle_fd() -> io::Result<OwnedFd> {
    let fd = syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC,
    ))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Deregistration needs the loop thread; dropped anywhere else the
        // kernel side is cleaned up by closing the listen socket.
        if self.listening.load(Ordering::Acquire) && self.event_loop.is_in_loop_thread() {
            self.channel.disable_all();
            self.channel.remove();
        }
    }
}

impl EventHandler for Acceptor {
    fn on_read(&self, _receive_time: Timestamp) {
        self.event_loop.assert_in_loop_thread();
        loop {
            match self.socket.accept() {
                Ok((fd, peer_addr)) => {
                    let callback = self.on_new_connection.lock().unwrap();
                    match &*callback {
                        Some(callback) => callback(fd, peer_addr),
                        // Nobody to hand it to; closing is the only option.
                        None => drop(fd),
                    }
                }
                Err(err) => {
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) => {}
                        Some(libc::EINTR) => continue,
                        Some(libc::EMFILE) => {
                            self.shed_connection();
                            continue;
                        }
                        _ => error!("accept on {} failed: {}", self.local_addr, err),
                    }
                    break;
                }
            }
        }
    }
}
