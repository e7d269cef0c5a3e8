use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use log::{error, trace};

use crate::channel::{Channel, Registration};
use crate::interest::Interest;
use crate::timestamp::Timestamp;

/// Initial size of the event list; doubled whenever a poll fills it.
const INITIAL_EVENTS: usize = 16;

/// The kernel readiness oracle: an epoll instance plus the map of channels
/// currently registered with it.
///
/// Level-triggered on purpose: the connection write path relies on
/// `EPOLLOUT` firing again as long as the output buffer has not drained.
/// Owned by one [`EventLoop`](crate::EventLoop) and only touched on its
/// thread.
pub(crate) struct Poller {
    ep: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Poller {
            ep: unsafe { OwnedFd::from_raw_fd(ep) },
            events: Vec::with_capacity(INITIAL_EVENTS),
            channels: HashMap::new(),
        })
    }

    /// Waits for readiness, stores each fired mask into its channel and
    /// appends the ready channels to `active`. Returns the time sampled
    /// right after the wait; `EINTR` is treated as an empty poll.
    pub(crate) fn poll(
        &mut self,
        timeout_ms: libc::c_int,
        active: &mut Vec<Arc<Channel>>,
    ) -> Timestamp {
        self.events.clear();
        let res = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout_ms,
        ));
        let receive_time = Timestamp::now();
        match res {
            Ok(num_events) => {
                // `epoll_wait` initialised exactly this many entries.
                unsafe { self.events.set_len(num_events as usize) };
                for event in &self.events {
                    if let Some(channel) = self.channels.get(&(event.u64 as RawFd)) {
                        channel.set_revents(event.events);
                        active.push(Arc::clone(channel));
                    }
                }
                if num_events as usize == self.events.capacity() {
                    let additional = self.events.capacity();
                    self.events.reserve(additional);
                }
            }
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
            Err(err) => error!("epoll_wait failed: {}", err),
        }
        receive_time
    }

    /// Reconciles the kernel interest set with the channel's interest,
    /// classifying the transition by the channel's registration state.
    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let registration = channel.registration();
        trace!(
            "update channel fd={} interest={:?} registration={:?}",
            fd,
            channel.interest(),
            registration
        );
        match registration {
            Registration::New | Registration::Deleted => {
                if registration == Registration::New {
                    self.channels.insert(fd, Arc::clone(channel));
                }
                channel.set_registration(Registration::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            Registration::Added => {
                if channel.interest().is_none() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_registration(Registration::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    /// Forgets the channel entirely; the kernel side is cleared first when
    /// it is still registered.
    pub(crate) fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!("remove channel fd={}", fd);
        self.channels.remove(&fd);
        if channel.registration() == Registration::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_registration(Registration::New);
    }

    pub(crate) fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .map_or(false, |registered| Arc::ptr_eq(registered, channel))
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: interest_to_epoll(channel.interest()),
            u64: fd as u64,
        };
        if let Err(err) = syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)) {
            if op == libc::EPOLL_CTL_DEL {
                // The descriptor may already be gone; nothing to unwind.
                error!("epoll_ctl(DEL) fd={} failed: {}", fd, err);
            } else {
                error!("epoll_ctl(op={}) fd={} failed: {}", op, fd, err);
                panic!("epoll_ctl(op={}) fd={} failed: {}", op, fd, err);
            }
        }
    }
}

fn interest_to_epoll(interest: Option<Interest>) -> u32 {
    let mut kind = 0;
    if let Some(interest) = interest {
        if interest.is_readable() {
            kind |= libc::EPOLLIN | libc::EPOLLPRI;
        }
        if interest.is_writable() {
            kind |= libc::EPOLLOUT;
        }
    }
    kind as u32
}
