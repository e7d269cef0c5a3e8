use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};

use log::trace;

use crate::event_loop::EventLoop;
use crate::interest::Interest;
use crate::timestamp::Timestamp;

/// Per-event hooks of a channel's logical owner.
///
/// The owner is held behind a [`Weak`] so a channel never keeps it alive;
/// dispatch upgrades the reference for its own duration and is skipped
/// entirely once the owner is gone.
pub(crate) trait EventHandler: Send + Sync {
    fn on_read(&self, receive_time: Timestamp);
    fn on_write(&self) {}
    fn on_close(&self) {}
    fn on_error(&self) {}
}

/// Where a channel stands with its poller.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Registration {
    /// Never handed to the poller.
    New,
    /// In the poller's map and the kernel interest set.
    Added,
    /// Still in the poller's map, removed from the kernel interest set.
    Deleted,
}

struct Inner {
    interest: Option<Interest>,
    revents: u32,
    registration: Registration,
    handler: Option<Weak<dyn EventHandler>>,
}

/// Binds one descriptor to an interest set and the owner's event hooks.
///
/// A channel belongs to exactly one [`EventLoop`] and exactly one logical
/// owner (a connection, the acceptor, or the loop's wake-up descriptor).
/// Interest changes push the new mask to the poller through the owning
/// loop, which asserts that the call happens on the loop thread.
pub(crate) struct Channel {
    fd: RawFd,
    event_loop: Weak<EventLoop>,
    weak_self: Weak<Channel>,
    inner: Mutex<Inner>,
}

impl Channel {
    pub(crate) fn new(event_loop: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|weak_self| Channel {
            fd,
            event_loop,
            weak_self: weak_self.clone(),
            inner: Mutex::new(Inner {
                interest: None,
                revents: 0,
                registration: Registration::New,
                handler: None,
            }),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Installs the owner's weak back-reference. Must happen before the
    /// first interest is enabled.
    pub(crate) fn set_handler(&self, handler: Weak<dyn EventHandler>) {
        self.inner.lock().unwrap().handler = Some(handler);
    }

    pub(crate) fn interest(&self) -> Option<Interest> {
        self.inner.lock().unwrap().interest
    }

    pub(crate) fn registration(&self) -> Registration {
        self.inner.lock().unwrap().registration
    }

    pub(crate) fn set_registration(&self, registration: Registration) {
        self.inner.lock().unwrap().registration = registration;
    }

    /// Stores the fired event mask; read back by the next `handle_event`.
    pub(crate) fn set_revents(&self, revents: u32) {
        self.inner.lock().unwrap().revents = revents;
    }

    pub(crate) fn enable_reading(&self) {
        self.add_interest(Interest::READABLE);
    }

    #[allow(dead_code)]
    pub(crate) fn disable_reading(&self) {
        self.remove_interest(Interest::READABLE);
    }

    pub(crate) fn enable_writing(&self) {
        self.add_interest(Interest::WRITABLE);
    }

    pub(crate) fn disable_writing(&self) {
        self.remove_interest(Interest::WRITABLE);
    }

    pub(crate) fn disable_all(&self) {
        self.inner.lock().unwrap().interest = None;
        self.update();
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.interest().map_or(false, Interest::is_writable)
    }

    #[allow(dead_code)]
    pub(crate) fn is_reading(&self) -> bool {
        self.interest().map_or(false, Interest::is_readable)
    }

    fn add_interest(&self, interest: Interest) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.interest = Some(match inner.interest {
                Some(current) => current.add(interest),
                None => interest,
            });
        }
        self.update();
    }

    fn remove_interest(&self, interest: Interest) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.interest = inner.interest.and_then(|current| current.remove(interest));
        }
        self.update();
    }

    /// Pushes the current interest to the poller via the owning loop.
    fn update(&self) {
        if let (Some(event_loop), Some(channel)) =
            (self.event_loop.upgrade(), self.weak_self.upgrade())
        {
            event_loop.update_channel(&channel);
        }
    }

    /// Deregisters this channel from the owning loop's poller.
    pub(crate) fn remove(&self) {
        if let (Some(event_loop), Some(channel)) =
            (self.event_loop.upgrade(), self.weak_self.upgrade())
        {
            event_loop.remove_channel(&channel);
        }
    }

    /// Dispatches the fired events to the owner's hooks.
    ///
    /// Order matters: hang-up without readable data fires close before
    /// anything else so a dead peer never looks like a readable one, and
    /// the owner is pinned by a strong reference for the whole dispatch so
    /// a callback tearing the owner down cannot free it mid-call.
    pub(crate) fn handle_event(&self, receive_time: Timestamp) {
        let (revents, handler) = {
            let inner = self.inner.lock().unwrap();
            (inner.revents, inner.handler.clone())
        };
        let handler = match handler.as_ref().and_then(Weak::upgrade) {
            Some(handler) => handler,
            None => {
                trace!(
                    "channel fd={} owner is gone, dropping events {:#x}",
                    self.fd,
                    revents
                );
                return;
            }
        };

        trace!("channel fd={} handling events {:#x}", self.fd, revents);
        let revents = revents as libc::c_int;
        if revents & libc::EPOLLHUP != 0 && revents & libc::EPOLLIN == 0 {
            handler.on_close();
        }
        if revents & libc::EPOLLERR != 0 {
            handler.on_error();
        }
        if revents & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
            handler.on_read(receive_time);
        }
        if revents & libc::EPOLLOUT != 0 {
            handler.on_write();
        }
    }
}
