//! A multi-reactor, non-blocking TCP server framework for Linux.
//!
//! The design is one-loop-per-thread: a main reactor accepts connections
//! and hands each one to a fixed sub-reactor, where all of its I/O happens
//! for the rest of its life. Each reactor is an [`EventLoop`] driving a
//! level-triggered epoll instance, an eventfd wake-up descriptor and a
//! cross-thread task queue.
//!
//! User code supplies a listening address and callbacks (connection
//! up/down, message, write-complete, high-water mark); the library owns
//! socket lifetimes, readiness dispatch, two-level output buffering and the
//! thread handoff of accepted connections.
//!
//! ```no_run
//! use std::sync::Arc;
//! use teal::{EventLoop, TcpServer};
//!
//! # fn main() -> std::io::Result<()> {
//! let event_loop = EventLoop::new()?;
//! let server = TcpServer::new(&event_loop, "127.0.0.1:8080".parse().unwrap(), "echo", false)?;
//! server.set_thread_num(4);
//! server.set_message_callback(Arc::new(|conn, buf, _when| {
//!     let msg = buf.retrieve_all_as_vec();
//!     conn.send(&msg);
//! }));
//! server.start()?;
//! event_loop.run();
//! # Ok(())
//! # }
//! ```
//!
//! Scope: IPv4 stream sockets on a Linux-like kernel (epoll, eventfd,
//! accept4, readv). No protocol parsing, no TLS, no timers, no datagrams.

#![cfg(target_os = "linux")]

#[macro_use]
mod macros;

mod acceptor;
mod buffer;
mod callbacks;
mod channel;
mod connection;
mod event_loop;
mod interest;
mod net;
mod poller;
mod server;
mod thread_pool;
mod timestamp;

pub use crate::buffer::Buffer;
pub use crate::callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionRef,
    ThreadInitCallback, WriteCompleteCallback,
};
pub use crate::connection::TcpConnection;
pub use crate::event_loop::EventLoop;
pub use crate::net::InetAddress;
pub use crate::server::TcpServer;
pub use crate::timestamp::Timestamp;
