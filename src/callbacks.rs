//! Callback aliases shared by [`TcpServer`](crate::TcpServer) and
//! [`TcpConnection`](crate::TcpConnection).
//!
//! Callbacks are owned closure values, set at configuration time and invoked
//! synchronously on the connection's loop thread at event time. They must
//! not block.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::connection::TcpConnection;
use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

/// Shared handle to a connection, as passed to every user callback.
pub type TcpConnectionRef = Arc<TcpConnection>;

/// Fired when a connection comes up and again when it goes down; inspect
/// [`TcpConnection::connected`] to tell the two apart.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fired when bytes arrive; the buffer holds everything not yet retrieved.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionRef, &mut Buffer, Timestamp) + Send + Sync>;

/// Fired when the output buffer fully drains after a buffered send.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fired once per crossing when buffered output climbs past the configured
/// threshold; receives the buffered size at the crossing.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionRef, usize) + Send + Sync>;

/// Runs inside every freshly spawned sub-reactor thread, before its loop
/// starts.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// Library-internal: lets the server unlink a closing connection.
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;
