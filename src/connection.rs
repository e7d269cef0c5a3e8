use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info, trace, warn};

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::channel::{Channel, EventHandler};
use crate::event_loop::EventLoop;
use crate::net::{InetAddress, Socket};
use crate::timestamp::Timestamp;

/// Buffered-output threshold above which the high-water callback fires.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle; transitions are monotone:
/// Connecting → Connected → (Disconnecting →) Disconnected.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

/// One accepted TCP connection, pinned to one sub-reactor.
///
/// Created by [`TcpServer`](crate::TcpServer) for every accepted
/// descriptor; user code only ever sees it as a shared
/// [`TcpConnectionRef`](crate::TcpConnectionRef). The two buffers and the
/// channel are touched exclusively on the owning loop's thread; [`send`]
/// and [`shutdown`] may be called from any thread and hop onto that thread
/// when needed.
///
/// Output is buffered on two levels: a `send` first tries one direct write
/// to the kernel, and only the remainder is parked in the output buffer
/// with write interest enabled, to be flushed as the kernel drains.
///
/// [`send`]: TcpConnection::send
/// [`shutdown`]: TcpConnection::shutdown
pub struct TcpConnection {
    name: String,
    event_loop: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    state: AtomicU8,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    on_connection: Mutex<Option<ConnectionCallback>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_write_complete: Mutex<Option<WriteCompleteCallback>>,
    on_high_water_mark: Mutex<Option<HighWaterMarkCallback>>,
    on_close: Mutex<Option<CloseCallback>>,
    weak_self: Weak<TcpConnection>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> Arc<TcpConnection> {
        let connection = Arc::new_cyclic(|weak_self: &Weak<TcpConnection>| {
            let channel = Channel::new(Arc::downgrade(&event_loop), socket.as_raw_fd());
            TcpConnection {
                name,
                event_loop,
                socket,
                channel,
                local_addr,
                peer_addr,
                state: AtomicU8::new(State::Connecting as u8),
                input: Mutex::new(Buffer::new()),
                output: Mutex::new(Buffer::new()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                on_connection: Mutex::new(None),
                on_message: Mutex::new(None),
                on_write_complete: Mutex::new(None),
                on_high_water_mark: Mutex::new(None),
                on_close: Mutex::new(None),
                weak_self: weak_self.clone(),
            }
        });
        debug!(
            "TcpConnection [{}] created, fd={}",
            connection.name,
            connection.socket.as_raw_fd()
        );
        connection.socket.set_keep_alive(true);
        connection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddress {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddress {
        self.peer_addr
    }

    /// The sub-loop this connection is pinned to.
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Disables Nagle's algorithm on the underlying socket.
    pub fn set_tcp_nodelay(&self, on: bool) {
        self.socket.set_tcp_nodelay(on);
    }

    /// Sends `data` to the peer. Callable from any thread: on the owning
    /// loop thread the bytes go out (or into the output buffer) right away,
    /// from any other thread a copy of the bytes is posted to the owning
    /// loop. Bytes from consecutive sends are never reordered.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else if let Some(connection) = self.weak_self.upgrade() {
            // The copy is authoritative; the caller's slice may be gone by
            // the time the loop runs this.
            let data = data.to_vec();
            self.event_loop
                .run_in_loop(move || connection.send_in_loop(&data));
        }
    }

    /// Half-closes the write side once all buffered output has drained.
    /// Callable from any thread; only the first call on a connected
    /// connection has an effect.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            if let Some(connection) = self.weak_self.upgrade() {
                self.event_loop
                    .run_in_loop(move || connection.shutdown_in_loop());
            }
        }
    }

    /// Installs the backpressure callback and its threshold in bytes.
    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Relaxed);
        *self.on_high_water_mark.lock().unwrap() = Some(callback);
    }

    pub(crate) fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.on_connection.lock().unwrap() = Some(callback);
    }

    pub(crate) fn set_message_callback(&self, callback: MessageCallback) {
        *self.on_message.lock().unwrap() = Some(callback);
    }

    pub(crate) fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.on_write_complete.lock().unwrap() = Some(callback);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        *self.on_close.lock().unwrap() = Some(callback);
    }

    /// Runs on the owning loop once the server has installed the
    /// connection: ties the channel to this connection, enables read
    /// interest and reports the connection as up.
    pub(crate) fn connect_established(&self) {
        self.event_loop.assert_in_loop_thread();
        self.set_state(State::Connected);
        self.channel.set_handler(self.weak_self.clone());
        self.channel.enable_reading();
        self.fire_connection_callback();
    }

    /// Runs on the owning loop after the server has dropped the connection
    /// from its table. Idempotent with `handle_close`: the down transition
    /// and the user callback fire once, the channel is always removed.
    pub(crate) fn connect_destroyed(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            self.fire_connection_callback();
        }
        self.channel.remove();
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn fire_connection_callback(&self) {
        let callback = self.on_connection.lock().unwrap().clone();
        if let (Some(callback), Some(connection)) = (callback, self.weak_self.upgrade()) {
            callback(&connection);
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!(
                "TcpConnection [{}] is disconnected, dropping {} bytes",
                self.name,
                data.len()
            );
            return;
        }

        let mut written = 0usize;
        let mut fault = false;
        let mut output = self.output.lock().unwrap();

        // Nothing pending and no write interest: try one direct write and
        // buffer only the remainder.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match syscall!(write(
                self.socket.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )) {
                Ok(n) => {
                    written = n as usize;
                    if written == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!("TcpConnection [{}] write failed: {}", self.name, err);
                        if matches!(
                            err.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        let remaining = data.len() - written;
        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len < mark && old_len + remaining >= mark {
                let callback = self.on_high_water_mark.lock().unwrap().clone();
                if let (Some(callback), Some(connection)) = (callback, self.weak_self.upgrade()) {
                    let buffered = old_len + remaining;
                    self.event_loop
                        .queue_in_loop(move || callback(&connection, buffered));
                }
            }
            output.append(&data[written..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        // Still flushing: handle_write issues the half-close after the
        // drain.
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    fn queue_write_complete(&self) {
        let callback = self.on_write_complete.lock().unwrap().clone();
        if let (Some(callback), Some(connection)) = (callback, self.weak_self.upgrade()) {
            self.event_loop.queue_in_loop(move || callback(&connection));
        }
    }

    fn handle_read(&self, receive_time: Timestamp) {
        let mut input = self.input.lock().unwrap();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                trace!("TcpConnection [{}] read {} bytes", self.name, n);
                let callback = self.on_message.lock().unwrap().clone();
                match (callback, self.weak_self.upgrade()) {
                    (Some(callback), Some(connection)) => {
                        callback(&connection, &mut input, receive_time)
                    }
                    // Nobody consumes; keeping the bytes would only grow the
                    // buffer without bound.
                    _ => input.retrieve_all(),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                drop(input);
                error!("TcpConnection [{}] read failed: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        if !self.channel.is_writing() {
            trace!(
                "TcpConnection [{}] fd={} is down, no more writing",
                self.name,
                self.channel.fd()
            );
            return;
        }
        let mut output = self.output.lock().unwrap();
        match output.write_fd(self.channel.fd()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    self.queue_write_complete();
                    if self.state() == State::Disconnecting {
                        drop(output);
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("TcpConnection [{}] write failed: {}", self.name, err),
        }
    }

    fn handle_close(&self) {
        let state = self.state();
        info!(
            "TcpConnection [{}] fd={} closing, state={:?}",
            self.name,
            self.channel.fd(),
            state
        );
        if state == State::Disconnected {
            return;
        }
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        // Keep a strong self-reference across the callbacks; the close
        // callback drops the server's table entry.
        let Some(connection) = self.weak_self.upgrade() else {
            return;
        };
        let callback = self.on_connection.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&connection);
        }
        let callback = self.on_close.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&connection);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(err)) => error!("TcpConnection [{}] SO_ERROR: {}", self.name, err),
            Ok(None) => {}
            Err(err) => error!(
                "TcpConnection [{}] failed to read SO_ERROR: {}",
                self.name, err
            ),
        }
    }
}

impl EventHandler for TcpConnection {
    fn on_read(&self, receive_time: Timestamp) {
        self.handle_read(receive_time);
    }

    fn on_write(&self) {
        self.handle_write();
    }

    fn on_close(&self) {
        self.handle_close();
    }

    fn on_error(&self) {
        self.handle_error();
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection [{}] fd={} dropped, state={:?}",
            self.name,
            self.socket.as_raw_fd(),
            self.state()
        );
    }
}
