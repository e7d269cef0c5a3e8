use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{error, info};

use crate::acceptor::Acceptor;
use crate::callbacks::{
    ConnectionCallback, MessageCallback, TcpConnectionRef, ThreadInitCallback,
    WriteCompleteCallback,
};
use crate::connection::TcpConnection;
use crate::event_loop::EventLoop;
use crate::net::{InetAddress, Socket};
use crate::thread_pool::EventLoopThreadPool;

/// A multi-reactor TCP server.
///
/// The main loop runs the acceptor; every accepted connection is handed to
/// a sub-loop picked round-robin from the thread pool and stays pinned to
/// it. User callbacks installed before [`start`] are propagated to every
/// connection.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use teal::{EventLoop, TcpServer};
///
/// # fn main() -> std::io::Result<()> {
/// let event_loop = EventLoop::new()?;
/// let server = TcpServer::new(&event_loop, "0.0.0.0:8080".parse().unwrap(), "echo", false)?;
/// server.set_thread_num(4);
/// server.set_message_callback(Arc::new(|conn, buf, _when| {
///     let msg = buf.retrieve_all_as_vec();
///     conn.send(&msg);
/// }));
/// server.start()?;
/// event_loop.run();
/// # Ok(())
/// # }
/// ```
///
/// [`start`]: TcpServer::start
pub struct TcpServer {
    event_loop: Arc<EventLoop>,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    on_connection: Mutex<Option<ConnectionCallback>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_write_complete: Mutex<Option<WriteCompleteCallback>>,
    thread_init: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, TcpConnectionRef>>,
    weak_self: Weak<TcpServer>,
}

impl TcpServer {
    /// Binds the listen socket on `listen_addr`. The returned server does
    /// nothing until [`start`](TcpServer::start).
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: InetAddress,
        name: &str,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(event_loop, &listen_addr, reuse_port)?;
        let local_addr = acceptor.local_addr();

        let server = Arc::new_cyclic(|weak_self: &Weak<TcpServer>| TcpServer {
            event_loop: Arc::clone(event_loop),
            name: name.to_string(),
            ip_port: local_addr.to_string(),
            acceptor,
            pool: Mutex::new(EventLoopThreadPool::new(
                Arc::clone(event_loop),
                name.to_string(),
            )),
            on_connection: Mutex::new(None),
            on_message: Mutex::new(None),
            on_write_complete: Mutex::new(None),
            thread_init: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        });

        let weak = server.weak_self.clone();
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |fd, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(fd, peer_addr);
                }
            }));
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address the listen socket is bound to; with port 0 this is the
    /// kernel-assigned ephemeral port.
    pub fn local_addr(&self) -> InetAddress {
        self.acceptor.local_addr()
    }

    /// Number of live connections in the table.
    pub fn num_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Number of sub-reactor threads; 0 keeps all I/O on the main loop.
    /// Takes effect at [`start`](TcpServer::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        self.pool.lock().unwrap().set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(&self, callback: ThreadInitCallback) {
        *self.thread_init.lock().unwrap() = Some(callback);
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.on_connection.lock().unwrap() = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.on_message.lock().unwrap() = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.on_write_complete.lock().unwrap() = Some(callback);
    }

    /// Starts the thread pool and schedules the acceptor to listen on the
    /// main loop. Idempotent; only the first call does anything.
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("TcpServer [{}] starting on {}", self.name, self.ip_port);
        let init = self.thread_init.lock().unwrap().clone();
        self.pool.lock().unwrap().start(init)?;

        let acceptor = Arc::clone(&self.acceptor);
        self.event_loop.run_in_loop(move || acceptor.listen());
        Ok(())
    }

    /// Runs on the main loop for every accepted descriptor.
    fn new_connection(&self, fd: OwnedFd, peer_addr: InetAddress) {
        self.event_loop.assert_in_loop_thread();
        let io_loop = self.pool.lock().unwrap().next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);

        let socket = Socket::from_owned(fd);
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                error!("getsockname for [{}] failed: {}", name, err);
                InetAddress::any(0)
            }
        };
        info!(
            "TcpServer [{}] new connection [{}] from {}",
            self.name, name, peer_addr
        );

        let connection = TcpConnection::new(io_loop.clone(), name.clone(), socket, local_addr, peer_addr);
        if let Some(callback) = self.on_connection.lock().unwrap().clone() {
            connection.set_connection_callback(callback);
        }
        if let Some(callback) = self.on_message.lock().unwrap().clone() {
            connection.set_message_callback(callback);
        }
        if let Some(callback) = self.on_write_complete.lock().unwrap().clone() {
            connection.set_write_complete_callback(callback);
        }
        let weak = self.weak_self.clone();
        connection.set_close_callback(Arc::new(move |conn: &TcpConnectionRef| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(name, Arc::clone(&connection));
        io_loop.run_in_loop(move || connection.connect_established());
    }

    /// Invoked by a closing connection, on its own sub-loop; hops to the
    /// main loop where the table lives.
    fn remove_connection(&self, connection: &TcpConnectionRef) {
        if let Some(server) = self.weak_self.upgrade() {
            let connection = Arc::clone(connection);
            self.event_loop
                .run_in_loop(move || server.remove_connection_in_loop(&connection));
        }
    }

    fn remove_connection_in_loop(&self, connection: &TcpConnectionRef) {
        self.event_loop.assert_in_loop_thread();
        info!(
            "TcpServer [{}] removing connection [{}]",
            self.name,
            connection.name()
        );
        self.connections.lock().unwrap().remove(connection.name());
        let io_loop = Arc::clone(connection.event_loop());
        let connection = Arc::clone(connection);
        io_loop.queue_in_loop(move || connection.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        info!("TcpServer [{}] shutting down", self.name);
        for (_, connection) in self.connections.lock().unwrap().drain() {
            let io_loop = Arc::clone(connection.event_loop());
            io_loop.run_in_loop(move || connection.connect_destroyed());
        }
    }
}
