//! An echo server: four sub-reactors, every message is written straight
//! back to its sender.
//!
//! You can talk to it using `nc`:
//!
//! ```sh
//! $ cargo run --example echo
//! $ nc 127.0.0.1 8080
//! ```

use std::io;
use std::sync::Arc;

use log::info;

use teal::{EventLoop, TcpServer};

fn main() -> io::Result<()> {
    env_logger::init();

    let event_loop = EventLoop::new()?;
    let addr = "0.0.0.0:8080".parse().unwrap();
    let server = TcpServer::new(&event_loop, addr, "echo", false)?;
    server.set_thread_num(4);

    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            info!("connection up: {}", conn.peer_addr());
        } else {
            info!("connection down: {}", conn.peer_addr());
        }
    }));
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let msg = buf.retrieve_all_as_vec();
        conn.send(&msg);
    }));

    server.start()?;
    println!("echo server listening on {}", server.local_addr());
    event_loop.run();
    Ok(())
}
