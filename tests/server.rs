use std::io::Read;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use teal::{TcpConnectionRef, TcpServer};

mod util;

use util::{wait_until, TestServer};

fn pattern(offset: usize, len: usize) -> Vec<u8> {
    (offset..offset + len).map(|i| (i % 251) as u8).collect()
}

/// Reads exactly `expected` pattern bytes (starting at offset 0) from the
/// stream, verifying content as it goes, and returns once they all arrived.
fn read_and_verify(client: &mut TcpStream, expected: usize) {
    let mut seen = 0usize;
    let mut chunk = vec![0u8; 64 * 1024];
    while seen < expected {
        let n = client.read(&mut chunk).expect("read failed");
        assert!(n > 0, "premature EOF after {} of {} bytes", seen, expected);
        assert_eq!(chunk[..n], pattern(seen, n)[..], "corrupt bytes at {}", seen);
        seen += n;
    }
    assert_eq!(seen, expected);
}

fn latest_connection(slot: &Arc<Mutex<Option<TcpConnectionRef>>>) -> TcpConnectionRef {
    assert!(wait_until(Duration::from_secs(2), || {
        slot.lock().unwrap().is_some()
    }));
    let conn = slot.lock().unwrap().take().unwrap();
    conn
}

#[test]
fn round_robin_dispatch_over_sub_reactors() {
    let ups: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));

    let record = Arc::clone(&ups);
    let server = TestServer::start(3, move |server| {
        server.set_connection_callback(Arc::new(move |conn: &TcpConnectionRef| {
            if conn.connected() {
                record.lock().unwrap().push(thread::current().id());
            }
        }));
    });

    let mut clients = Vec::new();
    for i in 0..9 {
        clients.push(TcpStream::connect(server.addr.to_string()).expect("unable to connect"));
        // Serialise the accepts so the assignment order is observable.
        assert!(wait_until(Duration::from_secs(2), || {
            ups.lock().unwrap().len() == i + 1
        }));
    }

    let assigned = ups.lock().unwrap().clone();
    assert_eq!(assigned.len(), 9);
    let first_round = &assigned[..3];
    assert!(first_round[0] != first_round[1]);
    assert!(first_round[1] != first_round[2]);
    assert!(first_round[0] != first_round[2]);
    for (i, thread_id) in assigned.iter().enumerate() {
        assert_eq!(*thread_id, first_round[i % 3], "accept {} went to the wrong loop", i);
    }
}

#[test]
fn large_write_buffers_and_reports_backpressure() {
    const BIG: usize = 32 * 1024 * 1024;
    const MARK: usize = 4 * 1024;

    let write_completes = Arc::new(AtomicUsize::new(0));
    let high_waters = Arc::new(AtomicUsize::new(0));
    let high_water_size = Arc::new(AtomicUsize::new(0));

    let slot = Arc::new(Mutex::new(None));
    let tracked = Arc::clone(&slot);
    let (hw, hw_size) = (Arc::clone(&high_waters), Arc::clone(&high_water_size));
    let wc = Arc::clone(&write_completes);
    let server = TestServer::start(1, move |server| {
        server.set_connection_callback(Arc::new(move |conn: &TcpConnectionRef| {
            if conn.connected() {
                let (hw, hw_size) = (Arc::clone(&hw), Arc::clone(&hw_size));
                conn.set_high_water_mark_callback(
                    Arc::new(move |_conn, buffered| {
                        hw.fetch_add(1, Ordering::AcqRel);
                        hw_size.store(buffered, Ordering::Release);
                    }),
                    MARK,
                );
                *tracked.lock().unwrap() = Some(Arc::clone(conn));
            }
        }));
        let wc = Arc::clone(&wc);
        server.set_write_complete_callback(Arc::new(move |_conn| {
            wc.fetch_add(1, Ordering::AcqRel);
        }));
    });

    let mut client =
        TcpStream::connect(server.addr.to_string()).expect("unable to connect to server");
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let conn = latest_connection(&slot);

    // The client is not reading: one send overwhelms the kernel buffers,
    // the remainder is buffered and the crossing is reported once.
    conn.send(&pattern(0, BIG));
    assert!(wait_until(Duration::from_secs(5), || {
        high_waters.load(Ordering::Acquire) == 1
    }));
    assert!(high_water_size.load(Ordering::Acquire) >= MARK);

    // Already above the mark: another send must not re-fire the callback.
    conn.send(&pattern(BIG, 1024));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(high_waters.load(Ordering::Acquire), 1);
    assert_eq!(write_completes.load(Ordering::Acquire), 0);

    read_and_verify(&mut client, BIG + 1024);

    assert!(wait_until(Duration::from_secs(5), || {
        write_completes.load(Ordering::Acquire) == 1
    }));
    assert_eq!(high_waters.load(Ordering::Acquire), 1);
}

#[test]
fn shutdown_flushes_buffered_output_before_half_close() {
    const BIG: usize = 32 * 1024 * 1024;

    let downs = Arc::new(AtomicUsize::new(0));
    let slot = Arc::new(Mutex::new(None));
    let tracked = Arc::clone(&slot);
    let down_count = Arc::clone(&downs);
    let server = TestServer::start(1, move |server| {
        server.set_connection_callback(Arc::new(move |conn: &TcpConnectionRef| {
            if conn.connected() {
                *tracked.lock().unwrap() = Some(Arc::clone(conn));
            } else {
                down_count.fetch_add(1, Ordering::AcqRel);
            }
        }));
    });

    let mut client =
        TcpStream::connect(server.addr.to_string()).expect("unable to connect to server");
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let conn = latest_connection(&slot);

    conn.send(&pattern(0, BIG));
    conn.shutdown();

    // Every buffered byte arrives, then EOF.
    read_and_verify(&mut client, BIG);
    let mut tail = [0u8; 1];
    assert_eq!(client.read(&mut tail).expect("read after data"), 0);

    // Half-close only: the connection goes down once the client closes its
    // own write side.
    assert_eq!(downs.load(Ordering::Acquire), 0);
    drop(client);
    assert!(wait_until(Duration::from_secs(2), || {
        downs.load(Ordering::Acquire) == 1
    }));
}

#[test]
fn peer_reset_tears_the_connection_down() {
    const BIG: usize = 32 * 1024 * 1024;

    let downs = Arc::new(AtomicUsize::new(0));
    let slot = Arc::new(Mutex::new(None));
    let server_slot: Arc<Mutex<Option<Arc<TcpServer>>>> = Arc::new(Mutex::new(None));

    let tracked = Arc::clone(&slot);
    let down_count = Arc::clone(&downs);
    let keep = Arc::clone(&server_slot);
    let server = TestServer::start(1, move |server| {
        *keep.lock().unwrap() = Some(Arc::clone(server));
        server.set_connection_callback(Arc::new(move |conn: &TcpConnectionRef| {
            if conn.connected() {
                *tracked.lock().unwrap() = Some(Arc::clone(conn));
            } else {
                down_count.fetch_add(1, Ordering::AcqRel);
            }
        }));
    });
    let server_handle = server_slot.lock().unwrap().clone().unwrap();
    assert_eq!(server_handle.num_connections(), 0);

    let client = TcpStream::connect(server.addr.to_string()).expect("unable to connect to server");
    let conn = latest_connection(&slot);
    assert!(wait_until(Duration::from_secs(2), || {
        server_handle.num_connections() == 1
    }));

    // Park a large send in the output buffer, then reset from the peer.
    conn.send(&pattern(0, BIG));
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let res = unsafe {
        libc::setsockopt(
            client.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(res, 0);
    drop(client);

    assert!(wait_until(Duration::from_secs(5), || {
        downs.load(Ordering::Acquire) == 1 && server_handle.num_connections() == 0
    }));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(downs.load(Ordering::Acquire), 1);
    assert!(!conn.connected());
}

#[test]
fn sequential_sends_arrive_concatenated_in_order() {
    let slot = Arc::new(Mutex::new(None));
    let tracked = Arc::clone(&slot);
    let server = TestServer::start(1, move |server| {
        server.set_connection_callback(Arc::new(move |conn: &TcpConnectionRef| {
            if conn.connected() {
                *tracked.lock().unwrap() = Some(Arc::clone(conn));
            }
        }));
    });

    let mut client =
        TcpStream::connect(server.addr.to_string()).expect("unable to connect to server");
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let conn = latest_connection(&slot);

    // Uneven chunks posted from a foreign thread; the peer must observe
    // one contiguous stream in submission order.
    let mut offset = 0usize;
    for i in 0..200 {
        let len = 1 + (i * 37) % 4096;
        conn.send(&pattern(offset, len));
        offset += len;
    }
    read_and_verify(&mut client, offset);
}
