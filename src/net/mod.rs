//! IPv4 address and stream-socket plumbing.

mod addr;
mod socket;

pub use self::addr::InetAddress;
pub(crate) use self::socket::Socket;
