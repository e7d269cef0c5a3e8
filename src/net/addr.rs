use std::fmt;
use std::net::{AddrParseError, Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

/// An IPv4 socket address.
///
/// A thin wrapper around [`SocketAddrV4`] that converts to and from the raw
/// `sockaddr_in` the socket syscalls need. Formats as `ip:port`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct InetAddress {
    addr: SocketAddrV4,
}

impl InetAddress {
    /// Address binding every local interface on `port` (`0.0.0.0:port`).
    pub fn any(port: u16) -> InetAddress {
        InetAddress {
            addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port),
        }
    }

    /// Address for a specific ip and port.
    pub fn new(ip: Ipv4Addr, port: u16) -> InetAddress {
        InetAddress {
            addr: SocketAddrV4::new(ip, port),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub(crate) fn from_raw(raw: libc::sockaddr_in) -> InetAddress {
        InetAddress {
            addr: SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr)),
                u16::from_be(raw.sin_port),
            ),
        }
    }

    pub(crate) fn to_raw(self) -> libc::sockaddr_in {
        libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: self.addr.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(*self.addr.ip()).to_be(),
            },
            sin_zero: [0; 8],
        }
    }
}

impl From<SocketAddrV4> for InetAddress {
    fn from(addr: SocketAddrV4) -> InetAddress {
        InetAddress { addr }
    }
}

impl FromStr for InetAddress {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<InetAddress, AddrParseError> {
        s.parse::<SocketAddrV4>().map(|addr| InetAddress { addr })
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::InetAddress;
    use std::net::Ipv4Addr;

    #[test]
    fn formats_as_ip_port() {
        assert_eq!(InetAddress::any(8080).to_string(), "0.0.0.0:8080");
        let addr: InetAddress = "127.0.0.1:13265".parse().unwrap();
        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(addr.port(), 13265);
    }

    #[test]
    fn raw_round_trip() {
        let addr: InetAddress = "192.168.1.7:4242".parse().unwrap();
        assert_eq!(InetAddress::from_raw(addr.to_raw()), addr);
    }
}
