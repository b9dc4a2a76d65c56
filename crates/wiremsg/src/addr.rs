//! Socket address strings.
//!
//! Addresses travel as strings of the form `inet:HOST:PORT`,
//! `inet6:HOST:PORT`, `unix:/path` or `unix:@abstract`. Host names go
//! through the platform resolver; numeric literals round-trip through
//! [`fmt::Display`].

use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::str::FromStr;

use nix::sys::socket::{AddressFamily, SockaddrIn, SockaddrIn6, SockaddrStorage, UnixAddr};

use crate::error::{Error, Result};

/// One parsed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Addr {
    /// IPv4 endpoint (`inet:HOST:PORT`).
    Inet(SocketAddrV4),
    /// IPv6 endpoint (`inet6:HOST:PORT`).
    Inet6(SocketAddrV6),
    /// Local socket: a filesystem path, or `@name` for an abstract name.
    Unix(String),
}

impl Addr {
    /// True for local sockets, the only ones eligible for descriptor
    /// passing and peer credentials.
    #[must_use]
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_))
    }

    /// Filesystem path of a non-abstract local address, if any.
    #[must_use]
    pub fn unix_path(&self) -> Option<&str> {
        match self {
            Self::Unix(name) if !name.starts_with('@') => Some(name),
            _ => None,
        }
    }

    pub(crate) fn family(&self) -> AddressFamily {
        match self {
            Self::Inet(_) => AddressFamily::Inet,
            Self::Inet6(_) => AddressFamily::Inet6,
            Self::Unix(_) => AddressFamily::Unix,
        }
    }

    pub(crate) fn to_os(&self) -> Result<OsAddr> {
        Ok(match self {
            Self::Inet(sa) => OsAddr::V4(SockaddrIn::from(*sa)),
            Self::Inet6(sa) => OsAddr::V6(SockaddrIn6::from(*sa)),
            Self::Unix(name) => match name.strip_prefix('@') {
                #[cfg(any(target_os = "linux", target_os = "android"))]
                Some(abstract_name) => OsAddr::Unix(UnixAddr::new_abstract(
                    abstract_name.as_bytes(),
                )?),
                #[cfg(not(any(target_os = "linux", target_os = "android")))]
                Some(_) => {
                    return Err(Error::Unsupported(
                        "abstract socket names on this platform",
                    ));
                }
                None => OsAddr::Unix(UnixAddr::new(name.as_str())?),
            },
        })
    }

    /// Rebuild an address from the kernel's view of a socket name.
    pub(crate) fn from_storage(ss: &SockaddrStorage) -> Option<Self> {
        if let Some(sin) = ss.as_sockaddr_in() {
            return Some(Self::Inet(SocketAddrV4::new(sin.ip(), sin.port())));
        }
        if let Some(sin6) = ss.as_sockaddr_in6() {
            return Some(Self::Inet6(SocketAddrV6::new(
                sin6.ip(),
                sin6.port(),
                sin6.flowinfo(),
                sin6.scope_id(),
            )));
        }
        let unix = ss.as_unix_addr()?;
        if let Some(path) = unix.path() {
            return Some(Self::Unix(path.to_string_lossy().into_owned()));
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Some(name) = unix.as_abstract() {
            return Some(Self::Unix(format!(
                "@{}",
                String::from_utf8_lossy(name)
            )));
        }
        // Unnamed local socket (e.g. the client end of a socketpair).
        Some(Self::Unix(String::new()))
    }
}

/// Nix-level form of an [`Addr`], ready for bind/connect/sendto.
#[derive(Debug, Clone)]
pub(crate) enum OsAddr {
    V4(SockaddrIn),
    V6(SockaddrIn6),
    Unix(UnixAddr),
}

impl OsAddr {
    pub(crate) fn bind(&self, fd: std::os::fd::RawFd) -> nix::Result<()> {
        match self {
            Self::V4(sa) => nix::sys::socket::bind(fd, sa),
            Self::V6(sa) => nix::sys::socket::bind(fd, sa),
            Self::Unix(sa) => nix::sys::socket::bind(fd, sa),
        }
    }

    pub(crate) fn connect(&self, fd: std::os::fd::RawFd) -> nix::Result<()> {
        match self {
            Self::V4(sa) => nix::sys::socket::connect(fd, sa),
            Self::V6(sa) => nix::sys::socket::connect(fd, sa),
            Self::Unix(sa) => nix::sys::socket::connect(fd, sa),
        }
    }

    pub(crate) fn sendto(
        &self,
        fd: std::os::fd::RawFd,
        buf: &[u8],
        flags: nix::sys::socket::MsgFlags,
    ) -> nix::Result<usize> {
        match self {
            Self::V4(sa) => nix::sys::socket::sendto(fd, buf, sa, flags),
            Self::V6(sa) => nix::sys::socket::sendto(fd, buf, sa, flags),
            Self::Unix(sa) => nix::sys::socket::sendto(fd, buf, sa, flags),
        }
    }
}

fn resolve(host: &str, port: &str, want_v6: bool) -> Result<Addr> {
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidArgument("bad port in address"))?;
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::InvalidArgument("unresolvable host in address"))?;
    for addr in addrs {
        match addr {
            SocketAddr::V4(sa) if !want_v6 => return Ok(Addr::Inet(sa)),
            SocketAddr::V6(sa) if want_v6 => return Ok(Addr::Inet6(sa)),
            _ => {}
        }
    }
    Err(Error::InvalidArgument(
        "host did not resolve in the requested family",
    ))
}

impl FromStr for Addr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("inet:") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or(Error::InvalidArgument("missing port in address"))?;
            return resolve(host, port, false);
        }
        if let Some(rest) = s.strip_prefix("inet6:") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or(Error::InvalidArgument("missing port in address"))?;
            return resolve(host, port, true);
        }
        if let Some(name) = s.strip_prefix("unix:") {
            if name.is_empty() {
                return Err(Error::InvalidArgument("empty local socket name"));
            }
            return Ok(Self::Unix(name.to_owned()));
        }
        Err(Error::InvalidArgument("unknown address scheme"))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(sa) => write!(f, "inet:{}:{}", sa.ip(), sa.port()),
            Self::Inet6(sa) => write!(f, "inet6:{}:{}", sa.ip(), sa.port()),
            Self::Unix(name) => write!(f, "unix:{name}"),
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(sa: SocketAddr) -> Self {
        match sa {
            SocketAddr::V4(v4) => Self::Inet(v4),
            SocketAddr::V6(v6) => Self::Inet6(v6),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_literals_roundtrip() {
        for text in [
            "inet:127.0.0.1:8080",
            "inet6:::1:8080",
            "unix:/tmp/test.sock",
            "unix:@abstract-name",
        ] {
            let addr: Addr = text.parse().unwrap();
            assert_eq!(addr.to_string(), text, "roundtrip of {text}");
        }
    }

    #[test]
    fn unix_detection() {
        let unix: Addr = "unix:/tmp/x.sock".parse().unwrap();
        let inet: Addr = "inet:127.0.0.1:80".parse().unwrap();
        assert!(unix.is_unix());
        assert_eq!(unix.unix_path(), Some("/tmp/x.sock"));
        assert!(!inet.is_unix());

        let abstract_addr: Addr = "unix:@name".parse().unwrap();
        assert!(abstract_addr.is_unix());
        assert_eq!(abstract_addr.unix_path(), None);
    }

    #[test]
    fn bad_addresses_are_rejected() {
        for text in [
            "inet:127.0.0.1",
            "inet:host:notaport",
            "unix:",
            "tcp:127.0.0.1:80",
            "",
        ] {
            assert!(text.parse::<Addr>().is_err(), "{text} should not parse");
        }
    }

    #[test]
    fn localhost_resolves() {
        let addr: Addr = "inet:localhost:1234".parse().unwrap();
        let Addr::Inet(sa) = addr else {
            panic!("expected an IPv4 address");
        };
        assert_eq!(sa.port(), 1234);
        assert!(sa.ip().is_loopback());
    }

    #[test]
    fn os_address_conversion() {
        let addr: Addr = "inet:127.0.0.1:9999".parse().unwrap();
        let os = addr.to_os().unwrap();
        assert!(matches!(os, OsAddr::V4(_)));

        let unix: Addr = "unix:/tmp/sock".parse().unwrap();
        assert!(matches!(unix.to_os().unwrap(), OsAddr::Unix(_)));
    }
}
