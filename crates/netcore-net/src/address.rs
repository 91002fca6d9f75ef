//! Transport endpoint encoded as a native sockaddr
//!
//! An `Address` is the exact byte image passed to `bind`/`connect` plus a
//! family tag. Construction validates the image, so every live `Address`
//! can go straight to the kernel.
//!
//! Accepted text forms:
//!
//! | Text                | Result                                 |
//! |---------------------|----------------------------------------|
//! | `127.0.0.1:9000`    | IPv4                                   |
//! | `[::1]:9000`        | IPv6                                   |
//! | `::1`               | IPv6, port 0                           |
//! | `localhost:80`      | first result of the system resolver    |
//! | `host`              | port 0                                 |
//! | `/tmp/app.sock`     | unix path (anything containing `/`)    |
//! | `unix:app.sock`     | unix path                              |
//! | `:9000` (listen)    | `0.0.0.0:9000`                         |
//! | `[]:9000` (listen)  | `[::]:9000`                            |

use core::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::ptr;

use netcore_core::{NetError, NetResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Inet,
    Inet6,
    Unix,
}

impl Family {
    /// `AF_*` value for socket(2).
    pub fn domain(&self) -> libc::c_int {
        match self {
            Family::Inet => libc::AF_INET,
            Family::Inet6 => libc::AF_INET6,
            Family::Unix => libc::AF_UNIX,
        }
    }

    fn from_raw(af: libc::c_int) -> Option<Self> {
        match af {
            libc::AF_INET => Some(Family::Inet),
            libc::AF_INET6 => Some(Family::Inet6),
            libc::AF_UNIX => Some(Family::Unix),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Address {
    bytes: Vec<u8>,
    family: Family,
}

/// Byte offset of `sun_path` within `sockaddr_un`.
const SUN_PATH_OFFSET: usize = mem::offset_of!(libc::sockaddr_un, sun_path);

impl Address {
    /// Parse a connect-side address.
    pub fn parse(text: &str) -> NetResult<Self> {
        Self::parse_with(text, false)
    }

    /// Parse a listen-side address; an empty host means the wildcard.
    pub fn listen(text: &str) -> NetResult<Self> {
        Self::parse_with(text, true)
    }

    fn parse_with(text: &str, listen: bool) -> NetResult<Self> {
        let text = text.trim();
        if let Some(path) = text.strip_prefix("unix:") {
            return Self::unix(path);
        }
        if text.contains('/') {
            return Self::unix(text);
        }

        if let Some(rest) = text.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid(text, "missing ']'"))?;
            let port = match tail {
                "" => 0,
                t => parse_port(text, t.strip_prefix(':').ok_or_else(|| invalid(text, "expected ':' after ']'"))?)?,
            };
            if host.is_empty() {
                if !listen {
                    return Err(invalid(text, "empty host"));
                }
                return Ok(Self::from_socket_addr(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port)));
            }
            let ip: Ipv6Addr = host.parse().map_err(|_| invalid(text, "bad IPv6 literal"))?;
            return Ok(Self::from_socket_addr(SocketAddr::new(ip.into(), port)));
        }

        // Bare IPv6 literal without brackets
        if text.matches(':').count() > 1 {
            let ip: Ipv6Addr = text.parse().map_err(|_| invalid(text, "bad IPv6 literal"))?;
            return Ok(Self::from_socket_addr(SocketAddr::new(ip.into(), 0)));
        }

        match text.split_once(':') {
            Some((host, port)) => Self::new(host, parse_port(text, port)?, listen),
            None => Self::new(text, 0, listen),
        }
    }

    /// Build from host and port. Hostnames go through the system resolver
    /// and the first result wins.
    pub fn new(host: &str, port: u16, listen: bool) -> NetResult<Self> {
        let host = host.trim();
        if host.is_empty() {
            if listen {
                return Ok(Self::from_socket_addr(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)));
            }
            return Err(invalid(host, "empty host"));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self::from_socket_addr(SocketAddr::new(ip, port)));
        }
        let resolved = (host, port)
            .to_socket_addrs()
            .map_err(|e| invalid(host, &e.to_string()))?
            .next()
            .ok_or_else(|| invalid(host, "no addresses"))?;
        Ok(Self::from_socket_addr(resolved))
    }

    /// Unix-domain path. Paths that do not fit `sun_path` are rejected.
    pub fn unix(path: &str) -> NetResult<Self> {
        let mut sun: libc::sockaddr_un = unsafe { mem::zeroed() };
        let raw = path.as_bytes();
        if raw.is_empty() {
            return Err(invalid(path, "empty unix path"));
        }
        if raw.len() >= sun.sun_path.len() {
            return Err(invalid(path, "unix path too long"));
        }
        if raw.contains(&0) {
            return Err(invalid(path, "unix path contains NUL"));
        }
        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in sun.sun_path.iter_mut().zip(raw) {
            *dst = *src as libc::c_char;
        }
        let len = SUN_PATH_OFFSET + raw.len() + 1;
        let mut bytes = struct_bytes(&sun);
        bytes.truncate(len);
        stamp_len(&mut bytes);
        Ok(Self { bytes, family: Family::Unix })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => {
                let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                let mut bytes = struct_bytes(&sin);
                stamp_len(&mut bytes);
                Self { bytes, family: Family::Inet }
            }
            SocketAddr::V6(v6) => {
                let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_scope_id = v6.scope_id();
                let mut bytes = struct_bytes(&sin6);
                stamp_len(&mut bytes);
                Self { bytes, family: Family::Inet6 }
            }
        }
    }

    /// Adopt a raw sockaddr image after validating it.
    pub fn from_bytes(bytes: &[u8]) -> NetResult<Self> {
        let family = validate(bytes).ok_or_else(|| NetError::InvalidAddress(format!("{} byte sockaddr rejected", bytes.len())))?;
        Ok(Self { bytes: bytes.to_vec(), family })
    }

    /// From what accept/getsockname/getpeername filled in.
    pub fn from_raw(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> NetResult<Self> {
        let len = (len as usize).min(mem::size_of::<libc::sockaddr_storage>());
        let bytes = unsafe { std::slice::from_raw_parts(storage as *const _ as *const u8, len) };
        Self::from_bytes(bytes)
    }

    #[inline]
    pub fn family(&self) -> Family {
        self.family
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        self.bytes.as_ptr() as *const libc::sockaddr
    }

    #[inline]
    pub fn socklen(&self) -> libc::socklen_t {
        self.bytes.len() as libc::socklen_t
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.family {
            Family::Inet => {
                let sin: libc::sockaddr_in = unsafe { ptr::read_unaligned(self.bytes.as_ptr() as *const _) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            Family::Inet6 => {
                let sin6: libc::sockaddr_in6 = unsafe { ptr::read_unaligned(self.bytes.as_ptr() as *const _) };
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            Family::Unix => None,
        }
    }

    /// Unix path, `None` for inet families. Unnamed sockets yield `""`.
    pub fn unix_path(&self) -> Option<String> {
        if self.family != Family::Unix {
            return None;
        }
        let raw = self.bytes.get(SUN_PATH_OFFSET..).unwrap_or(&[]);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Some(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// IP text or unix path.
    pub fn host(&self) -> String {
        match self.to_socket_addr() {
            Some(sa) => sa.ip().to_string(),
            None => self.unix_path().unwrap_or_default(),
        }
    }

    /// Port, 0 for unix addresses.
    pub fn port(&self) -> u16 {
        self.to_socket_addr().map_or(0, |sa| sa.port())
    }

    /// Text form that parses back to the same bytes.
    pub fn text(&self) -> String {
        match self.to_socket_addr() {
            Some(SocketAddr::V4(v4)) => format!("{}:{}", v4.ip(), v4.port()),
            Some(SocketAddr::V6(v6)) => format!("[{}]:{}", v6.ip(), v6.port()),
            None => {
                let path = self.unix_path().unwrap_or_default();
                if path.contains('/') {
                    path
                } else {
                    format!("unix:{}", path)
                }
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:?} {})", self.family, self.text())
    }
}

/// Structural check of a sockaddr image: known family, family-appropriate
/// size and, on BSD-derived systems, a consistent `sa_len`.
pub fn is_valid_addr(bytes: &[u8]) -> bool {
    validate(bytes).is_some()
}

fn validate(bytes: &[u8]) -> Option<Family> {
    let len = bytes.len();
    if len < SUN_PATH_OFFSET || len > mem::size_of::<libc::sockaddr_storage>() {
        return None;
    }
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), &mut ss as *mut _ as *mut u8, len) };

    let family = Family::from_raw(ss.ss_family as libc::c_int)?;
    let size_ok = match family {
        Family::Inet => len == mem::size_of::<libc::sockaddr_in>(),
        Family::Inet6 => len == mem::size_of::<libc::sockaddr_in6>(),
        Family::Unix => len <= mem::size_of::<libc::sockaddr_un>(),
    };
    if !size_ok || !stored_len_ok(&ss, family, len) {
        return None;
    }
    Some(family)
}

cfg_if::cfg_if! {
    if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ))] {
        /// BSD sockaddrs carry their own length in the first byte.
        fn stamp_len(bytes: &mut [u8]) {
            bytes[0] = bytes.len() as u8;
        }

        fn stored_len_ok(ss: &libc::sockaddr_storage, family: Family, len: usize) -> bool {
            let stored = ss.ss_len as usize;
            match family {
                Family::Unix => stored <= mem::size_of::<libc::sockaddr_un>(),
                _ => stored == 0 || stored == len,
            }
        }
    } else {
        fn stamp_len(_bytes: &mut [u8]) {}

        fn stored_len_ok(_ss: &libc::sockaddr_storage, _family: Family, _len: usize) -> bool {
            true
        }
    }
}

fn struct_bytes<T>(value: &T) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }.to_vec()
}

fn parse_port(text: &str, port: &str) -> NetResult<u16> {
    port.parse().map_err(|_| invalid(text, "bad port"))
}

fn invalid(text: &str, why: &str) -> NetError {
    NetError::InvalidAddress(format!("{:?}: {}", text, why))
}
