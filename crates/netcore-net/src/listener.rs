//! Bound, listening socket
//!
//! Accepts raw peers into caller-provided `Socket`s. A unix-domain listener
//! removes a stale socket file before binding and unlinks its path on drop.

use std::os::fd::RawFd;

use netcore_core::{kdebug, NetError, NetResult, SocketType};

use crate::address::{Address, Family};
use crate::socket::Socket;

#[derive(Debug)]
pub struct Listener {
    socket: Socket,
    address: Address,
    unix_path: Option<String>,
}

impl Listener {
    /// Create, bind and listen. The socket is non-blocking; `address()`
    /// reports the actual bound address (port 0 resolved).
    pub fn bind(addr: &Address, backlog: i32, ty: SocketType) -> NetResult<Self> {
        if ty == SocketType::SeqPacket && addr.family() != Family::Unix {
            return Err(NetError::InvalidAddress(format!("seqpacket requires a unix path, got {}", addr)));
        }
        let socket = Socket::new(addr.family().domain(), ty.as_raw(), 0)?;

        let unix_path = addr.unix_path().filter(|p| !p.is_empty());
        match &unix_path {
            Some(path) => {
                // Leftover from a previous run
                let _ = std::fs::remove_file(path);
            }
            None => socket.set_reuse_addr(true)?,
        }

        socket.bind(addr)?;
        socket.listen(backlog)?;
        socket.set_nonblocking(true)?;
        let address = socket.local_address().unwrap_or_else(|_| addr.clone());
        kdebug!("listening on {} fd={}", address, socket.fd());

        Ok(Self { socket, address, unix_path })
    }

    /// Accept one peer into `into`, replacing whatever it held.
    pub fn accept_into(&self, into: &mut Socket) -> NetResult<Address> {
        let (fd, peer) = self.socket.accept()?;
        into.reset(fd);
        Ok(peer)
    }

    /// Accept one peer as a bare descriptor.
    pub fn accept_raw(&self) -> NetResult<(RawFd, Address)> {
        self.socket.accept()
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    #[inline]
    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.socket.close();
        if let Some(path) = self.unix_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bind_resolves_port_and_accepts() {
        let l = Listener::bind(&Address::listen("127.0.0.1:0").unwrap(), 16, SocketType::Stream).unwrap();
        assert_ne!(l.address().port(), 0);

        let mut none = Socket::invalid();
        assert_eq!(l.accept_into(&mut none), Err(NetError::WouldBlock));

        let mut client = Socket::invalid();
        assert!(client.connect(l.address(), Duration::from_secs(2)));

        let mut peer = Socket::invalid();
        let mut accepted = None;
        for _ in 0..200 {
            match l.accept_into(&mut peer) {
                Ok(a) => {
                    accepted = Some(a);
                    break;
                }
                Err(NetError::WouldBlock) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("accept: {}", e),
            }
        }
        assert!(accepted.is_some());
        assert!(peer.is_valid());
    }

    #[test]
    fn test_unix_listener_cleans_up() {
        let path = std::env::temp_dir().join(format!("netcore-listener-{}.sock", std::process::id()));
        let text = path.to_string_lossy().into_owned();
        {
            let l = Listener::bind(&Address::unix(&text).unwrap(), 4, SocketType::SeqPacket).unwrap();
            assert_eq!(l.address().family(), Family::Unix);
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_seqpacket_needs_unix() {
        let addr = Address::listen("127.0.0.1:0").unwrap();
        assert!(matches!(
            Listener::bind(&addr, 4, SocketType::SeqPacket),
            Err(NetError::InvalidAddress(_))
        ));
    }
}
