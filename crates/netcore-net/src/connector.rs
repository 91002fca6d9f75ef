//! Outbound connection with a reserved slot
//!
//! A `Connector` owns one keep-alive connection id on a manager. A remote
//! disconnect closes the socket but leaves the slot allocated, so
//! `reconnect()` brings the peer back on the same id.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use netcore_core::{kdebug, ConnId, NetError, NetResult};

use crate::address::Address;
use crate::connection::Connection;
use crate::manager::{Core, Manager};

pub struct Connector {
    core: Arc<Core>,
    address: Address,
    timeout: Duration,
    conn: Mutex<Option<Arc<Connection>>>,
}

impl Connector {
    pub fn new(manager: &Manager, address: Address, timeout: Duration) -> Self {
        Self {
            core: manager.core().clone(),
            address,
            timeout,
            conn: Mutex::new(None),
        }
    }

    /// Parse `address` first.
    pub fn with_address(manager: &Manager, address: &str, timeout: Duration) -> NetResult<Self> {
        Ok(Self::new(manager, Address::parse(address)?, timeout))
    }

    /// Connect, reserving a slot on first use. The slot stays reserved even
    /// if the connect fails; a refused, unreachable or timed out connect
    /// reports `NetError::Closed`.
    pub fn connect(&self) -> NetResult<Arc<Connection>> {
        let mut guard = self.conn.lock().unwrap();
        let conn = match guard.as_ref() {
            Some(c) => c.clone(),
            None => {
                let c = self.core.new_conn().ok_or(NetError::Full)?;
                c.set_keep_alive(true);
                *guard = Some(c.clone());
                c
            }
        };
        if conn.is_connected() {
            return Ok(conn);
        }
        if !self.core.is_running() {
            return Err(NetError::NotRunning);
        }
        if self.core.connect_slot(&conn, &self.address, self.timeout) {
            Ok(conn)
        } else {
            Err(NetError::Closed)
        }
    }

    /// Drop the current socket (if any) and connect again on the same id.
    pub fn reconnect(&self) -> NetResult<Arc<Connection>> {
        let current = self.conn.lock().unwrap().clone();
        if let Some(conn) = current {
            self.core.remove_conn(&conn, None, false);
            conn.init();
            conn.set_keep_alive(true);
            kdebug!("reconnecting {} to {}", conn.id(), self.address);
        }
        self.connect()
    }

    pub fn send(&self, packet: &[u8]) -> bool {
        match self.conn.lock().unwrap().as_ref() {
            Some(conn) => conn.send(packet),
            None => false,
        }
    }

    /// Release the slot back to the manager.
    pub fn close(&self) {
        if let Some(conn) = self.conn.lock().unwrap().take() {
            conn.set_keep_alive(false);
            self.core.remove_conn(&conn, None, false);
        }
    }

    pub fn id(&self) -> Option<ConnId> {
        self.conn.lock().unwrap().as_ref().map(|c| c.id())
    }

    pub fn is_connected(&self) -> bool {
        self.conn.lock().unwrap().as_ref().is_some_and(|c| c.is_connected())
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_core::{ManagerSetting, Mode};
    use netcore_exec::ThreadPool;
    use std::thread;
    use std::time::Instant;

    fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    fn manager(name: &str, address: &str) -> Manager {
        let setting = ManagerSetting::new(name)
            .address(address)
            .mode(Mode::Select)
            .poll_timeout(Duration::from_millis(10));
        Manager::new(setting, Arc::new(ThreadPool::with_workers(2).unwrap())).unwrap()
    }

    #[test]
    fn test_slot_survives_remote_close() {
        let server = manager("t-conn-srv", "127.0.0.1:0");
        assert!(server.start());
        let client = manager("t-conn-cli", "");
        assert!(client.start());

        let connector = Connector::new(&client, server.local_address().unwrap(), Duration::from_secs(2));
        let conn = connector.connect().unwrap();
        let id = conn.id();
        assert!(connector.is_connected());
        assert!(wait_until(Duration::from_secs(5), || server.size() == 1));

        // Server drops the peer; client sees EOF but keeps the slot
        let server_ids: Vec<_> = server.ids().iter().copied().collect();
        assert!(server.remove(server_ids[0]));
        assert!(wait_until(Duration::from_secs(5), || !connector.is_connected()));
        assert_eq!(client.size(), 1);
        assert!(client.get_conn(id).is_some());

        let again = connector.reconnect().unwrap();
        assert_eq!(again.id(), id);
        assert!(again.is_connected());
        assert!(connector.send(b"x"));

        connector.close();
        assert_eq!(client.size(), 0);
        assert!(connector.id().is_none());
        client.stop();
        server.stop();
    }

    #[test]
    fn test_failed_connect_keeps_slot() {
        let client = manager("t-conn-refused", "");
        assert!(client.start());

        // Bind then drop a listener to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let addr = Address::parse(&format!("127.0.0.1:{}", port)).unwrap();
        let connector = Connector::new(&client, addr, Duration::from_millis(500));

        assert!(connector.connect().is_err());
        assert!(connector.id().is_some());
        assert_eq!(client.size(), 1);
        drop(connector);
        assert_eq!(client.size(), 0);
        client.stop();
    }
}
