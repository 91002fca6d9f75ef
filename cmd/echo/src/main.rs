//! netcore echo server
//!
//! Every packet a peer sends is written straight back. Connections are
//! served by a `ThreadPool`; the server stops when stdin reaches EOF.
//!
//! Usage:
//!     cargo build --release -p netcore-echo
//!     ./target/release/netcore-echo [address] [mode] [workers]
//!
//!     address  host:port, [v6]:port or a unix path   (default 0.0.0.0:9999)
//!     mode     epoll|select|kqueue|io_uring           (default: platform best)
//!     workers  thread pool size                       (default: CPU count)
//!
//! Positional arguments override `NETCORE_ECHO_*` and `NETCORE_POOL_*`.
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999

use std::process::ExitCode;
use std::sync::Arc;

use netcore::{kerror, kinfo, Manager, ManagerSetting, Mode, PoolConfig, ThreadPool};

const DEFAULT_ADDRESS: &str = "0.0.0.0:9999";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let mut setting = ManagerSetting::from_env("echo");
    if let Some(address) = args.get(1) {
        setting = setting.address(address.as_str());
    } else if !setting.listens() {
        setting = setting.address(DEFAULT_ADDRESS);
    }
    if let Some(mode) = args.get(2) {
        match mode.parse::<Mode>() {
            Ok(m) => setting = setting.mode(m),
            Err(e) => {
                kerror!("netcore-echo: {}", e);
                return ExitCode::from(2);
            }
        }
    }

    let mut pool_config = PoolConfig::from_env().name("echo-pool");
    if let Some(n) = args.get(3).and_then(|s| s.parse().ok()) {
        pool_config = pool_config.num_workers(n);
    }

    let pool = match ThreadPool::new(pool_config) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            kerror!("netcore-echo: {}", e);
            return ExitCode::from(2);
        }
    };
    let workers = pool.num_workers();

    let manager = match Manager::new(setting, pool) {
        Ok(m) => m,
        Err(e) => {
            kerror!("netcore-echo: {}", e);
            return ExitCode::from(2);
        }
    };

    manager.set_dispatcher(|conn, packet| conn.send(&packet));
    manager.set_connect_callback(|conn| match conn.peer() {
        Some(peer) => kinfo!("connect {} from {}", conn.id(), peer),
        None => kinfo!("connect {}", conn.id()),
    });
    manager.set_disconnect_callback(|conn| {
        kinfo!("disconnect {} (in={} out={})", conn.id(), conn.bytes_in(), conn.bytes_out());
    });

    if !manager.start() {
        kerror!("netcore-echo: failed to start");
        return ExitCode::FAILURE;
    }
    kinfo!(
        "netcore-echo: listening on {} ({}, {} workers); close stdin to stop",
        manager.local_address().map(|a| a.to_string()).unwrap_or_default(),
        manager.setting().mode,
        workers
    );

    // Block until stdin is closed
    let _ = std::io::copy(&mut std::io::stdin().lock(), &mut std::io::sink());

    let stats = manager.stats();
    manager.stop();
    kinfo!(
        "netcore-echo: stopped (accepted={} rejected={} removed={})",
        stats.accepted,
        stats.rejected,
        stats.removed
    );
    ExitCode::SUCCESS
}
