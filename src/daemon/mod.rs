//! Client side of the `forged` daemon
//!
//! The daemon serves a live "watch" stream as newline-delimited JSON over a
//! unix socket or TCP. This module finds the daemon, probes it, and speaks
//! the client half of the protocol.
//!
//! Discovery order:
//!
//! 1. The configured address (`FMAIL_FORGED_ADDR` / `forged_addr`)
//! 2. `<project>/.fmail/forged.sock`
//! 3. `127.0.0.1:7463`

pub mod client;
pub mod protocol;

pub use client::WatchClient;
pub use protocol::{Ack, FrameReader, ReadOutcome, StreamEvent, WatchRequest, WireError};

use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Socket file name inside the mailbox directory
pub const SOCKET_NAME: &str = "forged.sock";

/// Address tried when nothing else is configured or present
pub const FALLBACK_TCP_ADDR: &str = "127.0.0.1:7463";

/// Timeout for reachability probes and connection attempts
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Where the daemon listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonAddr {
    Unix(PathBuf),
    Tcp(String),
}

impl fmt::Display for DaemonAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonAddr::Unix(path) => write!(f, "unix:{}", path.display()),
            DaemonAddr::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

impl DaemonAddr {
    /// Interpret a configured address: paths starting with `/` or `./`, or
    /// ending in `.sock` without a colon, are unix sockets; anything else is TCP.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let is_unix = raw.starts_with('/')
            || raw.starts_with("./")
            || (raw.ends_with(".sock") && !raw.contains(':'));
        if is_unix {
            DaemonAddr::Unix(PathBuf::from(raw))
        } else {
            DaemonAddr::Tcp(raw.to_string())
        }
    }

    /// Whether a daemon appears to be listening.
    /// Unix sockets count when the file exists; TCP needs a successful connect.
    pub fn probe(&self) -> bool {
        match self {
            DaemonAddr::Unix(path) => path.exists(),
            DaemonAddr::Tcp(addr) => tcp_reachable(addr, CONNECT_TIMEOUT),
        }
    }
}

fn tcp_reachable(addr: &str, timeout: Duration) -> bool {
    let Ok(addrs) = addr.to_socket_addrs() else {
        return false;
    };
    addrs.into_iter().any(|sock| TcpStream::connect_timeout(&sock, timeout).is_ok())
}

/// Resolve the daemon address for a store rooted at `store_root` (the `.fmail` dir)
pub fn resolve_addr(configured: Option<&str>, store_root: &Path) -> DaemonAddr {
    if let Some(raw) = configured.map(str::trim).filter(|r| !r.is_empty()) {
        return DaemonAddr::parse(raw);
    }
    let socket = store_root.join(SOCKET_NAME);
    if socket.exists() {
        return DaemonAddr::Unix(socket);
    }
    DaemonAddr::Tcp(FALLBACK_TCP_ADDR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_heuristics() {
        assert_eq!(
            DaemonAddr::parse("/run/forged.sock"),
            DaemonAddr::Unix("/run/forged.sock".into())
        );
        assert_eq!(
            DaemonAddr::parse("./local"),
            DaemonAddr::Unix("./local".into())
        );
        assert_eq!(
            DaemonAddr::parse("forged.sock"),
            DaemonAddr::Unix("forged.sock".into())
        );
        assert_eq!(
            DaemonAddr::parse("host:1.sock"),
            DaemonAddr::Tcp("host:1.sock".into())
        );
        assert_eq!(
            DaemonAddr::parse("localhost:7463"),
            DaemonAddr::Tcp("localhost:7463".into())
        );
    }

    #[test]
    fn test_resolve_order() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            resolve_addr(None, dir.path()),
            DaemonAddr::Tcp(FALLBACK_TCP_ADDR.into())
        );

        let socket = dir.path().join(SOCKET_NAME);
        std::fs::write(&socket, b"").unwrap();
        assert_eq!(resolve_addr(None, dir.path()), DaemonAddr::Unix(socket.clone()));
        assert!(DaemonAddr::Unix(socket).probe());

        assert_eq!(
            resolve_addr(Some("10.0.0.1:9"), dir.path()),
            DaemonAddr::Tcp("10.0.0.1:9".into())
        );
    }

    #[test]
    fn test_probe_missing_socket() {
        let dir = TempDir::new().unwrap();
        assert!(!DaemonAddr::Unix(dir.path().join("none.sock")).probe());
    }
}
