//! Loopback port allocation.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, TcpListener};

/// Which of the two instance addresses is being allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressRole {
    /// Client-facing address.
    Endpoint,
    /// Internal peer (raft) address.
    Peer,
}

impl fmt::Display for AddressRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressRole::Endpoint => f.write_str("endpoint"),
            AddressRole::Peer => f.write_str("peer"),
        }
    }
}

/// Ask the OS for a free TCP port on `127.0.0.1` and return it as
/// `host:port`.
///
/// The listener is closed before this returns, so nothing holds the port
/// when the server later binds it. Another process may grab the port in
/// between; that window is a known limitation of allocate-then-release and
/// is accepted here. Bind errors are returned as-is.
pub fn allocate_local_address() -> io::Result<String> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr.to_string())
}
