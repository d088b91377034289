use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use nix::unistd::getuid;

// tonic does not support uds well, so each user gets a loopback port
// instead of a per-uid socket file.
const PORT_BASE: u16 = 40000;
const PORT_RANGE: u32 = 20000;

/// coordinator_port cooks up a unique-ish loopback port for the coordinator
/// from the invoking user's uid.
pub fn coordinator_port() -> u16 {
    port_for_uid(getuid().as_raw())
}

fn port_for_uid(uid: u32) -> u16 {
    PORT_BASE + (uid % PORT_RANGE) as u16
}

/// Address the coordinator binds when none is configured.
pub fn coordinator_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, coordinator_port()))
}

/// Endpoint URI workers dial for a coordinator bound at `addr`.
pub fn endpoint_for(addr: SocketAddr) -> String {
    format!("http://{}", addr)
}
