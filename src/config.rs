//! Server configuration.
//!
//! A [`Config`] is plain data; the binary fills it from command line arguments
//! and library users build it directly.
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

/// Port used when none is given.
pub const DEFAULT_PORT: u16 = 25500;

/// Size of the GameMaker packet header, including the leading marker byte.
pub const DEFAULT_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Interface to listen on.
    pub address: IpAddr,
    /// Port to listen on; `0` lets the OS choose one.
    pub port: u16,
    /// Bytes preceding the protocol tag of every request frame. The first
    /// one is read as the marker, the rest are skipped.
    pub header_len: usize,
    /// How long the acceptor sleeps when no client is waiting.
    pub accept_poll: Duration,
    /// How long the processing thread sleeps after a sweep that handled nothing.
    pub idle_backoff: Duration,
}

impl Config {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            header_len: DEFAULT_HEADER_LEN,
            accept_poll: Duration::from_millis(5),
            idle_backoff: Duration::from_millis(1),
        }
    }
}
