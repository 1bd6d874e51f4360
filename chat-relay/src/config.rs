use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::codec::DEFAULT_MAX_FRAME_LEN;

pub const DEFAULT_PORT: u16 = 5555;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime settings for a relay server.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: IpAddr,
    /// Use 0 for an ephemeral port.
    pub port: u16,
    /// Largest inbound payload accepted before the connection is dropped.
    /// Chat that would not fit in a relayed frame of this size with the
    /// sender's `"<name>: "` label is dropped, so clients reading with the same
    /// limit always see every relayed frame.
    pub max_frame_len: usize,
    /// Upper bound on a single write to one recipient during a broadcast.
    pub send_timeout: Duration,
}

impl RelayConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}
