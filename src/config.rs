//! Link cable configuration supplied by the frontend at power-on.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LinkConfig {
    /// Peer address as an IPv4 literal, `x.y.z.w:port`. When absent the
    /// serial device stays permanently disconnected: SB reads 0xFF and no
    /// transfer ever completes.
    pub peer_address: Option<String>,

    /// Accept the peer connection (master side) instead of dialing out
    /// (slave side). Independent of which side drives the transfer clock.
    pub bind_as_server: bool,

    /// Whether the caller raises the serial interrupt on completed
    /// transfers. The core only stores this; interpreting it is the CPU
    /// loop's business.
    pub interrupt_based: bool,

    /// Upper bound, in milliseconds, on how long a tick may wait for peer
    /// data. `None` keeps the protocol's native behavior of blocking
    /// indefinitely; with a bound set, an expired wait tears the link down
    /// instead of stalling the emulated machine forever.
    pub transfer_timeout_ms: Option<u64>,
}

impl LinkConfig {
    pub fn transfer_timeout(&self) -> Option<Duration> {
        self.transfer_timeout_ms.map(Duration::from_millis)
    }
}
