//! Traffic counters for the tunnel client.
//!
//! The control loop is single-threaded, so these are plain integers owned by
//! the lifecycle. A one-line summary is logged whenever the link is rebuilt.

use std::fmt;
use std::time::Instant;

/// Counters for one client run.
#[derive(Debug)]
pub struct Stats {
    /// Datagrams sent to the peer (data and keepalive)
    pub tx_datagrams: u64,
    /// Bytes sent to the peer, as seen on the wire
    pub tx_bytes: u64,
    /// Datagrams received from the peer and accepted
    pub rx_datagrams: u64,
    /// Bytes received from the peer, as seen on the wire
    pub rx_bytes: u64,
    /// Received datagrams dropped by the codec
    pub rx_rejected: u64,
    /// Tunnel frames that could not be forwarded
    pub tx_dropped: u64,
    /// Keepalives successfully sent
    pub keepalives_sent: u64,
    /// Completed reconnections
    pub reconnections: u64,
    /// Client start time (for uptime calculation)
    pub start_time: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            tx_datagrams: 0,
            tx_bytes: 0,
            rx_datagrams: 0,
            rx_bytes: 0,
            rx_rejected: 0,
            tx_dropped: 0,
            keepalives_sent: 0,
            reconnections: 0,
            start_time: Instant::now(),
        }
    }

    pub fn record_tx(&mut self, bytes: usize) {
        self.tx_datagrams += 1;
        self.tx_bytes += bytes as u64;
    }

    pub fn record_rx(&mut self, bytes: usize) {
        self.rx_datagrams += 1;
        self.rx_bytes += bytes as u64;
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tx {} pkts/{} bytes, rx {} pkts/{} bytes, rejected {}, dropped {}, keepalives {}, reconnects {}, up {}s",
            self.tx_datagrams,
            self.tx_bytes,
            self.rx_datagrams,
            self.rx_bytes,
            self.rx_rejected,
            self.tx_dropped,
            self.keepalives_sent,
            self.reconnections,
            self.start_time.elapsed().as_secs(),
        )
    }
}
