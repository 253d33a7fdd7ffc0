//! Readiness probing for the Tor proxy
//!
//! The node routes its traffic through Tor, so the node is only spawned once
//! Tor accepts connections on its control port.

use crate::process::TOR_CONTROL_PORT;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

/// Polls a TCP address until it accepts a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessProbe {
    /// Address that must accept a connection
    pub addr: SocketAddr,

    /// Give up after this long
    pub timeout: Duration,

    /// Delay between connection attempts
    pub interval: Duration,
}

impl ReadinessProbe {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            interval: Duration::from_millis(250),
        }
    }

    /// Probe for Tor's control port on localhost
    pub fn tor_control_port() -> Self {
        Self::new(
            SocketAddr::from((Ipv4Addr::LOCALHOST, TOR_CONTROL_PORT)),
            Duration::from_secs(30),
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait until `addr` accepts a connection.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn wait_until_ready(&self) -> bool {
        info!("Waiting for {} to accept connections...", self.addr);
        let start = Instant::now();

        let ready = timeout(self.timeout, async {
            let mut attempts = 0u32;
            loop {
                match TcpStream::connect(self.addr).await {
                    Ok(_) => return,
                    Err(e) => {
                        attempts += 1;
                        debug!("Connect attempt {} to {} failed: {}", attempts, self.addr, e);
                        sleep(self.interval).await;
                    }
                }
            }
        })
        .await
        .is_ok();

        if ready {
            info!("{} is accepting connections after {:?}", self.addr, start.elapsed());
        }
        ready
    }
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::tor_control_port()
    }
}
