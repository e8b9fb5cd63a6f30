//! Network Monitoring Implementation

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType},
};
use std::time::Duration;
use tracing::debug;

const PROBE_ADDR: &str = "1.1.1.1:443";

/// Desktop network monitor implementation
///
/// Desktop links are reported as unmetered. Connectivity is a TCP probe;
/// platform APIs (netlink, SystemConfiguration, NLM) would be more precise.
pub struct DesktopNetworkMonitor {
    poll_interval: Duration,
}

impl DesktopNetworkMonitor {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    async fn check_connectivity() -> NetworkStatus {
        match tokio::time::timeout(
            Duration::from_secs(3),
            tokio::net::TcpStream::connect(PROBE_ADDR),
        )
        .await
        {
            Ok(Ok(_)) => NetworkStatus::Connected,
            Ok(Err(_)) | Err(_) => NetworkStatus::Disconnected,
        }
    }
}

impl Default for DesktopNetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkMonitor for DesktopNetworkMonitor {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        let status = Self::check_connectivity().await;
        debug!(status = ?status, "Network info updated");

        Ok(NetworkInfo {
            status,
            network_type: (status == NetworkStatus::Connected).then_some(NetworkType::Other),
            is_metered: false,
        })
    }

    async fn is_metered(&self) -> bool {
        false
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(PollingChangeStream {
            interval: self.poll_interval,
            last_status: None,
        }))
    }
}

/// Emits an update whenever the probed status changes.
struct PollingChangeStream {
    interval: Duration,
    last_status: Option<NetworkStatus>,
}

#[async_trait]
impl NetworkChangeStream for PollingChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        loop {
            tokio::time::sleep(self.interval).await;

            let status = DesktopNetworkMonitor::check_connectivity().await;
            if self.last_status != Some(status) {
                self.last_status = Some(status);
                return Some(NetworkInfo {
                    status,
                    network_type: (status == NetworkStatus::Connected)
                        .then_some(NetworkType::Other),
                    is_metered: false,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_desktop_is_never_metered() {
        let monitor = DesktopNetworkMonitor::new();
        assert!(!monitor.is_metered().await);
    }

    #[tokio::test]
    async fn test_get_network_info() {
        let monitor = DesktopNetworkMonitor::new();
        let info = monitor.get_network_info().await.unwrap();

        assert!(!info.is_metered);
        assert!(matches!(
            info.status,
            NetworkStatus::Connected | NetworkStatus::Disconnected
        ));
    }
}
