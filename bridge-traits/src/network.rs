//! Network Monitoring Abstraction
//!
//! Lets the prefetch scheduler hold back work on metered connections.

use async_trait::async_trait;

use crate::error::Result;

/// Network connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Cellular,
    WiFi,
    Ethernet,
    Other,
}

/// Network connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Connected,
    Disconnected,
    Indeterminate,
}

/// Network information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    pub network_type: Option<NetworkType>,
    /// Whether the connection is metered (has data limits/costs)
    pub is_metered: bool,
}

impl NetworkInfo {
    pub fn unmetered(network_type: NetworkType) -> Self {
        Self {
            status: NetworkStatus::Connected,
            network_type: Some(network_type),
            is_metered: false,
        }
    }

    pub fn metered(network_type: NetworkType) -> Self {
        Self {
            status: NetworkStatus::Connected,
            network_type: Some(network_type),
            is_metered: true,
        }
    }
}

/// Network monitor trait
///
/// # Platform Support
///
/// - **Desktop**: treated as unmetered
/// - **iOS**: `NWPathMonitor` (`isExpensive` / `isConstrained`)
/// - **Android**: `ConnectivityManager.isActiveNetworkMetered`
///
/// # Example
///
/// ```ignore
/// async fn may_prefetch(monitor: &dyn NetworkMonitor, allow_metered: bool) -> bool {
///     allow_metered || !monitor.is_metered().await
/// }
/// ```
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Get current network information
    async fn get_network_info(&self) -> Result<NetworkInfo>;

    async fn is_connected(&self) -> bool {
        matches!(
            self.get_network_info().await,
            Ok(NetworkInfo {
                status: NetworkStatus::Connected,
                ..
            })
        )
    }

    /// Check if connection is metered. Unknown state counts as unmetered.
    async fn is_metered(&self) -> bool {
        matches!(
            self.get_network_info().await,
            Ok(NetworkInfo {
                is_metered: true,
                ..
            })
        )
    }

    /// Subscribe to network status changes
    ///
    /// Implementations should emit an update whenever connectivity or the
    /// metered flag changes.
    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>>;
}

/// Stream of network status changes
#[async_trait]
pub trait NetworkChangeStream: Send {
    /// Returns `None` when the stream is closed.
    async fn next(&mut self) -> Option<NetworkInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedMonitor(NetworkInfo);

    #[async_trait]
    impl NetworkMonitor for FixedMonitor {
        async fn get_network_info(&self) -> Result<NetworkInfo> {
            Ok(self.0.clone())
        }

        async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
            Err(crate::BridgeError::NotAvailable("changes".into()))
        }
    }

    #[tokio::test]
    async fn test_default_predicates() {
        let cellular = FixedMonitor(NetworkInfo::metered(NetworkType::Cellular));
        assert!(cellular.is_connected().await);
        assert!(cellular.is_metered().await);

        let wifi = FixedMonitor(NetworkInfo::unmetered(NetworkType::WiFi));
        assert!(!wifi.is_metered().await);

        let offline = FixedMonitor(NetworkInfo {
            status: NetworkStatus::Disconnected,
            network_type: None,
            is_metered: false,
        });
        assert!(!offline.is_connected().await);
    }
}
