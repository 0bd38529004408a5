//! Typed per-transport configuration records.
//!
//! Configuration is passed at construction time, not discovered
//! dynamically; every record carries the shared reconnect policy plus
//! transport-specific extras (quality-of-service level, queue name,
//! prefetch count).

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default maximum frame size for the socket transport (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Configuration for the TCP socket client.
#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Reconnect policy applied on unexpected disconnect.
    pub retry: RetryPolicy,
    /// Optional per-call timeout; `None` means a call without a terminal
    /// packet waits forever.
    pub request_timeout: Option<Duration>,
    /// Maximum accepted frame size.
    pub max_frame_size: usize,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            retry: RetryPolicy::default(),
            request_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl TcpClientConfig {
    /// Create a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the remote address.
    #[must_use]
    pub fn address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

/// Configuration for the TCP socket server.
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port; `0` picks an ephemeral port.
    pub port: u16,
    /// Maximum accepted frame size.
    pub max_frame_size: usize,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl TcpServerConfig {
    /// Create a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    #[must_use]
    pub fn address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

/// Configuration for pub/sub broker clients and servers.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker URL.
    pub url: String,
    /// Quality-of-service level passed to the driver.
    pub qos: u8,
    /// Reconnect policy applied on unexpected disconnect.
    pub retry: RetryPolicy,
    /// Optional per-call timeout (client side only).
    pub request_timeout: Option<Duration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "broker://localhost".to_string(),
            qos: 0,
            retry: RetryPolicy::default(),
            request_timeout: None,
        }
    }
}

impl BrokerConfig {
    /// Create a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the quality-of-service level.
    #[must_use]
    pub fn qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// Configuration for durable-queue clients and servers.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Broker URL.
    pub url: String,
    /// Name of the request queue.
    pub queue: String,
    /// Maximum unacknowledged deliveries in flight.
    pub prefetch: u16,
    /// Reconnect policy applied on unexpected disconnect.
    pub retry: RetryPolicy,
    /// Optional per-call timeout (client side only).
    pub request_timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: "queue://localhost".to_string(),
            queue: "stratus".to_string(),
            prefetch: 64,
            retry: RetryPolicy::default(),
            request_timeout: None,
        }
    }
}

impl QueueConfig {
    /// Create a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the request queue name.
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the prefetch window.
    #[must_use]
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// Configuration for the RPC-with-streaming client.
#[derive(Debug, Clone, Default)]
pub struct RpcClientConfig {
    /// Optional per-call timeout.
    pub request_timeout: Option<Duration>,
}

impl RpcClientConfig {
    /// Create a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-call timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let config = TcpClientConfig::new()
            .address("10.0.0.1", 9000)
            .retry(RetryPolicy::new().attempts(3))
            .request_timeout(Duration::from_secs(30));

        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_defaults() {
        let config = QueueConfig::new();
        assert_eq!(config.prefetch, 64);
        assert_eq!(config.retry.attempts, 0);
        assert!(config.request_timeout.is_none());
    }
}
