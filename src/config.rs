//! Broker configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BrokerError, Result};
use crate::source::ChannelKey;

/// Broker configuration options
///
/// Every timing rule the broker applies (reaper thresholds, exit-teardown
/// waits, startup probe) is a field here so deployments can tune them and
/// tests can inject short values.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Path to the transcoder binary (ffmpeg-compatible command surface)
    pub transcoder_bin: PathBuf,

    /// Host advertised to clients in channel endpoint hints
    pub advertised_host: String,

    /// Port advertised to clients in channel endpoint hints
    pub advertised_port: u16,

    /// Path prefix advertised to clients in channel endpoint hints
    pub base_path: String,

    /// Inclusive start of the loopback port range leased to transcoders
    pub port_range_start: u16,

    /// Exclusive end of the loopback port range
    pub port_range_end: u16,

    /// Read buffer size for the producer socket; each non-empty read is one
    /// broadcast payload
    pub read_buffer_size: usize,

    /// Delay before probing whether a freshly launched transcoder survived
    pub probe_delay: Duration,

    /// Reaper tick interval
    pub reaper_interval: Duration,

    /// Channels younger than this are never reaped
    pub creation_grace: Duration,

    /// Idle time after which a channel with no subscribers is reaped even if
    /// its process already died
    pub long_idle_timeout: Duration,

    /// Idle time after which a channel with a live process but no subscribers
    /// is reaped
    pub short_idle_timeout: Duration,

    /// Wait after process exit before teardown, letting buffered bytes flush
    /// to still-attached subscribers
    pub exit_flush_wait: Duration,

    /// Maximum wait for subscribers to drain after process exit
    pub exit_drain_wait: Duration,

    /// Poll interval while waiting for the subscriber count to reach zero
    pub drain_poll_interval: Duration,

    /// Maximum wait per pipeline during `shutdown_all`
    pub pipeline_shutdown_wait: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            transcoder_bin: PathBuf::from("ffmpeg"),
            advertised_host: "127.0.0.1".to_string(),
            advertised_port: 8080,
            base_path: "/stream".to_string(),
            port_range_start: 10000,
            port_range_end: 50000,
            read_buffer_size: 8 * 1024,
            probe_delay: Duration::from_millis(100),
            reaper_interval: Duration::from_secs(60),
            creation_grace: Duration::from_secs(30),
            long_idle_timeout: Duration::from_secs(300),
            short_idle_timeout: Duration::from_secs(10),
            exit_flush_wait: Duration::from_secs(3),
            exit_drain_wait: Duration::from_secs(30),
            drain_poll_interval: Duration::from_secs(1),
            pipeline_shutdown_wait: Duration::from_secs(5),
        }
    }
}

impl BrokerConfig {
    /// Create a config with the given transcoder binary path
    pub fn with_transcoder(bin: impl Into<PathBuf>) -> Self {
        Self {
            transcoder_bin: bin.into(),
            ..Default::default()
        }
    }

    /// Set the transcoder binary path
    pub fn transcoder_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.transcoder_bin = bin.into();
        self
    }

    /// Set the host/port/path advertised in endpoint hints
    pub fn advertise(mut self, host: impl Into<String>, port: u16, base_path: impl Into<String>) -> Self {
        self.advertised_host = host.into();
        self.advertised_port = port;
        self.base_path = base_path.into();
        self
    }

    /// Set the loopback port range leased to transcoders
    pub fn port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range_start = start;
        self.port_range_end = end;
        self
    }

    /// Set the reaper tick interval
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Set the creation grace period
    pub fn creation_grace(mut self, grace: Duration) -> Self {
        self.creation_grace = grace;
        self
    }

    /// Set the idle timeouts (long: dead process, short: live process)
    pub fn idle_timeouts(mut self, long: Duration, short: Duration) -> Self {
        self.long_idle_timeout = long;
        self.short_idle_timeout = short;
        self
    }

    /// Set the exit-teardown waits (flush, drain)
    pub fn exit_waits(mut self, flush: Duration, drain: Duration) -> Self {
        self.exit_flush_wait = flush;
        self.exit_drain_wait = drain;
        self
    }

    /// The URL clients use to reach a channel through the subscriber layer
    pub fn endpoint_hint(&self, key: &ChannelKey) -> String {
        format!(
            "ws://{}:{}{}/{}",
            self.advertised_host, self.advertised_port, self.base_path, key
        )
    }

    /// Check the configuration for values the broker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.transcoder_bin.as_os_str().is_empty() {
            return Err(BrokerError::InvalidConfiguration {
                reason: "transcoder binary path is empty".to_string(),
            });
        }

        if self.port_range_start >= self.port_range_end {
            return Err(BrokerError::InvalidConfiguration {
                reason: format!(
                    "port range {}..{} is empty",
                    self.port_range_start, self.port_range_end
                ),
            });
        }

        if !self.base_path.starts_with('/') {
            return Err(BrokerError::InvalidConfiguration {
                reason: format!("base path {:?} must start with '/'", self.base_path),
            });
        }

        if self.read_buffer_size == 0 {
            return Err(BrokerError::InvalidConfiguration {
                reason: "read buffer size is zero".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();

        assert_eq!(config.port_range_start, 10000);
        assert_eq!(config.port_range_end, 50000);
        assert_eq!(config.read_buffer_size, 8192);
        assert_eq!(config.reaper_interval, Duration::from_secs(60));
        assert_eq!(config.creation_grace, Duration::from_secs(30));
        assert_eq!(config.short_idle_timeout, Duration::from_secs(10));
        assert_eq!(config.long_idle_timeout, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_transcoder() {
        let config = BrokerConfig::with_transcoder("/usr/local/bin/ffmpeg");

        assert_eq!(
            config.transcoder_bin,
            PathBuf::from("/usr/local/bin/ffmpeg")
        );
    }

    #[test]
    fn test_builder_chaining() {
        let config = BrokerConfig::default()
            .advertise("relay.example", 9090, "/live")
            .port_range(20000, 21000)
            .reaper_interval(Duration::from_secs(5))
            .creation_grace(Duration::ZERO)
            .idle_timeouts(Duration::from_secs(60), Duration::from_secs(2));

        assert_eq!(config.advertised_host, "relay.example");
        assert_eq!(config.advertised_port, 9090);
        assert_eq!(config.base_path, "/live");
        assert_eq!(config.port_range_start, 20000);
        assert_eq!(config.port_range_end, 21000);
        assert_eq!(config.creation_grace, Duration::ZERO);
        assert_eq!(config.short_idle_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_validate_empty_binary() {
        let config = BrokerConfig::default().transcoder_bin("");

        assert!(matches!(
            config.validate(),
            Err(BrokerError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_validate_inverted_port_range() {
        let config = BrokerConfig::default().port_range(30000, 20000);

        assert!(matches!(
            config.validate(),
            Err(BrokerError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_validate_base_path() {
        let config = BrokerConfig::default().advertise("127.0.0.1", 8080, "stream");

        assert!(matches!(
            config.validate(),
            Err(BrokerError::InvalidConfiguration { .. })
        ));
    }
}
