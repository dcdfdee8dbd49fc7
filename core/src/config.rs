//! Client Configuration
//!
//! Timeouts, hosts and connection flags consumed by the connection core.

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

use crate::error::RealtimeError;

/// Primary realtime endpoint
pub const DEFAULT_REALTIME_HOST: &str = "realtime.pubsub.io";

/// Standby endpoints tried when the primary host is unreachable
pub const DEFAULT_FALLBACK_HOSTS: [&str; 5] = [
    "a.pubsub-realtime.com",
    "b.pubsub-realtime.com",
    "c.pubsub-realtime.com",
    "d.pubsub-realtime.com",
    "e.pubsub-realtime.com",
];

/// Options for a realtime connection.
///
/// Durations are expressed in milliseconds when loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientOptions {
    pub realtime_host: String,
    /// Explicit fallback list. `None` uses the defaults when the primary host
    /// is the default host, or no fallbacks otherwise.
    pub fallback_hosts: Option<Vec<String>>,
    pub fallback_hosts_use_default: bool,
    pub auto_connect: bool,
    pub client_id: Option<String>,
    pub echo_messages: bool,
    pub queue_messages: bool,
    /// Recovery key from a previous connection (`key:serial:msgSerial`)
    pub recover: Option<String>,

    #[serde(with = "duration_ms")]
    pub disconnected_retry_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub suspended_retry_timeout: Duration,
    /// Elapsed time after which connect attempts give up and suspend
    #[serde(with = "duration_ms")]
    pub connection_state_ttl: Duration,
    /// Used for connect, close and ping timeouts
    #[serde(with = "duration_ms")]
    pub realtime_request_timeout: Duration,
    /// How long a fallback host stays preferred after it worked
    #[serde(with = "duration_ms")]
    pub fallback_retry_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            realtime_host: DEFAULT_REALTIME_HOST.to_string(),
            fallback_hosts: None,
            fallback_hosts_use_default: false,
            auto_connect: false,
            client_id: None,
            echo_messages: true,
            queue_messages: true,
            recover: None,
            disconnected_retry_timeout: Duration::from_secs(15),
            suspended_retry_timeout: Duration::from_secs(30),
            connection_state_ttl: Duration::from_secs(120),
            realtime_request_timeout: Duration::from_secs(10),
            fallback_retry_timeout: Duration::from_secs(600),
        }
    }
}

impl ClientOptions {
    /// Load options from a JSON document, filling omitted fields with defaults
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let options: ClientOptions =
            serde_json::from_str(json).context("failed to parse client options")?;
        options.validate().context("client options failed validation")?;
        Ok(options)
    }

    pub fn with_realtime_host(mut self, host: impl Into<String>) -> Self {
        self.realtime_host = host.into();
        self
    }

    pub fn with_fallback_hosts(mut self, hosts: Vec<String>) -> Self {
        self.fallback_hosts = Some(hosts);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_recover(mut self, recovery_key: impl Into<String>) -> Self {
        self.recover = Some(recovery_key.into());
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_disconnected_retry_timeout(mut self, timeout: Duration) -> Self {
        self.disconnected_retry_timeout = timeout;
        self
    }

    pub fn with_suspended_retry_timeout(mut self, timeout: Duration) -> Self {
        self.suspended_retry_timeout = timeout;
        self
    }

    pub fn with_connection_state_ttl(mut self, ttl: Duration) -> Self {
        self.connection_state_ttl = ttl;
        self
    }

    pub fn with_realtime_request_timeout(mut self, timeout: Duration) -> Self {
        self.realtime_request_timeout = timeout;
        self
    }

    pub fn with_fallback_retry_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_retry_timeout = timeout;
        self
    }

    /// Resolve the fallback host list for the configured primary host
    pub fn resolved_fallback_hosts(&self) -> Vec<String> {
        match &self.fallback_hosts {
            Some(hosts) => hosts.clone(),
            None if self.fallback_hosts_use_default
                || self.realtime_host == DEFAULT_REALTIME_HOST =>
            {
                DEFAULT_FALLBACK_HOSTS.iter().map(|h| h.to_string()).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), RealtimeError> {
        if self.realtime_host.trim().is_empty() {
            return Err(RealtimeError::Config("realtime host is empty".into()));
        }
        if let Some(hosts) = &self.fallback_hosts {
            if hosts.iter().any(|h| h.trim().is_empty()) {
                return Err(RealtimeError::Config("fallback host is empty".into()));
            }
        }
        let timeouts = [
            ("disconnectedRetryTimeout", self.disconnected_retry_timeout),
            ("suspendedRetryTimeout", self.suspended_retry_timeout),
            ("connectionStateTtl", self.connection_state_ttl),
            ("realtimeRequestTimeout", self.realtime_request_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(RealtimeError::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

mod duration_ms {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ClientOptions::default();
        assert_eq!(options.disconnected_retry_timeout, Duration::from_secs(15));
        assert_eq!(options.connection_state_ttl, Duration::from_secs(120));
        assert!(options.validate().is_ok());
        assert_eq!(options.resolved_fallback_hosts().len(), 5);
    }

    #[test]
    fn test_custom_host_has_no_default_fallbacks() {
        let options = ClientOptions::default().with_realtime_host("rt.internal");
        assert!(options.resolved_fallback_hosts().is_empty());

        let options = options.with_fallback_hosts(vec!["alt.internal".into()]);
        assert_eq!(options.resolved_fallback_hosts(), vec!["alt.internal"]);
    }

    #[test]
    fn test_from_json() {
        let options = ClientOptions::from_json(
            r#"{"realtimeHost":"rt.test","disconnectedRetryTimeout":2500,"clientId":"abc"}"#,
        )
        .unwrap();
        assert_eq!(options.realtime_host, "rt.test");
        assert_eq!(options.disconnected_retry_timeout, Duration::from_millis(2500));
        assert_eq!(options.client_id.as_deref(), Some("abc"));
        assert_eq!(options.suspended_retry_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_json_options() {
        assert!(ClientOptions::from_json(r#"{"realtimeRequestTimeout":0}"#).is_err());
        assert!(ClientOptions::from_json(r#"{"realtimeHost":" "}"#).is_err());
        assert!(ClientOptions::from_json("not json").is_err());
    }
}
