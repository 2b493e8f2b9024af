//! Client configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::{Will, MAX_PACKET_SIZE};
use crate::qos::RetryPolicy;
use crate::topic::validate_topic;
use crate::types::{Handler, QoS};

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Client ID.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Keep alive interval in seconds. 0 disables keep-alive.
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// Last will published by the broker if the connection is lost.
    pub will: Option<Will>,
    /// How long to wait for CONNACK.
    pub connect_timeout: Duration,
    /// How long to wait for PINGRESP. Defaults to half the keep-alive interval.
    pub ping_timeout: Option<Duration>,
    /// How long to wait for SUBACK / UNSUBACK.
    pub ack_timeout: Duration,
    /// Retransmission schedule for QoS 1/2 publishes.
    pub retry: RetryPolicy,
    /// Maximum packet size in either direction.
    pub max_packet_size: usize,
    /// Receives publishes that no subscription handler claims.
    pub default_handler: Option<Arc<dyn Handler>>,
}

impl ClientConfig {
    /// Create a new client config.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            will: None,
            connect_timeout: Duration::from_secs(10),
            ping_timeout: None,
            ack_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            max_packet_size: MAX_PACKET_SIZE,
            default_handler: None,
        }
    }

    /// Set credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set the last will.
    pub fn with_will(
        mut self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        self.will = Some(Will {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        });
        self
    }

    /// Set the CONNACK timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the PINGRESP timeout.
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = Some(timeout);
        self
    }

    /// Set the SUBACK / UNSUBACK timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the retransmission schedule.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set maximum packet size.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the handler for publishes no subscription handler claims.
    ///
    /// Subscriptions made with [`Client::subscribe_default`] rely on it.
    ///
    /// [`Client::subscribe_default`]: crate::Client::subscribe_default
    pub fn with_default_handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.default_handler = Some(Arc::new(handler));
        self
    }

    /// Keep-alive interval as a duration, `None` when disabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        match self.keep_alive {
            0 => None,
            secs => Some(Duration::from_secs(secs as u64)),
        }
    }

    /// Effective PINGRESP timeout.
    pub fn effective_ping_timeout(&self) -> Duration {
        self.ping_timeout.unwrap_or_else(|| {
            Duration::from_millis(self.keep_alive as u64 * 1000 / 2)
        })
    }

    /// Check the configuration for values the session cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() && !self.clean_session {
            return Err(Error::InvalidConfig(
                "empty client id requires a clean session".to_string(),
            ));
        }
        if self.client_id.len() > u16::MAX as usize {
            return Err(Error::InvalidConfig("client id too long".to_string()));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::InvalidConfig("password without username".to_string()));
        }
        if let Some(interval) = self.keep_alive_interval() {
            let ping_timeout = self.effective_ping_timeout();
            if ping_timeout.is_zero() || ping_timeout >= interval {
                return Err(Error::InvalidConfig(format!(
                    "ping timeout {:?} must be positive and shorter than keep alive {:?}",
                    ping_timeout, interval
                )));
            }
        }
        if self.connect_timeout.is_zero() || self.ack_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be positive".to_string()));
        }
        if self.retry.initial.is_zero() || self.retry.max < self.retry.initial {
            return Err(Error::InvalidConfig(
                "retry policy needs 0 < initial <= max".to_string(),
            ));
        }
        if let Some(ref will) = self.will {
            validate_topic(&will.topic)?;
        }
        // Fixed header (2) + CONNACK body (2) is the smallest useful exchange.
        if self.max_packet_size < 4 {
            return Err(Error::InvalidConfig("max packet size too small".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("will", &self.will)
            .field("connect_timeout", &self.connect_timeout)
            .field("ping_timeout", &self.ping_timeout)
            .field("ack_timeout", &self.ack_timeout)
            .field("retry", &self.retry)
            .field("max_packet_size", &self.max_packet_size)
            .field("default_handler", &self.default_handler.is_some())
            .finish()
    }
}
