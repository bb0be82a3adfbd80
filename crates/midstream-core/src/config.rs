use std::time::Duration;

use crate::errors::ProxyCoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub disable_keep_alives: bool,
    pub dial_timeout: Duration,
    pub tunnel_dial_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub max_idle_connections: usize,
    pub idle_connection_timeout: Duration,
    pub max_head_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            disable_keep_alives: false,
            dial_timeout: Duration::from_secs(30),
            tunnel_dial_timeout: Duration::from_secs(5),
            tls_handshake_timeout: Duration::from_secs(10),
            max_idle_connections: 100,
            idle_connection_timeout: Duration::from_secs(90),
            max_head_bytes: 64 * 1024,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyCoreError> {
        if self.dial_timeout.is_zero() {
            return Err(ProxyCoreError::InvalidConfig(
                "dial_timeout must be greater than zero".to_string(),
            ));
        }
        if self.tunnel_dial_timeout.is_zero() {
            return Err(ProxyCoreError::InvalidConfig(
                "tunnel_dial_timeout must be greater than zero".to_string(),
            ));
        }
        if self.tls_handshake_timeout.is_zero() {
            return Err(ProxyCoreError::InvalidConfig(
                "tls_handshake_timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_head_bytes == 0 {
            return Err(ProxyCoreError::InvalidConfig(
                "max_head_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
