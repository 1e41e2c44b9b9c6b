use std::time::Duration;

use crate::{error::Error, limit::Limit};

/// Configuration of the [`Relay`](crate::Relay) service.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Capacity of the reservation store.
    pub max_reservations: usize,
    /// Lifetime of a reservation; also used as the peer-tag TTL.
    pub reservation_ttl: Duration,
    /// Byte cap advertised and enforced per relayed connection.
    pub default_data_limit: u64,
    /// Wall-clock cap advertised and enforced per relayed connection.
    pub default_duration_limit: Duration,
    /// Budget for each HOP request/reply and STOP exchange.
    pub handshake_timeout: Duration,
    /// When `false`, circuits are advertised and driven unbounded.
    pub apply_connection_limits: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            max_reservations: 15,
            reservation_ttl: Duration::from_secs(2 * 60 * 60),
            default_data_limit: 1 << 17, // 128 kibibyte
            default_duration_limit: Duration::from_secs(2 * 60),
            handshake_timeout: Duration::from_secs(30),
            apply_connection_limits: true,
        }
    }
}

impl RelayConfig {
    /// Rejects configurations the engine cannot run with. Called once at
    /// service construction; the service refuses to start on `Err`.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.max_reservations == 0 {
            return Err(Error::Config("max_reservations must be greater than 0"));
        }
        if self.reservation_ttl.is_zero() {
            return Err(Error::Config("reservation_ttl must be greater than 0"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::Config("handshake_timeout must be greater than 0"));
        }
        if self.default_duration_limit.as_secs() > u64::from(u32::MAX) {
            return Err(Error::Config(
                "default_duration_limit does not fit the wire format (u32 seconds)",
            ));
        }
        Ok(())
    }

    /// The limit recorded for new reservations and offered on RESERVE.
    pub(crate) fn connection_limit(&self) -> Limit {
        if !self.apply_connection_limits {
            return Limit::UNLIMITED;
        }

        Limit {
            data: self.default_data_limit,
            duration: self.default_duration_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        RelayConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = RelayConfig {
            max_reservations: 0,
            ..Default::default()
        };
        config.validate().unwrap_err();
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let config = RelayConfig {
            reservation_ttl: Duration::ZERO,
            ..Default::default()
        };
        config.validate().unwrap_err();
    }

    #[test]
    fn zero_handshake_timeout_is_rejected() {
        let config = RelayConfig {
            handshake_timeout: Duration::ZERO,
            ..Default::default()
        };
        config.validate().unwrap_err();
    }

    #[test]
    fn oversized_duration_limit_is_rejected() {
        let config = RelayConfig {
            default_duration_limit: Duration::from_secs(u64::from(u32::MAX) + 1),
            ..Default::default()
        };
        config.validate().unwrap_err();
    }

    #[test]
    fn disabled_limits_advertise_unbounded() {
        let config = RelayConfig {
            apply_connection_limits: false,
            ..Default::default()
        };
        assert!(config.connection_limit().is_unlimited());
    }
}
