//! Connection pool plumbing around the hyper client.
//!
//! hyper's legacy client owns the idle pool itself; this module supplies the
//! pieces it does not have:
//!
//! - [`TransportConnector`] caps open connections with a semaphore, evicts an
//!   idle connection when the cap is reached, dials through the forward proxy
//!   (CONNECT tunnel for https) and hands out [`PooledIo`] streams that peek
//!   for staleness after idling
//! - [`ConnectionSlot`] tracks whether a connection is in use and closes it
//!   on eviction or once its time-to-live has passed
//! - [`LeaseLayer`] counts connections bound to an exchange and bounds every
//!   body read by the request timeout
//! - [`PoolStats`] exposes both counters

mod connector;
mod io;
mod lease;
mod slot;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub use connector::TransportConnector;
pub use io::{ConnectionInfo, PooledIo};
pub use lease::{LeaseGuard, LeaseLayer, LeaseService, LeasedBody};
pub use slot::ConnectionSlot;
use slot::SlotRegistry;

use crate::config::SessionConfig;
use crate::error::ConfigError;

/// Immutable pool sizing and hygiene settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Total and per-route cap on open connections
    pub max_connections: usize,
    /// `None` means unbounded lifetime
    pub time_to_live: Option<Duration>,
    pub idle_timeout: Duration,
    pub stale_checking: bool,
    pub stale_timeout: Duration,
    /// `None` leaves connecting unbounded
    pub connect_timeout: Option<Duration>,
}

impl PoolSettings {
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidMaxConnections`] when `max_connections < 1`.
    pub fn from_config(config: &SessionConfig) -> Result<Self, ConfigError> {
        let max_connections = usize::try_from(config.max_connections)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or(ConfigError::InvalidMaxConnections(config.max_connections))?;

        let time_to_live = u64::try_from(config.connection_time_to_live_secs)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            max_connections,
            time_to_live,
            idle_timeout: Duration::from_secs(config.connection_idle_timeout_secs),
            stale_checking: config.stale_checking,
            stale_timeout: Duration::from_millis(config.stale_timeout_ms),
            connect_timeout: config.timeout(),
        })
    }
}

#[derive(Debug, Default)]
struct Counters {
    leased: AtomicUsize,
    open: AtomicUsize,
}

/// Live pool counters, shared by every clone of a session.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    counters: Arc<Counters>,
}

impl PoolStats {
    /// Connections currently bound to an exchange (dispatch until the
    /// response stream is released).
    #[must_use]
    pub fn leased(&self) -> usize {
        self.counters.leased.load(Ordering::Acquire)
    }

    /// Connections currently open, idle or leased.
    #[must_use]
    pub fn open(&self) -> usize {
        self.counters.open.load(Ordering::Acquire)
    }

    pub(crate) fn lease(&self) -> LeaseGuard {
        self.counters.leased.fetch_add(1, Ordering::AcqRel);
        LeaseGuard::new(self.clone())
    }

    pub(crate) fn release_lease(&self) {
        self.counters.leased.fetch_sub(1, Ordering::AcqRel);
    }

    fn opened(&self) -> OpenGuard {
        self.counters.open.fetch_add(1, Ordering::AcqRel);
        OpenGuard(self.clone())
    }
}

/// Decrements the open counter when the connection is dropped.
#[derive(Debug)]
struct OpenGuard(PoolStats);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.counters.open.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_max_connections() {
        for n in [0, -1] {
            let config = SessionConfig {
                max_connections: n,
                ..Default::default()
            };
            assert!(matches!(
                PoolSettings::from_config(&config),
                Err(ConfigError::InvalidMaxConnections(v)) if v == n
            ));
        }
    }

    #[test]
    fn non_positive_ttl_is_unbounded() {
        let config = SessionConfig {
            connection_time_to_live_secs: 0,
            ..Default::default()
        };
        assert!(PoolSettings::from_config(&config).unwrap().time_to_live.is_none());

        let config = SessionConfig {
            connection_time_to_live_secs: -5,
            ..Default::default()
        };
        assert!(PoolSettings::from_config(&config).unwrap().time_to_live.is_none());
    }

    #[test]
    fn maps_defaults() {
        let s = PoolSettings::from_config(&SessionConfig::default()).unwrap();
        assert_eq!(s.max_connections, 10);
        assert_eq!(s.time_to_live, Some(Duration::from_secs(900)));
        assert_eq!(s.idle_timeout, Duration::from_secs(10));
        assert_eq!(s.stale_timeout, Duration::from_secs(5));
        assert!(s.stale_checking);
    }

    #[test]
    fn lease_guard_releases_once() {
        let stats = PoolStats::default();
        let mut guard = stats.lease();
        assert_eq!(stats.leased(), 1);
        guard.release();
        guard.release();
        assert_eq!(stats.leased(), 0);
        drop(guard);
        assert_eq!(stats.leased(), 0);
    }

    #[test]
    fn open_guard_tracks_connections() {
        let stats = PoolStats::default();
        let a = stats.opened();
        let b = stats.opened();
        assert_eq!(stats.open(), 2);
        drop(a);
        drop(b);
        assert_eq!(stats.open(), 0);
    }
}
