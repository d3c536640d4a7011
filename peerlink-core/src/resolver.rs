//! Relay-assisted discovery of a dialable address for the local peer.
//!
//! After a relay accepts a reservation it publishes a circuit address for us,
//! but nothing signals when that happens. The resolver therefore dials the
//! relay once and then polls the local address list a bounded number of
//! times, sleeping between polls.

use crate::{
    address, logging,
    network::{DialError, SharedNetwork},
    Shutdown,
};
use multiaddr::Multiaddr;
use std::time::Duration;
use thiserror::Error as ThisError;

/// What callers display in place of an address when discovery fails.
pub const NO_ADDRESS_SENTINEL: &str = "No address found";

/// Bounds on how long discovery keeps polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Total number of polls of the address list. Zero is treated as one.
    pub max_attempts: u32,
    /// Pause between two polls.
    pub attempt_delay: Duration,
}

impl ResolverConfig {
    pub const DEFAULT_ATTEMPTS: u32 = 10;
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(10);

    /// The longest discovery can spend waiting between polls.
    pub fn max_wait(&self) -> Duration {
        self.attempt_delay * self.max_attempts.max(1).saturating_sub(1)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_ATTEMPTS,
            attempt_delay: Self::DEFAULT_DELAY,
        }
    }
}

/// Finds a relay-circuit address for the local peer of a network handle.
pub struct AddressResolver {
    network: SharedNetwork,
    shutdown: Shutdown,
}

impl AddressResolver {
    /// Creates a resolver that gives up early once `shutdown` fires.
    pub fn new(network: SharedNetwork, shutdown: Shutdown) -> Self {
        Self { network, shutdown }
    }

    /// Resolves an address using the bounds in `config`.
    pub async fn resolve(
        &self,
        relay: &Multiaddr,
        config: ResolverConfig,
    ) -> Result<Multiaddr, ResolveError> {
        self.resolve_dialable_address(relay, config.max_attempts, config.attempt_delay)
            .await
    }

    /// Dials `relay` and polls the local addresses until one of them is
    /// dialable through a relay circuit.
    ///
    /// The relay is dialed exactly once. The address list is polled at most
    /// `max_attempts` times with `attempt_delay` between polls, so the total
    /// wait never exceeds `(max_attempts - 1) * attempt_delay` plus the dial.
    pub async fn resolve_dialable_address(
        &self,
        relay: &Multiaddr,
        max_attempts: u32,
        attempt_delay: Duration,
    ) -> Result<Multiaddr, ResolveError> {
        let local = self.network.peer_id();
        tracing::debug!("{} dialling relay {}", local, relay);
        self.network
            .dial(relay)
            .await
            .map_err(ResolveError::RelayUnreachable)?;
        tracing::debug!("{} dialled relay, finding address", local);

        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(address) = self.find_dialable() {
                tracing::info!("{} found address {} on attempt {}", local, address, attempt);
                logging::address_event(local, &address);
                return Ok(address);
            }
            tracing::trace!("No dialable address on attempt {}/{}", attempt, attempts);
            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(attempt_delay) => {}
                    _ = self.shutdown.wait_for_shutdown() => return Err(ResolveError::Cancelled),
                }
            }
        }

        tracing::warn!("{} found no dialable address after {} attempts", local, attempts);
        Err(ResolveError::NoDialableAddressFound { attempts })
    }

    /// The last relay-circuit address the network currently lists.
    fn find_dialable(&self) -> Option<Multiaddr> {
        self.network
            .listen_addrs()
            .into_iter()
            .filter(address::is_circuit_dialable)
            .last()
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("The relay could not be reached: {0}")]
    RelayUnreachable(#[source] DialError),
    #[error("No dialable address appeared after {attempts} attempts")]
    NoDialableAddressFound { attempts: u32 },
    #[error("Address discovery was interrupted by a session shutdown")]
    Cancelled,
}
