//! Implementations of the [`Network`](crate::Network) contract.

mod overlay;
pub use overlay::{NodeKind, Overlay, OverlayNode};

#[cfg(test)]
pub(crate) mod scripted;
