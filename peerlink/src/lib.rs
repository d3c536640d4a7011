//! The `peerlink` command line front end.
//!
//! [`demo`] scripts a full session between two peers and a relay on the
//! simulated overlay, and [`cli`] turns command line arguments into a run.

pub mod cli;
pub mod demo;
