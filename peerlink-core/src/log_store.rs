//! The replicated append-only log that sessions share records through.
//!
//! A [`LogStore`] opens named [`Database`]s. Each database is an append-only
//! list of [`Record`]s that every connected peer running the same store
//! eventually holds too. [`MemoryLogStore`] keeps records in memory and
//! replicates them over the session's own network handle.

use async_trait::async_trait;
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use thiserror::Error as ThisError;
use tokio::sync::broadcast;

mod memory;
pub use memory::{MemoryDatabase, MemoryLogStore, LOG_PROTOCOL};

/// A shared handle to a [`Database`].
pub type SharedDatabase = Arc<dyn Database>;

/// Uniquely names a record: the peer that wrote it and its position among
/// that peer's writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub author: String,
    pub seq: u64,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.author, self.seq)
    }
}

/// One entry in a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub value: serde_json::Value,
}

/// A change to a database.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    /// A remote peer contributed to the database for the first time.
    Join(PeerId),
    /// A record was added, locally or by a remote peer.
    Update(Record),
}

/// Opens databases by name.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Opens the database called `name`, creating it if it does not exist.
    /// Opening the same name twice returns the same database.
    async fn open(&self, name: &str) -> Result<SharedDatabase, LogError>;
}

/// A named, replicated, append-only list of records.
#[async_trait]
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    /// Appends `value` and shares it with connected peers.
    async fn add(&self, value: serde_json::Value) -> Result<RecordId, LogError>;

    /// Every record, oldest first.
    fn all(&self) -> Vec<Record>;

    /// Subscribes to [`LogEvent`]s.
    fn events(&self) -> broadcast::Receiver<LogEvent>;
}

#[derive(Debug, ThisError)]
pub enum LogError {
    #[error("Failed to encode a record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to replicate a record: {0}")]
    Stream(#[from] crate::stream::StreamError),
    #[error("The log store needs a running session")]
    NotStarted,
    #[error("The log store was closed")]
    Closed,
}
