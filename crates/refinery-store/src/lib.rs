//! Refinery store seam
//!
//! One logical graph store reachable through a transactional session
//! abstraction. The coordinator opens one write session per batch, runs
//! each message's statements inside it, and commits or rolls back the whole
//! batch as a unit.
//!
//! Two backends: [`memory::MemoryGraph`] interprets mutation programs
//! directly against an in-process graph (reference semantics, tests, local
//! demo runs); [`neo4j::Neo4jStore`] renders programs to Cypher over bolt.

pub mod advisor;
pub mod error;
pub mod memory;
pub mod neo4j;

pub use advisor::{IndexAdvisor, IndexKey};
pub use error::StoreError;
pub use memory::MemoryGraph;
pub use neo4j::Neo4jStore;

use async_trait::async_trait;
use refinery_graph::MutationProgram;
use refinery_model::PropMap;

/// One statement against the store, run inside a write session.
#[derive(Debug, Clone)]
pub enum Statement {
    /// Match the node addressed by `labels` + `key` and return its
    /// properties (at minimum the ownership bookkeeping fields). Empty
    /// result set when no node matches.
    FetchNode { labels: Vec<String>, key: PropMap },
    /// Apply one compiled mutation program.
    Apply(MutationProgram),
}

/// A row of named values returned by [`WriteSession::run`].
pub type Record = PropMap;
pub type RecordSet = Vec<Record>;

/// Handle to one logical graph store.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Open a write transaction. At most one is in flight at a time under
    /// the batch coordinator.
    async fn begin_write(&self) -> Result<Box<dyn WriteSession>, StoreError>;

    /// Create a composite index on `label` over `properties`. Runs outside
    /// the batch transaction (stores treat schema and data work as separate
    /// transactions). "Already exists" surfaces as
    /// [`StoreError::AlreadyExists`].
    async fn create_index(&self, label: &str, properties: &[String]) -> Result<(), StoreError>;
}

/// One open write transaction.
#[async_trait]
pub trait WriteSession: Send {
    async fn run(&mut self, statement: Statement) -> Result<RecordSet, StoreError>;

    /// Commit every statement run so far, atomically.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard every statement run so far.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
