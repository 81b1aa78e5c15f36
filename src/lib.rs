// otsync - Commit-graph synchronization for operationally transformed documents

pub mod algorithms;
pub mod commit;
pub mod config;
pub mod manager;
pub mod node;
pub mod ot;
pub mod repository;
pub mod systems;

pub use algorithms::{CommonAncestor, FindResult, GraphError, OtAlgorithms};
pub use commit::{Commit, CommitError, CommitId};
pub use config::{ConfigError, RetryPolicy, SyncConfig};
pub use manager::{ManagerEvent, ManagerStatus, StateManager, SyncError};
pub use node::wire::{CborCodec, DiffCodec, JsonCodec, LoopbackTransport, Transport, WireNode};
pub use node::{NodeError, RepositoryNode, SyncNode};
pub use ot::{OtError, OtState, OtSystem, StateError, TransformResult};
pub use repository::{InMemoryRepository, OtRepository, RepositoryError};
