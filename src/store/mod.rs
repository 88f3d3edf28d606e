//! Entity and cluster storage interfaces.
//!
//! Per spec §1/§6, entity ingestion and the backing stores are external
//! collaborators specified only at their interface. Readers do not lock;
//! writers replace the whole backing collection under a
//! `parking_lot::RwLock` (spec §5) rather than pulling in a new atomic-swap
//! dependency the reference stack doesn't carry (see SPEC_FULL §5).

pub mod cluster_store;
pub mod entity_store;

pub use cluster_store::{ClusterStore, InMemoryClusterStore};
pub use entity_store::{EntityStore, InMemoryEntityStore};
