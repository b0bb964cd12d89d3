//! Artifact storage for LoRA Flow
//!
//! This crate provides the keyed artifact cache: the [`ArtifactStore`]
//! abstraction, its filesystem, in-memory and object-store backends,
//! artifact tree copying and digests, and scoped staging directories.

pub mod filesystem;
pub mod memory;
#[cfg(feature = "s3")]
pub mod object;
pub mod resolver;
pub mod staging;
pub mod store;
pub mod tree;

// Re-export commonly used types
pub use filesystem::FilesystemArtifactStore;
pub use memory::{InMemoryArtifactStore, MemoryNamespace};
#[cfg(feature = "s3")]
pub use object::ObjectStoreArtifactStore;
pub use resolver::StoreResolver;
pub use staging::StagingDir;
pub use store::ArtifactStore;
pub use tree::ArtifactSummary;
