//! Depot - local artifact cache and remote-catalog synchronization
//!
//! Depot stores, indexes, and searches versioned, reusable content packages
//! ("artifacts": components and measures) on disk, and reconciles that local
//! store against a remote registry over HTTP.
//!
//! # Architecture
//!
//! ```text
//! Remote registry (HTTP)
//!     │
//!     ├── /api/metasearch   ← counts, facets, taxonomy
//!     ├── /api/search       ← paged result records
//!     └── /api/download     ← artifact archives (tar.gz)
//!            │
//!            ▼
//!     RegistryClient ──► download pipeline ──► CatalogStore
//!                                                  │
//!                                    {libraryRoot}/{uid}/{versionId}/…
//!                                    {libraryRoot}/catalog.db
//! ```
//!
//! `SyncCoordinator` ties the two halves together: local hits are served from
//! the [`CatalogStore`]; misses are fetched through the [`RegistryClient`],
//! whose download pipeline registers the result back into the store.

pub mod artifact;
pub mod error;
pub mod registry;
pub mod store;
pub mod sync;

pub use artifact::{Artifact, ArtifactKind, ArtifactManifest, AttributeRecord, AttributeType, FileRecord};
pub use error::{DepotError, NetworkErrorKind, Result};
pub use registry::{Facet, FacetItem, MetaSearchResult, RegistryClient, RegistryConfig, SearchResult};
pub use store::CatalogStore;
pub use sync::SyncCoordinator;
