//! Derivative lifecycle management for stored assets.
//!
//! An asset owns one primary file and any number of derivatives (thumbnails,
//! transcodes, extracted text), at most one per key. Derivatives are produced
//! by [`DerivativeDefinition`]s, uploaded to blob storage and committed under
//! an optimistic guard on the asset's version and primary-file fingerprint, so
//! that nothing generated from an outdated primary file is ever kept.

pub mod config;
mod creator;
pub mod definition;
#[cfg(feature = "sea-orm")]
pub mod entity;
pub mod error;
pub mod fingerprint;
pub mod lifecycle;
pub mod model;
mod persistence;
pub mod repository;
pub mod resolver;
mod service;
pub mod source;

pub use config::{DerivativesAppConfig, LifecycleConfig, PersistenceConfig};
pub use definition::{
    ContentTypeFilter, DefinitionRegistry, DerivativeDefinition, RegistryBuilder, SourceFile,
    Specificity, TransformContext,
};
pub use error::{DerivativeError, PreconditionError, Result, TransformError};
pub use fingerprint::{current_fingerprint, has_changed_since, require_fingerprint};
pub use lifecycle::{Destruction, LifecycleDirectives, Promotion, Scheduled, TimingDirective};
pub use model::{Asset, AssetRecord, Derivative, FileMetadata, MetadataOverride, StoredFile};
pub use persistence::{AddOptions, AddOutcome, RemoveOptions, RemoveOutcome};
pub use repository::{AssetRepository, MemoryRepository, RepoError};
pub use resolver::{ResolveOptions, most_specific, resolve};
pub use service::DerivativeService;
pub use source::{DerivativeOutput, DerivativeSource};
