mod error;
mod fingerprint;
mod location;
mod registry;
mod traits;

pub mod filesystem;
pub mod memory;

pub use error::StorageError;
pub use filesystem::FilesystemBlobStore;
pub use fingerprint::Fingerprint;
pub use location::{BlobRef, generate_id, validate_id};
pub use memory::MemoryBlobStore;
pub use registry::StorageRegistry;
pub use traits::{BlobStore, BoxReader};
