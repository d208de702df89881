pub mod error;
pub mod loader;
pub mod registry;

pub use error::{ChunkLoadError, InstallError, LoadFailureKind};
pub use loader::{
  ChunkFetcher, ChunkLoadHandle, ChunkLoader, ChunkPayload, LoaderOptions, UrlResolver,
};
pub use registry::{Exports, ModuleBody, ModuleRegistry};
