use std::fmt;

/// Why a chunk load failed. Carried inside [`ChunkLoadError`] so callers can
/// distinguish a transport failure from a script that loaded but never
/// registered the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailureKind {
  /// The fetch itself failed.
  Network,

  /// The fetch did not complete within the configured timeout.
  Timeout,

  /// The fetched payload did not contain the requested chunk.
  Missing,
}

impl fmt::Display for LoadFailureKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      LoadFailureKind::Network => "network",
      LoadFailureKind::Timeout => "timeout",
      LoadFailureKind::Missing => "missing",
    })
  }
}

/// A failed chunk load. Cloneable because one failure is fanned out to every
/// caller waiting on the same in-flight request.
#[derive(thiserror::Error, Debug, Clone)]
#[error("loading chunk {chunk_id} failed ({kind}: {url})")]
pub struct ChunkLoadError {
  pub chunk_id: String,
  pub kind: LoadFailureKind,
  pub url: String,
}

#[derive(thiserror::Error, Debug)]
pub enum InstallError {
  #[error("module {0} is not installed")]
  MissingModule(String),
}
