#[derive(thiserror::Error, Debug)]
pub enum SplitError {
  /// Request-time filenames cannot be honored for on-demand chunks, so a
  /// custom filename template is only valid on chunks that are exclusively
  /// loaded as part of an initial page load.
  #[error(
    "cache group {cache_group} sets a filename for a chunk which is (also) loaded on demand. \
     The runtime can only load chunks that follow the computed filename scheme."
  )]
  FilenameOnOnDemandChunk { cache_group: String },
}
