pub mod cache_group;
pub mod combinations;
pub mod error;
pub mod max_size;
pub mod split_chunks;

pub use cache_group::{
  CacheGroupSource, CacheGroups, ChunkFilter, GroupsFn, MatchRule, NameRule, ResolvedCacheGroup,
  SplitOptions,
};
pub use error::SplitError;
pub use split_chunks::Optimizer;
