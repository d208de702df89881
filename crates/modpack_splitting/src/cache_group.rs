use std::sync::Arc;

use modpack_core::chunk_graph::{Chunk, ChunkGraph, Module, ModuleId};
use modpack_core::hash::short_hash;
use regex::Regex;

/// Request budgets of `u32::MAX` mean "unbounded".
pub const UNBOUNDED_REQUESTS: u32 = u32::MAX;

/// Longest automatic chunk name before it gets truncated and hashed.
/// Keeps `[name].[chunkhash].[ext]` style output paths under filesystem limits.
const MAX_NAME_LEN: usize = 100;

/// Which loading contexts of a chunk set a cache group is allowed to select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChunkFilter {
  Initial,
  Async,
  #[default]
  All,
}

impl ChunkFilter {
  pub fn test(&self, chunk: &Chunk) -> bool {
    match self {
      ChunkFilter::Initial => chunk.can_be_initial,
      ChunkFilter::Async => !chunk.can_be_initial,
      ChunkFilter::All => true,
    }
  }
}

pub type ModulePredicate = Arc<dyn Fn(&Module, &[&Chunk]) -> bool + Send + Sync>;

/// Match predicate over a module, normalized once at configuration time.
/// A failing match silently excludes the group for that module.
#[derive(Clone)]
pub enum MatchRule {
  Always(bool),

  /// Prefix test against the module's condition name or any owning chunk's name.
  Prefix(String),

  /// Regex test against the same names as [`MatchRule::Prefix`].
  Pattern(Regex),

  /// Custom predicate receiving the module and its owning chunks.
  Predicate(ModulePredicate),
}

impl std::fmt::Debug for MatchRule {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      MatchRule::Always(value) => f.debug_tuple("Always").field(value).finish(),
      MatchRule::Prefix(prefix) => f.debug_tuple("Prefix").field(prefix).finish(),
      MatchRule::Pattern(pattern) => f.debug_tuple("Pattern").field(&pattern.as_str()).finish(),
      MatchRule::Predicate(_) => f.write_str("Predicate(..)"),
    }
  }
}

impl Default for MatchRule {
  fn default() -> Self {
    MatchRule::Always(true)
  }
}

impl MatchRule {
  pub fn matches(&self, module: &Module, owning_chunks: &[&Chunk]) -> bool {
    match self {
      MatchRule::Always(value) => *value,
      MatchRule::Prefix(prefix) => {
        if let Some(name) = &module.name_for_condition {
          if name.starts_with(prefix.as_str()) {
            return true;
          }
        }
        owning_chunks
          .iter()
          .any(|chunk| matches!(&chunk.name, Some(name) if name.starts_with(prefix.as_str())))
      }
      MatchRule::Pattern(pattern) => {
        if let Some(name) = &module.name_for_condition {
          if pattern.is_match(name) {
            return true;
          }
        }
        owning_chunks
          .iter()
          .any(|chunk| matches!(&chunk.name, Some(name) if pattern.is_match(name)))
      }
      MatchRule::Predicate(predicate) => predicate(module, owning_chunks),
    }
  }
}

pub type NameFn = Arc<dyn Fn(&Module, &[&Chunk], &str) -> Option<String> + Send + Sync>;

/// How a cache group names the chunks it produces. A `None` name falls back
/// to the (chunk-set, group) derived key, which keeps split chunks anonymous.
#[derive(Clone, Default)]
pub enum NameRule {
  /// No explicit name.
  #[default]
  Off,

  /// Derive a name from the names of the contributing chunks. Yields no name
  /// when any contributing chunk is unnamed.
  Auto,

  Fixed(String),

  Custom(NameFn),
}

impl std::fmt::Debug for NameRule {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      NameRule::Off => f.write_str("Off"),
      NameRule::Auto => f.write_str("Auto"),
      NameRule::Fixed(name) => f.debug_tuple("Fixed").field(name).finish(),
      NameRule::Custom(_) => f.write_str("Custom(..)"),
    }
  }
}

/// Computes the group declarations applying to one module, replacing a
/// static declaration list.
pub type GroupsFn = Arc<dyn Fn(&Module, &[&Chunk]) -> Vec<CacheGroupSource> + Send + Sync>;

/// The cache-group configuration: a fixed list of declarations, or a
/// function computing declarations per module. Dynamic declarations go
/// through the same default resolution as static ones at match time.
#[derive(Clone)]
pub enum CacheGroups {
  Static(Vec<CacheGroupSource>),
  Dynamic(GroupsFn),
}

impl std::fmt::Debug for CacheGroups {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheGroups::Static(groups) => f.debug_tuple("Static").field(groups).finish(),
      CacheGroups::Dynamic(_) => f.write_str("Dynamic(..)"),
    }
  }
}

impl Default for CacheGroups {
  fn default() -> Self {
    CacheGroups::Static(Vec::new())
  }
}

impl From<Vec<CacheGroupSource>> for CacheGroups {
  fn from(groups: Vec<CacheGroupSource>) -> Self {
    CacheGroups::Static(groups)
  }
}

/// A raw cache group declaration. Unset fields fall back to the global
/// defaults in [`SplitOptions`] (or to the relaxed values when `enforce` is
/// set) during normalization.
#[derive(Debug, Clone)]
pub struct CacheGroupSource {
  pub key: String,
  pub test: MatchRule,
  pub priority: i32,
  pub chunks: Option<ChunkFilter>,
  pub min_size: Option<u64>,
  pub max_size: Option<u64>,
  pub min_chunks: Option<u32>,
  pub max_async_requests: Option<u32>,
  pub max_initial_requests: Option<u32>,
  pub name: NameRule,
  pub automatic_name_delimiter: Option<String>,
  pub filename: Option<String>,

  /// Bypass the default size/count floors and request budgets.
  pub enforce: bool,

  /// Reuse an existing chunk that already contains exactly the extracted
  /// module set instead of creating a new one.
  pub reuse_existing_chunk: bool,
}

impl CacheGroupSource {
  pub fn new(key: impl Into<String>, test: MatchRule) -> Self {
    Self {
      key: key.into(),
      test,
      priority: 0,
      chunks: None,
      min_size: None,
      max_size: None,
      min_chunks: None,
      max_async_requests: None,
      max_initial_requests: None,
      name: NameRule::Off,
      automatic_name_delimiter: None,
      filename: None,
      enforce: false,
      reuse_existing_chunk: false,
    }
  }
}

/// Global optimizer configuration: defaults applied to every cache group
/// plus the group declarations themselves.
#[derive(Debug, Clone)]
pub struct SplitOptions {
  pub chunks: ChunkFilter,
  pub min_size: u64,
  pub max_size: u64,
  pub min_chunks: u32,
  pub max_async_requests: u32,
  pub max_initial_requests: u32,
  pub automatic_name_delimiter: String,

  /// Replace path-derived parts of generated names with a short hash.
  pub hide_path_info: bool,

  /// Size bounds used by the size-ceiling pass for chunks that were not
  /// produced by a cache group with its own `max_size`.
  pub fallback_min_size: Option<u64>,
  pub fallback_max_size: Option<u64>,

  pub cache_groups: CacheGroups,
}

impl Default for SplitOptions {
  fn default() -> Self {
    Self {
      chunks: ChunkFilter::All,
      min_size: 30_000,
      max_size: 0,
      min_chunks: 1,
      max_async_requests: 5,
      max_initial_requests: 3,
      automatic_name_delimiter: "~".to_string(),
      hide_path_info: false,
      fallback_min_size: None,
      fallback_max_size: None,
      cache_groups: CacheGroups::default(),
    }
  }
}

/// A cache group with every field populated, produced once per declaration
/// before the optimizer runs.
#[derive(Debug, Clone)]
pub struct ResolvedCacheGroup {
  pub key: String,
  pub test: MatchRule,
  pub priority: i32,
  pub chunks: ChunkFilter,
  pub min_size: u64,
  pub max_size: u64,
  pub min_chunks: u32,
  pub max_async_requests: u32,
  pub max_initial_requests: u32,
  pub name: NameRule,
  pub automatic_name_delimiter: String,
  pub filename: Option<String>,
  pub reuse_existing_chunk: bool,
}

impl ResolvedCacheGroup {
  /// Compute the name this group gives to a split chunk built from the given
  /// contributing chunks, or `None` when the chunk stays anonymous.
  pub fn chunk_name(&self, module: &Module, chunks: &[&Chunk]) -> Option<String> {
    match &self.name {
      NameRule::Off => None,
      NameRule::Fixed(name) => Some(name.clone()),
      NameRule::Custom(name_fn) => name_fn(module, chunks, &self.key),
      NameRule::Auto => {
        let mut names = Vec::with_capacity(chunks.len());
        for chunk in chunks {
          names.push(chunk.name.as_deref()?);
        }
        names.sort_unstable();

        let delimiter = &self.automatic_name_delimiter;
        let name = format!("{}{}{}", self.key, delimiter, names.join(delimiter));
        Some(truncate_name(name, delimiter))
      }
    }
  }
}

/// Output paths derived from chunk names must stay well below filesystem
/// limits, so overlong names keep a prefix and gain a short hash.
pub(crate) fn truncate_name(name: String, delimiter: &str) -> String {
  if name.chars().count() <= MAX_NAME_LEN {
    return name;
  }
  let prefix: String = name.chars().take(MAX_NAME_LEN).collect();
  format!("{}{}{}", prefix, delimiter, short_hash(&name))
}

/// Apply global defaults (relaxed under `enforce`) to one declaration.
pub(crate) fn resolve_group(
  options: &SplitOptions,
  source: &CacheGroupSource,
) -> Arc<ResolvedCacheGroup> {
  let enforce = source.enforce;
  Arc::new(ResolvedCacheGroup {
    key: source.key.clone(),
    test: source.test.clone(),
    priority: source.priority,
    chunks: source.chunks.unwrap_or(options.chunks),
    min_size: source
      .min_size
      .unwrap_or(if enforce { 0 } else { options.min_size }),
    max_size: source
      .max_size
      .unwrap_or(if enforce { 0 } else { options.max_size }),
    min_chunks: source
      .min_chunks
      .unwrap_or(if enforce { 1 } else { options.min_chunks }),
    max_async_requests: source.max_async_requests.unwrap_or(if enforce {
      UNBOUNDED_REQUESTS
    } else {
      options.max_async_requests
    }),
    max_initial_requests: source.max_initial_requests.unwrap_or(if enforce {
      UNBOUNDED_REQUESTS
    } else {
      options.max_initial_requests
    }),
    name: source.name.clone(),
    automatic_name_delimiter: source
      .automatic_name_delimiter
      .clone()
      .unwrap_or_else(|| options.automatic_name_delimiter.clone()),
    filename: source.filename.clone(),
    reuse_existing_chunk: source.reuse_existing_chunk,
  })
}

/// Pre-resolve the static declarations. A dynamic configuration has nothing
/// to resolve up front; its declarations are produced per module.
pub(crate) fn resolve_cache_groups(options: &SplitOptions) -> Vec<Arc<ResolvedCacheGroup>> {
  match &options.cache_groups {
    CacheGroups::Static(sources) => sources
      .iter()
      .map(|source| resolve_group(options, source))
      .collect(),
    CacheGroups::Dynamic(_) => Vec::new(),
  }
}

/// Ordered list of resolved groups matching a module. An empty list means the
/// optimizer skips the module entirely.
pub(crate) fn groups_for(
  options: &SplitOptions,
  static_groups: &[Arc<ResolvedCacheGroup>],
  graph: &ChunkGraph,
  module: ModuleId,
) -> Vec<Arc<ResolvedCacheGroup>> {
  let module = graph.module(module);
  let owning_chunks: Vec<&Chunk> = module.chunks().iter().map(|c| graph.chunk(*c)).collect();

  match &options.cache_groups {
    CacheGroups::Static(_) => static_groups
      .iter()
      .filter(|group| group.test.matches(module, &owning_chunks))
      .cloned()
      .collect(),
    CacheGroups::Dynamic(compute) => compute(module, &owning_chunks)
      .iter()
      .map(|source| resolve_group(options, source))
      .filter(|group| group.test.matches(module, &owning_chunks))
      .collect(),
  }
}
