use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use indexmap::IndexMap;
use itertools::Itertools;
use modpack_core::chunk_graph::{ChunkGraph, ChunkId};
use tracing::debug;

use crate::cache_group::ChunkFilter;

/// Derived identity for an exact set of chunks. Two modules that belong to
/// the identical chunk set share a key and are processed together once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkSetKey(String);

impl ChunkSetKey {
  pub fn of<'a>(chunks: impl IntoIterator<Item = &'a ChunkId>) -> Self {
    ChunkSetKey(
      chunks
        .into_iter()
        .map(|c| c.0)
        .sorted_unstable()
        .join(","),
    )
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

/// Index of every distinct chunk set occurring in the graph, bucketed by
/// cardinality, with memoized combination and selection lookups.
///
/// Enumerating combinations for a chunk set of size k scans every smaller
/// bucket testing subset inclusion, which is O(distinct-chunk-sets²) in the
/// worst case. The per-key memoization is what keeps this tractable on graphs
/// with many entry points, where most modules share a handful of chunk sets.
#[derive(Debug, Default)]
pub struct ChunkSetIndex {
  sets: IndexMap<ChunkSetKey, Arc<BTreeSet<ChunkId>>>,
  by_count: BTreeMap<usize, Vec<ChunkSetKey>>,
  combinations: HashMap<ChunkSetKey, Arc<Vec<Arc<BTreeSet<ChunkId>>>>>,
  selected: HashMap<(ChunkSetKey, ChunkFilter), Arc<(Vec<ChunkId>, ChunkSetKey)>>,
}

impl ChunkSetIndex {
  /// Record each module's exact chunk set once.
  pub fn new(graph: &ChunkGraph) -> Self {
    let mut sets: IndexMap<ChunkSetKey, Arc<BTreeSet<ChunkId>>> = IndexMap::new();
    for module in graph.module_ids() {
      let chunks = graph.module(module).chunks();
      let key = ChunkSetKey::of(chunks);
      sets
        .entry(key)
        .or_insert_with(|| Arc::new(chunks.clone()));
    }

    let mut by_count: BTreeMap<usize, Vec<ChunkSetKey>> = BTreeMap::new();
    for (key, set) in &sets {
      by_count.entry(set.len()).or_default().push(key.clone());
    }

    debug!(
      distinct_chunk_sets = sets.len(),
      "indexed chunk sets in graph"
    );

    Self {
      sets,
      by_count,
      combinations: HashMap::new(),
      selected: HashMap::new(),
    }
  }

  /// Every subset of the keyed chunk set that is itself some module's exact
  /// chunk set, plus the full set itself. Memoized per key.
  pub fn combinations(&mut self, key: &ChunkSetKey) -> Arc<Vec<Arc<BTreeSet<ChunkId>>>> {
    if let Some(cached) = self.combinations.get(key) {
      return cached.clone();
    }

    let chunk_set = self.sets[key].clone();
    let mut result = vec![chunk_set.clone()];

    // Exact-size matches would have been merged into the same key already,
    // so only strictly smaller sets can be subsets.
    if chunk_set.len() > 1 {
      for (count, keys) in &self.by_count {
        if *count >= chunk_set.len() {
          break;
        }
        for candidate_key in keys {
          let candidate = &self.sets[candidate_key];
          if candidate.is_subset(&chunk_set) {
            result.push(candidate.clone());
          }
        }
      }
    }

    let result = Arc::new(result);
    self.combinations.insert(key.clone(), result.clone());
    result
  }

  /// Chunks of a combination passing the group's chunk filter, with the key
  /// of the filtered list. Memoized per (chunk set, filter).
  pub fn selected(
    &mut self,
    graph: &ChunkGraph,
    combination: &BTreeSet<ChunkId>,
    filter: ChunkFilter,
  ) -> Arc<(Vec<ChunkId>, ChunkSetKey)> {
    let cache_key = (ChunkSetKey::of(combination), filter);
    if let Some(cached) = self.selected.get(&cache_key) {
      return cached.clone();
    }

    let chunks: Vec<ChunkId> = combination
      .iter()
      .copied()
      .filter(|c| filter.test(graph.chunk(*c)))
      .collect();
    let key = ChunkSetKey::of(&chunks);

    let entry = Arc::new((chunks, key));
    self.selected.insert(cache_key, entry.clone());
    entry
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn chunk_set_key_is_order_independent() {
    let a = ChunkSetKey::of(&[ChunkId(2), ChunkId(0), ChunkId(1)]);
    let b = ChunkSetKey::of(&[ChunkId(0), ChunkId(1), ChunkId(2)]);
    assert_eq!(a, b);
    assert_eq!(a.as_str(), "0,1,2");
  }

  #[test]
  fn combinations_include_narrower_cooccurring_sets() {
    let mut graph = ChunkGraph::new();
    let home = graph.add_entry_chunk("home");
    let list = graph.add_entry_chunk("list");
    let detail = graph.add_entry_chunk("detail");

    // a: {home, list, detail}; b: {home, list}; c: {detail}
    let a = graph.add_module("./a.js", 10, Some("./a.js"));
    let b = graph.add_module("./b.js", 10, Some("./b.js"));
    let c = graph.add_module("./c.js", 10, Some("./c.js"));
    for chunk in [home, list, detail] {
      graph.connect(chunk, a);
    }
    graph.connect(home, b);
    graph.connect(list, b);
    graph.connect(detail, c);

    let mut index = ChunkSetIndex::new(&graph);
    let key = ChunkSetKey::of(graph.module(a).chunks());
    let combinations = index.combinations(&key);

    let mut as_keys: Vec<String> = combinations
      .iter()
      .map(|set| ChunkSetKey::of(set.iter()).as_str().to_string())
      .collect();
    as_keys.sort();
    // Full set, the {home, list} subset and the {detail} subset.
    assert_eq!(as_keys, vec!["0,1".to_string(), "0,1,2".into(), "2".into()]);
  }

  #[test]
  fn combinations_are_memoized_per_key() {
    let mut graph = ChunkGraph::new();
    let home = graph.add_entry_chunk("home");
    let m = graph.add_module("./m.js", 10, None);
    graph.connect(home, m);

    let mut index = ChunkSetIndex::new(&graph);
    let key = ChunkSetKey::of(graph.module(m).chunks());
    let first = index.combinations(&key);
    let second = index.combinations(&key);
    assert!(Arc::ptr_eq(&first, &second));
  }

  #[test]
  fn selected_filters_by_loading_context() {
    let mut graph = ChunkGraph::new();
    let home = graph.add_entry_chunk("home");
    let lazy = graph.add_async_chunk(Some("lazy"));
    let m = graph.add_module("./m.js", 10, None);
    graph.connect(home, m);
    graph.connect(lazy, m);

    let mut index = ChunkSetIndex::new(&graph);
    let combination: BTreeSet<ChunkId> = [home, lazy].into_iter().collect();

    let initial = index.selected(&graph, &combination, ChunkFilter::Initial);
    assert_eq!(initial.0, vec![home]);
    let asynchronous = index.selected(&graph, &combination, ChunkFilter::Async);
    assert_eq!(asynchronous.0, vec![lazy]);
    let all = index.selected(&graph, &combination, ChunkFilter::All);
    assert_eq!(all.0, vec![home, lazy]);
  }
}
