use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use modpack_core::chunk_graph::{Chunk, ChunkGraph, ChunkId, ModuleId};
use tracing::{debug, instrument};

use crate::cache_group::{
  groups_for, resolve_cache_groups, ResolvedCacheGroup, SplitOptions, UNBOUNDED_REQUESTS,
};
use crate::combinations::{ChunkSetIndex, ChunkSetKey};
use crate::error::SplitError;
use crate::max_size::{ensure_max_size, MaxSizeSettings};

/// Accumulator for one candidate split, keyed by explicit name or by
/// (chunk-set, cache-group). Created lazily while scanning modules, mutated
/// as qualifying modules are discovered, destroyed once extracted or pruned.
#[derive(Debug)]
struct PendingSplit {
  modules: BTreeSet<ModuleId>,
  group: Arc<ResolvedCacheGroup>,
  name: Option<String>,

  /// Kept equal to the sum of the current modules' sizes incrementally;
  /// only recomputed after deletions.
  size: u64,

  chunks: BTreeSet<ChunkId>,
  chunks_keys: HashSet<ChunkSetKey>,
}

/// Total order over pending splits; `Greater` means `a` is extracted first.
///
/// Descending by group priority, contributing chunk count, size reduction
/// estimate and module count; the final tiebreak prefers the entry whose
/// sorted module identifier sequence compares lexicographically smaller,
/// keeping extraction order reproducible across runs.
fn compare_entries(graph: &ChunkGraph, a: &PendingSplit, b: &PendingSplit) -> Ordering {
  let by_priority = a.group.priority.cmp(&b.group.priority);
  if by_priority != Ordering::Equal {
    return by_priority;
  }

  let by_chunk_count = a.chunks.len().cmp(&b.chunks.len());
  if by_chunk_count != Ordering::Equal {
    return by_chunk_count;
  }

  let a_reduction = a.size * (a.chunks.len() as u64).saturating_sub(1);
  let b_reduction = b.size * (b.chunks.len() as u64).saturating_sub(1);
  let by_reduction = a_reduction.cmp(&b_reduction);
  if by_reduction != Ordering::Equal {
    return by_reduction;
  }

  let by_module_count = a.modules.len().cmp(&b.modules.len());
  if by_module_count != Ordering::Equal {
    return by_module_count;
  }

  let a_identifiers = sorted_identifiers(graph, &a.modules);
  let b_identifiers = sorted_identifiers(graph, &b.modules);
  b_identifiers.cmp(&a_identifiers)
}

fn sorted_identifiers<'a>(graph: &'a ChunkGraph, modules: &BTreeSet<ModuleId>) -> Vec<&'a str> {
  let mut identifiers: Vec<&str> = modules
    .iter()
    .map(|m| graph.module(*m).identifier.as_str())
    .collect();
  identifiers.sort_unstable();
  identifiers
}

/// Accumulate a module into the pending-split table under the given cache
/// group and selected chunks. Named entries unify across chunk sets; when two
/// groups feed the same named entry, the higher priority group wins.
fn add_module_to_table(
  table: &mut IndexMap<String, PendingSplit>,
  graph: &ChunkGraph,
  group: &Arc<ResolvedCacheGroup>,
  selected_chunks: &[ChunkId],
  selected_key: &ChunkSetKey,
  module: ModuleId,
) {
  if (selected_chunks.len() as u32) < group.min_chunks {
    return;
  }

  let chunk_refs: Vec<&Chunk> = selected_chunks.iter().map(|c| graph.chunk(*c)).collect();
  let name = group.chunk_name(graph.module(module), &chunk_refs);

  let key = match &name {
    Some(name) => format!("name:{name}"),
    None => format!("chunks:{} key:{}", selected_key.as_str(), group.key),
  };

  let entry = table.entry(key).or_insert_with(|| PendingSplit {
    modules: BTreeSet::new(),
    group: group.clone(),
    name,
    size: 0,
    chunks: BTreeSet::new(),
    chunks_keys: HashSet::new(),
  });

  if !Arc::ptr_eq(&entry.group, group) && entry.group.priority < group.priority {
    entry.group = group.clone();
  }

  if entry.modules.insert(module) {
    entry.size += graph.module(module).size;
  }
  if entry.chunks_keys.insert(selected_key.clone()) {
    entry.chunks.extend(selected_chunks.iter().copied());
  }
}

/// Chunk graph optimizer. Extracts modules shared across chunks into new (or
/// reused) split chunks according to the configured cache groups, then
/// subdivides any chunk exceeding its size ceiling.
///
/// Repeated invocations on the same graph are idempotent: the optimizer seals
/// itself after a run and [`Optimizer::reset`] unseals it again.
pub struct Optimizer {
  options: SplitOptions,
  groups: Vec<Arc<ResolvedCacheGroup>>,
  already_optimized: bool,
}

impl Optimizer {
  pub fn new(options: SplitOptions) -> Self {
    let groups = resolve_cache_groups(&options);
    Self {
      options,
      groups,
      already_optimized: false,
    }
  }

  /// Unseal the optimizer so the next [`Optimizer::optimize`] call runs again,
  /// e.g. after the graph has been rebuilt.
  pub fn reset(&mut self) {
    self.already_optimized = false;
  }

  #[instrument(level = "debug", skip_all)]
  pub fn optimize(&mut self, graph: &mut ChunkGraph) -> Result<(), SplitError> {
    if self.already_optimized {
      debug!("chunk graph already optimized, skipping");
      return Ok(());
    }
    self.already_optimized = true;

    let mut index = ChunkSetIndex::new(graph);
    let mut table: IndexMap<String, PendingSplit> = IndexMap::new();

    // Build the pending-split table: every module, every matching group,
    // every chunk-set combination passing the group's chunk filter.
    for module in graph.module_ids() {
      let groups = groups_for(&self.options, &self.groups, graph, module);
      if groups.is_empty() {
        continue;
      }

      let chunks_key = ChunkSetKey::of(graph.module(module).chunks());
      let combinations = index.combinations(&chunks_key);

      for group in &groups {
        for combination in combinations.iter() {
          if (combination.len() as u32) < group.min_chunks {
            continue;
          }
          let selected = index.selected(graph, combination, group.chunks);
          add_module_to_table(&mut table, graph, group, &selected.0, &selected.1, module);
        }
      }
    }

    debug!(pending_splits = table.len(), "built pending-split table");

    let mut max_size_queue: HashMap<ChunkId, MaxSizeSettings> = HashMap::new();

    while !table.is_empty() {
      // Pick the best ranked entry that meets its group's size floor.
      let mut best_key: Option<String> = None;
      for (key, entry) in &table {
        if entry.size < entry.group.min_size {
          continue;
        }
        let better = match &best_key {
          None => true,
          Some(current) => compare_entries(graph, &table[current.as_str()], entry) == Ordering::Less,
        };
        if better {
          best_key = Some(key.clone());
        }
      }

      // No qualifying entry left.
      let Some(best_key) = best_key else { break };
      let Some(item) = table.shift_remove(&best_key) else {
        break;
      };

      let mut chunk_name = item.name.clone();

      // When allowed, reuse an existing chunk that already contains exactly
      // this module set and holds no entry module, preferring the chunk with
      // the shortest, then lexicographically smallest, name.
      let mut reused_chunk: Option<ChunkId> = None;
      if item.group.reuse_existing_chunk {
        for candidate in &item.chunks {
          let chunk = graph.chunk(*candidate);
          if chunk.modules().len() != item.modules.len() || chunk.is_entry {
            continue;
          }
          if !item.modules.iter().all(|m| chunk.modules().contains(m)) {
            continue;
          }

          let better = match reused_chunk {
            None => true,
            Some(current) => match (graph.chunk(current).name.as_deref(), chunk.name.as_deref()) {
              (None, _) => true,
              (Some(_), None) => false,
              (Some(current_name), Some(candidate_name)) => {
                candidate_name.len() < current_name.len()
                  || (candidate_name.len() == current_name.len()
                    && candidate_name < current_name)
              }
            },
          };
          if better {
            reused_chunk = Some(*candidate);
          }
          chunk_name = None;
        }
      }
      let is_reused = reused_chunk.is_some();

      // The chunks modules actually get extracted from: skip the chunk we
      // would address by name and the chunk being reused.
      let used_chunks: Vec<ChunkId> = item
        .chunks
        .iter()
        .copied()
        .filter(|c| {
          let chunk = graph.chunk(*c);
          (chunk_name.is_none() || chunk.name.as_deref() != chunk_name.as_deref())
            && reused_chunk != Some(*c)
        })
        .collect();

      // Self-referential round.
      if used_chunks.is_empty() {
        continue;
      }

      // Enforce the request budgets: an initial chunk is limited by the
      // initial ceiling, an async-only chunk by the async ceiling, a chunk
      // loaded in both contexts by the tighter of the two.
      let within_limit: Vec<ChunkId> = used_chunks
        .iter()
        .copied()
        .filter(|c| {
          let chunk = graph.chunk(*c);
          let max_requests = if chunk.is_only_initial() {
            item.group.max_initial_requests
          } else if chunk.can_be_initial {
            item
              .group
              .max_initial_requests
              .min(item.group.max_async_requests)
          } else {
            item.group.max_async_requests
          };
          max_requests == UNBOUNDED_REQUESTS || graph.requests(*c) < max_requests
        })
        .collect();

      if within_limit.len() < used_chunks.len() {
        // The full extraction is infeasible; re-queue the same modules for
        // the narrower chunk set and let the loop re-evaluate it.
        debug!(
          cache_group = %item.group.key,
          dropped = used_chunks.len() - within_limit.len(),
          "request budget exceeded, deferring extraction to narrower chunk set"
        );
        let narrowed_key = ChunkSetKey::of(&within_limit);
        for module in &item.modules {
          add_module_to_table(
            &mut table,
            graph,
            &item.group,
            &within_limit,
            &narrowed_key,
            *module,
          );
        }
        continue;
      }

      // Materialize: create (or reuse) the destination chunk and rewire the
      // graph edges.
      let new_chunk = match reused_chunk {
        Some(chunk) => chunk,
        None => graph.add_split_chunk(chunk_name.clone()),
      };

      for used in &used_chunks {
        graph.split(*used, new_chunk);
      }

      let mut reason = if is_reused {
        format!("reused as split chunk (cache group: {})", item.group.key)
      } else {
        format!("split chunk (cache group: {})", item.group.key)
      };
      if let Some(name) = &chunk_name {
        reason.push_str(&format!(" (name: {name})"));
      }
      graph.chunk_mut(new_chunk).reason = Some(reason);

      if let Some(filename) = &item.group.filename {
        if !graph.chunk(new_chunk).is_only_initial() {
          return Err(SplitError::FilenameOnOnDemandChunk {
            cache_group: item.group.key.clone(),
          });
        }
        graph.chunk_mut(new_chunk).filename_template = Some(filename.clone());
      }

      // Connect before disconnecting so a module is never orphaned.
      for module in &item.modules {
        if !is_reused {
          graph.connect(new_chunk, *module);
        }
        for used in &used_chunks {
          graph.disconnect(*used, *module);
        }
      }

      debug!(
        cache_group = %item.group.key,
        name = chunk_name.as_deref().unwrap_or("<anonymous>"),
        modules = item.modules.len(),
        size = item.size,
        from_chunks = used_chunks.len(),
        reused = is_reused,
        "extracted split chunk"
      );

      if item.group.max_size > 0 {
        let settings = max_size_queue
          .entry(new_chunk)
          .or_insert_with(|| MaxSizeSettings {
            min_size: 0,
            max_size: u64::MAX,
            automatic_name_delimiter: item.group.automatic_name_delimiter.clone(),
          });
        settings.min_size = settings.min_size.max(item.group.min_size);
        settings.max_size = settings.max_size.min(item.group.max_size);
        settings.automatic_name_delimiter = item.group.automatic_name_delimiter.clone();
      }

      // Correct the accounting of every remaining entry whose chunk set
      // overlaps the extraction; prune entries that fall below their floor.
      table.retain(|_, entry| {
        if !entry.chunks.iter().any(|c| item.chunks.contains(c)) {
          return true;
        }
        let before = entry.modules.len();
        for module in &item.modules {
          entry.modules.remove(module);
        }
        if entry.modules.is_empty() {
          return false;
        }
        if entry.modules.len() != before {
          entry.size = graph.modules_size(&entry.modules);
          if entry.size < entry.group.min_size {
            return false;
          }
        }
        true
      });
    }

    ensure_max_size(graph, &max_size_queue, &self.options);

    Ok(())
  }
}
