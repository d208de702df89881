use std::collections::HashMap;
use std::mem;

use modpack_core::chunk_graph::{ChunkGraph, ChunkId, Module, ModuleId};
use modpack_core::hash::short_hash;
use tracing::debug;

use crate::cache_group::{truncate_name, SplitOptions};

/// Size bounds applied to one chunk by the subdivision pass. Recorded per
/// split chunk while extracting; merged when several cache groups contribute
/// to the same chunk (tightest ceiling, loosest floor).
#[derive(Debug, Clone)]
pub struct MaxSizeSettings {
  pub min_size: u64,
  pub max_size: u64,
  pub automatic_name_delimiter: String,
}

/// Stable grouping key for a module, independent of arena indices. Path
/// separators are flattened so the key stays usable inside output filenames.
fn grouping_key(module: &Module, delimiter: &str) -> String {
  let name = module
    .name_for_condition
    .as_deref()
    .unwrap_or(&module.identifier);
  format!("{name}{delimiter}{}", short_hash(&module.identifier))
    .chars()
    .map(|c| if matches!(c, '/' | '\\' | '?') { '_' } else { c })
    .collect()
}

/// Subdivide every chunk whose total module size exceeds its ceiling.
///
/// Modules are ordered by their stable grouping key and packed greedily:
/// a bucket closes once adding the next module would overflow the ceiling
/// and the bucket already meets the floor. Every bucket but the last becomes
/// a fresh chunk split off from the original; the last keeps the original
/// chunk's identity under a derived name. Re-running the pass over its own
/// output changes nothing, since every produced bucket fits its ceiling
/// (an oversized single module stays alone in place).
pub fn ensure_max_size(
  graph: &mut ChunkGraph,
  queue: &HashMap<ChunkId, MaxSizeSettings>,
  options: &SplitOptions,
) {
  let fallback = MaxSizeSettings {
    min_size: options.fallback_min_size.unwrap_or(options.min_size),
    max_size: options.fallback_max_size.unwrap_or(options.max_size),
    automatic_name_delimiter: options.automatic_name_delimiter.clone(),
  };

  // Snapshot: chunks created by the subdivision itself are already in bounds.
  let existing: Vec<ChunkId> = graph.chunk_ids().collect();
  for chunk_id in existing {
    let settings = queue.get(&chunk_id).unwrap_or(&fallback);
    if settings.max_size == 0 {
      continue;
    }
    let total = graph.modules_size(graph.chunk(chunk_id).modules());
    if total <= settings.max_size {
      continue;
    }

    let delimiter = settings.automatic_name_delimiter.clone();
    let mut items: Vec<(String, ModuleId, u64)> = graph
      .chunk(chunk_id)
      .modules()
      .iter()
      .map(|m| {
        let module = graph.module(*m);
        (grouping_key(module, &delimiter), *m, module.size)
      })
      .collect();
    items.sort_by(|a, b| a.0.cmp(&b.0));

    let mut buckets: Vec<Vec<(String, ModuleId, u64)>> = Vec::new();
    let mut current: Vec<(String, ModuleId, u64)> = Vec::new();
    let mut current_size = 0u64;
    for item in items {
      if !current.is_empty()
        && current_size + item.2 > settings.max_size
        && current_size >= settings.min_size
      {
        buckets.push(mem::take(&mut current));
        current_size = 0;
      }
      current_size += item.2;
      current.push(item);
    }
    if !current.is_empty() {
      buckets.push(current);
    }
    if buckets.len() <= 1 {
      continue;
    }

    debug!(
      chunk = chunk_id.0,
      total,
      max_size = settings.max_size,
      parts = buckets.len(),
      "subdividing oversized chunk"
    );

    let base_name = graph.chunk(chunk_id).name.clone();
    let reason = graph.chunk(chunk_id).reason.clone();
    let last = buckets.len() - 1;
    for (i, bucket) in buckets.iter().enumerate() {
      let name = base_name.as_ref().map(|base| {
        let key = if options.hide_path_info {
          short_hash(&bucket[0].0)
        } else {
          bucket[0].0.clone()
        };
        truncate_name(format!("{base}{delimiter}{key}"), &delimiter)
      });

      if i == last {
        graph.chunk_mut(chunk_id).name = name;
      } else {
        let part = graph.add_split_chunk(name);
        graph.split(chunk_id, part);
        graph.chunk_mut(part).reason = reason.clone();
        for (_, module, _) in bucket {
          graph.connect(part, *module);
          graph.disconnect(chunk_id, *module);
        }
      }
    }
  }
}
