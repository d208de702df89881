use std::collections::BTreeSet;

/// Opaque arena index for a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

/// Opaque arena index for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u32);

/// A unit of compiled source. Owned by the [`ChunkGraph`] arena; extraction
/// moves chunk membership, it never copies the module.
#[derive(Debug, Clone)]
pub struct Module {
  /// Stable identifier, unique within the graph.
  pub identifier: String,

  /// Byte size of the compiled module.
  pub size: u64,

  /// Normalized source path used by match rules and grouping keys.
  /// `None` for synthetic modules (multi-entry shims etc).
  pub name_for_condition: Option<String>,

  chunks: BTreeSet<ChunkId>,
}

impl Module {
  /// Chunks this module currently belongs to.
  pub fn chunks(&self) -> &BTreeSet<ChunkId> {
    &self.chunks
  }
}

/// An output unit grouping modules that are loaded together.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
  pub name: Option<String>,

  /// Whether this chunk directly contains an entry module.
  pub is_entry: bool,

  /// Whether this chunk may be loaded as part of an initial page load.
  pub can_be_initial: bool,

  /// Whether this chunk is also reachable through an on-demand load.
  pub on_demand: bool,

  /// Custom output filename template requested by a cache group.
  pub filename_template: Option<String>,

  /// Human readable note explaining why this chunk exists.
  pub reason: Option<String>,

  modules: BTreeSet<ModuleId>,
  split_from: BTreeSet<ChunkId>,
  split_into: BTreeSet<ChunkId>,
}

impl Chunk {
  pub fn modules(&self) -> &BTreeSet<ModuleId> {
    &self.modules
  }

  /// Chunks this chunk was extracted from.
  pub fn split_from(&self) -> &BTreeSet<ChunkId> {
    &self.split_from
  }

  /// Chunks that were extracted out of this chunk.
  pub fn split_into(&self) -> &BTreeSet<ChunkId> {
    &self.split_into
  }

  /// True when the chunk is only ever loaded as part of an initial page load.
  pub fn is_only_initial(&self) -> bool {
    self.can_be_initial && !self.on_demand
  }
}

/// Arena of modules and chunks with many-to-many membership kept consistent
/// on both sides. All membership mutation goes through this API.
#[derive(Debug, Clone, Default)]
pub struct ChunkGraph {
  modules: Vec<Module>,
  chunks: Vec<Chunk>,
}

impl ChunkGraph {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_module(
    &mut self,
    identifier: impl Into<String>,
    size: u64,
    name_for_condition: Option<&str>,
  ) -> ModuleId {
    let id = ModuleId(self.modules.len() as u32);
    self.modules.push(Module {
      identifier: identifier.into(),
      size,
      name_for_condition: name_for_condition.map(str::to_string),
      chunks: BTreeSet::new(),
    });
    id
  }

  /// Add a chunk holding an entry module, loaded on initial page load.
  pub fn add_entry_chunk(&mut self, name: &str) -> ChunkId {
    self.push_chunk(Chunk {
      name: Some(name.to_string()),
      is_entry: true,
      can_be_initial: true,
      ..Chunk::default()
    })
  }

  /// Add a chunk loaded on demand.
  pub fn add_async_chunk(&mut self, name: Option<&str>) -> ChunkId {
    self.push_chunk(Chunk {
      name: name.map(str::to_string),
      on_demand: true,
      ..Chunk::default()
    })
  }

  /// Add an empty chunk with no loading context yet. The optimizer uses this
  /// for freshly created split chunks; [`ChunkGraph::split`] derives the
  /// loading flags from the parents.
  pub fn add_split_chunk(&mut self, name: Option<String>) -> ChunkId {
    self.push_chunk(Chunk {
      name,
      ..Chunk::default()
    })
  }

  fn push_chunk(&mut self, chunk: Chunk) -> ChunkId {
    let id = ChunkId(self.chunks.len() as u32);
    self.chunks.push(chunk);
    id
  }

  pub fn module(&self, id: ModuleId) -> &Module {
    &self.modules[id.0 as usize]
  }

  pub fn chunk(&self, id: ChunkId) -> &Chunk {
    &self.chunks[id.0 as usize]
  }

  pub fn chunk_mut(&mut self, id: ChunkId) -> &mut Chunk {
    &mut self.chunks[id.0 as usize]
  }

  pub fn module_ids(&self) -> impl Iterator<Item = ModuleId> + '_ {
    (0..self.modules.len() as u32).map(ModuleId)
  }

  pub fn chunk_ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
    (0..self.chunks.len() as u32).map(ChunkId)
  }

  /// Connect a module to a chunk, updating both index sets.
  pub fn connect(&mut self, chunk: ChunkId, module: ModuleId) {
    self.chunks[chunk.0 as usize].modules.insert(module);
    self.modules[module.0 as usize].chunks.insert(chunk);
  }

  /// Remove a module from a chunk. Returns false when the module was not a
  /// member of the chunk.
  pub fn disconnect(&mut self, chunk: ChunkId, module: ModuleId) -> bool {
    let removed = self.chunks[chunk.0 as usize].modules.remove(&module);
    if removed {
      self.modules[module.0 as usize].chunks.remove(&chunk);
    }
    removed
  }

  /// Record that `child` was split off from `parent`. The child inherits the
  /// parent's loading contexts, since it now loads wherever the parent does.
  pub fn split(&mut self, parent: ChunkId, child: ChunkId) {
    self.chunks[parent.0 as usize].split_into.insert(child);
    let (can_be_initial, on_demand) = {
      let p = &self.chunks[parent.0 as usize];
      (p.can_be_initial, p.on_demand)
    };
    let c = &mut self.chunks[child.0 as usize];
    c.split_from.insert(parent);
    c.can_be_initial |= can_be_initial;
    c.on_demand |= on_demand;
  }

  /// The number of parallel requests needed to load this chunk together with
  /// the chunks that were split off from it.
  pub fn requests(&self, chunk: ChunkId) -> u32 {
    1 + self.chunks[chunk.0 as usize].split_into.len() as u32
  }

  /// Sum of the byte sizes of the given modules.
  pub fn modules_size<'a>(&self, modules: impl IntoIterator<Item = &'a ModuleId>) -> u64 {
    modules
      .into_iter()
      .map(|m| self.modules[m.0 as usize].size)
      .sum()
  }

  pub fn module_count(&self) -> usize {
    self.modules.len()
  }

  pub fn chunk_count(&self) -> usize {
    self.chunks.len()
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn membership_is_kept_consistent_on_both_sides() {
    let mut graph = ChunkGraph::new();
    let home = graph.add_entry_chunk("home");
    let list = graph.add_async_chunk(Some("list"));
    let a = graph.add_module("./a.js", 100, Some("./a.js"));

    graph.connect(home, a);
    graph.connect(list, a);
    assert_eq!(graph.module(a).chunks().len(), 2);
    assert!(graph.chunk(home).modules().contains(&a));

    assert!(graph.disconnect(home, a));
    assert!(!graph.disconnect(home, a));
    assert_eq!(
      graph.module(a).chunks().iter().copied().collect::<Vec<_>>(),
      vec![list]
    );
  }

  #[test]
  fn split_records_lineage_and_inherits_loading_context() {
    let mut graph = ChunkGraph::new();
    let home = graph.add_entry_chunk("home");
    let vendors = graph.add_split_chunk(Some("vendors".into()));

    graph.split(home, vendors);

    assert!(graph.chunk(home).split_into().contains(&vendors));
    assert!(graph.chunk(vendors).split_from().contains(&home));
    assert!(graph.chunk(vendors).can_be_initial);
    assert!(!graph.chunk(vendors).on_demand);
    assert!(graph.chunk(vendors).is_only_initial());
    assert_eq!(graph.requests(home), 2);
  }

  #[test]
  fn only_initial_is_false_for_mixed_context_chunks() {
    let mut graph = ChunkGraph::new();
    let shared = graph.add_entry_chunk("shared");
    graph.chunk_mut(shared).on_demand = true;
    assert!(graph.chunk(shared).can_be_initial);
    assert!(!graph.chunk(shared).is_only_initial());
  }
}
