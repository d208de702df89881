pub mod chunk_graph;
pub mod hash;
pub mod manifest;
