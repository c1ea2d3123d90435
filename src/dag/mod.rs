pub mod resource_graph;
pub mod variants;
pub mod walker;
